use crate::config::TranscodeConfig;
use crate::encoder::EncoderChoice;
use crate::error::StartError;
use async_trait::async_trait;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// PID 加内核记录的进程启动时间, 用来识别 PID 被回收后分配给了别的进程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: Option<u64>,
}

impl ProcessIdentity {
    /// 读取当前占用 `pid` 的进程身份
    pub fn capture(pid: u32) -> Self {
        Self {
            pid,
            start_time: process_start_time(pid),
        }
    }

    /// 进程仍存在且就是当初记录的那一个
    ///
    /// Linux 上比对启动时间, 缺少启动时间的记录一律视为失效;
    /// 其他平台读不到启动时间, 只能退化为 PID 存在性检查
    pub fn is_running(&self) -> bool {
        if cfg!(target_os = "linux") {
            match (self.start_time, process_start_time(self.pid)) {
                (Some(expected), Some(actual)) => expected == actual,
                _ => false,
            }
        } else {
            pid_exists(self.pid)
        }
    }
}

/// 被监管的子进程
#[async_trait]
pub trait ChildProcess: Send {
    fn identity(&self) -> ProcessIdentity;

    fn pid(&self) -> u32 {
        self.identity().pid
    }

    /// 非阻塞存活检查
    fn is_alive(&mut self) -> bool;

    /// 发送 SIGTERM 并最多等待 `grace`, 返回进程是否已退出
    async fn stop(&mut self, grace: Duration) -> bool;

    async fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// 启动转码进程, 并提供按 PID 操作 (用于没有句柄的遗留进程)
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        stream_url: &str,
        encoder: EncoderChoice,
    ) -> Result<Box<dyn ChildProcess>, StartError>;

    fn is_running(&self, identity: ProcessIdentity) -> bool;

    /// 接管一个没有句柄的已知进程, 以便继续监控
    fn adopt(&self, identity: ProcessIdentity) -> Box<dyn ChildProcess>;

    /// 只在身份核对通过时发送 SIGTERM
    async fn terminate(&self, identity: ProcessIdentity, grace: Duration);
}

pub struct ProcessHandle {
    identity: ProcessIdentity,
    child: Child,
    started_at: Instant,
}

impl ProcessHandle {
    /// 启动子进程, 等待 `grace` 后确认其仍在运行
    ///
    /// # 错误处理
    /// - 无法 spawn 时返回 `StartError::Spawn`
    /// - 宽限期内已退出返回 `StartError::ImmediateExit`, 调用方应按崩溃处理
    pub async fn start(program: &str, args: &[String], grace: Duration) -> Result<Self, StartError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| StartError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pid = child.id().ok_or(StartError::NoPid)?;
        // 子进程未被回收前 PID 不会复用, 此时读取的启动时间一定属于它
        let identity = ProcessIdentity::capture(pid);

        // stderr 必须持续读取, 否则管道写满会卡住 FFmpeg
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", pid, line);
                }
            });
        }

        info!("Process [{}] spawned: {}", pid, program);

        tokio::time::sleep(grace).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("Process [{}] exited within start grace: {}", pid, status);
                return Err(StartError::ImmediateExit {
                    pid,
                    status: status.to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Process [{}] status check failed: {}", pid, e),
        }

        Ok(Self {
            identity,
            child,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[async_trait]
impl ChildProcess for ProcessHandle {
    fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!("Process [{}] try_wait failed: {}", self.identity.pid, e);
                self.identity.is_running()
            }
        }
    }

    async fn stop(&mut self, grace: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }
        if let Err(e) = send_terminate(self.identity.pid) {
            error!("Process [{}] terminate signal failed: {}", self.identity.pid, e);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(
                    "Process [{}] stopped after {}s: {}",
                    self.identity.pid,
                    self.uptime().as_secs(),
                    status
                );
                true
            }
            Ok(Err(e)) => {
                error!("Process [{}] wait failed: {}", self.identity.pid, e);
                false
            }
            Err(_) => {
                // 不强制 SIGKILL, 仅告警
                error!(
                    "Process [{}] still alive {}s after SIGTERM; leaving it running",
                    self.identity.pid,
                    grace.as_secs()
                );
                false
            }
        }
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// 生产环境的 FFmpeg 启动器
pub struct FfmpegLauncher {
    cfg: TranscodeConfig,
    start_grace: Duration,
}

impl FfmpegLauncher {
    pub fn new(cfg: TranscodeConfig, start_grace: Duration) -> Self {
        Self { cfg, start_grace }
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    async fn launch(
        &self,
        stream_url: &str,
        encoder: EncoderChoice,
    ) -> Result<Box<dyn ChildProcess>, StartError> {
        if stream_url.is_empty() {
            return Err(StartError::NoStreamUrl);
        }
        let args = encoder.transcode_args(&self.cfg, stream_url);
        info!("Starting transcode [{}] -> {}", encoder, self.cfg.output_target);
        let handle = ProcessHandle::start(&self.cfg.ffmpeg_binary, &args, self.start_grace).await?;
        Ok(Box::new(handle))
    }

    fn is_running(&self, identity: ProcessIdentity) -> bool {
        identity.is_running()
    }

    fn adopt(&self, identity: ProcessIdentity) -> Box<dyn ChildProcess> {
        Box::new(AdoptedProcess { identity })
    }

    async fn terminate(&self, identity: ProcessIdentity, grace: Duration) {
        terminate_verified(identity, grace).await;
    }
}

/// 没有 `Child` 句柄的进程 (上一轮遗留或由其他路径启动), 只能按身份轮询
pub struct AdoptedProcess {
    identity: ProcessIdentity,
}

#[async_trait]
impl ChildProcess for AdoptedProcess {
    fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    fn is_alive(&mut self) -> bool {
        self.identity.is_running()
    }

    async fn stop(&mut self, grace: Duration) -> bool {
        terminate_verified(self.identity, grace).await
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        while self.identity.is_running() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(io::Error::other(format!(
            "exit status of adopted process {} is unavailable",
            self.identity.pid
        )))
    }
}

/// 身份核对后发送 SIGTERM 并轮询等待退出
///
/// PID 已被其他进程占用时不发信号。与 `ProcessHandle::stop` 相同, 超时后只记录错误, 不升级为 SIGKILL
pub async fn terminate_verified(identity: ProcessIdentity, grace: Duration) -> bool {
    let pid = identity.pid;
    if !identity.is_running() {
        info!("Process [{}] is gone or was replaced, not signalling", pid);
        return true;
    }
    if let Err(e) = send_terminate(pid) {
        error!("Process [{}] terminate signal failed: {}", pid, e);
        return false;
    }

    let deadline = Instant::now() + grace;
    loop {
        if !identity.is_running() {
            info!("Process [{}] terminated", pid);
            return true;
        }
        if Instant::now() >= deadline {
            error!("Process [{}] still alive {}s after SIGTERM", pid, grace.as_secs());
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// `/proc/<pid>/stat` 第 22 个字段, 开机以来的时钟滴答数
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // 第 2 个字段是带括号的进程名, 可能含空格, 从最后一个 ')' 之后开始数
    let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
    // 僵尸进程已经退出, 只是还没被父进程回收
    if fields.next()? == "Z" {
        return None;
    }
    fields.nth(18)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

/// 用空信号检查 PID 是否存在
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        // 进程存在但无权限
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn pid_exists(_pid: u32) -> bool {
    false
}

/// 发送 SIGTERM, 进程已不存在时视为成功
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(io::Error::other)?;
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signal-based stop is only supported on unix",
    ))
}
