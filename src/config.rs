use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// 直播间页面地址
    pub page_url: String,
    /// 房间信息接口, `{room_id}` 会被替换为解析出的房间号
    pub room_api: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_sec: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscodeConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_binary: String,
    /// 推流目标 (RTMP 地址 + 串流密钥)
    pub output_target: String,
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_start_grace")]
    pub start_grace_sec: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_sec: u64,
    /// 单个硬件编码器探测的超时时间
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_sec: u64,
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: String,
    /// 字幕/水印字体, 配置后视为必需依赖
    #[serde(default)]
    pub font_file: Option<String>,
}

/// 故障重试策略 (固定间隔, 不做指数退避)
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub interval_sec: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    pub interval_sec: u64,
    pub cpu_threshold: f64,
    pub mem_threshold: f64,
    /// 进程存活时是否顺带复查直播间状态
    pub check_source: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_sec: 30,
            cpu_threshold: 90.0,
            mem_threshold: 85.0,
            check_source: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// 每次轮询都推送一次状态摘要
    #[serde(default)]
    pub status_summary: bool,
    #[serde(default = "default_request_timeout")]
    pub timeout_sec: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            status_summary: false,
            timeout_sec: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// 运行时文件目录 (PID 记录、锁文件、日志)
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./run"),
        }
    }
}

impl PathsConfig {
    pub fn pid_record(&self) -> PathBuf {
        self.state_dir.join("supervised.json")
    }

    pub fn rate_limit_marker(&self) -> PathBuf {
        self.state_dir.join("rate_limit")
    }

    pub fn instance_lock(&self) -> PathBuf {
        self.state_dir.join("vtx-relay.lock")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("vtx-relay.log")
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminConfig {
    /// 只读状态接口监听地址, 留空则不启动
    #[serde(default)]
    pub listen: Option<String>,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_video_bitrate() -> String {
    "2500k".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_start_grace() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_vaapi_device() -> String {
    "/dev/dri/renderD128".to_string()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.retry.max_attempts >= 1, "retry.max_attempts must be at least 1");
        anyhow::ensure!(self.retry.interval_sec > 0, "retry.interval_sec must be positive");
        anyhow::ensure!(self.monitor.interval_sec > 0, "monitor.interval_sec must be positive");
        anyhow::ensure!(
            self.source.poll_interval_sec > 0,
            "source.poll_interval_sec must be positive"
        );
        anyhow::ensure!(
            !self.transcode.output_target.trim().is_empty(),
            "transcode.output_target must not be empty"
        );
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.source.poll_interval_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_sec)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_sec)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.transcode.start_grace_sec)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.transcode.stop_grace_sec)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode.probe_timeout_sec)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig::from_yaml(
        r#"
source:
  page_url: "https://live.example.com/123"
  room_api: "https://api.example.com/room?id={room_id}"
transcode:
  output_target: "rtmp://dst/live/key"
"#,
    )
    .expect("test config should parse")
}
