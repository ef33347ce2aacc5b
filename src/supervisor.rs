use crate::config::AppConfig;
use crate::encoder::EncoderSelector;
use crate::health::HealthMonitor;
use crate::notify::{notify_best_effort, Notification, Notifier};
use crate::process::{ChildProcess, ProcessLauncher};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::source::{BroadcastStatus, StatusSource};
use crate::state::{remove_if_exists, SupervisionRecord, SupervisionState};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 监管循环依赖的外部组件, 启动时构造一次后注入
pub struct Components {
    pub config: Arc<AppConfig>,
    pub source: Arc<dyn StatusSource>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub selector: EncoderSelector,
    pub notifier: Arc<dyn Notifier>,
    pub state: SupervisionState,
    pub health: HealthMonitor,
}

/// 重试计数及其所属的直播场次 (房间号)
struct RetrySession {
    policy: RetryPolicy,
    room: Option<String>,
}

struct Shared {
    c: Components,
    retry: Mutex<RetrySession>,
}

impl Shared {
    async fn notify(&self, message: Notification) {
        notify_best_effort(self.c.notifier.as_ref(), message).await;
    }

    async fn clear_record(&self) {
        if let Err(e) = self.c.state.lock().await.clear() {
            error!("Failed to clear supervision record: {}", e);
        }
    }
}

/// 正在运行的监控任务
struct ActiveMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 单次轮询的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    FetchFailed,
    Offline,
    AlreadySupervised(Option<u32>),
    Started(u32),
    StartFailed,
    SessionExhausted,
    StateUnavailable,
}

impl TickOutcome {
    fn describe(&self) -> String {
        match self {
            TickOutcome::FetchFailed => "status unavailable".to_string(),
            TickOutcome::Offline => "idle".to_string(),
            TickOutcome::AlreadySupervised(Some(pid)) => format!("relaying (pid {})", pid),
            TickOutcome::AlreadySupervised(None) => "relay restarting".to_string(),
            TickOutcome::Started(pid) => format!("relay started (pid {})", pid),
            TickOutcome::StartFailed => "relay failed to start".to_string(),
            TickOutcome::SessionExhausted => "retries exhausted for this broadcast".to_string(),
            TickOutcome::StateUnavailable => "state unavailable".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SupervisorReport {
    pub record: Option<SupervisionRecord>,
    pub retry: RetryState,
    pub max_attempts: u32,
    pub monitoring: bool,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    active: AsyncMutex<Option<ActiveMonitor>>,
}

impl Supervisor {
    pub fn new(components: Components) -> Self {
        let policy = RetryPolicy::from_config(&components.config.retry);
        Self {
            shared: Arc::new(Shared {
                c: components,
                retry: Mutex::new(RetrySession { policy, room: None }),
            }),
            active: AsyncMutex::new(None),
        }
    }

    pub fn retry_state(&self) -> RetryState {
        lock_retry(&self.shared).policy.state()
    }

    pub async fn report(&self) -> SupervisorReport {
        let record = self.shared.c.state.snapshot().await.unwrap_or_else(|e| {
            warn!("Failed to read supervision record: {}", e);
            None
        });
        let (retry, max_attempts) = {
            let session = lock_retry(&self.shared);
            (session.policy.state(), session.policy.max_attempts())
        };
        let monitoring = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|m| !m.task.is_finished())
            .unwrap_or(false);
        SupervisorReport {
            record,
            retry,
            max_attempts,
            monitoring,
        }
    }

    /// 主循环: 定时轮询直到收到取消信号, 之后无条件执行清理
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.reconcile().await;
        let result = self.poll_loop(&shutdown).await;
        self.shutdown().await;
        result
    }

    async fn poll_loop(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.shared.c.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, leaving poll loop");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            // 单次轮询不可中途取消, 以免启动到一半的进程失去记录
            self.tick().await;
        }
    }

    /// 启动时对账: 记录中的进程已不存在则清除
    async fn reconcile(&self) {
        let mut store = self.shared.c.state.lock().await;
        match store.load() {
            Ok(Some(record)) if self.shared.c.launcher.is_running(record.identity()) => {
                warn!(
                    "Process [{}] from a previous run is still alive; treating it as supervised",
                    record.pid
                );
            }
            Ok(Some(record)) => {
                info!("Clearing stale record for exited process [{}]", record.pid);
                if let Err(e) = store.clear() {
                    error!("Failed to clear stale record: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Failed to read supervision record: {}", e),
        }
    }

    /// 单次轮询
    pub async fn tick(&self) -> TickOutcome {
        let status = match self.shared.c.source.fetch().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Status fetch failed: {}", e);
                self.shared
                    .notify(Notification::text(format!("Status fetch failed: {}", e)))
                    .await;
                return TickOutcome::FetchFailed;
            }
        };

        let outcome = if status.is_live {
            self.on_online(&status).await
        } else {
            self.on_offline();
            TickOutcome::Offline
        };

        if self.shared.c.config.notify.status_summary {
            let text = format!("{} | {}", status.summary(), outcome.describe());
            self.shared
                .notify(Notification::text(text).with_image(status.metadata.cover_image_url.clone()))
                .await;
        }
        outcome
    }

    fn on_offline(&self) {
        info!("Source offline, nothing to do");
        let mut session = lock_retry(&self.shared);
        if session.policy.is_exhausted() {
            info!("Broadcast session over, retry budget restored");
            session.policy.reset();
            session.room = None;
        }
    }

    async fn on_online(&self, status: &BroadcastStatus) -> TickOutcome {
        {
            let mut session = lock_retry(&self.shared);
            if session.policy.is_exhausted() {
                if session.room.is_some() && session.room == status.room_identifier {
                    debug!("Retries exhausted for room {:?}, waiting for next broadcast", session.room);
                    return TickOutcome::SessionExhausted;
                }
                info!("New broadcast session detected, retry budget restored");
                session.policy.reset();
                session.room = None;
            }
        }

        let mut active = self.active.lock().await;
        if let Some(monitor) = active.as_ref() {
            if !monitor.task.is_finished() {
                let pid = self.shared.c.state.snapshot().await.ok().flatten().map(|r| r.pid);
                debug!("Stream already supervised ({:?})", pid);
                return TickOutcome::AlreadySupervised(pid);
            }
        }
        if let Some(finished) = active.take() {
            if let Err(e) = finished.task.await {
                error!("Monitor task ended abnormally: {}", e);
            }
        }

        // 检查-启动-写入在同一把锁内完成
        let mut store = self.shared.c.state.lock().await;
        match store.load() {
            Ok(Some(record)) if self.shared.c.launcher.is_running(record.identity()) => {
                debug!("Process [{}] already supervised", record.pid);
                return TickOutcome::AlreadySupervised(Some(record.pid));
            }
            Ok(Some(record)) => {
                warn!("Recorded process [{}] is gone, clearing record", record.pid);
                if let Err(e) = store.clear() {
                    error!("Failed to clear stale record: {}", e);
                    return TickOutcome::StateUnavailable;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to read supervision record: {}", e);
                return TickOutcome::StateUnavailable;
            }
        }

        let Some(url) = status.playable_url.as_deref() else {
            warn!("Source is live but has no playable url");
            self.shared
                .notify(Notification::text("Source is live but no playable url was returned"))
                .await;
            return TickOutcome::StartFailed;
        };

        let encoder = self.shared.c.selector.select().await;
        let child = match self.shared.c.launcher.launch(url, encoder).await {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start transcoder: {}", e);
                self.shared
                    .notify(Notification::text(format!("Failed to start transcoder: {}", e)))
                    .await;
                return TickOutcome::StartFailed;
            }
        };

        let pid = child.pid();
        let record = SupervisionRecord::new(child.identity(), encoder, status.room_identifier.clone());
        if let Err(e) = store.save(&record) {
            error!("Failed to persist supervision record for [{}]: {}", pid, e);
        }
        drop(store);

        {
            let mut session = lock_retry(&self.shared);
            session.policy.reset();
            session.room = status.room_identifier.clone();
        }

        info!("Supervising transcoder [{}] with {}", pid, encoder);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor(self.shared.clone(), child, cancel.clone()));
        *active = Some(ActiveMonitor { cancel, task });

        TickOutcome::Started(pid)
    }

    /// 清理路径, 可重复调用
    ///
    /// 1. 停止监控任务 (由它负责停掉持有的子进程)
    /// 2. 没有监控任务时, 按记录中的 PID 终止遗留进程
    /// 3. 清除监管记录
    /// 4. 删除限流标记文件
    pub async fn shutdown(&self) {
        let grace = self.shared.c.config.stop_grace();

        let monitor = self.active.lock().await.take();
        let had_monitor = monitor.is_some();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                error!("Monitor task ended abnormally: {}", e);
            }
        }

        if !had_monitor {
            match self.shared.c.state.snapshot().await {
                Ok(Some(record)) if self.shared.c.launcher.is_running(record.identity()) => {
                    info!("Stopping unmonitored process [{}]", record.pid);
                    self.shared.c.launcher.terminate(record.identity(), grace).await;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read supervision record during cleanup: {}", e),
            }
        }

        self.shared.clear_record().await;

        let marker = self.shared.c.config.paths.rate_limit_marker();
        match remove_if_exists(&marker) {
            Ok(true) => info!("Removed {:?}", marker),
            Ok(false) => {}
            Err(e) => warn!("Failed to remove {:?}: {}", marker, e),
        }
        info!("Cleanup finished");
    }
}

fn lock_retry(shared: &Shared) -> std::sync::MutexGuard<'_, RetrySession> {
    shared
        .retry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 后台监控任务, 每个活跃直播一个
///
/// 定期检查子进程; 存活时做健康检查, 退出时按重试策略重启或放弃
async fn monitor(shared: Arc<Shared>, mut child: Box<dyn ChildProcess>, cancel: CancellationToken) {
    let interval = shared.c.config.monitor_interval();
    let grace = shared.c.config.stop_grace();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Monitor for [{}] cancelled, stopping transcoder", child.pid());
                child.stop(grace).await;
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if child.is_alive() {
            if lock_retry(&shared).policy.mark_healthy() {
                info!("Transcoder [{}] healthy again, retry counter reset", child.pid());
            }
            check_health(&shared).await;
            continue;
        }

        let pid = child.pid();
        match child.wait().await {
            Ok(status) => warn!("Transcoder [{}] exited unexpectedly: {}", pid, status),
            Err(e) => warn!("Transcoder [{}] exited, status unknown: {}", pid, e),
        }
        shared.clear_record().await;

        match restart(&shared, &cancel).await {
            Some(next) => child = next,
            None => return,
        }
    }
}

async fn check_health(shared: &Shared) {
    let sample = shared.c.health.sample();
    let source_live = if shared.c.config.monitor.check_source {
        match shared.c.source.fetch().await {
            Ok(status) => Some(status.is_live),
            Err(e) => {
                debug!("Health check status fetch failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    for warning in shared.c.health.check(&sample, source_live) {
        warn!("Health warning: {}", warning);
        shared
            .notify(Notification::text(format!("Warning: {}", warning)))
            .await;
    }
}

/// 按重试策略反复尝试重启, 成功返回新的子进程
async fn restart(shared: &Shared, cancel: &CancellationToken) -> Option<Box<dyn ChildProcess>> {
    loop {
        let decision = lock_retry(shared).policy.on_failure();
        let (attempt, max, delay) = match decision {
            RetryDecision::Restart {
                attempt,
                max,
                delay,
            } => (attempt, max, delay),
            RetryDecision::Exhausted => {
                let max = lock_retry(shared).policy.max_attempts();
                error!("Transcoder failed {} restarts, giving up for this broadcast", max);
                shared
                    .notify(Notification::text(format!(
                        "Transcoder failed {} restarts, giving up for this broadcast",
                        max
                    )))
                    .await;
                shared.clear_record().await;
                return None;
            }
        };

        warn!("Restarting transcoder ({}/{}) in {}s", attempt, max, delay.as_secs());
        shared
            .notify(Notification::text(format!(
                "Transcoder exited, restarting ({}/{}) in {}s",
                attempt,
                max,
                delay.as_secs()
            )))
            .await;

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        // 重新获取播放地址, 旧地址可能已经失效
        let status = match shared.c.source.fetch().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Restart attempt {} could not fetch status: {}", attempt, e);
                continue;
            }
        };
        if !status.is_live {
            info!("Broadcast ended, supervision stopped");
            shared
                .notify(Notification::text("Broadcast ended, supervision stopped"))
                .await;
            {
                let mut session = lock_retry(shared);
                session.policy.reset();
                session.room = None;
            }
            shared.clear_record().await;
            return None;
        }
        let Some(url) = status.playable_url.as_deref() else {
            warn!("Restart attempt {}: no playable url", attempt);
            continue;
        };

        let encoder = shared.c.selector.select().await;
        let mut store = shared.c.state.lock().await;
        let recorded = store
            .load()
            .ok()
            .flatten()
            .filter(|r| shared.c.launcher.is_running(r.identity()));
        if let Some(record) = recorded {
            // 其他路径已经写入了存活的进程, 接管它而不是再启动一个
            drop(store);
            warn!("Process [{}] is already recorded, adopting it instead of restarting", record.pid);
            shared
                .notify(Notification::text(format!(
                    "Transcoder [{}] already running, supervising it instead of restarting",
                    record.pid
                )))
                .await;
            return Some(shared.c.launcher.adopt(record.identity()));
        }

        match shared.c.launcher.launch(url, encoder).await {
            Ok(child) => {
                let record =
                    SupervisionRecord::new(child.identity(), encoder, status.room_identifier.clone());
                if let Err(e) = store.save(&record) {
                    error!("Failed to persist supervision record for [{}]: {}", record.pid, e);
                }
                info!("Transcoder restarted as [{}] ({}/{})", record.pid, attempt, max);
                return Some(child);
            }
            Err(e) => {
                warn!("Restart attempt {}/{} failed: {}", attempt, max, e);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::encoder::{EncoderChoice, HardwareProbe};
    use crate::error::{FetchError, NotifyError, StartError};
    use crate::health::{HealthSample, Thresholds};
    use crate::process::{FfmpegLauncher, ProcessIdentity};
    use crate::state::{FileStateStore, MemoryStateStore, StateStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Clone)]
    enum Scripted {
        Live(&'static str, &'static str),
        Offline,
        Fail,
    }

    struct FakeSource {
        current: Mutex<Scripted>,
    }

    impl FakeSource {
        fn new(s: Scripted) -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(s),
            })
        }

        fn set(&self, s: Scripted) {
            *self.current.lock().unwrap() = s;
        }
    }

    #[async_trait]
    impl StatusSource for FakeSource {
        async fn fetch(&self) -> Result<BroadcastStatus, FetchError> {
            match self.current.lock().unwrap().clone() {
                Scripted::Live(url, room) => Ok(BroadcastStatus {
                    is_live: true,
                    playable_url: Some(url.to_string()),
                    room_identifier: Some(room.to_string()),
                    ..Default::default()
                }),
                Scripted::Offline => Ok(BroadcastStatus::default()),
                Scripted::Fail => Err(FetchError::Api(500)),
            }
        }
    }

    type AliveMap = Arc<Mutex<HashMap<u32, bool>>>;

    struct FakeChild {
        pid: u32,
        alive: AliveMap,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        fn identity(&self) -> ProcessIdentity {
            ProcessIdentity {
                pid: self.pid,
                start_time: Some(u64::from(self.pid)),
            }
        }

        fn is_alive(&mut self) -> bool {
            self.alive.lock().unwrap().get(&self.pid).copied().unwrap_or(false)
        }

        async fn stop(&mut self, _grace: Duration) -> bool {
            self.alive.lock().unwrap().insert(self.pid, false);
            true
        }

        async fn wait(&mut self) -> io::Result<ExitStatus> {
            Ok(ExitStatus::from_raw(1 << 8))
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        next_pid: AtomicU32,
        fail: AtomicBool,
        /// 模拟启动耗时, 单位毫秒
        launch_delay_ms: AtomicU64,
        alive: AliveMap,
        launches: Mutex<Vec<(String, Instant)>>,
        terminated: Mutex<Vec<u32>>,
    }

    impl FakeLauncher {
        fn new() -> Arc<Self> {
            let launcher = Self::default();
            launcher.next_pid.store(1000, Ordering::SeqCst);
            Arc::new(launcher)
        }

        fn launch_urls(&self) -> Vec<String> {
            self.launches.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
        }

        fn launch_times(&self) -> Vec<Instant> {
            self.launches.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }

        fn kill(&self, pid: u32) {
            self.alive.lock().unwrap().insert(pid, false);
        }

        fn mark_alive(&self, pid: u32) {
            self.alive.lock().unwrap().insert(pid, true);
        }

        fn live_count(&self) -> usize {
            self.alive.lock().unwrap().values().filter(|a| **a).count()
        }

        fn pid_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().get(&pid).copied().unwrap_or(false)
        }

        fn set_launch_delay(&self, delay: Duration) {
            self.launch_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(
            &self,
            stream_url: &str,
            _encoder: EncoderChoice,
        ) -> Result<Box<dyn ChildProcess>, StartError> {
            let delay = self.launch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.launches
                .lock()
                .unwrap()
                .push((stream_url.to_string(), Instant::now()));
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StartError::ImmediateExit {
                    pid,
                    status: "exit status: 1".to_string(),
                });
            }
            self.mark_alive(pid);
            Ok(Box::new(FakeChild {
                pid,
                alive: self.alive.clone(),
            }))
        }

        fn is_running(&self, identity: ProcessIdentity) -> bool {
            self.pid_alive(identity.pid)
        }

        fn adopt(&self, identity: ProcessIdentity) -> Box<dyn ChildProcess> {
            Box::new(FakeChild {
                pid: identity.pid,
                alive: self.alive.clone(),
            })
        }

        async fn terminate(&self, identity: ProcessIdentity, _grace: Duration) {
            self.terminated.lock().unwrap().push(identity.pid);
            self.kill(identity.pid);
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|n| n.text.clone()).collect()
        }

        fn count_containing(&self, needle: &str) -> usize {
            self.texts().iter().filter(|t| t.contains(needle)).count()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct NoHardware;

    #[async_trait]
    impl HardwareProbe for NoHardware {
        async fn vaapi(&self) -> io::Result<bool> {
            Ok(false)
        }
        async fn nvenc(&self) -> io::Result<bool> {
            Ok(false)
        }
        async fn qsv(&self) -> io::Result<bool> {
            Ok(false)
        }
    }

    struct Harness {
        supervisor: Supervisor,
        source: Arc<FakeSource>,
        launcher: Arc<FakeLauncher>,
        notifier: Arc<RecordingNotifier>,
        store: MemoryStateStore,
    }

    fn harness_with(config: AppConfig, source: Scripted) -> Harness {
        let source = FakeSource::new(source);
        let launcher = FakeLauncher::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let store = MemoryStateStore::default();
        let supervisor = Supervisor::new(Components {
            config: Arc::new(config),
            source: source.clone(),
            launcher: launcher.clone(),
            selector: EncoderSelector::new(Box::new(NoHardware)),
            notifier: notifier.clone(),
            state: SupervisionState::new(Box::new(store.clone())),
            health: HealthMonitor::with_sampler(Thresholds::default(), || HealthSample {
                cpu_percent: 5.0,
                mem_percent: 5.0,
            }),
        });
        Harness {
            supervisor,
            source,
            launcher,
            notifier,
            store,
        }
    }

    fn harness(source: Scripted) -> Harness {
        harness_with(test_config(), source)
    }

    const LIVE_A: Scripted = Scripted::Live("rtmp://src/a", "7001");

    #[tokio::test(start_paused = true)]
    async fn online_status_starts_once_with_url_and_sends_summary() {
        let mut cfg = test_config();
        cfg.notify.status_summary = true;
        let h = harness_with(cfg, LIVE_A);

        let outcome = h.supervisor.tick().await;
        let pid = match outcome {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };

        assert_eq!(h.launcher.launch_urls(), vec!["rtmp://src/a".to_string()]);
        assert_eq!(h.store.current().map(|r| r.pid), Some(pid));
        assert_eq!(h.store.current().map(|r| r.encoder), Some(EncoderChoice::SoftwareH264));
        assert_eq!(h.notifier.texts().len(), 1);
        assert!(h.notifier.texts()[0].contains("[online]"));

        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_online_ticks_start_and_write_once() {
        let h = harness(LIVE_A);

        assert!(matches!(h.supervisor.tick().await, TickOutcome::Started(_)));
        assert!(matches!(h.supervisor.tick().await, TickOutcome::AlreadySupervised(Some(_))));

        assert_eq!(h.launcher.launch_urls().len(), 1);
        assert_eq!(h.store.writes(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn online_offline_sequences_never_double_start() {
        let h = harness(LIVE_A);
        let script = [
            LIVE_A,
            LIVE_A,
            Scripted::Offline,
            LIVE_A,
            Scripted::Offline,
            Scripted::Offline,
            LIVE_A,
            LIVE_A,
        ];

        for step in script {
            h.source.set(step);
            h.supervisor.tick().await;
            assert!(h.launcher.live_count() <= 1);
            assert!(h.store.distinct_pids() <= 1);
        }
        assert_eq!(h.launcher.launch_urls().len(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_error_skips_tick_without_side_effects() {
        let h = harness(Scripted::Fail);

        assert_eq!(h.supervisor.tick().await, TickOutcome::FetchFailed);
        assert!(h.launcher.launch_urls().is_empty());
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.supervisor.retry_state(), RetryState::Idle);
        assert_eq!(h.notifier.count_containing("Status fetch failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_status_takes_no_action() {
        let h = harness(Scripted::Offline);

        assert_eq!(h.supervisor.tick().await, TickOutcome::Offline);
        assert!(h.launcher.launch_urls().is_empty());
        assert!(h.notifier.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_leaves_state_empty_and_retries_next_tick() {
        let h = harness(LIVE_A);
        h.launcher.fail.store(true, Ordering::SeqCst);

        assert_eq!(h.supervisor.tick().await, TickOutcome::StartFailed);
        assert_eq!(h.store.current(), None);
        assert_eq!(h.notifier.count_containing("Failed to start transcoder"), 1);
        assert_eq!(h.supervisor.retry_state(), RetryState::Idle);

        h.launcher.fail.store(false, Ordering::SeqCst);
        assert!(matches!(h.supervisor.tick().await, TickOutcome::Started(_)));
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_record_is_reconciled_before_start() {
        let h = harness(LIVE_A);
        h.store.preload(SupervisionRecord {
            pid: 42,
            start_time: None,
            started_at: Utc::now(),
            encoder: EncoderChoice::Vaapi,
            room_id: None,
        });

        assert!(matches!(h.supervisor.tick().await, TickOutcome::Started(_)));
        assert_eq!(h.store.clears(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_orphan_record_counts_as_supervised() {
        let h = harness(LIVE_A);
        h.launcher.mark_alive(42);
        h.store.preload(SupervisionRecord {
            pid: 42,
            start_time: None,
            started_at: Utc::now(),
            encoder: EncoderChoice::SoftwareH264,
            room_id: None,
        });

        assert_eq!(h.supervisor.tick().await, TickOutcome::AlreadySupervised(Some(42)));
        assert!(h.launcher.launch_urls().is_empty());

        // 清理时按 PID 终止遗留进程
        h.supervisor.shutdown().await;
        assert_eq!(*h.launcher.terminated.lock().unwrap(), vec![42]);
        assert_eq!(h.store.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_exhaust_retries_then_clear_state() {
        let h = harness(LIVE_A);
        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };

        h.launcher.fail.store(true, Ordering::SeqCst);
        h.launcher.kill(pid);
        tokio::time::sleep(Duration::from_secs(600)).await;

        // 1 次初始启动 + 3 次重启
        let times = h.launcher.launch_times();
        assert_eq!(times.len(), 4);
        for pair in times[1..].windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(30));
        }
        assert_eq!(h.notifier.count_containing("restarting (1/3)"), 1);
        assert_eq!(h.notifier.count_containing("restarting (3/3)"), 1);
        assert_eq!(h.notifier.count_containing("giving up"), 1);
        assert_eq!(h.store.current(), None);
        assert_eq!(h.supervisor.retry_state(), RetryState::Exhausted);
        assert!(!h.supervisor.report().await.monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_scoped_to_one_broadcast() {
        let mut cfg = test_config();
        cfg.retry.max_attempts = 1;
        let h = harness_with(cfg, LIVE_A);

        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        h.launcher.fail.store(true, Ordering::SeqCst);
        h.launcher.kill(pid);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.supervisor.retry_state(), RetryState::Exhausted);

        h.launcher.fail.store(false, Ordering::SeqCst);
        assert_eq!(h.supervisor.tick().await, TickOutcome::SessionExhausted);

        h.source.set(Scripted::Offline);
        assert_eq!(h.supervisor.tick().await, TickOutcome::Offline);
        assert_eq!(h.supervisor.retry_state(), RetryState::Idle);

        h.source.set(LIVE_A);
        assert!(matches!(h.supervisor.tick().await, TickOutcome::Started(_)));
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_room_lifts_exhaustion() {
        let mut cfg = test_config();
        cfg.retry.max_attempts = 1;
        let h = harness_with(cfg, LIVE_A);

        if let TickOutcome::Started(pid) = h.supervisor.tick().await {
            h.launcher.fail.store(true, Ordering::SeqCst);
            h.launcher.kill(pid);
        }
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.supervisor.retry_state(), RetryState::Exhausted);

        h.launcher.fail.store(false, Ordering::SeqCst);
        h.source.set(Scripted::Live("rtmp://src/b", "7002"));
        assert!(matches!(h.supervisor.tick().await, TickOutcome::Started(_)));
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_health_after_restart_resets_counter() {
        let h = harness(LIVE_A);
        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };

        h.source.set(Scripted::Live("rtmp://src/rotated", "7001"));
        h.launcher.kill(pid);
        // 30s 发现退出, 再等 30s 重启
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.supervisor.retry_state(), RetryState::Attempting(1));
        assert_eq!(
            h.launcher.launch_urls(),
            vec!["rtmp://src/a".to_string(), "rtmp://src/rotated".to_string()]
        );
        let restarted = h.store.current().map(|r| r.pid).unwrap();
        assert_ne!(restarted, pid);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.supervisor.retry_state(), RetryState::Idle);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_end_during_restart_stops_quietly() {
        let h = harness(LIVE_A);
        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };

        h.launcher.kill(pid);
        // 进程存活检查前切换为下播, 避免健康检查先看到离线
        h.source.set(Scripted::Offline);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.launcher.launch_urls().len(), 1);
        assert_eq!(h.notifier.count_containing("Broadcast ended"), 1);
        assert_eq!(h.store.current(), None);
        assert_eq!(h.supervisor.retry_state(), RetryState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn health_warnings_are_forwarded_every_interval() {
        let source = FakeSource::new(LIVE_A);
        let launcher = FakeLauncher::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = Supervisor::new(Components {
            config: Arc::new(test_config()),
            source: source.clone(),
            launcher: launcher.clone(),
            selector: EncoderSelector::new(Box::new(NoHardware)),
            notifier: notifier.clone(),
            state: SupervisionState::new(Box::new(MemoryStateStore::default())),
            health: HealthMonitor::with_sampler(Thresholds::default(), || HealthSample {
                cpu_percent: 97.0,
                mem_percent: 10.0,
            }),
        });

        assert!(matches!(supervisor.tick().await, TickOutcome::Started(_)));
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(notifier.count_containing("CPU usage"), 3);
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_child_and_clears_record() {
        let h = harness(LIVE_A);
        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(h.launcher.pid_alive(pid));

        h.supervisor.shutdown().await;
        assert!(!h.launcher.pid_alive(pid));
        assert_eq!(h.store.current(), None);
        assert!(!h.supervisor.report().await.monitoring);
        assert!(h.launcher.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent_and_removes_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        let pid_file = cfg.paths.pid_record();
        let marker = cfg.paths.rate_limit_marker();

        let mut file_store = FileStateStore::new(&pid_file);
        file_store
            .save(&SupervisionRecord {
                pid: 4242,
                start_time: None,
                started_at: Utc::now(),
                encoder: EncoderChoice::SoftwareH264,
                room_id: None,
            })
            .unwrap();
        std::fs::write(&marker, "x").unwrap();

        let launcher = FakeLauncher::new();
        let supervisor = Supervisor::new(Components {
            config: Arc::new(cfg),
            source: FakeSource::new(Scripted::Offline),
            launcher: launcher.clone(),
            selector: EncoderSelector::new(Box::new(NoHardware)),
            notifier: Arc::new(RecordingNotifier::default()),
            state: SupervisionState::new(Box::new(file_store)),
            health: HealthMonitor::new(Thresholds::default()),
        });

        supervisor.shutdown().await;
        assert!(!pid_file.exists());
        assert!(!marker.exists());

        supervisor.shutdown().await;
        assert!(launcher.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_cleans_up_on_cancellation() {
        let h = Arc::new(harness(LIVE_A));
        let token = CancellationToken::new();

        let runner = {
            let h = h.clone();
            let token = token.clone();
            tokio::spawn(async move { h.supervisor.run(token).await })
        };

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(h.launcher.launch_urls().len(), 1);
        assert!(h.store.current().is_some());

        token.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(h.store.current(), None);
        assert_eq!(h.launcher.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ticks_start_only_once() {
        let h = harness(LIVE_A);
        h.launcher.set_launch_delay(Duration::from_secs(10));

        let (a, b) = tokio::join!(h.supervisor.tick(), h.supervisor.tick());
        let started = [&a, &b]
            .iter()
            .filter(|o| matches!(o, TickOutcome::Started(_)))
            .count();
        assert_eq!(started, 1, "outcomes: {:?} {:?}", a, b);
        assert!(matches!(
            (&a, &b),
            (TickOutcome::AlreadySupervised(Some(_)), _) | (_, TickOutcome::AlreadySupervised(Some(_)))
        ));

        assert_eq!(h.launcher.launch_urls().len(), 1);
        assert_eq!(h.store.writes(), 1);
        assert!(h.store.distinct_pids() <= 1);
        assert_eq!(h.launcher.live_count(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_during_restart_launch_waits_and_does_not_double_start() {
        let h = harness(LIVE_A);
        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };

        h.launcher.set_launch_delay(Duration::from_secs(10));
        h.launcher.kill(pid);
        // 30s 发现退出, 60s 开始重启, 启动耗时 10s
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(h.launcher.launch_urls().len(), 1);
        assert_eq!(h.store.current(), None);

        // 重启持有状态锁期间的轮询只能等待, 不会再启动一个
        let before = Instant::now();
        let outcome = h.supervisor.tick().await;
        assert!(Instant::now() - before >= Duration::from_secs(5));
        let restarted = h.store.current().map(|r| r.pid).unwrap();
        assert_ne!(restarted, pid);
        assert_eq!(outcome, TickOutcome::AlreadySupervised(Some(restarted)));

        assert_eq!(h.launcher.launch_urls().len(), 2);
        assert_eq!(h.launcher.live_count(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_adopts_process_recorded_meanwhile() {
        let h = harness(LIVE_A);
        let pid = match h.supervisor.tick().await {
            TickOutcome::Started(pid) => pid,
            other => panic!("unexpected outcome {:?}", other),
        };

        h.launcher.kill(pid);
        tokio::time::sleep(Duration::from_secs(35)).await;
        // 重启等待期间另有进程写入记录
        h.launcher.mark_alive(5000);
        h.store.preload(SupervisionRecord {
            pid: 5000,
            start_time: None,
            started_at: Utc::now(),
            encoder: EncoderChoice::SoftwareH264,
            room_id: Some("7001".to_string()),
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.launcher.launch_urls().len(), 1);
        assert_eq!(h.notifier.count_containing("already running"), 1);
        assert_eq!(h.store.current().map(|r| r.pid), Some(5000));
        assert!(h.supervisor.report().await.monitoring);

        // 接管的进程退出后照常按策略重启
        h.launcher.kill(5000);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.launcher.launch_urls().len(), 2);
        assert_eq!(h.supervisor.retry_state(), RetryState::Attempting(2));
        let restarted = h.store.current().map(|r| r.pid).unwrap();
        assert_ne!(restarted, 5000);
        h.supervisor.shutdown().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn recycled_pid_in_record_is_stale_and_never_signalled() {
        let mut other = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let actual = ProcessIdentity::capture(other.id().unwrap());
        let recycled = SupervisionRecord::new(
            ProcessIdentity {
                pid: actual.pid,
                start_time: actual.start_time.map(|t| t + 1),
            },
            EncoderChoice::SoftwareH264,
            Some("7001".to_string()),
        );

        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        cfg.transcode.ffmpeg_binary = "/nonexistent/ffmpeg".to_string();
        let config = Arc::new(cfg);
        let store = MemoryStateStore::default();
        store.preload(recycled.clone());
        let supervisor = Supervisor::new(Components {
            config: config.clone(),
            source: FakeSource::new(LIVE_A),
            launcher: Arc::new(FfmpegLauncher::new(
                config.transcode.clone(),
                config.start_grace(),
            )),
            selector: EncoderSelector::new(Box::new(NoHardware)),
            notifier: Arc::new(RecordingNotifier::default()),
            state: SupervisionState::new(Box::new(store.clone())),
            health: HealthMonitor::with_sampler(Thresholds::default(), || HealthSample {
                cpu_percent: 5.0,
                mem_percent: 5.0,
            }),
        });

        // 清理路径不向 PID 的新主人发信号
        supervisor.shutdown().await;
        assert_eq!(store.current(), None);
        assert!(other.try_wait().unwrap().is_none());

        // 记录被当作失效清除, 随后照常尝试启动
        store.preload(recycled);
        assert_eq!(supervisor.tick().await, TickOutcome::StartFailed);
        assert_eq!(store.current(), None);
        assert!(other.try_wait().unwrap().is_none());

        other.kill().await.unwrap();
    }
}
