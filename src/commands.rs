use crate::config::{AdminConfig, AppConfig, TranscodeConfig};
use crate::encoder::{EncoderSelector, SystemProbe};
use crate::error::DependencyMissing;
use crate::health::{HealthMonitor, Thresholds};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::process::{terminate_verified, FfmpegLauncher};
use crate::source::HttpStatusSource;
use crate::state::{read_lock_holder, remove_if_exists, FileStateStore, InstanceLock, StateStore, SupervisionState};
use crate::supervisor::{Components, Supervisor};
use crate::web;
use anyhow::Context;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 组装生产环境的监管组件
pub fn build_supervisor(config: Arc<AppConfig>) -> anyhow::Result<Supervisor> {
    let source = HttpStatusSource::new(
        &config.source,
        config.request_timeout(),
        config.paths.rate_limit_marker(),
    )?;
    let launcher = FfmpegLauncher::new(config.transcode.clone(), config.start_grace());
    let selector = EncoderSelector::new(Box::new(SystemProbe::new(
        &config.transcode,
        config.probe_timeout(),
    )));
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.notify.timeout_sec),
        )?),
        None => Arc::new(LogNotifier),
    };
    let state = SupervisionState::new(Box::new(FileStateStore::new(config.paths.pid_record())));
    let health = HealthMonitor::new(Thresholds::from(&config.monitor));

    Ok(Supervisor::new(Components {
        config,
        source: Arc::new(source),
        launcher: Arc::new(launcher),
        selector,
        notifier,
        state,
        health,
    }))
}

/// 单项依赖检查结果
pub struct DependencyCheck {
    pub name: String,
    pub result: Result<String, DependencyMissing>,
}

pub async fn check_dependencies(cfg: &TranscodeConfig) -> Vec<DependencyCheck> {
    let mut checks = vec![DependencyCheck {
        name: cfg.ffmpeg_binary.clone(),
        result: check_ffmpeg(&cfg.ffmpeg_binary).await,
    }];

    if let Some(font) = &cfg.font_file {
        let result = if Path::new(font).is_file() {
            Ok("present".to_string())
        } else {
            Err(DependencyMissing {
                name: font.clone(),
                detail: "font file not found".to_string(),
            })
        };
        checks.push(DependencyCheck {
            name: font.clone(),
            result,
        });
    }
    checks
}

async fn check_ffmpeg(binary: &str) -> Result<String, DependencyMissing> {
    let missing = |detail: String| DependencyMissing {
        name: binary.to_string(),
        detail,
    };
    let mut cmd = Command::new(binary);
    cmd.arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(10), cmd.output())
        .await
        .map_err(|_| missing("timed out".to_string()))?
        .map_err(|e| missing(e.to_string()))?;
    if !output.status.success() {
        return Err(missing(format!("exited with {}", output.status)));
    }
    let first_line = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    Ok(first_line)
}

async fn require_dependencies(cfg: &TranscodeConfig) -> Result<(), DependencyMissing> {
    for check in check_dependencies(cfg).await {
        check.result?;
    }
    Ok(())
}

/// `run`: 进入轮询主循环
pub async fn run(config: Arc<AppConfig>) -> anyhow::Result<()> {
    if let Err(e) = require_dependencies(&config.transcode).await {
        error!("{}", e);
        return Err(e.into());
    }

    let _lock = InstanceLock::acquire(&config.paths.instance_lock(), |holder| holder.is_running())?;
    // 先绑定管理端口, 监管器构造之后不再有跳过清理的提前返回
    let admin = bind_admin(&config.admin).await?;
    let supervisor = Arc::new(build_supervisor(config.clone())?);
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    info!(
        "Relay started. Polling {} every {}s",
        config.source.page_url, config.source.poll_interval_sec
    );
    serve(supervisor, admin, shutdown).await
}

async fn bind_admin(cfg: &AdminConfig) -> anyhow::Result<Option<TcpListener>> {
    let Some(addr) = &cfg.listen else {
        return Ok(None);
    };
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin API on {}", addr))?;
    info!("Admin API listening on {}", addr);
    Ok(Some(listener))
}

/// 运行主循环和管理接口, 循环以任何方式结束都会先执行清理
async fn serve(
    supervisor: Arc<Supervisor>,
    admin: Option<TcpListener>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let admin = admin.map(|listener| {
        let app = web::admin::router(supervisor.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Admin API stopped: {}", e);
            }
        })
    });

    let result = supervisor.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = admin {
        let _ = handle.await;
    }
    result
}

fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
                _ = term.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupt received");
        }
        token.cancel();
    });
}

/// `status`: 是否有存活的被监管进程
pub fn status(config: &AppConfig) -> bool {
    let store = FileStateStore::new(config.paths.pid_record());
    match store.load() {
        Ok(Some(record)) if record.identity().is_running() => {
            println!(
                "Running: PID {} ({}, since {})",
                record.pid,
                record.encoder,
                record.started_at.to_rfc3339()
            );
            true
        }
        Ok(Some(record)) => {
            println!("Not running (stale record for PID {})", record.pid);
            false
        }
        Ok(None) => {
            println!("Not running");
            false
        }
        Err(e) => {
            println!("Not running ({})", e);
            false
        }
    }
}

/// `stop`: 终止服务实例和被监管进程
pub async fn stop(config: &AppConfig) -> anyhow::Result<()> {
    let grace = config.stop_grace();
    let lock_path = config.paths.instance_lock();

    if let Some(holder) = read_lock_holder(&lock_path) {
        if holder.pid != std::process::id() && holder.is_running() {
            println!("Stopping service instance {}", holder.pid);
            // 服务收到 SIGTERM 后会自行停止转码进程, 多留一些时间
            terminate_verified(holder, grace + Duration::from_secs(5)).await;
        }
    }

    let mut store = FileStateStore::new(config.paths.pid_record());
    match store.load() {
        Ok(Some(record)) if record.identity().is_running() => {
            println!("Stopping transcoder {}", record.pid);
            terminate_verified(record.identity(), grace).await;
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to read supervision record: {}", e),
    }
    store.clear()?;
    remove_if_exists(&config.paths.rate_limit_marker())?;
    remove_stale_lock(&lock_path)?;

    println!("Stopped");
    Ok(())
}

/// `troubleshoot`: 依赖与编码器诊断, 返回依赖是否齐全
pub async fn troubleshoot(config: &AppConfig) -> bool {
    let mut ok = true;
    for check in check_dependencies(&config.transcode).await {
        match check.result {
            Ok(detail) => println!("[ok]      {}: {}", check.name, detail),
            Err(e) => {
                ok = false;
                println!("[missing] {}", e);
            }
        }
    }

    let selector = EncoderSelector::new(Box::new(SystemProbe::new(
        &config.transcode,
        config.probe_timeout(),
    )));
    println!("Encoder: {}", selector.select().await);

    let sample = HealthMonitor::system_sample();
    println!(
        "Host: cpu {:.1}%, memory {:.1}%",
        sample.cpu_percent, sample.mem_percent
    );

    ok
}

/// `clean`: 直接执行清理流程, 不经过信号
pub async fn clean(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let lock_path = config.paths.instance_lock();
    let supervisor = build_supervisor(config)?;
    supervisor.shutdown().await;
    remove_stale_lock(&lock_path)?;
    println!("Cleaned");
    Ok(())
}

fn remove_stale_lock(path: &Path) -> std::io::Result<()> {
    match read_lock_holder(path) {
        Some(holder) if holder.is_running() => {
            warn!("Lock file still held by live process {}", holder.pid);
        }
        _ => {
            remove_if_exists(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::encoder::EncoderChoice;
    use crate::process::ProcessIdentity;
    use crate::state::SupervisionRecord;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_ffmpeg_is_reported() {
        let mut cfg = test_config().transcode;
        cfg.ffmpeg_binary = "/nonexistent/ffmpeg".to_string();
        let checks = check_dependencies(&cfg).await;
        assert_eq!(checks.len(), 1);
        assert!(checks[0].result.is_err());
        assert!(require_dependencies(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn configured_font_must_exist() {
        let mut cfg = test_config().transcode;
        cfg.font_file = Some("/nonexistent/font.ttf".to_string());
        let checks = check_dependencies(&cfg).await;
        assert_eq!(checks.len(), 2);
        let font = checks.iter().find(|c| c.name.ends_with("font.ttf")).unwrap();
        assert!(font.result.is_err());
    }

    #[test]
    fn status_without_record_is_failure() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        assert!(!status(&cfg));
    }

    #[test]
    fn status_with_live_record_is_success() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        FileStateStore::new(cfg.paths.pid_record())
            .save(&SupervisionRecord::new(
                ProcessIdentity::capture(std::process::id()),
                EncoderChoice::SoftwareH264,
                None,
            ))
            .unwrap();
        assert!(status(&cfg));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn status_with_recycled_pid_is_failure() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        let me = ProcessIdentity::capture(std::process::id());
        FileStateStore::new(cfg.paths.pid_record())
            .save(&SupervisionRecord::new(
                ProcessIdentity {
                    pid: me.pid,
                    start_time: me.start_time.map(|t| t + 1),
                },
                EncoderChoice::SoftwareH264,
                None,
            ))
            .unwrap();
        assert!(!status(&cfg));
    }

    #[tokio::test]
    async fn stop_with_nothing_running_clears_files() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        std::fs::write(cfg.paths.rate_limit_marker(), "x").unwrap();
        std::fs::write(cfg.paths.instance_lock(), "999999\n").unwrap();

        stop(&cfg).await.unwrap();
        assert!(!cfg.paths.rate_limit_marker().exists());
        assert!(!cfg.paths.instance_lock().exists());
    }

    #[tokio::test]
    async fn admin_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = AdminConfig {
            listen: Some(taken.local_addr().unwrap().to_string()),
        };
        let err = bind_admin(&cfg).await.unwrap_err();
        assert!(err.to_string().contains("admin API"));

        assert!(bind_admin(&AdminConfig::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn serve_always_runs_cleanup() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config();
        cfg.paths.state_dir = dir.path().to_path_buf();
        FileStateStore::new(cfg.paths.pid_record())
            .save(&SupervisionRecord::new(
                ProcessIdentity {
                    pid: 999_999,
                    start_time: None,
                },
                EncoderChoice::SoftwareH264,
                None,
            ))
            .unwrap();
        std::fs::write(cfg.paths.rate_limit_marker(), "x").unwrap();
        let config = Arc::new(cfg);

        let supervisor = Arc::new(build_supervisor(config.clone()).unwrap());
        let admin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        serve(supervisor, Some(admin), shutdown).await.unwrap();
        assert!(!config.paths.pid_record().exists());
        assert!(!config.paths.rate_limit_marker().exists());
    }
}
