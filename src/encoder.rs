use crate::config::TranscodeConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// 可用的视频编码方式, 按偏好顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderChoice {
    SoftwareH264,
    Vaapi,
    Nvenc,
    Qsv,
}

impl fmt::Display for EncoderChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncoderChoice::SoftwareH264 => "libx264",
            EncoderChoice::Vaapi => "h264_vaapi",
            EncoderChoice::Nvenc => "h264_nvenc",
            EncoderChoice::Qsv => "h264_qsv",
        };
        f.write_str(name)
    }
}

impl EncoderChoice {
    /// 构建完整的 FFmpeg 参数 (不含可执行文件本身)
    pub fn transcode_args(&self, cfg: &TranscodeConfig, stream_url: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

        match self {
            EncoderChoice::Vaapi => {
                args.extend(["-vaapi_device".into(), cfg.vaapi_device.clone()]);
            }
            EncoderChoice::Qsv => {
                args.extend(["-hwaccel".into(), "qsv".into()]);
            }
            EncoderChoice::SoftwareH264 | EncoderChoice::Nvenc => {}
        }

        // 源站断流时让 FFmpeg 自行重连一段时间
        args.extend([
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
            "-i".into(),
            stream_url.to_string(),
        ]);

        args.extend(self.video_args(cfg));

        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            cfg.audio_bitrate.clone(),
            "-ar".into(),
            "44100".into(),
            "-f".into(),
            "flv".into(),
            cfg.output_target.clone(),
        ]);
        args
    }

    fn video_args(&self, cfg: &TranscodeConfig) -> Vec<String> {
        let bitrate = cfg.video_bitrate.clone();
        match self {
            EncoderChoice::SoftwareH264 => vec![
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-tune".into(),
                "zerolatency".into(),
                "-b:v".into(),
                bitrate,
                "-g".into(),
                "60".into(),
            ],
            EncoderChoice::Vaapi => vec![
                "-vf".into(),
                "format=nv12,hwupload".into(),
                "-c:v".into(),
                "h264_vaapi".into(),
                "-b:v".into(),
                bitrate,
                "-g".into(),
                "60".into(),
            ],
            EncoderChoice::Nvenc => vec![
                "-c:v".into(),
                "h264_nvenc".into(),
                "-preset".into(),
                "p4".into(),
                "-b:v".into(),
                bitrate,
                "-g".into(),
                "60".into(),
            ],
            EncoderChoice::Qsv => vec![
                "-c:v".into(),
                "h264_qsv".into(),
                "-preset".into(),
                "veryfast".into(),
                "-b:v".into(),
                bitrate,
                "-g".into(),
                "60".into(),
            ],
        }
    }
}

/// 硬件编码能力探测
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    async fn vaapi(&self) -> io::Result<bool>;
    async fn nvenc(&self) -> io::Result<bool>;
    async fn qsv(&self) -> io::Result<bool>;
}

/// 通过 FFmpeg 试编码一帧来确认硬件编码器真实可用
pub struct SystemProbe {
    ffmpeg_binary: String,
    vaapi_device: String,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(cfg: &TranscodeConfig, timeout: Duration) -> Self {
        Self {
            ffmpeg_binary: cfg.ffmpeg_binary.clone(),
            vaapi_device: cfg.vaapi_device.clone(),
            timeout,
        }
    }

    async fn test_encode(&self, pre_input: &[&str], codec: &str, filter: Option<&str>) -> io::Result<bool> {
        let mut cmd = Command::new(&self.ffmpeg_binary);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd.args(pre_input);
        cmd.args(["-f", "lavfi", "-i", "nullsrc=s=256x256:d=1"]);
        if let Some(vf) = filter {
            cmd.args(["-vf", vf]);
        }
        cmd.args(["-c:v", codec, "-frames:v", "1", "-f", "null", "-"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(status) => Ok(status?.success()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} probe timed out", codec),
            )),
        }
    }
}

#[async_trait]
impl HardwareProbe for SystemProbe {
    async fn vaapi(&self) -> io::Result<bool> {
        let device = Path::new(&self.vaapi_device);
        match tokio::fs::metadata(device).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
        // 设备存在但当前用户没有读写权限时同样视为不可用
        tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .await?;
        self.test_encode(
            &["-vaapi_device", self.vaapi_device.as_str()],
            "h264_vaapi",
            Some("format=nv12,hwupload"),
        )
        .await
    }

    async fn nvenc(&self) -> io::Result<bool> {
        self.test_encode(&[], "h264_nvenc", None).await
    }

    async fn qsv(&self) -> io::Result<bool> {
        self.test_encode(&["-init_hw_device", "qsv=hw"], "h264_qsv", None).await
    }
}

type ProbeFuture<'a> = Pin<Box<dyn Future<Output = io::Result<bool>> + Send + 'a>>;

/// 每次启动前重新探测, 不缓存结果 (硬件状态可能变化)
pub struct EncoderSelector {
    probe: Box<dyn HardwareProbe>,
}

impl EncoderSelector {
    pub fn new(probe: Box<dyn HardwareProbe>) -> Self {
        Self { probe }
    }

    pub async fn select(&self) -> EncoderChoice {
        // 按偏好顺序逐个探测, 命中即停止
        let candidates: [(EncoderChoice, ProbeFuture<'_>); 3] = [
            (EncoderChoice::Vaapi, self.probe.vaapi()),
            (EncoderChoice::Nvenc, self.probe.nvenc()),
            (EncoderChoice::Qsv, self.probe.qsv()),
        ];

        for (candidate, probe) in candidates {
            match probe.await {
                Ok(true) => {
                    info!("Encoder selected: {}", candidate);
                    return candidate;
                }
                Ok(false) => debug!("Encoder [{}] unavailable", candidate),
                Err(e) => debug!("Encoder [{}] probe failed: {}", candidate, e),
            }
        }

        info!("No hardware encoder available, falling back to libx264");
        EncoderChoice::SoftwareH264
    }
}
