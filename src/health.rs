use crate::config::MonitorConfig;
use serde::Serialize;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            mem_percent: 85.0,
        }
    }
}

impl From<&MonitorConfig> for Thresholds {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            cpu_percent: cfg.cpu_threshold,
            mem_percent: cfg.mem_threshold,
        }
    }
}

/// 越过阈值的提示, 不是错误, 不会阻断监管
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceWarning {
    HighCpu { value: f64, threshold: f64 },
    HighMemory { value: f64, threshold: f64 },
    SourceOffline,
}

impl fmt::Display for ResourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceWarning::HighCpu { value, threshold } => {
                write!(f, "CPU usage {:.1}% exceeds {:.0}%", value, threshold)
            }
            ResourceWarning::HighMemory { value, threshold } => {
                write!(f, "Memory usage {:.1}% exceeds {:.0}%", value, threshold)
            }
            ResourceWarning::SourceOffline => {
                write!(f, "Transcoder is running but the source reports offline")
            }
        }
    }
}

/// 无状态判断: 每次采样超过阈值都会重新告警
pub fn evaluate(sample: &HealthSample, thresholds: &Thresholds) -> Vec<ResourceWarning> {
    let mut warnings = Vec::new();
    if sample.cpu_percent > thresholds.cpu_percent {
        warnings.push(ResourceWarning::HighCpu {
            value: sample.cpu_percent,
            threshold: thresholds.cpu_percent,
        });
    }
    if sample.mem_percent > thresholds.mem_percent {
        warnings.push(ResourceWarning::HighMemory {
            value: sample.mem_percent,
            threshold: thresholds.mem_percent,
        });
    }
    warnings
}

type Sampler = Box<dyn Fn() -> HealthSample + Send + Sync>;

pub struct HealthMonitor {
    thresholds: Thresholds,
    sampler: Sampler,
}

impl HealthMonitor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self::with_sampler(thresholds, Self::system_sample)
    }

    pub fn with_sampler(
        thresholds: Thresholds,
        sampler: impl Fn() -> HealthSample + Send + Sync + 'static,
    ) -> Self {
        Self {
            thresholds,
            sampler: Box::new(sampler),
        }
    }

    pub fn sample(&self) -> HealthSample {
        (self.sampler)()
    }

    /// 读取主机负载与内存占用
    ///
    /// CPU 百分比按 1 分钟平均负载 / 核数估算
    pub fn system_sample() -> HealthSample {
        let cpus = sys_info::cpu_num().unwrap_or(1).max(1) as f64;
        let cpu_percent = match sys_info::loadavg() {
            Ok(load) => load.one / cpus * 100.0,
            Err(e) => {
                warn!("Failed to read load average: {}", e);
                0.0
            }
        };

        let mem_percent = match sys_info::mem_info() {
            Ok(mem) if mem.total > 0 => {
                let used = mem.total.saturating_sub(mem.avail);
                used as f64 / mem.total as f64 * 100.0
            }
            Ok(_) => 0.0,
            Err(e) => {
                warn!("Failed to read memory info: {}", e);
                0.0
            }
        };

        HealthSample {
            cpu_percent,
            mem_percent,
        }
    }

    /// 合并主机指标和直播源判断
    pub fn check(&self, sample: &HealthSample, source_live: Option<bool>) -> Vec<ResourceWarning> {
        let mut warnings = evaluate(sample, &self.thresholds);
        if source_live == Some(false) {
            warnings.push(ResourceWarning::SourceOffline);
        }
        warnings
    }
}
