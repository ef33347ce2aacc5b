use crate::health::HealthMonitor;
use crate::supervisor::{Supervisor, SupervisorReport};
use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/status", get(supervision_status)) // 监管状态
        .route("/sys/status", get(sys_status)) // 系统状态
        .with_state(supervisor)
}

/// 当前监管记录与重试状态
pub async fn supervision_status(State(supervisor): State<Arc<Supervisor>>) -> Json<SupervisorReport> {
    Json(supervisor.report().await)
}

/// 获取系统状态 API
/// 返回内存、负载以及监控用的占用百分比
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
    let sample = HealthMonitor::system_sample();

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "cpu_percent": sample.cpu_percent,
        "mem_percent": sample.mem_percent,
    }))
}
