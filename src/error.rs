use thiserror::Error;

/// 查询直播间状态失败, 本轮跳过即可
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cannot resolve room id from {0}")]
    RoomNotFound(String),

    #[error("status api returned code {0}")]
    Api(i64),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// 转码进程启动失败, 交给重试策略处理
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process has no pid")]
    NoPid,

    #[error("process {pid} exited during start grace period ({status})")]
    ImmediateExit { pid: u32, status: String },

    #[error("stream url is missing")]
    NoStreamUrl,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notify endpoint rejected message: {0}")]
    Rejected(u16),
}

/// 启动前缺少外部依赖, 直接以非零退出
#[derive(Debug, Error)]
#[error("missing dependency {name}: {detail}")]
pub struct DependencyMissing {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
