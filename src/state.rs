use crate::encoder::EncoderChoice;
use crate::error::StateError;
use crate::process::ProcessIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// 当前被监管的转码进程 (持久化到磁盘, 服务重启后仍可对账)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionRecord {
    pub pid: u32,
    /// 内核记录的进程启动时间, 与 PID 一起确认进程身份
    #[serde(default)]
    pub start_time: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub encoder: EncoderChoice,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl SupervisionRecord {
    pub fn new(identity: ProcessIdentity, encoder: EncoderChoice, room_id: Option<String>) -> Self {
        Self {
            pid: identity.pid,
            start_time: identity.start_time,
            started_at: Utc::now(),
            encoder,
            room_id,
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.start_time,
        }
    }
}

pub trait StateStore: Send {
    fn load(&self) -> Result<Option<SupervisionRecord>, StateError>;
    fn save(&mut self, record: &SupervisionRecord) -> Result<(), StateError>;
    fn clear(&mut self) -> Result<(), StateError>;
}

/// JSON 文件存储, 写入走临时文件 + rename
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<SupervisionRecord>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring malformed PID record {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    fn save(&mut self, record: &SupervisionRecord) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StateError> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}

/// 所有读写都经过同一把锁, 检查-启动-写入作为一个临界区
pub struct SupervisionState {
    store: Mutex<Box<dyn StateStore>>,
}

pub type StateGuard<'a> = MutexGuard<'a, Box<dyn StateStore>>;

impl SupervisionState {
    pub fn new(store: Box<dyn StateStore>) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub async fn lock(&self) -> StateGuard<'_> {
        self.store.lock().await
    }

    pub async fn snapshot(&self) -> Result<Option<SupervisionRecord>, StateError> {
        self.store.lock().await.load()
    }
}

/// 删除文件, 不存在时返回 `Ok(false)`
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 单实例锁文件, 内容为持有者 PID 和启动时间; 析构时释放
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    pub fn acquire(path: &Path, is_alive: impl Fn(ProcessIdentity) -> bool) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let me = ProcessIdentity::capture(std::process::id());

        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    match me.start_time {
                        Some(start) => writeln!(file, "{} {}", me.pid, start)?,
                        None => writeln!(file, "{}", me.pid)?,
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid: me.pid,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_lock_holder(path) {
                    Some(holder) if holder.pid != me.pid && is_alive(holder) => {
                        anyhow::bail!("another instance is running (pid {})", holder.pid);
                    }
                    _ => {
                        warn!("Removing stale lock file {:?}", path);
                        remove_if_exists(path)?;
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("could not acquire lock file {:?}", path)
    }

    pub fn release(&self) {
        if read_lock_holder(&self.path).map(|h| h.pid) == Some(self.pid) {
            match remove_if_exists(&self.path) {
                Ok(true) => info!("Lock file {:?} released", self.path),
                Ok(false) => {}
                Err(e) => warn!("Failed to remove lock file {:?}: {}", self.path, e),
            }
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// 解析锁文件 `"<pid> [start_time]"`
pub fn read_lock_holder(path: &Path) -> Option<ProcessIdentity> {
    let content = fs::read_to_string(path).ok()?;
    let mut parts = content.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let start_time = parts.next().and_then(|t| t.parse().ok());
    Some(ProcessIdentity { pid, start_time })
}

#[cfg(test)]
pub use memory::MemoryStateStore;
