use crate::config::SourceConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// 直播间元信息
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamMetadata {
    pub title: Option<String>,
    pub owner_name: Option<String>,
    pub owner_id: Option<String>,
    pub owner_signature: Option<String>,
    pub cover_image_url: Option<String>,
    pub server_timestamp: Option<i64>,
}

/// 单次轮询得到的直播状态快照, 不可变
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcastStatus {
    pub is_live: bool,
    pub playable_url: Option<String>,
    pub room_identifier: Option<String>,
    pub metadata: StreamMetadata,
}

impl BroadcastStatus {
    pub fn summary(&self) -> String {
        let state = if self.is_live { "online" } else { "offline" };
        let owner = self.metadata.owner_name.as_deref().unwrap_or("unknown");
        let mut text = format!("[{}] {}", state, owner);
        if let Some(title) = &self.metadata.title {
            text.push_str(&format!(" - {}", title));
        }
        if let Some(room) = &self.room_identifier {
            text.push_str(&format!(" (room {})", room));
        }
        text
    }
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self) -> Result<BroadcastStatus, FetchError>;
}

/// 房间信息接口的响应体
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfo {
    status_code: i64,
    #[serde(default)]
    live_status: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    cover_url: Option<String>,
    #[serde(default)]
    owner_signature: Option<String>,
    #[serde(default)]
    owner_nickname: Option<String>,
    #[serde(default)]
    owner_unique_id: Option<String>,
    #[serde(default)]
    playable_url: Option<String>,
    #[serde(default)]
    server_timestamp: Option<i64>,
}

const LIVE_STATUS_ONLINE: i64 = 2;

impl RoomInfo {
    fn into_status(self, room_id: String) -> Result<BroadcastStatus, FetchError> {
        if self.status_code != 0 {
            return Err(FetchError::Api(self.status_code));
        }
        Ok(BroadcastStatus {
            is_live: self.live_status == LIVE_STATUS_ONLINE,
            playable_url: self.playable_url.filter(|u| !u.is_empty()),
            room_identifier: Some(room_id),
            metadata: StreamMetadata {
                title: self.title,
                owner_name: self.owner_nickname,
                owner_id: self.owner_unique_id,
                owner_signature: self.owner_signature,
                cover_image_url: self.cover_url,
                server_timestamp: self.server_timestamp,
            },
        })
    }
}

/// 取最终跳转地址中最后一个纯数字路径段作为房间号
pub fn room_id_from_url(url: &Url) -> Option<String> {
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "room_id") {
        if !id.is_empty() {
            return Some(id.into_owned());
        }
    }
    url.path_segments()?
        .rev()
        .find(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

pub struct HttpStatusSource {
    client: reqwest::Client,
    page_url: String,
    room_api: String,
    rate_limit_marker: PathBuf,
}

impl HttpStatusSource {
    pub fn new(cfg: &SourceConfig, timeout: Duration, rate_limit_marker: PathBuf) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &cfg.cookie {
            headers.insert(COOKIE, HeaderValue::from_str(cookie)?);
        }
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers);
        if let Some(ua) = &cfg.user_agent {
            builder = builder.user_agent(ua.clone());
        }

        Ok(Self {
            client: builder.build()?,
            page_url: cfg.page_url.clone(),
            room_api: cfg.room_api.clone(),
            rate_limit_marker,
        })
    }

    fn check_rate_limit(&self, status: StatusCode) {
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Status source is rate limiting requests");
            let stamp = chrono::Utc::now().to_rfc3339();
            if let Err(e) = std::fs::write(&self.rate_limit_marker, stamp) {
                warn!("Failed to write rate limit marker: {}", e);
            }
        }
    }

    async fn resolve_room_id(&self) -> Result<String, FetchError> {
        let resp = self.client.get(&self.page_url).send().await?;
        self.check_rate_limit(resp.status());
        let resp = resp.error_for_status()?;
        room_id_from_url(resp.url()).ok_or_else(|| FetchError::RoomNotFound(resp.url().to_string()))
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> Result<BroadcastStatus, FetchError> {
        let room_id = self.resolve_room_id().await?;
        let api = self.room_api.replace("{room_id}", &room_id);
        debug!("Querying room [{}]", room_id);

        let resp = self.client.get(&api).send().await?;
        self.check_rate_limit(resp.status());
        let body = resp.error_for_status()?.text().await?;
        let info: RoomInfo =
            serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        info.into_status(room_id)
    }
}
