use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::UpstreamError;

/// Raw feed item ("card") as returned by the dynamics API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCard {
    pub desc: CardDesc,
    /// Type-specific payload. Upstream nests it as a JSON document encoded
    /// into a string.
    pub card: String,
    /// Fields not modelled above, kept for [`Post::raw`](crate::engine::Post).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDesc {
    pub r#type: u32,
    pub dynamic_id_str: String,
    /// Publish time, unix seconds.
    #[serde(default)]
    pub timestamp: u64,
    pub user_profile: UserProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bvid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_dy_id_str: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub info: UserInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub uname: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawCard {
    pub fn id(&self) -> &str {
        &self.desc.dynamic_id_str
    }

    pub fn timestamp(&self) -> u64 {
        self.desc.timestamp
    }

    pub fn author(&self) -> &str {
        &self.desc.user_profile.info.uname
    }
}

/// Capabilities the engine needs from the feed API.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Latest item of the identity's feed (head of the list).
    async fn fetch_latest(&self, uid: &str) -> Result<RawCard, UpstreamError>;

    /// Single item by its post ID.
    async fn fetch_by_id(&self, post_id: &str) -> Result<RawCard, UpstreamError>;

    /// Human-readable name of the identity.
    async fn resolve_name(&self, uid: &str) -> Result<String, UpstreamError>;
}
