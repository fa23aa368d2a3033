use std::{fmt, time::Duration};

use serde::Deserialize;

use crate::engine::{type_code, DelayRange, PollConfig};

#[derive(Deserialize)]
pub struct Config {
    pub telegram_token: String,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub fetch_jitter_ms: DelayRange,
    pub dispatch_delay_ms: DelayRange,
}

/// A Telegram chat and the feeds it follows.
#[derive(Deserialize, Debug)]
pub struct ChannelConfig {
    pub chat_id: Snowflake,
    #[serde(default)]
    pub follows: Vec<FollowConfig>,
}

#[derive(Deserialize, Debug)]
pub struct FollowConfig {
    pub uid: Snowflake,
    /// Post kinds this chat does not want to see.
    #[serde(default)]
    pub muted: Vec<PostKindName>,
    /// Mentions prepended to every message: `@username` or a numeric user id.
    #[serde(default)]
    pub followers: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostKindName {
    Forward,
    Image,
    Text,
    Video,
    Article,
    Other,
}

/// Represents an ID that [`i64`] or [`String`].
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Snowflake {
    Number(i64),
    String(String),
}

impl Default for PollSettings {
    fn default() -> Self {
        let defaults = PollConfig::default();

        Self {
            interval_secs: defaults.interval.as_secs(),
            fetch_jitter_ms: defaults.fetch_jitter,
            dispatch_delay_ms: defaults.dispatch_delay,
        }
    }
}

impl PollSettings {
    pub fn to_poll_config(&self) -> PollConfig {
        PollConfig {
            // a zero period would make the ticker panic
            interval: Duration::from_secs(self.interval_secs.max(1)),
            fetch_jitter: self.fetch_jitter_ms,
            dispatch_delay: self.dispatch_delay_ms,
        }
    }
}

impl PostKindName {
    pub fn flag(self) -> u32 {
        match self {
            Self::Forward => type_code::REPOST,
            Self::Image => type_code::IMAGE,
            Self::Text => type_code::TEXT,
            Self::Video => type_code::VIDEO,
            Self::Article => type_code::ARTICLE,
            Self::Other => type_code::OTHER,
        }
    }
}

impl FollowConfig {
    pub fn muted_mask(&self) -> u32 {
        self.muted.iter().fold(0, |mask, kind| mask | kind.flag())
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(v) => v.fmt(f),
        }
    }
}
