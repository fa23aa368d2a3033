use thiserror::Error;

/// Failure talking to the feed API. Always transient from the engine's
/// point of view: the identity is skipped for the current cycle.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Scheme(#[from] serde_json::Error),
    #[error("API returned error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("feed of {uid} is empty")]
    EmptyFeed { uid: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("malformed post {post_id}: {reason}")]
    MalformedPost { post_id: String, reason: String },
    #[error("can not resolve name of {uid}: {source}")]
    NameResolution {
        uid: String,
        #[source]
        source: UpstreamError,
    },
}

/// Error type returned by subscriber callbacks.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

impl EngineError {
    pub fn malformed(post_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedPost {
            post_id: post_id.into(),
            reason: reason.to_string(),
        }
    }
}
