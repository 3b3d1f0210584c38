use serde::ser::Serializer;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),
    #[error("event sink closed: {0}")]
    SinkClosed(String),
    #[error("logging setup error: {0}")]
    Logging(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Failures reported by a [`crate::store::DocumentStore`] adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("auction closed: {0}")]
    AuctionClosed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::AuctionClosed(_) => "auction_closed",
            Self::Network(_) => "network",
            Self::Permission(_) => "permission",
            Self::Decode(_) => "decode",
            Self::Backend(_) => "backend",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Conflict(message)
            | Self::NotFound(message)
            | Self::AuctionClosed(message)
            | Self::Network(message)
            | Self::Permission(message)
            | Self::Decode(message)
            | Self::Backend(message) => message,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(value: reqwest::Error) -> Self {
        match value.status().map(|status| status.as_u16()) {
            Some(401) | Some(403) => Self::Permission(value.to_string()),
            Some(404) => Self::NotFound(value.to_string()),
            _ => Self::Network(value.to_string()),
        }
    }
}

impl From<simd_json::Error> for StoreError {
    fn from(value: simd_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

/// Local reasons a bid never leaves the device.
#[derive(Debug, Clone, Copy, Error, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum BidRejection {
    #[error("auction has not loaded yet")]
    NotLoaded,
    #[error("bid amount is not a valid number")]
    InvalidAmount,
    #[error("auction has ended")]
    AuctionEnded,
    #[error("bid must be greater than current bid (${current_bid:.2})")]
    #[serde(rename_all = "camelCase")]
    BidTooLow { current_bid: f64 },
    #[error("sign in to place a bid")]
    SignInRequired,
    #[error("a bid submission is already in progress")]
    SubmissionInProgress,
}

impl BidRejection {
    /// `AuctionEnded` is terminal for the auction; everything else can be
    /// corrected by the user or by waiting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuctionEnded)
    }
}

/// A conditional append that the remote store refused or never acknowledged.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("remote write failed ({kind}): {message}")]
#[serde(rename_all = "camelCase")]
pub struct RemoteWriteFailed {
    pub kind: String,
    pub message: String,
}

impl From<StoreError> for RemoteWriteFailed {
    fn from(value: StoreError) -> Self {
        Self {
            kind: value.kind().to_string(),
            message: value.message().to_string(),
        }
    }
}

/// Channel setup or delivery failure on a live subscription.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("subscription error ({kind}): {message}")]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionError {
    pub kind: String,
    pub message: String,
}

impl SubscriptionError {
    pub fn channel_closed() -> Self {
        Self {
            kind: "channel_closed".to_string(),
            message: "notification channel closed by store".to_string(),
        }
    }
}

impl From<StoreError> for SubscriptionError {
    fn from(value: StoreError) -> Self {
        Self {
            kind: value.kind().to_string(),
            message: value.message().to_string(),
        }
    }
}
