use crate::auction::clock::TimeRemaining;
use crate::auction::list::AuctionCollection;
use crate::auction::submission::BidOutcome;
use crate::auction::types::{format_currency, AuctionSnapshot};
use crate::auction::{
    AUCTION_NOT_FOUND_EVENT, BID_RESULT_EVENT, LIST_CHANGED_EVENT, SNAPSHOT_CHANGED_EVENT,
    SYNC_STATUS_EVENT, TICK_EVENT,
};
use crate::error::{AppError, SubscriptionError};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    Live,
    Degraded { error: SubscriptionError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionListRow {
    pub id: String,
    pub title: String,
    pub image: Option<String>,
    pub current_bid: f64,
    pub current_bid_text: String,
    pub bid_count: usize,
    pub end_time_ms: i64,
    pub countdown: String,
    pub ended: bool,
}

impl AuctionListRow {
    pub fn from_snapshot(snapshot: &AuctionSnapshot, now_ms: i64) -> Self {
        let remaining = snapshot.time_remaining(now_ms);
        Self {
            id: snapshot.id.clone(),
            title: snapshot.title.clone(),
            image: snapshot.image.clone(),
            current_bid: snapshot.current_bid,
            current_bid_text: format_currency(snapshot.current_bid),
            bid_count: snapshot.bid_count(),
            end_time_ms: snapshot.end_time_ms,
            countdown: remaining.to_string(),
            ended: remaining.ended,
        }
    }
}

pub fn list_rows(collection: &AuctionCollection, now_ms: i64) -> Vec<AuctionListRow> {
    collection
        .iter()
        .map(|snapshot| AuctionListRow::from_snapshot(snapshot, now_ms))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuctionUiEvent {
    #[serde(rename_all = "camelCase")]
    SnapshotChanged {
        snapshot: AuctionSnapshot,
        time_remaining: TimeRemaining,
        countdown: String,
    },
    #[serde(rename_all = "camelCase")]
    NotFound { auction_id: String },
    /// `auction_id` is `None` for list-wide ticks.
    #[serde(rename_all = "camelCase")]
    Tick {
        auction_id: Option<String>,
        now_ms: i64,
        time_remaining: Option<TimeRemaining>,
        countdown: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    BidResult {
        auction_id: String,
        amount: String,
        outcome: BidOutcome,
    },
    #[serde(rename_all = "camelCase")]
    ListChanged {
        collection: String,
        rows: Vec<AuctionListRow>,
    },
    #[serde(rename_all = "camelCase")]
    SyncStatus { scope: String, status: SyncStatus },
}

impl AuctionUiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SnapshotChanged { .. } => SNAPSHOT_CHANGED_EVENT,
            Self::NotFound { .. } => AUCTION_NOT_FOUND_EVENT,
            Self::Tick { .. } => TICK_EVENT,
            Self::BidResult { .. } => BID_RESULT_EVENT,
            Self::ListChanged { .. } => LIST_CHANGED_EVENT,
            Self::SyncStatus { .. } => SYNC_STATUS_EVENT,
        }
    }

    pub fn snapshot_changed(snapshot: &AuctionSnapshot, now_ms: i64) -> Self {
        let time_remaining = snapshot.time_remaining(now_ms);
        Self::SnapshotChanged {
            snapshot: snapshot.clone(),
            countdown: time_remaining.to_string(),
            time_remaining,
        }
    }
}

/// Where views deliver UI events. Implementations must not block.
pub trait AuctionEventSink: Send + Sync {
    fn emit(&self, event: AuctionUiEvent) -> Result<(), AppError>;
}

/// Emits one event, logging a failed delivery. Returns `false` once the sink
/// is gone so pumps can stop.
pub(crate) fn deliver(sink: &dyn AuctionEventSink, event: AuctionUiEvent) -> bool {
    let name = event.name();
    match sink.emit(event) {
        Ok(()) => true,
        Err(error) => {
            warn!(event = name, error = %error, "failed to deliver ui event");
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<AuctionUiEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuctionUiEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AuctionEventSink for ChannelEventSink {
    fn emit(&self, event: AuctionUiEvent) -> Result<(), AppError> {
        let name = event.name();
        self.sender
            .send(event)
            .map_err(|_| AppError::SinkClosed(name.to_string()))
    }
}
