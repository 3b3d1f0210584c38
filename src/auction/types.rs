use crate::auction::clock::TimeRemaining;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CURRENT_BID_FIELD: &str = "currentBid";
pub const BIDS_FIELD: &str = "bids";
pub const END_TIME_FIELD: &str = "endTime";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidRecord {
    pub bidder: String,
    pub bidder_id: Option<String>,
    pub amount: f64,
    pub placed_at_ms: Option<i64>,
}

/// Remote document as the store delivered it. Every field except `id` may be
/// absent or malformed upstream; adapters leave such fields `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuctionDocument {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub owner: Option<String>,
    pub end_time_ms: Option<i64>,
    pub current_bid: Option<f64>,
    pub bids: Option<Vec<BidRecord>>,
    pub revision: Option<String>,
}

/// Read-only mirror of one auction document. Built wholesale from a
/// notification, never patched.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub id: String,
    pub title: String,
    pub description: String,
    pub image: Option<String>,
    pub owner: Option<String>,
    /// `i64::MIN` when the document carries no usable deadline, which makes
    /// the auction read as ended.
    pub end_time_ms: i64,
    pub current_bid: f64,
    pub bids: Vec<BidRecord>,
    pub revision: Option<String>,
    pub refreshed_at_ms: i64,
}

impl AuctionSnapshot {
    pub fn from_document(document: AuctionDocument, bid_floor: f64, refreshed_at_ms: i64) -> Self {
        let bids: Vec<BidRecord> = document
            .bids
            .unwrap_or_default()
            .into_iter()
            .filter(|bid| bid.amount.is_finite())
            .collect();

        let stored_bid = document
            .current_bid
            .filter(|value| value.is_finite())
            .unwrap_or(bid_floor);
        let current_bid = bids
            .iter()
            .map(|bid| bid.amount)
            .fold(stored_bid.max(bid_floor), f64::max);

        Self {
            id: document.id,
            title: document.title.unwrap_or_default(),
            description: document.description.unwrap_or_default(),
            image: document.image,
            owner: document.owner,
            end_time_ms: document.end_time_ms.unwrap_or(i64::MIN),
            current_bid,
            bids,
            revision: document.revision,
            refreshed_at_ms,
        }
    }

    pub fn is_ended(&self, now_ms: i64) -> bool {
        now_ms >= self.end_time_ms
    }

    pub fn time_remaining(&self, now_ms: i64) -> TimeRemaining {
        TimeRemaining::between(now_ms, self.end_time_ms)
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn highest_bid(&self) -> Option<&BidRecord> {
        self.bids
            .iter()
            .max_by(|left, right| left.amount.total_cmp(&right.amount))
    }

    /// Equality on everything the store owns; the local refresh time is
    /// ignored.
    pub fn same_content(&self, other: &Self) -> bool {
        Self {
            refreshed_at_ms: other.refreshed_at_ms,
            ..self.clone()
        } == *other
    }

    pub fn share_message(&self) -> String {
        format!(
            "Check out this auction: {} - Current bid: {}!",
            self.title,
            format_currency(self.current_bid)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BidProposal {
    pub auction_id: String,
    pub amount: String,
}

impl BidProposal {
    pub fn new(auction_id: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            auction_id: auction_id.into(),
            amount: amount.into(),
        }
    }
}

pub fn format_currency(amount: f64) -> String {
    format!("${amount:.2}")
}

/// Accepts RFC 3339 timestamps or integer epoch milliseconds.
pub fn parse_end_time_ms(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(epoch_ms) = trimmed.parse::<i64>() {
        return Some(epoch_ms);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|parsed| parsed.timestamp_millis())
}

/// Numbers sometimes arrive as strings from older writers.
pub fn parse_lenient_amount(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

pub fn format_timestamp_ms(timestamp_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Millis, true))
}
