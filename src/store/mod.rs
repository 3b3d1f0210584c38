//! Boundary to the authoritative document store.
//!
//! Every adapter exposes the same three operations: a live document feed, a
//! live ordered-collection feed, and an atomic conditional append. Feeds
//! always start with the current state and then deliver full documents (or
//! full collections) in the order the store produced them.

pub mod firestore;
pub mod hub;
pub mod memory;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

use crate::auction::types::{AuctionDocument, BidRecord};
use crate::error::StoreError;
use crate::session::Session;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const FEED_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Found(AuctionDocument),
    Missing,
}

pub type DocumentFeed = mpsc::Receiver<Result<DocumentChange, StoreError>>;
pub type QueryFeed = mpsc::Receiver<Result<Vec<AuctionDocument>, StoreError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderField {
    EndTime,
}

impl OrderField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTime => "endTime",
        }
    }
}

/// Append `bid` to the document's bid list and raise `currentBid` to
/// `bid.amount`, but only if the precondition in
/// [`check_append_precondition`] holds at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalAppend {
    pub collection: String,
    pub document_id: String,
    pub bid: BidRecord,
}

impl ConditionalAppend {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>, bid: BidRecord) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
            bid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendReceipt {
    pub document_id: String,
    pub current_bid: f64,
    pub bid_count: usize,
    pub revision: Option<String>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn subscribe_document(
        &self,
        session: &Session,
        collection: &str,
        document_id: &str,
        cancel_token: CancellationToken,
    ) -> Result<DocumentFeed, StoreError>;

    async fn subscribe_query(
        &self,
        session: &Session,
        collection: &str,
        order_by: OrderField,
        cancel_token: CancellationToken,
    ) -> Result<QueryFeed, StoreError>;

    async fn conditional_append(
        &self,
        session: &Session,
        request: ConditionalAppend,
    ) -> Result<AppendReceipt, StoreError>;

    /// Cheap reachability check, made with the caller's credentials.
    async fn ping(&self, session: &Session, collection: &str) -> Result<(), StoreError>;
}

/// Highest amount the stored document has already accepted. Stores treat a
/// missing `currentBid` as zero.
pub fn stored_high_bid(document: &AuctionDocument) -> f64 {
    let stored = document
        .current_bid
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
        .max(0.0);
    document
        .bids
        .iter()
        .flatten()
        .map(|bid| bid.amount)
        .filter(|amount| amount.is_finite())
        .fold(stored, f64::max)
}

/// Write-time admission rule shared by every adapter: the document exists,
/// the deadline has not passed, and the amount strictly exceeds what the
/// store already holds.
pub fn check_append_precondition(
    document: Option<&AuctionDocument>,
    amount: f64,
    now_ms: i64,
) -> Result<(), StoreError> {
    let document = document.ok_or_else(|| StoreError::NotFound("auction does not exist".to_string()))?;

    match document.end_time_ms {
        Some(end_time_ms) if now_ms < end_time_ms => {}
        _ => {
            return Err(StoreError::AuctionClosed(format!(
                "auction {} is no longer accepting bids",
                document.id
            )))
        }
    }

    if !amount.is_finite() {
        return Err(StoreError::Conflict("bid amount must be finite".to_string()));
    }

    let high_bid = stored_high_bid(document);
    if amount <= high_bid {
        return Err(StoreError::Conflict(format!(
            "bid {amount:.2} does not exceed stored current bid {high_bid:.2}"
        )));
    }

    Ok(())
}

pub fn sort_documents(documents: &mut [AuctionDocument], order_by: OrderField) {
    documents.sort_by(|left, right| {
        let primary = match order_by {
            OrderField::EndTime => compare_missing_last(left.end_time_ms, right.end_time_ms),
        };
        primary.then_with(|| left.id.cmp(&right.id))
    });
}

fn compare_missing_last(left: Option<i64>, right: Option<i64>) -> Ordering {
    match (left, right) {
        (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
