use crate::auction::types::{AuctionDocument, AuctionSnapshot, BidRecord};
use crate::error::StoreError;
use crate::session::Session;
use crate::store::memory::MemoryDocumentStore;
use crate::store::{
    AppendReceipt, ConditionalAppend, DocumentFeed, DocumentStore, OrderField, QueryFeed,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Memory store whose conditional appends wait for a permit, so a test can
/// hold a submission in flight. Permits go to waiting appends in arrival
/// order.
pub struct GatedStore {
    inner: MemoryDocumentStore,
    gate: Semaphore,
}

impl GatedStore {
    pub fn new(inner: MemoryDocumentStore) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
        }
    }

    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl DocumentStore for GatedStore {
    fn backend_name(&self) -> &'static str {
        "gated"
    }

    async fn subscribe_document(
        &self,
        session: &Session,
        collection: &str,
        document_id: &str,
        cancel_token: CancellationToken,
    ) -> Result<DocumentFeed, StoreError> {
        self.inner
            .subscribe_document(session, collection, document_id, cancel_token)
            .await
    }

    async fn subscribe_query(
        &self,
        session: &Session,
        collection: &str,
        order_by: OrderField,
        cancel_token: CancellationToken,
    ) -> Result<QueryFeed, StoreError> {
        self.inner
            .subscribe_query(session, collection, order_by, cancel_token)
            .await
    }

    async fn conditional_append(
        &self,
        session: &Session,
        request: ConditionalAppend,
    ) -> Result<AppendReceipt, StoreError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| StoreError::Backend("gate closed".to_string()))?;
        permit.forget();
        self.inner.conditional_append(session, request).await
    }

    async fn ping(&self, session: &Session, collection: &str) -> Result<(), StoreError> {
        self.inner.ping(session, collection).await
    }
}

/// Ties, stale lower bids and repeats mixed in with genuine raises.
pub const MIXED_BID_SEQUENCE: [f64; 10] = [
    1_600.0, 1_600.0, 1_580.0, 1_700.0, 1_650.0, 1_700.0, 1_550.0, 1_800.0, 1_799.99, 1_800.01,
];

fn bid_from(session: &Session, amount: f64) -> BidRecord {
    BidRecord {
        bidder: session.bidder_label(),
        bidder_id: session.user_id.clone(),
        amount,
        placed_at_ms: None,
    }
}

/// Appends each amount in order. Returns which appends the store accepted;
/// only precondition conflicts count as a refusal.
pub async fn append_in_order(
    store: &dyn DocumentStore,
    session: &Session,
    collection: &str,
    document_id: &str,
    amounts: &[f64],
) -> Vec<bool> {
    let mut accepted = Vec::with_capacity(amounts.len());
    for &amount in amounts {
        let request = ConditionalAppend::new(collection, document_id, bid_from(session, amount));
        match store.conditional_append(session, request).await {
            Ok(receipt) => {
                assert_eq!(receipt.current_bid, amount);
                accepted.push(true);
            }
            Err(StoreError::Conflict(_)) => accepted.push(false),
            Err(error) => panic!("unexpected append error for {amount}: {error}"),
        }
    }
    accepted
}

/// Fires every amount at once. Returns how many the store accepted.
pub async fn append_concurrently(
    store: &dyn DocumentStore,
    session: &Session,
    collection: &str,
    document_id: &str,
    amounts: &[f64],
) -> usize {
    let attempts = amounts.iter().map(|&amount| {
        let request = ConditionalAppend::new(collection, document_id, bid_from(session, amount));
        store.conditional_append(session, request)
    });
    join_all(attempts)
        .await
        .into_iter()
        .filter(|result| match result {
            Ok(_) => true,
            Err(StoreError::Conflict(_)) => false,
            Err(error) => panic!("unexpected append error: {error}"),
        })
        .count()
}

/// Stored bid amounts rise strictly and the snapshot's current bid is the
/// highest of them.
pub fn assert_bid_history_is_monotonic(document: AuctionDocument) -> Vec<f64> {
    let stored_current = document.current_bid;
    let snapshot = AuctionSnapshot::from_document(document, 0.0, 0);
    let amounts: Vec<f64> = snapshot.bids.iter().map(|bid| bid.amount).collect();

    for pair in amounts.windows(2) {
        assert!(pair[0] < pair[1], "bid history must rise strictly: {amounts:?}");
    }
    let highest = amounts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(snapshot.current_bid, highest);
    assert_eq!(stored_current, Some(highest));
    amounts
}
