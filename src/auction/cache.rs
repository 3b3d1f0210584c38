//! Per-auction mirror of the remote document.
//!
//! The cached value is an `Arc<AuctionSnapshot>` swapped under a lock, so a
//! reader holds either the previous document or the next one, never a mix.

use crate::auction::clock::Clock;
use crate::auction::types::AuctionSnapshot;
use crate::error::SubscriptionError;
use crate::session::Session;
use crate::store::{DocumentChange, DocumentFeed, DocumentStore};
use futures_util::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    Loaded(Arc<AuctionSnapshot>),
    NotFound,
    Error(SubscriptionError),
}

type SnapshotSlot = Arc<RwLock<Option<Arc<AuctionSnapshot>>>>;

/// Cheap read handle onto a cache's latest snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    auction_id: Arc<str>,
    slot: SnapshotSlot,
}

impl SnapshotReader {
    pub fn auction_id(&self) -> &str {
        &self.auction_id
    }

    pub fn latest(&self) -> Option<Arc<AuctionSnapshot>> {
        self.slot.read().clone()
    }

    /// `None` until a snapshot has loaded.
    pub fn is_ended(&self, now_ms: i64) -> Option<bool> {
        self.slot.read().as_ref().map(|snapshot| snapshot.is_ended(now_ms))
    }
}

pub struct AuctionSnapshotCache {
    store: Arc<dyn DocumentStore>,
    session: Session,
    collection: String,
    auction_id: String,
    bid_floor: f64,
    clock: Arc<dyn Clock>,
    slot: SnapshotSlot,
    cancel_token: Mutex<CancellationToken>,
}

impl AuctionSnapshotCache {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Session,
        collection: impl Into<String>,
        auction_id: impl Into<String>,
        bid_floor: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            session,
            collection: collection.into(),
            auction_id: auction_id.into(),
            bid_floor,
            clock,
            slot: Arc::new(RwLock::new(None)),
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn auction_id(&self) -> &str {
        &self.auction_id
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            auction_id: Arc::from(self.auction_id.as_str()),
            slot: Arc::clone(&self.slot),
        }
    }

    pub fn latest(&self) -> Option<Arc<AuctionSnapshot>> {
        self.slot.read().clone()
    }

    /// Opens a live feed for this auction. Dropping the returned subscription,
    /// calling [`Self::unsubscribe`], or dropping the cache releases it.
    pub async fn subscribe(&self) -> Result<SnapshotSubscription, SubscriptionError> {
        let cancel_token = self.cancel_token.lock().child_token();
        let feed = self
            .store
            .subscribe_document(
                &self.session,
                &self.collection,
                &self.auction_id,
                cancel_token.clone(),
            )
            .await
            .map_err(|error| {
                cancel_token.cancel();
                warn!(
                    auction_id = %self.auction_id,
                    error = %error,
                    "snapshot subscription failed to open"
                );
                SubscriptionError::from(error)
            })?;

        info!(
            auction_id = %self.auction_id,
            backend = self.store.backend_name(),
            "snapshot subscription opened"
        );
        Ok(SnapshotSubscription {
            feed,
            slot: Arc::clone(&self.slot),
            auction_id: self.auction_id.clone(),
            bid_floor: self.bid_floor,
            clock: Arc::clone(&self.clock),
            cancel_token,
            finished: false,
        })
    }

    /// Releases every open subscription. The cache can subscribe again
    /// afterwards.
    pub fn unsubscribe(&self) {
        let previous = std::mem::replace(&mut *self.cancel_token.lock(), CancellationToken::new());
        previous.cancel();
        debug!(auction_id = %self.auction_id, "snapshot subscriptions released");
    }
}

impl Drop for AuctionSnapshotCache {
    fn drop(&mut self) {
        self.cancel_token.lock().cancel();
    }
}

pub struct SnapshotSubscription {
    feed: DocumentFeed,
    slot: SnapshotSlot,
    auction_id: String,
    bid_floor: f64,
    clock: Arc<dyn Clock>,
    cancel_token: CancellationToken,
    finished: bool,
}

impl SnapshotSubscription {
    /// Waits for the next store notification and applies it. Every
    /// notification produces exactly one event; `None` means the
    /// subscription was released.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        if self.finished {
            return None;
        }

        let received = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => None,
            received = self.feed.recv() => Some(received),
        };

        match received {
            None => {
                self.finished = true;
                None
            }
            Some(Some(Ok(DocumentChange::Found(document)))) => {
                let snapshot = Arc::new(AuctionSnapshot::from_document(
                    document,
                    self.bid_floor,
                    self.clock.now_ms(),
                ));
                *self.slot.write() = Some(Arc::clone(&snapshot));
                debug!(
                    auction_id = %self.auction_id,
                    current_bid = snapshot.current_bid,
                    bid_count = snapshot.bid_count(),
                    "snapshot replaced"
                );
                Some(SnapshotEvent::Loaded(snapshot))
            }
            Some(Some(Ok(DocumentChange::Missing))) => {
                *self.slot.write() = None;
                info!(auction_id = %self.auction_id, "auction not found");
                Some(SnapshotEvent::NotFound)
            }
            Some(Some(Err(error))) => {
                warn!(
                    auction_id = %self.auction_id,
                    error = %error,
                    "snapshot feed delivered an error; keeping last snapshot"
                );
                Some(SnapshotEvent::Error(SubscriptionError::from(error)))
            }
            Some(None) => {
                self.finished = true;
                if self.cancel_token.is_cancelled() {
                    return None;
                }
                warn!(auction_id = %self.auction_id, "snapshot feed closed by store");
                Some(SnapshotEvent::Error(SubscriptionError::channel_closed()))
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn into_stream(self) -> impl Stream<Item = SnapshotEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.next().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for SnapshotSubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        debug!(auction_id = %self.auction_id, "snapshot subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::clock::ManualClock;
    use crate::auction::types::AuctionDocument;
    use crate::error::StoreError;
    use crate::store::memory::MemoryDocumentStore;
    use crate::store::{AppendReceipt, ConditionalAppend, OrderField, QueryFeed};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    const COLLECTION: &str = "auctions";
    const NOW: i64 = 1_752_000_000_000;

    fn memory_store() -> (MemoryDocumentStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = MemoryDocumentStore::new(clock.clone());
        store.seed_demo_auctions(COLLECTION, NOW);
        (store, clock)
    }

    fn cache_for(store: &MemoryDocumentStore, clock: Arc<ManualClock>, auction_id: &str) -> AuctionSnapshotCache {
        AuctionSnapshotCache::new(
            Arc::new(store.clone()),
            Session::anonymous(),
            COLLECTION,
            auction_id,
            0.0,
            clock,
        )
    }

    #[tokio::test]
    async fn first_event_is_current_document() {
        let (store, clock) = memory_store();
        let cache = cache_for(&store, clock, "auction-001");
        assert!(cache.latest().is_none());

        let mut subscription = cache.subscribe().await.expect("subscription should open");
        let event = subscription.next().await.expect("initial event");

        let SnapshotEvent::Loaded(snapshot) = event else {
            panic!("expected a loaded snapshot, got {event:?}");
        };
        assert_eq!(snapshot.current_bid, 1_550.0);
        assert_eq!(snapshot.refreshed_at_ms, NOW);
        assert_eq!(cache.reader().latest(), Some(snapshot));
    }

    #[tokio::test]
    async fn missing_document_emits_not_found_and_clears_cache() {
        let (store, clock) = memory_store();
        let cache = cache_for(&store, clock, "auction-001");
        let mut subscription = cache.subscribe().await.expect("subscription should open");
        assert!(matches!(subscription.next().await, Some(SnapshotEvent::Loaded(_))));

        store.remove_document(COLLECTION, "auction-001");
        assert_eq!(subscription.next().await, Some(SnapshotEvent::NotFound));
        assert!(cache.latest().is_none());
    }

    #[tokio::test]
    async fn replayed_notification_leaves_snapshot_unchanged() {
        let (store, clock) = memory_store();
        let cache = cache_for(&store, clock.clone(), "auction-002");
        let mut subscription = cache.subscribe().await.expect("subscription should open");

        let Some(SnapshotEvent::Loaded(first)) = subscription.next().await else {
            panic!("expected initial snapshot");
        };

        clock.advance(500);
        store.touch(COLLECTION, "auction-002");
        let Some(SnapshotEvent::Loaded(second)) = subscription.next().await else {
            panic!("expected replayed snapshot");
        };

        assert!(first.same_content(&second));
        assert_eq!(second.bid_count(), 2);
        assert_eq!(second.current_bid, 1_800.0);
        assert_eq!(second.refreshed_at_ms, NOW + 500);
    }

    #[tokio::test]
    async fn remote_appends_replace_the_snapshot_wholesale() {
        let (store, clock) = memory_store();
        let cache = cache_for(&store, clock, "auction-003");
        let reader = cache.reader();
        let mut subscription = cache.subscribe().await.expect("subscription should open");
        assert!(matches!(subscription.next().await, Some(SnapshotEvent::Loaded(_))));

        let before = reader.latest().expect("snapshot loaded");
        store
            .conditional_append(
                &Session::anonymous(),
                ConditionalAppend::new(
                    COLLECTION,
                    "auction-003",
                    crate::auction::types::BidRecord {
                        bidder: "Carol".to_string(),
                        bidder_id: None,
                        amount: 950.0,
                        placed_at_ms: None,
                    },
                ),
            )
            .await
            .expect("append should succeed");

        assert!(matches!(subscription.next().await, Some(SnapshotEvent::Loaded(_))));
        let after = reader.latest().expect("snapshot loaded");

        // The earlier Arc is untouched; readers holding it saw a whole document.
        assert_eq!(before.current_bid, 900.0);
        assert_eq!(before.bid_count(), 2);
        assert_eq!(after.current_bid, 950.0);
        assert_eq!(after.bid_count(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let (store, clock) = memory_store();
        let cache = cache_for(&store, clock, "auction-001");
        let subscription = cache.subscribe().await.expect("subscription should open");
        let mut events = Box::pin(subscription.into_stream());
        assert!(matches!(events.next().await, Some(SnapshotEvent::Loaded(_))));

        cache.unsubscribe();
        assert_eq!(events.next().await, None);

        let mut reopened = cache.subscribe().await.expect("cache can subscribe again");
        assert!(matches!(reopened.next().await, Some(SnapshotEvent::Loaded(_))));
    }

    #[tokio::test]
    async fn reader_reports_expiry_from_supplied_time() {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = MemoryDocumentStore::new(clock.clone());
        store.put_document(
            COLLECTION,
            AuctionDocument {
                id: "closing".to_string(),
                end_time_ms: Some(NOW + 1_000),
                ..AuctionDocument::default()
            },
        );
        let cache = cache_for(&store, clock, "closing");
        let reader = cache.reader();
        assert_eq!(reader.is_ended(NOW), None);

        let mut subscription = cache.subscribe().await.expect("subscription should open");
        subscription.next().await;
        assert_eq!(reader.is_ended(NOW + 999), Some(false));
        assert_eq!(reader.is_ended(NOW + 1_000), Some(true));
    }

    struct FlakyStore {
        script: Mutex<Option<Vec<Result<DocumentChange, StoreError>>>>,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        fn backend_name(&self) -> &'static str {
            "flaky"
        }

        async fn subscribe_document(
            &self,
            _session: &Session,
            _collection: &str,
            _document_id: &str,
            _cancel_token: CancellationToken,
        ) -> Result<DocumentFeed, StoreError> {
            let script = self.script.lock().take().unwrap_or_default();
            let (sender, receiver) = mpsc::channel(script.len().max(1));
            for item in script {
                sender.try_send(item).expect("script fits in channel");
            }
            Ok(receiver)
        }

        async fn subscribe_query(
            &self,
            _session: &Session,
            _collection: &str,
            _order_by: OrderField,
            _cancel_token: CancellationToken,
        ) -> Result<QueryFeed, StoreError> {
            Err(StoreError::Backend("not scripted".to_string()))
        }

        async fn conditional_append(
            &self,
            _session: &Session,
            _request: ConditionalAppend,
        ) -> Result<AppendReceipt, StoreError> {
            Err(StoreError::Backend("not scripted".to_string()))
        }

        async fn ping(&self, _session: &Session, _collection: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn feed_errors_keep_stale_snapshot_and_report_degraded() {
        let store = FlakyStore {
            script: Mutex::new(Some(vec![
                Ok(DocumentChange::Found(AuctionDocument {
                    id: "auction-001".to_string(),
                    current_bid: Some(10.0),
                    end_time_ms: Some(NOW + 1_000),
                    ..AuctionDocument::default()
                })),
                Err(StoreError::Network("connection reset".to_string())),
            ])),
        };
        let cache = AuctionSnapshotCache::new(
            Arc::new(store),
            Session::anonymous(),
            COLLECTION,
            "auction-001",
            0.0,
            Arc::new(ManualClock::new(NOW)),
        );
        let mut subscription = cache.subscribe().await.expect("subscription should open");

        assert!(matches!(subscription.next().await, Some(SnapshotEvent::Loaded(_))));
        let degraded = subscription.next().await;
        assert_eq!(
            degraded,
            Some(SnapshotEvent::Error(SubscriptionError {
                kind: "network".to_string(),
                message: "connection reset".to_string(),
            }))
        );
        assert_eq!(cache.latest().map(|snapshot| snapshot.current_bid), Some(10.0));

        // The scripted sender is gone, so the store closed the channel.
        assert_eq!(
            subscription.next().await,
            Some(SnapshotEvent::Error(SubscriptionError::channel_closed()))
        );
        assert_eq!(subscription.next().await, None);
    }
}
