use crate::auction::clock::Clock;
use crate::auction::types::{AuctionDocument, AuctionSnapshot};
use crate::error::SubscriptionError;
use crate::session::Session;
use crate::store::{sort_documents, DocumentStore, OrderField, QueryFeed};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Every auction in a collection, soonest deadline first. Auctions without a
/// usable deadline sort last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuctionCollection {
    auctions: Vec<Arc<AuctionSnapshot>>,
    by_id: HashMap<String, usize>,
    refreshed_at_ms: i64,
}

impl AuctionCollection {
    pub fn from_documents(
        mut documents: Vec<AuctionDocument>,
        bid_floor: f64,
        refreshed_at_ms: i64,
    ) -> Self {
        sort_documents(&mut documents, OrderField::EndTime);

        let mut auctions = Vec::with_capacity(documents.len());
        let mut by_id = HashMap::with_capacity(documents.len());
        for document in documents {
            if by_id.contains_key(&document.id) {
                continue;
            }
            by_id.insert(document.id.clone(), auctions.len());
            auctions.push(Arc::new(AuctionSnapshot::from_document(
                document,
                bid_floor,
                refreshed_at_ms,
            )));
        }

        Self {
            auctions,
            by_id,
            refreshed_at_ms,
        }
    }

    pub fn get(&self, auction_id: &str) -> Option<&Arc<AuctionSnapshot>> {
        self.by_id
            .get(auction_id)
            .and_then(|index| self.auctions.get(*index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AuctionSnapshot>> {
        self.auctions.iter()
    }

    pub fn len(&self) -> usize {
        self.auctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.auctions.is_empty()
    }

    pub fn refreshed_at_ms(&self) -> i64 {
        self.refreshed_at_ms
    }

    pub fn open_count(&self, now_ms: i64) -> usize {
        self.auctions
            .iter()
            .filter(|snapshot| !snapshot.is_ended(now_ms))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent {
    Replaced(Arc<AuctionCollection>),
    Error(SubscriptionError),
}

pub struct AuctionListSynchronizer {
    store: Arc<dyn DocumentStore>,
    session: Session,
    collection: String,
    bid_floor: f64,
    clock: Arc<dyn Clock>,
    current: Arc<RwLock<Arc<AuctionCollection>>>,
    cancel_token: Mutex<CancellationToken>,
}

impl AuctionListSynchronizer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Session,
        collection: impl Into<String>,
        bid_floor: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            session,
            collection: collection.into(),
            bid_floor,
            clock,
            current: Arc::new(RwLock::new(Arc::new(AuctionCollection::default()))),
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn latest(&self) -> Arc<AuctionCollection> {
        Arc::clone(&self.current.read())
    }

    pub async fn subscribe(&self) -> Result<ListSubscription, SubscriptionError> {
        let cancel_token = self.cancel_token.lock().child_token();
        let feed = match self
            .store
            .subscribe_query(
                &self.session,
                &self.collection,
                OrderField::EndTime,
                cancel_token.clone(),
            )
            .await
        {
            Ok(feed) => feed,
            Err(error) => {
                cancel_token.cancel();
                warn!(collection = %self.collection, error = %error, "list subscription failed to open");
                return Err(SubscriptionError::from(error));
            }
        };

        info!(
            collection = %self.collection,
            backend = self.store.backend_name(),
            "list subscription opened"
        );
        Ok(ListSubscription {
            feed,
            current: Arc::clone(&self.current),
            collection: self.collection.clone(),
            bid_floor: self.bid_floor,
            clock: Arc::clone(&self.clock),
            cancel_token,
            finished: false,
        })
    }

    pub fn unsubscribe(&self) {
        let previous = std::mem::replace(&mut *self.cancel_token.lock(), CancellationToken::new());
        previous.cancel();
        debug!(collection = %self.collection, "list subscriptions released");
    }
}

impl Drop for AuctionListSynchronizer {
    fn drop(&mut self) {
        self.cancel_token.lock().cancel();
    }
}

pub struct ListSubscription {
    feed: QueryFeed,
    current: Arc<RwLock<Arc<AuctionCollection>>>,
    collection: String,
    bid_floor: f64,
    clock: Arc<dyn Clock>,
    cancel_token: CancellationToken,
    finished: bool,
}

impl ListSubscription {
    pub async fn next(&mut self) -> Option<ListEvent> {
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
            Some(Some(Ok(documents))) => {
                let replaced = Arc::new(AuctionCollection::from_documents(
                    documents,
                    self.bid_floor,
                    self.clock.now_ms(),
                ));
                *self.current.write() = Arc::clone(&replaced);
                debug!(
                    collection = %self.collection,
                    auctions = replaced.len(),
                    "auction list replaced"
                );
                Some(ListEvent::Replaced(replaced))
            }
            Some(Some(Err(error))) => {
                warn!(
                    collection = %self.collection,
                    error = %error,
                    "list feed delivered an error; keeping last collection"
                );
                Some(ListEvent::Error(SubscriptionError::from(error)))
            }
            Some(None) => {
                self.finished = true;
                if self.cancel_token.is_cancelled() {
                    return None;
                }
                warn!(collection = %self.collection, "list feed closed by store");
                Some(ListEvent::Error(SubscriptionError::channel_closed()))
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for ListSubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
