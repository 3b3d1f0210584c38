use crate::auction::clock::Clock;
use crate::auction::types::{AuctionDocument, BidRecord};
use crate::error::StoreError;
use crate::session::Session;
use crate::store::hub::{ChangeHub, DocumentLoader};
use crate::store::{
    check_append_precondition, sort_documents, AppendReceipt, ConditionalAppend, DocumentFeed,
    DocumentStore, OrderField, QueryFeed,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const HOUR_MS: i64 = 3_600_000;

struct MemoryInner {
    collections: Mutex<HashMap<String, HashMap<String, AuctionDocument>>>,
    versions: AtomicU64,
    append_calls: AtomicU64,
    hub: ChangeHub,
    clock: Arc<dyn Clock>,
}

/// Authoritative store held in process memory. Conditional appends are
/// serialized by a single lock, which is what makes them atomic.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<MemoryInner>,
}

impl MemoryDocumentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                collections: Mutex::new(HashMap::new()),
                versions: AtomicU64::new(0),
                append_calls: AtomicU64::new(0),
                hub: ChangeHub::new(),
                clock,
            }),
        }
    }

    /// Creates or replaces a document, as an external writer would.
    pub fn put_document(&self, collection: &str, mut document: AuctionDocument) {
        document.revision = Some(self.inner.next_revision());
        let document_id = document.id.clone();
        {
            let mut collections = self.inner.collections.lock();
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(document_id.clone(), document);
        }
        self.inner.hub.publish(collection, &document_id);
    }

    pub fn remove_document(&self, collection: &str, document_id: &str) -> bool {
        let removed = {
            let mut collections = self.inner.collections.lock();
            collections
                .get_mut(collection)
                .and_then(|documents| documents.remove(document_id))
                .is_some()
        };
        if removed {
            self.inner.hub.publish(collection, document_id);
        }
        removed
    }

    /// Re-announces a document without changing it, like a store that
    /// delivers a redundant notification.
    pub fn touch(&self, collection: &str, document_id: &str) {
        self.inner.hub.publish(collection, document_id);
    }

    pub fn document(&self, collection: &str, document_id: &str) -> Option<AuctionDocument> {
        self.inner.get(collection, document_id)
    }

    /// Number of conditional appends that reached the store, accepted or not.
    pub fn append_calls(&self) -> u64 {
        self.inner.append_calls.load(Ordering::SeqCst)
    }

    pub fn seed_demo_auctions(&self, collection: &str, now_ms: i64) {
        for document in demo_auctions(now_ms) {
            self.put_document(collection, document);
        }
        info!(collection, "seeded demo auctions");
    }
}

impl MemoryInner {
    fn next_revision(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn get(&self, collection: &str, document_id: &str) -> Option<AuctionDocument> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|documents| documents.get(document_id))
            .cloned()
    }
}

#[async_trait]
impl DocumentLoader for MemoryInner {
    async fn load_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<AuctionDocument>, StoreError> {
        Ok(self.get(collection, document_id))
    }

    async fn load_collection(
        &self,
        collection: &str,
        order_by: OrderField,
    ) -> Result<Vec<AuctionDocument>, StoreError> {
        let mut documents: Vec<AuctionDocument> = self
            .collections
            .lock()
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default();
        sort_documents(&mut documents, order_by);
        Ok(documents)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn subscribe_document(
        &self,
        _session: &Session,
        collection: &str,
        document_id: &str,
        cancel_token: CancellationToken,
    ) -> Result<DocumentFeed, StoreError> {
        Ok(self.inner.hub.spawn_document_feed(
            Arc::clone(&self.inner),
            collection.to_string(),
            document_id.to_string(),
            cancel_token,
        ))
    }

    async fn subscribe_query(
        &self,
        _session: &Session,
        collection: &str,
        order_by: OrderField,
        cancel_token: CancellationToken,
    ) -> Result<QueryFeed, StoreError> {
        Ok(self.inner.hub.spawn_query_feed(
            Arc::clone(&self.inner),
            collection.to_string(),
            order_by,
            cancel_token,
        ))
    }

    async fn conditional_append(
        &self,
        _session: &Session,
        request: ConditionalAppend,
    ) -> Result<AppendReceipt, StoreError> {
        self.inner.append_calls.fetch_add(1, Ordering::SeqCst);
        let now_ms = self.inner.clock.now_ms();

        let receipt = {
            let mut collections = self.inner.collections.lock();
            let document = collections
                .get_mut(&request.collection)
                .and_then(|documents| documents.get_mut(&request.document_id));

            check_append_precondition(document.as_deref(), request.bid.amount, now_ms)?;
            let Some(document) = document else {
                return Err(StoreError::NotFound(request.document_id));
            };

            let amount = request.bid.amount;
            document.bids.get_or_insert_with(Vec::new).push(request.bid);
            document.current_bid = Some(amount);
            document.revision = Some(self.inner.next_revision());

            AppendReceipt {
                document_id: document.id.clone(),
                current_bid: amount,
                bid_count: document.bids.as_ref().map(Vec::len).unwrap_or_default(),
                revision: document.revision.clone(),
            }
        };

        debug!(
            collection = %request.collection,
            document_id = %receipt.document_id,
            current_bid = receipt.current_bid,
            "conditional append committed"
        );
        self.inner
            .hub
            .publish(&request.collection, &receipt.document_id);
        Ok(receipt)
    }

    async fn ping(&self, _session: &Session, _collection: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// The three harvest auctions the storefront launched with, re-dated so they
/// are open relative to `now_ms`.
pub fn demo_auctions(now_ms: i64) -> Vec<AuctionDocument> {
    fn seeded_bid(bidder: &str, amount: f64) -> BidRecord {
        BidRecord {
            bidder: bidder.to_string(),
            bidder_id: None,
            amount,
            placed_at_ms: None,
        }
    }

    vec![
        AuctionDocument {
            id: "auction-001".to_string(),
            title: Some("Fresh Oranges (700kg)".to_string()),
            description: Some("Bid for a box of fresh Oranges from our latest harvest!".to_string()),
            image: Some(
                "https://cdn.pixabay.com/photo/2016/02/23/17/42/orange-1218158_960_720.png"
                    .to_string(),
            ),
            owner: Some("merchant1@example.com".to_string()),
            end_time_ms: Some(now_ms + 2 * HOUR_MS),
            current_bid: Some(1_550.0),
            bids: Some(vec![
                seeded_bid("John Smith", 1_350.0),
                seeded_bid("Jane Doe", 1_550.0),
            ]),
            revision: None,
        },
        AuctionDocument {
            id: "auction-002".to_string(),
            title: Some("Pineapples (650kg)".to_string()),
            description: Some(
                "Auction for a batch of freshly imported Pineapples. Perfect for sweets!"
                    .to_string(),
            ),
            image: Some(
                "https://static.vecteezy.com/system/resources/previews/008/848/362/non_2x/fresh-pineapple-free-png.png"
                    .to_string(),
            ),
            owner: Some("merchant2@example.com".to_string()),
            end_time_ms: Some(now_ms + 26 * HOUR_MS),
            current_bid: Some(1_800.0),
            bids: Some(vec![seeded_bid("Bob", 1_750.0), seeded_bid("Alice", 1_800.0)]),
            revision: None,
        },
        AuctionDocument {
            id: "auction-003".to_string(),
            title: Some("Eggs (900pcs)".to_string()),
            description: Some("A batch of farm fresh eggs, collected this week.".to_string()),
            image: None,
            owner: Some("merchant2@example.com".to_string()),
            end_time_ms: Some(now_ms + 50 * HOUR_MS),
            current_bid: Some(900.0),
            bids: Some(vec![seeded_bid("Bob", 720.0), seeded_bid("Alice", 900.0)]),
            revision: None,
        },
    ]
}
