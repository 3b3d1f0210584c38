//! Change fan-out for stores that live in this process. Writers publish the
//! id of the document they touched; every feed reloads the full current
//! state from its loader and forwards it.

use crate::auction::types::AuctionDocument;
use crate::error::StoreError;
use crate::store::{DocumentChange, DocumentFeed, OrderField, QueryFeed, FEED_CAPACITY};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: String,
    pub document_id: String,
}

#[async_trait]
pub trait DocumentLoader: Send + Sync + 'static {
    async fn load_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<AuctionDocument>, StoreError>;

    async fn load_collection(
        &self,
        collection: &str,
        order_by: OrderField,
    ) -> Result<Vec<AuctionDocument>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct ChangeHub {
    sender: broadcast::Sender<ChangeNotice>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, collection: &str, document_id: &str) {
        let notice = ChangeNotice {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
        };
        if self.sender.send(notice).is_err() {
            debug!(collection, document_id, "change published with no live feeds");
        }
    }

    pub fn spawn_document_feed<L: DocumentLoader>(
        &self,
        loader: Arc<L>,
        collection: String,
        document_id: String,
        cancel_token: CancellationToken,
    ) -> DocumentFeed {
        // Subscribe before the first read so no change can slip between them.
        let mut notices = self.sender.subscribe();
        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);

        tokio::spawn(async move {
            if !forward_document(&*loader, &collection, &document_id, &sender, &cancel_token).await {
                return;
            }

            loop {
                let notice = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    _ = sender.closed() => break,
                    notice = notices.recv() => notice,
                };

                let reload = match notice {
                    Ok(notice) => notice.collection == collection && notice.document_id == document_id,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%collection, %document_id, skipped, "document feed lagged; resyncing");
                        true
                    }
                    Err(RecvError::Closed) => {
                        let _ = sender
                            .send(Err(StoreError::Backend("change hub closed".to_string())))
                            .await;
                        break;
                    }
                };

                if reload
                    && !forward_document(&*loader, &collection, &document_id, &sender, &cancel_token)
                        .await
                {
                    break;
                }
            }
            debug!(%collection, %document_id, "document feed closed");
        });

        receiver
    }

    pub fn spawn_query_feed<L: DocumentLoader>(
        &self,
        loader: Arc<L>,
        collection: String,
        order_by: OrderField,
        cancel_token: CancellationToken,
    ) -> QueryFeed {
        let mut notices = self.sender.subscribe();
        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);

        tokio::spawn(async move {
            if !forward_collection(&*loader, &collection, order_by, &sender, &cancel_token).await {
                return;
            }

            loop {
                let notice = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    _ = sender.closed() => break,
                    notice = notices.recv() => notice,
                };

                let reload = match notice {
                    Ok(notice) => notice.collection == collection,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%collection, skipped, "query feed lagged; resyncing");
                        true
                    }
                    Err(RecvError::Closed) => {
                        let _ = sender
                            .send(Err(StoreError::Backend("change hub closed".to_string())))
                            .await;
                        break;
                    }
                };

                if reload
                    && !forward_collection(&*loader, &collection, order_by, &sender, &cancel_token)
                        .await
                {
                    break;
                }
            }
            debug!(%collection, "query feed closed");
        });

        receiver
    }
}

async fn forward_document<L: DocumentLoader>(
    loader: &L,
    collection: &str,
    document_id: &str,
    sender: &mpsc::Sender<Result<DocumentChange, StoreError>>,
    cancel_token: &CancellationToken,
) -> bool {
    let item = loader
        .load_document(collection, document_id)
        .await
        .map(|loaded| match loaded {
            Some(document) => DocumentChange::Found(document),
            None => DocumentChange::Missing,
        });

    tokio::select! {
        _ = cancel_token.cancelled() => false,
        sent = sender.send(item) => sent.is_ok(),
    }
}

async fn forward_collection<L: DocumentLoader>(
    loader: &L,
    collection: &str,
    order_by: OrderField,
    sender: &mpsc::Sender<Result<Vec<AuctionDocument>, StoreError>>,
    cancel_token: &CancellationToken,
) -> bool {
    let item = loader.load_collection(collection, order_by).await;

    tokio::select! {
        _ = cancel_token.cancelled() => false,
        sent = sender.send(item) => sent.is_ok(),
    }
}
