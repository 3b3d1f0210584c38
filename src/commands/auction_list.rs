use crate::auction::clock::{Clock, TickSubscription};
use crate::auction::list::{AuctionCollection, AuctionListSynchronizer, ListEvent, ListSubscription};
use crate::commands::events::{
    deliver, list_rows, AuctionEventSink, AuctionListRow, AuctionUiEvent, SyncStatus,
};
use crate::error::AppError;
use crate::state::ClientState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The storefront grid: every auction in the collection with a live
/// countdown, re-emitted whole whenever the store reports a change.
pub struct AuctionListView {
    collection: String,
    synchronizer: Arc<AuctionListSynchronizer>,
    alive: CancellationToken,
}

impl AuctionListView {
    pub async fn open(state: &ClientState, sink: Arc<dyn AuctionEventSink>) -> Result<Self, AppError> {
        let collection = state.config.collection.clone();
        let synchronizer = Arc::new(AuctionListSynchronizer::new(
            Arc::clone(&state.store),
            state.session(),
            collection.clone(),
            state.config.bid_floor,
            Arc::clone(&state.clock),
        ));

        let subscription = synchronizer.subscribe().await?;
        let alive = CancellationToken::new();

        tokio::spawn(pump_list(
            subscription,
            Arc::clone(&sink),
            Arc::clone(&state.clock),
            collection.clone(),
            alive.clone(),
        ));
        tokio::spawn(pump_ticks(
            state.ticks.subscribe(),
            Arc::clone(&synchronizer),
            Arc::clone(&sink),
            alive.clone(),
        ));

        info!(collection = %collection, "auction list view opened");
        Ok(Self {
            collection,
            synchronizer,
            alive,
        })
    }

    pub fn collection(&self) -> Arc<AuctionCollection> {
        self.synchronizer.latest()
    }

    pub fn rows_at(&self, now_ms: i64) -> Vec<AuctionListRow> {
        list_rows(&self.synchronizer.latest(), now_ms)
    }

    pub fn close(&self) {
        if self.alive.is_cancelled() {
            return;
        }
        self.alive.cancel();
        self.synchronizer.unsubscribe();
        info!(collection = %self.collection, "auction list view closed");
    }
}

impl Drop for AuctionListView {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_list(
    mut subscription: ListSubscription,
    sink: Arc<dyn AuctionEventSink>,
    clock: Arc<dyn Clock>,
    collection: String,
    alive: CancellationToken,
) {
    let scope = format!("list:{collection}");
    let mut degraded = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = alive.cancelled() => break,
            event = subscription.next() => event,
        };

        let delivered = match event {
            None => break,
            Some(ListEvent::Replaced(replaced)) => {
                if degraded {
                    degraded = false;
                    deliver(
                        sink.as_ref(),
                        AuctionUiEvent::SyncStatus {
                            scope: scope.clone(),
                            status: SyncStatus::Live,
                        },
                    );
                }
                deliver(
                    sink.as_ref(),
                    AuctionUiEvent::ListChanged {
                        collection: collection.clone(),
                        rows: list_rows(&replaced, clock.now_ms()),
                    },
                )
            }
            Some(ListEvent::Error(error)) => {
                degraded = true;
                deliver(
                    sink.as_ref(),
                    AuctionUiEvent::SyncStatus {
                        scope: scope.clone(),
                        status: SyncStatus::Degraded { error },
                    },
                )
            }
        };
        if !delivered {
            break;
        }
    }
    debug!(collection = %collection, "list pump stopped");
}

async fn pump_ticks(
    mut ticks: TickSubscription,
    synchronizer: Arc<AuctionListSynchronizer>,
    sink: Arc<dyn AuctionEventSink>,
    alive: CancellationToken,
) {
    loop {
        let now_ms = tokio::select! {
            biased;
            _ = alive.cancelled() => break,
            tick = ticks.next() => match tick {
                Some(now_ms) => now_ms,
                None => break,
            },
        };

        let event = AuctionUiEvent::Tick {
            auction_id: None,
            now_ms,
            time_remaining: None,
            countdown: None,
        };
        if !deliver(sink.as_ref(), event) {
            break;
        }
        debug!(
            open_auctions = synchronizer.latest().open_count(now_ms),
            "list tick"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::clock::ManualClock;
    use crate::auction::types::AuctionDocument;
    use crate::commands::events::ChannelEventSink;
    use crate::config::ClientConfig;
    use crate::store::memory::MemoryDocumentStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    const NOW: i64 = 1_752_000_000_000;

    async fn next_rows(receiver: &mut UnboundedReceiver<AuctionUiEvent>) -> Vec<AuctionListRow> {
        loop {
            match receiver.recv().await.expect("sink should stay open") {
                AuctionUiEvent::ListChanged { rows, .. } => return rows,
                AuctionUiEvent::Tick { .. } => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn list_view_emits_sorted_rows_and_follows_store_changes() {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = MemoryDocumentStore::new(clock.clone());
        store.seed_demo_auctions("auctions", NOW);
        let state = ClientState::with_store(ClientConfig::default(), Arc::new(store.clone()), clock);
        let (sink, mut receiver) = ChannelEventSink::new();

        let view = AuctionListView::open(&state, Arc::new(sink))
            .await
            .expect("list view should open");

        let rows = next_rows(&mut receiver).await;
        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["auction-001", "auction-002", "auction-003"]);
        assert_eq!(rows[0].current_bid_text, "$1550.00");
        assert_eq!(rows[1].countdown, "1d 2h 0m 0s");

        store.put_document(
            "auctions",
            AuctionDocument {
                id: "auction-000".to_string(),
                title: Some("Lemons (50kg)".to_string()),
                end_time_ms: Some(NOW + 60_000),
                ..AuctionDocument::default()
            },
        );
        let rows = next_rows(&mut receiver).await;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].id, "auction-000");
        assert_eq!(rows[0].countdown, "0h 1m 0s");
        assert_eq!(view.rows_at(NOW + 60_000)[0].countdown, "Auction Ended");

        view.close();
        store.touch("auctions", "auction-002");
        tokio::task::yield_now().await;
        while let Ok(event) = receiver.try_recv() {
            assert!(
                !matches!(event, AuctionUiEvent::ListChanged { .. }),
                "closed view must not emit list changes"
            );
        }
    }
}
