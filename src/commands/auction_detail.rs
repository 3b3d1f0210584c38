use crate::auction::cache::{AuctionSnapshotCache, SnapshotEvent, SnapshotReader, SnapshotSubscription};
use crate::auction::clock::{Clock, TickSubscription};
use crate::auction::submission::{BidOutcome, BidSubmissionPipeline, SubmissionPhase};
use crate::auction::types::{AuctionSnapshot, BidProposal};
use crate::commands::events::{deliver, AuctionEventSink, AuctionUiEvent, SyncStatus};
use crate::error::AppError;
use crate::state::ClientState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One open auction detail screen: a live snapshot, a countdown, and a bid
/// form. Closing the view (or dropping it) stops every event it would emit,
/// including the result of a bid that is still in flight.
pub struct AuctionDetailView {
    auction_id: String,
    cache: Arc<AuctionSnapshotCache>,
    pipeline: Arc<BidSubmissionPipeline>,
    sink: Arc<dyn AuctionEventSink>,
    alive: CancellationToken,
}

impl AuctionDetailView {
    pub async fn open(
        state: &ClientState,
        auction_id: impl Into<String>,
        sink: Arc<dyn AuctionEventSink>,
    ) -> Result<Self, AppError> {
        let auction_id = auction_id.into();
        if auction_id.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "auction id must not be empty".to_string(),
            ));
        }

        let session = state.session();
        let cache = Arc::new(AuctionSnapshotCache::new(
            Arc::clone(&state.store),
            session.clone(),
            state.config.collection.clone(),
            auction_id.clone(),
            state.config.bid_floor,
            Arc::clone(&state.clock),
        ));
        let pipeline = Arc::new(BidSubmissionPipeline::new(
            Arc::clone(&state.store),
            session,
            Arc::clone(&state.clock),
            cache.reader(),
            state.config.collection.clone(),
        ));

        let subscription = cache.subscribe().await?;
        let alive = CancellationToken::new();

        tokio::spawn(pump_snapshots(
            subscription,
            Arc::clone(&sink),
            Arc::clone(&state.clock),
            auction_id.clone(),
            alive.clone(),
        ));
        tokio::spawn(pump_ticks(
            state.ticks.subscribe(),
            cache.reader(),
            Arc::clone(&sink),
            alive.clone(),
        ));

        info!(auction_id = %auction_id, "auction detail view opened");
        Ok(Self {
            auction_id,
            cache,
            pipeline,
            sink,
            alive,
        })
    }

    pub fn auction_id(&self) -> &str {
        &self.auction_id
    }

    pub fn snapshot(&self) -> Option<Arc<AuctionSnapshot>> {
        self.cache.latest()
    }

    pub fn phase(&self) -> SubmissionPhase {
        self.pipeline.phase()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SubmissionPhase> {
        self.pipeline.watch_phase()
    }

    pub fn is_open(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Submits `amount` as typed. The returned handle always yields the
    /// outcome; a `BidResult` event is emitted only if the view is still open
    /// when the store answers.
    pub fn place_bid(&self, amount: impl Into<String>) -> JoinHandle<BidOutcome> {
        let proposal = BidProposal::new(self.auction_id.clone(), amount);
        let pipeline = Arc::clone(&self.pipeline);
        let sink = Arc::clone(&self.sink);
        let alive = self.alive.clone();

        tokio::spawn(async move {
            let amount = proposal.amount.clone();
            let auction_id = proposal.auction_id.clone();
            let outcome = pipeline.submit(proposal).await;

            if alive.is_cancelled() {
                debug!(auction_id = %auction_id, "view closed before bid completed; result dropped");
            } else {
                deliver(
                    sink.as_ref(),
                    AuctionUiEvent::BidResult {
                        auction_id,
                        amount,
                        outcome: outcome.clone(),
                    },
                );
            }
            outcome
        })
    }

    pub fn close(&self) {
        if self.alive.is_cancelled() {
            return;
        }
        self.alive.cancel();
        self.cache.unsubscribe();
        info!(auction_id = %self.auction_id, "auction detail view closed");
    }
}

impl Drop for AuctionDetailView {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_snapshots(
    mut subscription: SnapshotSubscription,
    sink: Arc<dyn AuctionEventSink>,
    clock: Arc<dyn Clock>,
    auction_id: String,
    alive: CancellationToken,
) {
    let scope = format!("auction:{auction_id}");
    let mut degraded = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = alive.cancelled() => break,
            event = subscription.next() => event,
        };
        let Some(event) = event else {
            break;
        };

        let ui_event = match event {
            SnapshotEvent::Error(error) => {
                degraded = true;
                AuctionUiEvent::SyncStatus {
                    scope: scope.clone(),
                    status: SyncStatus::Degraded { error },
                }
            }
            recovered => {
                if degraded {
                    degraded = false;
                    let live = AuctionUiEvent::SyncStatus {
                        scope: scope.clone(),
                        status: SyncStatus::Live,
                    };
                    if !deliver(sink.as_ref(), live) {
                        break;
                    }
                }
                match recovered {
                    SnapshotEvent::Loaded(snapshot) => {
                        AuctionUiEvent::snapshot_changed(&snapshot, clock.now_ms())
                    }
                    _ => AuctionUiEvent::NotFound {
                        auction_id: auction_id.clone(),
                    },
                }
            }
        };

        if !deliver(sink.as_ref(), ui_event) {
            break;
        }
    }
    debug!(auction_id = %auction_id, "snapshot pump stopped");
}

async fn pump_ticks(
    mut ticks: TickSubscription,
    reader: SnapshotReader,
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

        let time_remaining = reader
            .latest()
            .map(|snapshot| snapshot.time_remaining(now_ms));
        let event = AuctionUiEvent::Tick {
            auction_id: Some(reader.auction_id().to_string()),
            now_ms,
            time_remaining,
            countdown: time_remaining.map(|remaining| remaining.to_string()),
        };
        if !deliver(sink.as_ref(), event) {
            break;
        }
    }
    debug!(auction_id = %reader.auction_id(), "tick pump stopped");
}
