//! Bid submission state machine.
//!
//! `Idle -> Validating -> Submitting -> Succeeded | Rejected | Failed -> Idle`.
//! The terminal phase is published to watchers, then the pipeline settles
//! back to `Idle` and the outcome goes to the caller.
//! The pipeline never touches the cached snapshot. An accepted bid becomes
//! visible only when the store's own notification replaces the snapshot.
//! Nothing is retried automatically; the caller re-submits against a fresh
//! snapshot if it wants to.

use crate::auction::cache::SnapshotReader;
use crate::auction::clock::Clock;
use crate::auction::types::{BidProposal, BidRecord};
use crate::auction::validator::validate_bid;
use crate::error::{BidRejection, RemoteWriteFailed};
use crate::session::Session;
use crate::store::{AppendReceipt, ConditionalAppend, DocumentStore};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionPhase {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Rejected,
    Failed,
}

impl SubmissionPhase {
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Validating | Self::Submitting)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum BidOutcome {
    Accepted(AppendReceipt),
    Rejected(BidRejection),
    Failed(RemoteWriteFailed),
}

impl BidOutcome {
    pub fn phase(&self) -> SubmissionPhase {
        match self {
            Self::Accepted(_) => SubmissionPhase::Succeeded,
            Self::Rejected(_) => SubmissionPhase::Rejected,
            Self::Failed(_) => SubmissionPhase::Failed,
        }
    }
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct BidSubmissionPipeline {
    store: Arc<dyn DocumentStore>,
    session: Session,
    clock: Arc<dyn Clock>,
    reader: SnapshotReader,
    collection: String,
    phase: watch::Sender<SubmissionPhase>,
    in_flight: AtomicBool,
}

impl BidSubmissionPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Session,
        clock: Arc<dyn Clock>,
        reader: SnapshotReader,
        collection: impl Into<String>,
    ) -> Self {
        let (phase, _) = watch::channel(SubmissionPhase::Idle);
        Self {
            store,
            session,
            clock,
            reader,
            collection: collection.into(),
            phase,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Current phase. `Idle` whenever no attempt is running.
    pub fn phase(&self) -> SubmissionPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SubmissionPhase> {
        self.phase.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn submit(&self, proposal: BidProposal) -> BidOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            warn!(auction_id = %proposal.auction_id, "bid rejected: submission already in progress");
            return BidOutcome::Rejected(BidRejection::SubmissionInProgress);
        }
        let guard = InFlightGuard {
            flag: &self.in_flight,
        };

        let outcome = self.run(proposal).await;
        let terminal = outcome.phase();
        self.phase.send_replace(terminal);
        drop(guard);
        // A submit that started after the guard dropped owns the phase now.
        self.phase.send_if_modified(|phase| {
            if *phase == terminal {
                *phase = SubmissionPhase::Idle;
                true
            } else {
                false
            }
        });
        outcome
    }

    async fn run(&self, proposal: BidProposal) -> BidOutcome {
        self.phase.send_replace(SubmissionPhase::Validating);

        let now_ms = self.clock.now_ms();
        let snapshot = self
            .reader
            .latest()
            .filter(|snapshot| snapshot.id == proposal.auction_id);
        let amount = match validate_bid(snapshot.as_deref(), &proposal.amount, now_ms) {
            Ok(amount) => amount,
            Err(rejection) => {
                info!(
                    auction_id = %proposal.auction_id,
                    raw_amount = %proposal.amount,
                    reason = %rejection,
                    "bid rejected locally"
                );
                return BidOutcome::Rejected(rejection);
            }
        };
        drop(snapshot);

        if !self.session.is_authenticated() {
            info!(auction_id = %proposal.auction_id, "bid rejected: sign-in required");
            return BidOutcome::Rejected(BidRejection::SignInRequired);
        }

        self.phase.send_replace(SubmissionPhase::Submitting);
        let bid = BidRecord {
            bidder: self.session.bidder_label(),
            bidder_id: self.session.user_id.clone(),
            amount,
            placed_at_ms: Some(now_ms),
        };
        let request = ConditionalAppend::new(&self.collection, proposal.auction_id.as_str(), bid);

        match self.store.conditional_append(&self.session, request).await {
            Ok(receipt) => {
                info!(
                    auction_id = %proposal.auction_id,
                    amount,
                    bid_count = receipt.bid_count,
                    "bid accepted by store"
                );
                BidOutcome::Accepted(receipt)
            }
            Err(error) => {
                warn!(
                    auction_id = %proposal.auction_id,
                    amount,
                    kind = error.kind(),
                    error = %error,
                    "bid write failed"
                );
                BidOutcome::Failed(RemoteWriteFailed::from(error))
            }
        }
    }
}
