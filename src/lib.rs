pub mod auction;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod session;
pub mod state;
pub mod store;

pub use auction::cache::{AuctionSnapshotCache, SnapshotEvent, SnapshotReader};
pub use auction::clock::{Clock, ClockTickSource, ManualClock, SystemClock, TimeRemaining};
pub use auction::list::{AuctionCollection, AuctionListSynchronizer, ListEvent};
pub use auction::submission::{BidOutcome, BidSubmissionPipeline, SubmissionPhase};
pub use auction::types::{AuctionDocument, AuctionSnapshot, BidProposal, BidRecord};
pub use auction::validator::validate_bid;
pub use commands::auction_detail::AuctionDetailView;
pub use commands::auction_list::AuctionListView;
pub use commands::events::{AuctionEventSink, AuctionUiEvent, ChannelEventSink};
pub use config::{ClientConfig, ClientConfigArgs, StoreBackend};
pub use error::{AppError, BidRejection, RemoteWriteFailed, StoreError, SubscriptionError};
pub use session::Session;
pub use state::ClientState;
pub use store::DocumentStore;

use commands::client_info::client_info;
use commands::events::SyncStatus;
use commands::health::health;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Runs the terminal monitor: follows the auction list (and one auction when
/// `watch_auction` is set) and logs every UI event until Ctrl-C.
pub async fn run(watch_auction: Option<String>) -> Result<(), AppError> {
    let config = ClientConfigArgs::from_env()?.normalize()?;
    logging::init_logging(&config)?;

    let client = client_info(&config);
    info!(
        name = %client.name,
        version = %client.version,
        backend = client.backend,
        collection = %client.collection,
        platform = %client.platform,
        arch = %client.arch,
        "auction monitor starting"
    );

    let state = ClientState::initialize(config).await?;
    let health = health(&state).await;
    info!(
        backend = health.backend,
        store = health.store,
        uptime_ms = health.uptime_ms as u64,
        "store health"
    );

    let (sink, mut receiver) = ChannelEventSink::new();
    let sink: Arc<dyn AuctionEventSink> = Arc::new(sink);
    let list_view = AuctionListView::open(&state, Arc::clone(&sink)).await?;
    let detail_view = match watch_auction {
        Some(auction_id) => Some(AuctionDetailView::open(&state, auction_id, Arc::clone(&sink)).await?),
        None => None,
    };
    drop(sink);

    tokio::select! {
        _ = log_events(&mut receiver) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received; shutting down");
        }
    }

    if let Some(view) = detail_view {
        view.close();
    }
    list_view.close();
    state.shutdown().await;
    Ok(())
}

async fn log_events(receiver: &mut UnboundedReceiver<AuctionUiEvent>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            AuctionUiEvent::ListChanged { collection, rows } => {
                info!(collection = %collection, auctions = rows.len(), "auction list changed");
                for row in rows {
                    info!(
                        auction_id = %row.id,
                        title = %row.title,
                        current_bid = %row.current_bid_text,
                        bids = row.bid_count,
                        countdown = %row.countdown,
                        "auction"
                    );
                }
            }
            AuctionUiEvent::SnapshotChanged {
                snapshot, countdown, ..
            } => {
                info!(
                    auction_id = %snapshot.id,
                    current_bid = snapshot.current_bid,
                    bids = snapshot.bid_count(),
                    countdown = %countdown,
                    "auction updated"
                );
            }
            AuctionUiEvent::NotFound { auction_id } => {
                warn!(auction_id = %auction_id, "watched auction not found");
            }
            AuctionUiEvent::Tick {
                auction_id: Some(auction_id),
                countdown: Some(countdown),
                ..
            } => {
                debug!(auction_id = %auction_id, countdown = %countdown, "tick");
            }
            AuctionUiEvent::Tick { .. } => {}
            AuctionUiEvent::BidResult {
                auction_id,
                amount,
                outcome,
            } => {
                info!(auction_id = %auction_id, amount = %amount, phase = ?outcome.phase(), "bid result");
            }
            AuctionUiEvent::SyncStatus { scope, status } => match status {
                SyncStatus::Live => info!(scope = %scope, "sync restored"),
                SyncStatus::Degraded { error } => {
                    warn!(scope = %scope, kind = %error.kind, error = %error.message, "sync degraded")
                }
            },
        }
    }
}
