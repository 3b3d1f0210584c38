use harvest_auction_lib::store::memory::MemoryDocumentStore;
use harvest_auction_lib::{
    AuctionDetailView, AuctionUiEvent, BidOutcome, BidRejection, ChannelEventSink, ClientConfig,
    ClientState, ManualClock, Session, StoreBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const NOW: i64 = 1_752_000_000_000;
const HOUR_MS: i64 = 3_600_000;

fn unique_data_dir(label: &str) -> PathBuf {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock should be after unix epoch")
        .as_nanos();

    std::env::temp_dir().join(format!("harvest-auction-{label}-{timestamp}"))
}

async fn next_current_bid(receiver: &mut UnboundedReceiver<AuctionUiEvent>) -> f64 {
    loop {
        match receiver.recv().await.expect("sink should stay open") {
            AuctionUiEvent::SnapshotChanged { snapshot, .. } => return snapshot.current_bid,
            AuctionUiEvent::Tick { .. } | AuctionUiEvent::BidResult { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

async fn wait_for_bid(receiver: &mut UnboundedReceiver<AuctionUiEvent>, target: f64) -> f64 {
    loop {
        let current_bid = next_current_bid(receiver).await;
        if current_bid >= target {
            return current_bid;
        }
    }
}

async fn sqlite_state(label: &str) -> (ClientState, PathBuf) {
    let data_dir = unique_data_dir(label);
    let config = ClientConfig {
        backend: StoreBackend::Sqlite,
        data_dir: data_dir.clone(),
        seed_demo_data: true,
        ..ClientConfig::default()
    };
    let state = ClientState::initialize(config)
        .await
        .expect("sqlite client state should initialize");
    (state, data_dir)
}

#[tokio::test]
async fn sqlite_backend_accepts_a_higher_bid_and_pushes_the_update() {
    let (state, data_dir) = sqlite_state("accept").await;
    state.set_session(Session::authenticated("uid-jane", "Jane Doe"));

    let (sink, mut receiver) = ChannelEventSink::new();
    let view = AuctionDetailView::open(&state, "auction-001", Arc::new(sink))
        .await
        .expect("view should open");
    assert_eq!(next_current_bid(&mut receiver).await, 1_550.0);

    let outcome = view.place_bid("1600").await.expect("bid task should finish");
    let BidOutcome::Accepted(receipt) = outcome else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert_eq!(receipt.current_bid, 1_600.0);
    assert_eq!(receipt.bid_count, 3);
    assert_eq!(next_current_bid(&mut receiver).await, 1_600.0);

    drop(view);
    state.shutdown().await;
    let _ = std::fs::remove_dir_all(data_dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_backend_resolves_racing_bids_to_the_highest() {
    let (state, data_dir) = sqlite_state("race").await;

    state.set_session(Session::authenticated("uid-alice", "Alice"));
    let (alice_sink, mut alice_events) = ChannelEventSink::new();
    let alice = AuctionDetailView::open(&state, "auction-001", Arc::new(alice_sink))
        .await
        .expect("alice view should open");

    state.set_session(Session::authenticated("uid-bob", "Bob"));
    let (bob_sink, mut bob_events) = ChannelEventSink::new();
    let bob = AuctionDetailView::open(&state, "auction-001", Arc::new(bob_sink))
        .await
        .expect("bob view should open");

    assert_eq!(next_current_bid(&mut alice_events).await, 1_550.0);
    assert_eq!(next_current_bid(&mut bob_events).await, 1_550.0);

    let (alice_outcome, bob_outcome) = tokio::join!(alice.place_bid("1600"), bob.place_bid("1700"));
    let alice_outcome = alice_outcome.expect("alice bid task should finish");
    let bob_outcome = bob_outcome.expect("bob bid task should finish");

    assert!(matches!(bob_outcome, BidOutcome::Accepted(_)));
    match alice_outcome {
        BidOutcome::Accepted(_) => {}
        BidOutcome::Failed(failure) => assert_eq!(failure.kind, "conflict"),
        other => panic!("unexpected outcome for the lower bid: {other:?}"),
    }

    assert_eq!(wait_for_bid(&mut alice_events, 1_700.0).await, 1_700.0);
    assert_eq!(wait_for_bid(&mut bob_events, 1_700.0).await, 1_700.0);

    drop(alice);
    drop(bob);
    state.shutdown().await;
    let _ = std::fs::remove_dir_all(data_dir);
}

#[tokio::test]
async fn expired_auction_is_rejected_without_contacting_the_store() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = MemoryDocumentStore::new(clock.clone());
    store.seed_demo_auctions("auctions", NOW);
    let state = ClientState::with_store(ClientConfig::default(), Arc::new(store.clone()), clock.clone());
    state.set_session(Session::authenticated("uid-jane", "Jane Doe"));

    let (sink, mut receiver) = ChannelEventSink::new();
    let view = AuctionDetailView::open(&state, "auction-001", Arc::new(sink))
        .await
        .expect("view should open");
    assert_eq!(next_current_bid(&mut receiver).await, 1_550.0);

    clock.advance(2 * HOUR_MS);
    let outcome = view.place_bid("999999").await.expect("bid task should finish");

    assert_eq!(outcome, BidOutcome::Rejected(BidRejection::AuctionEnded));
    assert_eq!(store.append_calls(), 0);
}

#[tokio::test]
async fn anonymous_session_must_sign_in_before_bidding() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = MemoryDocumentStore::new(clock.clone());
    store.seed_demo_auctions("auctions", NOW);
    let state = ClientState::with_store(ClientConfig::default(), Arc::new(store.clone()), clock);

    let (sink, mut receiver) = ChannelEventSink::new();
    let view = AuctionDetailView::open(&state, "auction-002", Arc::new(sink))
        .await
        .expect("view should open");
    assert_eq!(next_current_bid(&mut receiver).await, 1_800.0);

    let outcome = view.place_bid("1900").await.expect("bid task should finish");

    assert_eq!(outcome, BidOutcome::Rejected(BidRejection::SignInRequired));
    assert_eq!(store.append_calls(), 0);
}
