#[tokio::main]
async fn main() {
    let watch_auction = std::env::args().nth(1);
    if let Err(error) = harvest_auction_lib::run(watch_auction).await {
        eprintln!("auction-monitor: {error}");
        std::process::exit(1);
    }
}
