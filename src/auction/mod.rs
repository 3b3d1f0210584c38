pub mod cache;
pub mod clock;
pub mod list;
pub mod submission;
pub mod types;
pub mod validator;

pub const SNAPSHOT_CHANGED_EVENT: &str = "auction_snapshot_changed";
pub const AUCTION_NOT_FOUND_EVENT: &str = "auction_not_found";
pub const TICK_EVENT: &str = "auction_tick";
pub const BID_RESULT_EVENT: &str = "auction_bid_result";
pub const LIST_CHANGED_EVENT: &str = "auction_list_changed";
pub const SYNC_STATUS_EVENT: &str = "auction_sync_status";
