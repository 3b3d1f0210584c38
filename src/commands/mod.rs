pub mod auction_detail;
pub mod auction_list;
pub mod client_info;
pub mod events;
pub mod health;
