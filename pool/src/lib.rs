pub mod blockchain;
pub mod config;
pub mod jobs;
pub mod login;
pub mod metrics;
pub mod notifications;
pub mod payout;
pub mod shares;
