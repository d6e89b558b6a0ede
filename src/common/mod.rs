pub mod config;
pub mod logs;
pub mod membership;
pub mod payload;
pub mod poller;
pub mod region;
