pub mod ack;
pub mod app;
pub mod audit;
pub mod auth;
pub mod config;
pub mod dedupe;
pub mod filelog;
pub mod outcome;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod retention;
pub mod signature;
