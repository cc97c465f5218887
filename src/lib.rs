/// Tollgate - activation key entitlement engine
///
/// Issues single-use activation keys tied to subscription plans, binds each
/// key to exactly one account on redemption, tracks per-window request quota
/// and gates access on account state. A thin HTTP surface exposes the engine
/// to a chat front end and to administrators.

pub mod access;
pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod rate_limit;
pub mod redemption;
pub mod server;
pub mod sweeper;

pub use context::AppContext;
pub use error::{EngineError, EngineResult};
