// =============================================================================
// API module (§6) — thin Axum surface over the trading core
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

pub use rest::router;
