//! HTTP server for boardci.
//!
//! Receives GitHub pull request webhooks, exposes job control and logs, and
//! reports job status back to GitHub.

pub mod error;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;
