//! XRPL Token Monitor Library
//!
//! Real-time ingestion and analytics over the ledger's transaction stream:
//! trust-line and payment tracking, hot-token detection, wallet alpha
//! scoring, and a follower that mirrors a target account's trust lines.

pub mod analytics;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod follower;
pub mod ledger;
pub mod monitor;
pub mod parser;
pub mod store;
pub mod tracker;
pub mod wallet;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use parser::TokenId;
