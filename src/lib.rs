//! TRADEQUEUE: concurrent work-queue runner for exchange accounts
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod retry;
pub mod locks;
pub mod vault;
pub mod storage;
pub mod provision;
pub mod engine;
pub mod notify;
