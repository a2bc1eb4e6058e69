//! The TLS layer: an abstract record-level engine, the two-state step
//! machine that drives it, and a connection wrapper that preserves the plain
//! connection's application contract while orchestrating wrap/unwrap traffic
//! underneath.

pub mod conn;
pub mod engine;
pub mod rustls;
pub mod state;
