//! `Pulsar` is a single-threaded, readiness-driven HTTP/1.x server core.
//!
//! The crate is split in three layers. `net` contains the transport: a mio
//! based reactor, the buffer primitives and the non-blocking connection.
//! `tls` wraps a connection in a TLS session driven by an abstract
//! record-level engine. `http` parses requests off either transport, routes
//! them to user handlers and serializes responses through a gathered write
//! path.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod http;
pub mod net;
pub mod tls;
