//! A client for an etcd-compatible metastore.
//!
//! The [`MetastoreClient`] facade offers the KV / lease / election /
//! maintenance surfaces and survives network partitions, backend restarts
//! and leader changes: watches resume from their last delivered revision,
//! the lease keep-alive stream reconnects, and a health monitor can trip a
//! fall-break that fails requests fast while the backend is down.
//!
//! Operations are dispatched per configuration (and per key) to either a
//! direct gRPC strategy or a proxied strategy that exchanges envelopes with
//! a peer service over a message bus.

pub mod backoff;
pub mod bus;
pub mod channel;
mod client;
pub mod config;
pub mod election;
pub mod error;
pub mod grpc;
pub mod health;
pub mod kv;
pub mod lease;
pub mod maintenance;
pub mod retry;
pub mod tls;
mod unary;

pub use client::MetastoreClient;
pub use config::{Config, RoutingMode, TimeoutOptions, TlsOptions};
pub use error::{Error, Result};
pub use health::{HealthGate, HealthObserver, HealthStatus};

pub use metastore_core as core;
