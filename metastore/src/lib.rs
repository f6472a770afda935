//! Client for an etcd-compatible metastore.
//!
//! This facade re-exports the three layers of the project:
//!
//! - [`core`]: wire messages, option structs, responses and the
//!   transaction builder.
//! - [`client`]: the [`MetastoreClient`] facade with its direct and
//!   proxied strategies, the watch and keep-alive engines, and the
//!   configuration surface.
//! - [`runtime`]: the health monitor, leader discovery and acquisition,
//!   and instance record bookkeeping.
//!
//! # Example
//!
//! ```no_run
//! use metastore::{Config, MetastoreClient};
//! use metastore::core::{GetOptions, PutOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), metastore::Error> {
//!     let config = Config::direct("127.0.0.1:2379").with_table_prefix("/cluster-a");
//!     let client = MetastoreClient::new(config, None).await?;
//!
//!     client.put("/sn/workers/xxx", "1.0", PutOptions::default()).await?;
//!     let stored = client.get("/sn/workers/xxx", GetOptions::default()).await?;
//!     assert_eq!(stored.kvs[0].value, b"1.0");
//!     Ok(())
//! }
//! ```

pub use metastore_client as client;
pub use metastore_core as core;
pub use metastore_runtime as runtime;

pub use metastore_client::{Config, Error, HealthStatus, MetastoreClient, Result};
pub use metastore_runtime::{
    ElectionParams, EtcdExplorer, EtcdLeader, ExplorerRegistry, HealthMonitor, InstanceOperator,
    MonitorParams, TxnExplorer, TxnLeader,
};
