//! The cluster-awareness core of the DocDB Rust driver.
//!
//! This crate discovers and continuously monitors the servers of a deployment, maintains an
//! authoritative [`TopologyDescription`] via the server discovery and monitoring state
//! machine, selects servers for operations under read-preference, latency, and compatibility
//! constraints, and drives retryable command execution (including batched write splitting)
//! against the selected server.
//!
//! Wire framing, TLS, authentication, connection pooling, the DNS resolver, and the
//! user-facing API are external collaborators, consumed through the traits in [`cmap`] and
//! [`sdam::SrvResolver`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use docdb_core::{options::{ClientOptions, ServerAddress}, Topology};
//! # fn collaborators() -> (Arc<dyn docdb_core::cmap::PoolFactory>, Arc<dyn docdb_core::cmap::MonitorConnector>) { unimplemented!() }
//! # fn main() -> docdb_core::error::Result<()> {
//! let (pool_factory, monitor_connector) = collaborators();
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::parse("db0.example.com:27017")?])
//!     .pool_factory(pool_factory)
//!     .monitor_connector(monitor_connector)
//!     .build();
//! let topology = Topology::new(options)?;
//! topology.connect()?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub use bson;

mod bson_util;
pub mod cmap;
pub mod concern;
pub mod error;
pub mod event;
mod executor;
mod hello;
pub mod operation;
pub mod options;
mod runtime;
mod sdam;
pub mod selection_criteria;
mod serde_util;
pub mod session;

#[cfg(test)]
pub(crate) mod test_util;

pub use crate::{
    options::{ClientOptions, ServerAddress},
    sdam::{
        LookupHosts,
        SelectedServer,
        Server,
        ServerDescription,
        ServerType,
        SrvResolver,
        Topology,
        TopologyDescription,
        TopologySubscription,
        TopologyType,
        TopologyVersion,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::{ClientSession, ClusterTime},
};
