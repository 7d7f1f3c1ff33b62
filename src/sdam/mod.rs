pub(crate) mod description;
mod monitor;
pub(crate) mod server;
mod srv_polling;
mod topology;

use std::time::Duration;

pub use description::{
    server::{ServerDescription, ServerType, TopologyVersion},
    topology::{server_selection::SelectedServer, TopologyDescription, TopologyType},
};
pub use server::Server;
pub use srv_polling::{LookupHosts, SrvResolver};
pub use topology::{Topology, TopologySubscription};

pub(crate) use monitor::DEFAULT_HEARTBEAT_FREQUENCY;
pub(crate) use topology::TopologyUpdater;

/// The minimum amount of time that must elapse between server checks.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
