//! Contains the types for configuring the topology core.

use std::{cmp::Ordering, fmt, str::FromStr, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    cmap::{MonitorConnector, PoolFactory},
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    event::{command::CommandEventHandler, sdam::SdamEventHandler},
    sdam::{SrvResolver, MIN_HEARTBEAT_FREQUENCY},
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a DocDB server.
///
/// Currently this just supports addresses that can be connected to over TCP, but alternative
/// address types may be supported in the future (e.g. Unix Domain Socket paths).
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the server can be found.
        host: String,

        /// The TCP port that the server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(serde::de::Error::custom)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl std::hash::Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

// Server descriptions are kept ordered by address; comparison is on the
// canonicalized (host, effective port) pair.
impl Ord for ServerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => (host, port.unwrap_or(DEFAULT_PORT))
                .cmp(&(other_host, other_port.unwrap_or(DEFAULT_PORT))),
        }
    }
}

impl PartialOrd for ServerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`, canonicalizing the hostname to
    /// lowercase.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part.to_lowercase(),
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "invalid server address: \"{}\"; hostname cannot be empty",
                        address
                    ),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = part.parse::<u16>().map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;
                Some(port)
            }
            None => None,
        };

        if parts.next().is_some() {
            return Err(ErrorKind::InvalidArgument {
                message: format!("invalid server address: \"{}\"", address),
            }
            .into());
        }

        Ok(Self::Tcp { host, port })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, with the default filled in.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host(), self.port())
    }
}

/// The declared API version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Stable API version 1.
    #[serde(rename = "1")]
    V1,
}

impl fmt::Display for ServerApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

/// Options used to declare a stable server API.
#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    #[serde(rename = "apiVersion")]
    pub version: ServerApiVersion,

    /// Whether the server should return errors for features that are not part of the declared API
    /// version.
    #[builder(default)]
    #[serde(rename = "apiStrict", skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,

    /// Whether the server should return errors for deprecated features.
    #[builder(default)]
    #[serde(rename = "apiDeprecationErrors", skip_serializing_if = "Option::is_none")]
    pub deprecation_errors: Option<bool>,
}

/// Contains the options that can be used to create a new topology.
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the topology should connect to.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The hostname of the SRV record that produced the seed list, if any. When set, the
    /// topology periodically re-resolves the record to discover changes in the deployment's
    /// host set.
    pub original_srv_hostname: Option<String>,

    /// The SRV service name for DNS queries. Defaults to "docdb".
    pub srv_service_name: Option<String>,

    /// The maximum number of hosts to keep from SRV resolution (0 or unset = unlimited).
    pub srv_max_hosts: Option<u32>,

    /// The name of the replica set that the topology should connect to.
    pub repl_set_name: Option<String>,

    /// Whether the topology should connect directly to a single server rather than discovering
    /// and monitoring all servers in the deployment.
    pub direct_connection: Option<bool>,

    /// Whether the deployment is behind a load balancer. This disables monitoring.
    pub load_balanced: Option<bool>,

    /// The amount of time that the topology will wait to select a server for an operation
    /// before erroring.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that
    /// is acceptable for a read operation.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time each monitoring task should wait between performing server checks.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// The minimum amount of time that must elapse between server checks, bounding how quickly
    /// requested immediate checks can run.
    ///
    /// The default value is 500 ms.
    pub min_heartbeat_freq: Option<Duration>,

    /// The amount of time between SRV record re-resolutions.
    ///
    /// The default value is 60 seconds.
    pub rescan_srv_interval: Option<Duration>,

    /// Whether the executor should retry supported write operations.
    pub retry_writes: Option<bool>,

    /// Whether the executor should retry supported read operations.
    pub retry_reads: Option<bool>,

    /// The default criteria used when selecting servers for read operations.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The default read concern for operations.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations.
    pub write_concern: Option<WriteConcern>,

    /// The declared stable server API options.
    pub server_api: Option<ServerApi>,

    /// The handler that should process server discovery and monitoring events.
    #[derive_where(skip)]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// The handler that should process command monitoring events.
    #[derive_where(skip)]
    pub command_event_handler: Option<Arc<dyn CommandEventHandler>>,

    /// Builds the per-server connection pools that operations check connections out of.
    #[builder(!default)]
    #[derive_where(skip)]
    pub pool_factory: Arc<dyn PoolFactory>,

    /// Establishes the dedicated connections used by server monitors.
    #[builder(!default)]
    #[derive_where(skip)]
    pub monitor_connector: Arc<dyn MonitorConnector>,

    /// Resolves SRV records when SRV polling is enabled.
    #[derive_where(skip)]
    pub srv_resolver: Option<Arc<dyn SrvResolver>>,
}

impl ClientOptions {
    /// Ensure the options are consistent before constructing a topology with them.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "the seed list cannot be empty".to_string(),
            }
            .into());
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot specify multiple seeds with a direct connection".to_string(),
            }
            .into());
        }

        if self.load_balanced == Some(true) {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify multiple seeds with load_balanced=true".to_string(),
                }
                .into());
            }
            if self.repl_set_name.is_some() {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify repl_set_name with load_balanced=true".to_string(),
                }
                .into());
            }
            if self.direct_connection == Some(true) {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify direct_connection=true with load_balanced=true"
                        .to_string(),
                }
                .into());
            }
        }

        if let Some(max_hosts) = self.srv_max_hosts {
            if self.original_srv_hostname.is_none() {
                return Err(ErrorKind::InvalidArgument {
                    message: "srv_max_hosts requires an SRV seed list".to_string(),
                }
                .into());
            }
            if max_hosts > 0 {
                if self.repl_set_name.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "srv_max_hosts and repl_set_name cannot both be present"
                            .to_string(),
                    }
                    .into());
                }
                if self.load_balanced == Some(true) {
                    return Err(ErrorKind::InvalidArgument {
                        message: "srv_max_hosts and load_balanced=true cannot both be present"
                            .to_string(),
                    }
                    .into());
                }
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < self.min_heartbeat_frequency() {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "heartbeat_freq must be at least {}ms, but {}ms was given",
                        self.min_heartbeat_frequency().as_millis(),
                        heartbeat_freq.as_millis()
                    ),
                }
                .into());
            }
        }

        Ok(())
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        self.min_heartbeat_freq.unwrap_or(MIN_HEARTBEAT_FREQUENCY)
    }

    /// Whether SRV polling should run for this configuration.
    pub(crate) fn srv_polling_enabled(&self) -> bool {
        self.original_srv_hostname.is_some()
            && self.load_balanced != Some(true)
            && self.direct_connection != Some(true)
    }
}
