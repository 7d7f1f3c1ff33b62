use std::time::Duration;

use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};

use crate::{
    bson::{oid::ObjectId, DateTime},
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
    session::ClusterTime,
};

const DRIVER_MIN_DB_VERSION: &str = "4.0";
const DRIVER_MIN_WIRE_VERSION: i32 = 6;
const DRIVER_MAX_WIRE_VERSION: i32 = 21;

/// The possible types for a server.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, standalone server.
    Standalone,

    /// A router to a sharded cluster, i.e. a mongos server.
    Mongos,

    /// A replica set primary.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A replica set secondary.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A replica set arbiter.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// A replica set member that is none of the other types (a passive, for example).
    #[serde(rename = "RSOther")]
    RsOther,

    /// A replica set member that does not report a set name or a hosts list (i.e. a member that
    /// is still being initialized).
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load balancer.
    LoadBalancer,

    /// A server that the driver has not yet communicated with, or one that is down.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// A server's topology version, as reported in hello responses and state-change errors.
/// Versions from the same process are ordered by counter; versions from different processes
/// are incomparable.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    /// The id of the server process.
    pub process_id: ObjectId,

    /// A monotonically increasing counter within the process.
    pub counter: i64,
}

impl TopologyVersion {
    pub(crate) fn is_more_recent_than(&self, existing: TopologyVersion) -> bool {
        self.process_id != existing.process_id || self.counter > existing.counter
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// The shortest recently-observed duration of this server's hello calls.
    pub(crate) minimum_round_trip_time: Option<Duration>,

    // The SDAM rules require a ServerDescription to carry an error message if an error
    // occurred during the heartbeat for the server, and a description with neither a reply
    // nor an error exists between when a server is added to the topology and its first
    // heartbeat. A Result<Option<_>> represents all three states and keeps the accessors
    // below `?`-friendly.
    pub(crate) reply: Result<Option<HelloReply>>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.raw_command_response);
                let other_response = other_reply.as_ref().map(|r| &r.raw_command_response);
                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err.to_string() == other_err.to_string(),
            _ => false,
        }
    }
}

impl Serialize for ServerDescription {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ServerDescription", 4)?;
        state.serialize_field("address", &self.address.to_string())?;
        state.serialize_field("type", &self.server_type)?;
        state.serialize_field(
            "averageRoundTripTimeMillis",
            &self
                .average_round_trip_time
                .map(|rtt| rtt.as_millis() as i64),
        )?;
        state.serialize_field("error", &self.reply.as_ref().err().map(|e| e.to_string()))?;
        state.end()
    }
}

impl ServerDescription {
    /// Creates a fresh `Unknown` description for a server no heartbeat has reached yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: normalize_address(address),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            minimum_round_trip_time: None,
            reply: Ok(None),
        }
    }

    /// Creates a description from a successful heartbeat.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
        minimum_rtt: Option<Duration>,
    ) -> Self {
        let mut description = Self {
            address: normalize_address(&address),
            server_type: reply.command_response.server_type(),
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: Some(average_rtt),
            minimum_round_trip_time: minimum_rtt,
            reply: Ok(None),
        };

        // Normalize all instances of hostnames to lowercase.
        for hosts in [
            reply.command_response.hosts.as_mut(),
            reply.command_response.passives.as_mut(),
            reply.command_response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in hosts.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = reply.command_response.me {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    /// Creates an `Unknown` description carrying the error that caused it.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            address: normalize_address(&address),
            server_type: Default::default(),
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: None,
            minimum_round_trip_time: None,
            reply: Err(error),
        }
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The average round trip time of this server's heartbeats, if any have succeeded.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    /// The minimum recently observed round trip time, if known.
    pub fn minimum_round_trip_time(&self) -> Option<Duration> {
        self.minimum_round_trip_time
    }

    /// The error that caused this server to be `Unknown`, if any.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    /// Whether this server is available for operations.
    pub fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this version of the driver only \
                     supports up to {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this version of the driver \
                     requires at least {} (server version {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION
                ));
            }
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let known_hosts = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .map(|reply| {
                let hosts = reply.command_response.hosts.as_deref().unwrap_or_default();
                let passives = reply
                    .command_response
                    .passives
                    .as_deref()
                    .unwrap_or_default();
                let arbiters = reply
                    .command_response
                    .arbiters
                    .as_deref()
                    .unwrap_or_default();

                hosts
                    .iter()
                    .chain(passives.iter())
                    .chain(arbiters.iter())
                    .map(ServerAddress::parse)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        Ok(known_hosts.unwrap_or_default())
    }

    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    #[cfg(test)]
    pub(crate) fn min_wire_version(&self) -> Result<Option<i32>> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.min_wire_version);
        Ok(version)
    }

    #[cfg(test)]
    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version);
        Ok(version)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60))),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply.cluster_time.clone()),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Ok(None) => None,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let reply = match self.reply.as_ref() {
            Ok(Some(ref reply)) => reply,
            _ => return false,
        };

        let server_tags = match reply.command_response.tags {
            Some(ref tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

fn normalize_address(address: &ServerAddress) -> ServerAddress {
    match address {
        ServerAddress::Tcp { host, port } => ServerAddress::Tcp {
            host: host.to_lowercase(),
            port: *port,
        },
    }
}
