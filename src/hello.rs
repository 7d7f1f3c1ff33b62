use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, rawdoc, DateTime, Document, RawDocumentBuf},
    cmap::{Command, MonitorConnection, RawCommandResponse},
    error::Result,
    options::{ServerAddress, ServerApi},
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
    session::ClusterTime,
};

/// The name of the command used for handshakes and heartbeats.
pub(crate) const HELLO_COMMAND_NAME: &str = "hello";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello command.
///
/// When `awaitable_options` is provided, the server blocks the reply until its state changes
/// or `maxAwaitTimeMS` elapses.
pub(crate) fn hello_command(
    server_api: Option<&ServerApi>,
    load_balanced: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let mut body = rawdoc! { HELLO_COMMAND_NAME: 1 };

    if load_balanced == Some(true) {
        body.append("loadBalanced", true);
    }

    if let Some(opts) = awaitable_options {
        let topology_version = crate::bson::to_raw_document_buf(&opts.topology_version)
            .unwrap_or_else(|_| RawDocumentBuf::new());
        body.append("topologyVersion", topology_version);
        body.append(
            "maxAwaitTimeMS",
            i64::try_from(opts.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    let mut command = Command::new(HELLO_COMMAND_NAME, "admin", body);
    if let Some(server_api) = server_api {
        command.set_server_api(server_api);
    }
    command.exhaust_allowed = awaitable_options.is_some();
    command
}

/// Execute a hello command on a monitoring connection.
pub(crate) async fn run_hello(
    conn: &mut dyn MonitorConnection,
    command: Command,
    address: &ServerAddress,
) -> Result<HelloReply> {
    let response = conn.send_command(command).await?;
    response.into_hello_reply(address.clone())
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: RawDocumentBuf,
    pub(crate) cluster_time: Option<ClusterTime>,
}

impl RawCommandResponse {
    pub(crate) fn into_hello_reply(self, server_address: ServerAddress) -> Result<HelloReply> {
        if self.ok()? != 1 {
            let error: crate::operation::CommandErrorBody = self.body()?;
            return Err(crate::error::Error::from(error).with_server_response(&self));
        }

        let command_response: HelloCommandResponse = self.body()?;
        let cluster_time = self.cluster_time()?;

        Ok(HelloReply {
            server_address,
            command_response,
            raw_command_response: self.raw_body().to_owned(),
            cluster_time,
        })
    }
}

/// The response to a `hello` command.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// router instance, or a standalone.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary`.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passive members in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a router.
    pub msg: Option<String>,

    /// The address of the server that returned this response, as it knows itself.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica-set ghost (e.g. still initializing).
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// The maximum permitted size of a BSON object in bytes.
    pub max_bson_object_size: Option<i64>,

    /// The maximum permitted size of a wire protocol message.
    pub max_message_size_bytes: Option<i64>,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    /// The server's current topology version, used to order monitoring updates and to issue
    /// awaitable hellos.
    pub topology_version: Option<TopologyVersion>,

    /// The server-generated ID for the connection the hello command was run on.
    pub connection_id: Option<i64>,

    /// The reply to speculative authentication done in the handshake, if any.
    pub speculative_authenticate: Option<Document>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}
