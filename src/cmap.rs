//! The connection-management surface consumed by the topology core.
//!
//! Wire framing, TLS, authentication, compression, and pooling are implemented by external
//! collaborators; this module defines the command/reply value types exchanged with them and
//! the traits through which the core checks out connections and establishes monitoring
//! connections.

use std::{
    fmt,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    bson::{oid::ObjectId, Bson, Document, RawBsonRef, RawDocument, RawDocumentBuf},
    bson_util,
    error::{Error, ErrorKind, Result},
    hello::HelloReply,
    options::{ServerAddress, ServerApi},
    sdam::ServerType,
    selection_criteria::ReadPreference,
    session::{ClientSession, ClusterTime},
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns a monotonically increasing id for correlating command monitoring events.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Commands that need to be redacted from monitoring because they may carry credentials.
pub(crate) const REDACTED_COMMANDS: &[&str] = &[
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

pub(crate) const HELLO_COMMAND_NAMES: &[&str] = &["hello", "ismaster"];

/// A command to be sent to the server. The body holds command-specific fields; cross-cutting
/// fields (`lsid`, `txnNumber`, `$clusterTime`, concerns, API versioning) are appended by the
/// executor before dispatch.
#[derive(Clone, Debug)]
pub struct Command {
    /// The name of the command (its first body key).
    pub name: String,

    /// The database the command will be executed against.
    pub target_db: String,

    /// The command document.
    pub body: RawDocumentBuf,

    pub(crate) document_sequences: Vec<DocumentSequence>,

    /// Whether the wire layer may use an exhaust-style reply stream for this command.
    pub exhaust_allowed: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Command {
    /// Constructs a new command.
    pub fn new(name: impl ToString, target_db: impl ToString, body: RawDocumentBuf) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            document_sequences: Vec::new(),
            exhaust_allowed: false,
        }
    }

    /// Appends a document sequence to be transmitted alongside the body.
    pub fn add_document_sequence(
        &mut self,
        identifier: impl ToString,
        documents: Vec<RawDocumentBuf>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        });
    }

    pub(crate) fn set_server_api(&mut self, server_api: &ServerApi) {
        self.body
            .append("apiVersion", server_api.version.to_string());

        if let Some(strict) = server_api.strict {
            self.body.append("apiStrict", strict);
        }

        if let Some(deprecation_errors) = server_api.deprecation_errors {
            self.body.append("apiDeprecationErrors", deprecation_errors);
        }
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) -> Result<()> {
        let read_pref_doc = crate::bson::to_raw_document_buf(read_preference)?;
        self.body.append("$readPreference", read_pref_doc);
        Ok(())
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) -> Result<()> {
        let lsid = RawDocumentBuf::from_document(session.id())?;
        self.body.append("lsid", lsid);
        Ok(())
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.append("txnNumber", txn_number);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.append("autocommit", false);
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) -> Result<()> {
        let cluster_time_doc = crate::bson::to_raw_document_buf(cluster_time)?;
        self.body.append("$clusterTime", cluster_time_doc);
        Ok(())
    }

    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(&name.as_str()) || self.should_redact_body()
    }

    fn should_redact_body(&self) -> bool {
        let name = self.name.to_lowercase();
        HELLO_COMMAND_NAMES.contains(&name.as_str())
            && self
                .body
                .get("speculativeAuthenticate")
                .ok()
                .flatten()
                .is_some()
    }

    /// Materializes the full command, including document sequences, for command monitoring.
    pub(crate) fn get_command_document(&self) -> Document {
        let mut doc = bson_util::to_document(&self.body);
        for sequence in &self.document_sequences {
            let documents: Vec<Bson> = sequence
                .documents
                .iter()
                .map(|raw| Bson::Document(bson_util::to_document(raw)))
                .collect();
            doc.insert(sequence.identifier.clone(), documents);
        }
        doc
    }

    /// The total number of bytes the body and document sequences will occupy on the wire,
    /// excluding message framing.
    pub(crate) fn payload_size(&self) -> usize {
        let sequences: usize = self
            .document_sequences
            .iter()
            .flat_map(|sequence| sequence.documents.iter())
            .map(|doc| doc.as_bytes().len())
            .sum();
        self.body.as_bytes().len() + sequences
    }
}

/// A reply document received from the server.
#[derive(Clone, Debug)]
pub struct RawCommandResponse {
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    /// Wraps a raw reply body.
    pub fn new(raw: RawDocumentBuf) -> Self {
        Self { raw }
    }

    /// Constructs a response from a `Document`, mainly useful for testing collaborators.
    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            raw: RawDocumentBuf::from_document(doc)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// The raw reply body.
    pub fn raw_body(&self) -> &RawDocument {
        &self.raw
    }

    /// Deserializes the body of this response.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    /// The reply body as a `Document`, for command monitoring.
    pub(crate) fn body_document(&self) -> Document {
        bson_util::to_document(&self.raw)
    }

    /// The `ok` field of the reply, coerced to an integer.
    pub(crate) fn ok(&self) -> Result<i64> {
        match self.raw.get("ok")? {
            Some(b) => bson_util::get_int_raw(b).ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: format!("expected ok value to be a number, instead got {:?}", b),
                }
                .into()
            }),
            None => Err(ErrorKind::InvalidResponse {
                message: "missing 'ok' value in response".to_string(),
            }
            .into()),
        }
    }

    /// The `$clusterTime` field of the reply, if present.
    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>> {
        self.raw
            .get("$clusterTime")?
            .and_then(RawBsonRef::as_document)
            .map(|doc| {
                crate::bson::from_slice(doc.as_bytes())
                    .map_err(|e| Error::invalid_response(format!("invalid $clusterTime: {}", e)))
            })
            .transpose()
    }

    /// The `operationTime` field of the reply, if present.
    pub(crate) fn operation_time(&self) -> Result<Option<crate::bson::Timestamp>> {
        Ok(self
            .raw
            .get("operationTime")?
            .and_then(RawBsonRef::as_timestamp))
    }
}

/// A description of the behavior and capabilities of a server, derived from its handshake
/// response.
#[derive(Debug, Clone)]
pub struct StreamDescription {
    /// The type of the server when the handshake occurred.
    pub initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub min_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without being refreshed.
    pub logical_session_timeout: Option<Duration>,

    /// The maximum size of BSON object allowed by this server.
    pub max_bson_object_size: i64,

    /// The maximum size of a wire-protocol message allowed by this server.
    pub max_message_size_bytes: i64,

    /// The maximum number of write operations allowed in one batch.
    pub max_write_batch_size: i64,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    /// Whether the server supports the `hello` command for handshakes.
    pub hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60)),
            max_bson_object_size: response.max_bson_object_size.unwrap_or(16 * 1024 * 1024),
            max_message_size_bytes: response
                .max_message_size_bytes
                .unwrap_or(48_000_000),
            max_write_batch_size: response.max_write_batch_size.unwrap_or(100_000),
            service_id: response.service_id,
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether this server supports retryable writes: sessions must be supported and the
    /// server must not be a standalone.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.logical_session_timeout.is_some()
            && self.initial_server_type != ServerType::Standalone
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }
}

/// Information about a pooled connection, carried on command monitoring events.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection within its pool.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection, if known.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn {} to {}", self.id, self.address)
    }
}

/// An established application connection checked out of a pool.
#[async_trait]
pub trait Connection: Send {
    /// Information identifying this connection.
    fn info(&self) -> ConnectionInfo;

    /// The address of the server this connection is connected to.
    fn address(&self) -> &ServerAddress;

    /// The handshake-derived description of the server behind this connection.
    fn stream_description(&self) -> Result<&StreamDescription>;

    /// Serializes and sends the command, then reads and returns the server's reply document.
    async fn send_command(
        &mut self,
        command: Command,
        request_id: i32,
    ) -> Result<RawCommandResponse>;

    /// If the connection is to a load balancer, the id of the selected backend.
    fn service_id(&self) -> Option<ObjectId> {
        None
    }
}

/// A pool of application connections to a single server. Implementations are thread-safe by
/// contract; the core never performs I/O while holding its own locks.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Checks out a connection, establishing one if the pool is empty. This method suspends
    /// until a connection is available or establishment fails.
    async fn check_out(&self) -> Result<Box<dyn Connection>>;

    /// Clears the pool in response to the provided error, closing idle connections and
    /// invalidating checked-out ones. Must not block.
    fn clear(&self, cause: &Error);

    /// Marks the pool as ready, allowing connections to be created in the background. Must
    /// not block.
    fn mark_as_ready(&self);
}

/// Builds connection pools for servers as they join the topology.
pub trait PoolFactory: Send + Sync {
    /// Builds a pool for the server at the given address.
    fn build(&self, address: ServerAddress) -> Arc<dyn ConnectionPool>;
}

/// A dedicated monitoring connection. Monitoring connections bypass the pool and speak only
/// the handshake protocol.
#[async_trait]
pub trait MonitorConnection: Send {
    /// Sends the handshake command and reads the reply. For awaitable handshakes the server
    /// may hold the reply until a state change or `maxAwaitTimeMS` elapses.
    async fn send_command(&mut self, command: Command) -> Result<RawCommandResponse>;

    /// The server-generated id for this connection, if reported.
    fn server_connection_id(&self) -> Option<i64> {
        None
    }
}

/// Establishes monitoring connections.
#[async_trait]
pub trait MonitorConnector: Send + Sync {
    /// Opens a new monitoring connection to the given address.
    async fn connect_monitoring(&self, address: &ServerAddress) -> Result<Box<dyn MonitorConnection>>;
}
