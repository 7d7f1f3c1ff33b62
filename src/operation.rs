//! The generic contract between the executor and the per-operation command builders, which
//! live outside this crate: an operation renders its command for a selected server, consumes
//! the reply, and declares how it may be retried.

use serde::Deserialize;

use crate::{
    bson::RawDocumentBuf,
    cmap::{Command, Connection, RawCommandResponse, StreamDescription},
    concern::{ReadConcern, WriteConcern},
    error::{
        BulkWriteFailure,
        CommandError,
        Error,
        ErrorKind,
        IndexedWriteError,
        Result,
        WriteConcernError,
        WriteFailure,
    },
    options::ClientOptions,
    selection_criteria::SelectionCriteria,
    session::{ClientSession, ClusterTime},
};

/// The amount of message overhead (command-agnostic fields) to account for when deciding how
/// many documents fit into one batched write.
pub(crate) const COMMAND_OVERHEAD_SIZE: usize = 16_000;

/// Context about the execution of an operation, passed to response handling.
pub struct ExecutionContext<'a> {
    /// The connection the command was executed on.
    pub connection: &'a mut dyn Connection,

    /// The session the command was executed with, if any.
    pub session: Option<&'a mut ClientSession>,

    /// For batched writes, the index of the first document of the current batch within the
    /// original document list.
    pub batch_offset: usize,
}

/// Whether the executor classifies an operation as a read or a write, which governs the
/// default server selection criteria and retry eligibility.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OperationType {
    /// The operation reads data.
    Read,

    /// The operation writes data.
    Write,
}

/// The level of retryability an operation supports.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Retryability {
    /// The operation is a retryable write.
    Write,

    /// The operation is a retryable read.
    Read,

    /// The operation cannot be retried.
    None,
}

impl Retryability {
    /// Returns this level of retryability in tandem with the client options.
    pub(crate) fn with_options(&self, options: &ClientOptions) -> Self {
        match self {
            Self::Write if options.retry_writes != Some(false) => Self::Write,
            Self::Read if options.retry_reads != Some(false) => Self::Read,
            _ => Self::None,
        }
    }

    /// Whether this level of retryability can retry the given error.
    pub(crate) fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Self::Write => error.is_write_retryable(),
            Self::Read => error.is_read_retryable(),
            Self::None => false,
        }
    }
}

/// An explicit retry mode, overriding the default of at most one retry.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RetryMode {
    /// Never retry.
    None,

    /// Retry at most once.
    Once,

    /// Keep retrying for as long as the operation's deadline allows.
    Context,
}

/// The documents of a batched write, split across as many commands as server limits require.
#[derive(Debug, Clone)]
pub struct Batches {
    /// The document-sequence identifier the documents are transmitted under (e.g.
    /// "documents").
    pub identifier: String,

    /// The documents to deliver.
    pub documents: Vec<RawDocumentBuf>,

    /// Whether a failed document aborts the remainder of the batch.
    pub ordered: bool,

    offset: usize,
}

impl Batches {
    /// Creates a new set of batches.
    pub fn new(
        identifier: impl ToString,
        documents: Vec<RawDocumentBuf>,
        ordered: bool,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            documents,
            ordered,
            offset: 0,
        }
    }

    /// The index of the first undelivered document.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether every document has been delivered.
    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.documents.len()
    }

    /// Computes the next window of documents that fits within the server's limits, given the
    /// size already consumed by the command body.
    ///
    /// Documents are delivered in their original order; a document larger than the server's
    /// document size limit fails the operation.
    pub(crate) fn next_window(
        &self,
        description: &StreamDescription,
        body_size: usize,
    ) -> Result<Vec<RawDocumentBuf>> {
        let max_count = usize::try_from(description.max_write_batch_size).unwrap_or(1).max(1);
        let max_doc_size = usize::try_from(description.max_bson_object_size).unwrap_or(usize::MAX);
        let max_payload_size = usize::try_from(description.max_message_size_bytes)
            .unwrap_or(usize::MAX)
            .saturating_sub(COMMAND_OVERHEAD_SIZE + body_size);

        let mut window = Vec::new();
        let mut size = 0usize;

        for document in &self.documents[self.offset..] {
            let document_size = document.as_bytes().len();

            if document_size > max_doc_size {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "document must be within {} bytes, but document provided is {} bytes",
                        max_doc_size, document_size
                    ),
                }
                .into());
            }

            // A batch always carries at least one document; an oversized remainder is
            // delivered alone and left to the server to reject.
            if !window.is_empty() && size + document_size > max_payload_size {
                break;
            }

            window.push(document.clone());
            size += document_size;

            if window.len() >= max_count {
                break;
            }
        }

        Ok(window)
    }

    pub(crate) fn advance(&mut self, delivered: usize) {
        self.offset += delivered;
    }
}

/// A trait modeling the behavior of a server-side operation.
///
/// The executor drives the full lifecycle: server selection, connection checkout, appending
/// cross-cutting command fields, batched-write splitting, command monitoring, and retries.
/// Implementations supply the command body and consume replies, accumulating their result
/// internally.
pub trait Operation: Send {
    /// The name of the server-side command associated with this operation.
    fn name(&self) -> &str;

    /// The database the command should be executed against.
    fn target_db(&self) -> &str;

    /// Whether the operation reads or writes, governing default selection criteria and retry
    /// eligibility.
    fn operation_type(&self) -> OperationType;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store additional state required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server's reply to the command, updating the operation's accumulated
    /// result. Returning an error marks the command as failed for retry classification.
    fn handle_response(
        &mut self,
        response: &RawCommandResponse,
        context: ExecutionContext<'_>,
    ) -> Result<()>;

    /// Interpret an error encountered while sending the built command to the server,
    /// potentially recovering.
    fn handle_error(&mut self, error: Error) -> Result<()> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on,
    /// overriding the type-appropriate default.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// The read concern to append to the command, if any.
    fn read_concern(&self) -> Option<&ReadConcern> {
        None
    }

    /// The write concern to append to the command, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Whether this operation supports sessions.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// An explicit retry mode overriding the default of at most one retry.
    fn retry_mode(&self) -> Option<RetryMode> {
        None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The documents of a batched write, if this operation is one. The executor delivers them
    /// across as many commands as the selected server's limits require.
    fn batches(&mut self) -> Option<&mut Batches> {
        None
    }
}

/// A response body useful for deserializing command errors.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(command_error_response: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(command_error_response.command_error),
            command_error_response.error_labels,
        )
    }
}

/// A response to a command with a body shape deserialized to a `T`. Provided for operation
/// implementations that deserialize their replies wholesale.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse<T> {
    /// The command's `ok` field.
    pub ok: crate::bson::Bson,

    /// The cluster time attached to the reply, if any.
    #[serde(rename = "$clusterTime")]
    pub cluster_time: Option<ClusterTime>,

    /// The command-specific remainder of the reply.
    #[serde(flatten)]
    pub body: T,
}

impl<T: serde::de::DeserializeOwned> CommandResponse<T> {
    /// Whether the command succeeded or not (i.e. if this response is ok: 1).
    pub fn is_success(&self) -> bool {
        crate::bson_util::get_int(&self.ok) == Some(1)
    }
}

/// The body of a write response: the write count plus any per-document or write concern
/// errors.
#[derive(Debug, Deserialize)]
pub struct WriteResponseBody {
    /// The number of documents affected.
    #[serde(default)]
    pub n: u64,

    #[serde(rename = "writeErrors")]
    pub(crate) write_errors: Option<Vec<IndexedWriteError>>,

    #[serde(rename = "writeConcernError")]
    pub(crate) write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    pub(crate) labels: Option<Vec<String>>,
}

impl WriteResponseBody {
    /// Surfaces any per-document or write concern errors as a batched-write failure, offset
    /// into the original document list by `batch_offset`.
    pub fn validate(&self, batch_offset: usize) -> Result<()> {
        if self.write_errors.is_none() && self.write_concern_error.is_none() {
            return Ok(());
        }

        let write_errors = self.write_errors.clone().map(|errors| {
            errors
                .into_iter()
                .map(|mut error| {
                    error.index += batch_offset;
                    error
                })
                .collect()
        });

        let failure = BulkWriteFailure {
            write_errors,
            write_concern_error: self.write_concern_error.clone(),
            inserted_ids: Default::default(),
        };

        Err(Error::new(
            ErrorKind::BulkWrite(failure),
            self.labels.clone(),
        ))
    }
}

/// Body of a write response that can have a write concern error but not write errors.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    /// Surfaces a write concern error, if one occurred.
    pub fn validate(&self) -> Result<()> {
        match self.write_concern_error {
            Some(ref wc_error) => Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error.clone())),
                self.labels.clone(),
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::rawdoc;

    fn stream_description(max_batch: i64, max_message: i64) -> StreamDescription {
        StreamDescription {
            initial_server_type: crate::sdam::ServerType::RsPrimary,
            max_wire_version: Some(17),
            min_wire_version: Some(6),
            logical_session_timeout: Some(std::time::Duration::from_secs(30 * 60)),
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: max_message,
            max_write_batch_size: max_batch,
            service_id: None,
            hello_ok: true,
        }
    }

    #[test]
    fn window_respects_max_batch_count() {
        let docs: Vec<_> = (0..5).map(|i| rawdoc! { "x": i as i32 }).collect();
        let mut batches = Batches::new("documents", docs, true);

        let description = stream_description(2, 48_000_000);
        let mut windows = Vec::new();
        while !batches.is_exhausted() {
            let window = batches.next_window(&description, 100).unwrap();
            assert!(!window.is_empty());
            batches.advance(window.len());
            windows.push(window.len());
        }

        assert_eq!(windows, vec![2, 2, 1]);
    }

    #[test]
    fn window_respects_max_message_size() {
        let docs: Vec<_> = (0..4).map(|i| rawdoc! { "x": i as i32 }).collect();
        let doc_size = docs[0].as_bytes().len();
        let mut batches = Batches::new("documents", docs, false);

        // Room for exactly two documents beyond the fixed overhead.
        let description = stream_description(
            100_000,
            (COMMAND_OVERHEAD_SIZE + 2 * doc_size) as i64,
        );
        let window = batches.next_window(&description, 0).unwrap();
        assert_eq!(window.len(), 2);
        batches.advance(window.len());
        assert_eq!(batches.offset(), 2);
    }

    #[test]
    fn windows_preserve_document_order() {
        let docs: Vec<_> = (0..7).map(|i| rawdoc! { "i": i as i32 }).collect();
        let original = docs.clone();
        let mut batches = Batches::new("documents", docs, true);
        let description = stream_description(3, 48_000_000);

        let mut delivered = Vec::new();
        while !batches.is_exhausted() {
            let window = batches.next_window(&description, 0).unwrap();
            batches.advance(window.len());
            delivered.extend(window);
        }

        assert_eq!(delivered, original);
    }
}
