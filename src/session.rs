//! Contains the minimal client session state threaded through operation execution: the
//! session id (`lsid`), the transaction number, and causal-consistency bookkeeping.

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp},
    operation::Retryability,
};

/// Struct modeling a cluster time reported by the server.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    pub(crate) signature: Document,
}

impl PartialEq for ClusterTime {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A logical session, identified by an `lsid` document. Sessions gate retryable writes
/// (which consume one transaction number per command) and causal consistency.
#[derive(Clone, Debug)]
pub struct ClientSession {
    id: Document,
    txn_number: i64,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    in_transaction: bool,
    implicit: bool,
    dirty: bool,
}

impl ClientSession {
    /// Creates a new session with a freshly generated `lsid`.
    pub fn new() -> Self {
        Self::with_implicit(false)
    }

    pub(crate) fn implicit() -> Self {
        Self::with_implicit(true)
    }

    fn with_implicit(implicit: bool) -> Self {
        let uuid = uuid::Uuid::new_v4();
        let id = doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: uuid.as_bytes().to_vec(),
            }
        };
        Self {
            id,
            txn_number: 0,
            cluster_time: None,
            operation_time: None,
            in_transaction: false,
            implicit,
            dirty: false,
        }
    }

    /// The `lsid` document for this session.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Whether this session was created internally for a single operation.
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// The highest cluster time this session has observed.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The latest `operationTime` this session has observed.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Whether a transaction is currently in progress on this session.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest seen
    /// cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Set the `operationTime` to the provided one if it is greater than this session's highest
    /// seen operation time.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        match self.operation_time {
            Some(current) if (current.time, current.increment) >= (ts.time, ts.increment) => {}
            _ => self.operation_time = Some(ts),
        }
    }

    /// Begins a transaction on this session, consuming a new transaction number.
    pub fn start_transaction(&mut self) {
        self.txn_number += 1;
        self.in_transaction = true;
    }

    /// Ends the transaction in progress, if any.
    pub fn end_transaction(&mut self) {
        self.in_transaction = false;
    }

    /// The transaction number to attach to the next command, if the command participates in a
    /// transaction or is a retryable write. Retryable writes consume a fresh number per
    /// command; a retry of the same command reuses the number of the first attempt.
    pub(crate) fn get_txn_number_for_operation(
        &mut self,
        retryability: Retryability,
    ) -> Option<i64> {
        if self.in_transaction {
            Some(self.txn_number)
        } else if retryability == Retryability::Write {
            self.txn_number += 1;
            Some(self.txn_number)
        } else {
            None
        }
    }

    /// Mark this session as dirty after a network error; a dirty session's server-side state
    /// cannot be reused.
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[allow(dead_code)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
