//! Drives a single logical operation: server selection, connection checkout, command
//! assembly, batched-write splitting, command monitoring, and retries.

use std::time::Instant;

use crate::{
    cmap::{next_request_id, Connection, RawCommandResponse, StreamDescription},
    error::{
        BulkWriteFailure,
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
    },
    event::command::{
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::{ExecutionContext, Operation, OperationType, RetryMode, Retryability},
    sdam::{ServerType, Topology},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::ClientSession,
};

impl Topology {
    /// Execute the given operation.
    ///
    /// Server selection is performed using the criteria specified on the operation, if any,
    /// falling back to the type-appropriate default. An implicit session is created if the
    /// operation and write concern are compatible with sessions and an explicit session is
    /// not provided. The operation accumulates its own result; this method reports only
    /// success or failure of the execution.
    pub async fn execute_operation<T: Operation>(
        &self,
        op: &mut T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<()> {
        let mut session = session.into();

        if session.as_ref().map_or(false, |s| s.in_transaction()) {
            if op.read_concern().is_some() {
                return Err(Error::invalid_argument(
                    "Cannot set read concern after starting a transaction",
                ));
            }
            if op.write_concern().is_some() {
                return Err(Error::invalid_argument(
                    "Cannot set write concern after starting a transaction",
                ));
            }
        }

        if let Some(write_concern) = op.write_concern() {
            write_concern.validate()?;
        }

        let criteria = self.effective_criteria(op);

        let mut implicit_session: Option<ClientSession> = None;
        let mut accumulated_failure: Option<BulkWriteFailure> = None;
        let mut accumulated_labels: Vec<String> = Vec::new();

        // A batched write may require multiple round-trips even on success; each pass
        // delivers as many documents as the selected server's limits allow.
        loop {
            let result = self
                .execute_command_with_retry(op, &mut session, &mut implicit_session, &criteria)
                .await;

            match result {
                Ok(()) => {}
                Err(error) => {
                    if !matches!(*error.kind, ErrorKind::BulkWrite(_)) {
                        return Err(error);
                    }

                    let ordered = op.batches().map(|b| b.ordered).unwrap_or(true);
                    accumulated_labels.extend(error.labels().iter().cloned());
                    if let ErrorKind::BulkWrite(failure) = *error.kind {
                        match accumulated_failure {
                            Some(ref mut accumulated) => accumulated.merge(failure),
                            None => accumulated_failure = Some(failure),
                        }
                    }

                    // Ordered writes never deliver a document past the first failure.
                    if ordered {
                        break;
                    }
                }
            }

            if op.batches().map(|b| b.is_exhausted()).unwrap_or(true) {
                break;
            }
        }

        match accumulated_failure {
            Some(failure) => Err(Error::new(
                ErrorKind::BulkWrite(failure),
                Some(accumulated_labels),
            )),
            None => Ok(()),
        }
    }

    fn effective_criteria<T: Operation>(&self, op: &T) -> SelectionCriteria {
        if let Some(criteria) = op.selection_criteria() {
            return criteria.clone();
        }
        match op.operation_type() {
            OperationType::Write => SelectionCriteria::ReadPreference(ReadPreference::Primary),
            OperationType::Read => self
                .options()
                .selection_criteria
                .clone()
                .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary)),
        }
    }

    /// Executes a single command's worth of the operation, selecting a server and retrying
    /// once (or per the operation's retry mode) on retryable failures.
    async fn execute_command_with_retry<T: Operation>(
        &self,
        op: &mut T,
        session: &mut Option<&mut ClientSession>,
        implicit_session: &mut Option<ClientSession>,
        criteria: &SelectionCriteria,
    ) -> Result<()> {
        let mut retry: Option<ExecutionRetry> = None;

        loop {
            if retry.is_some() {
                op.update_for_retry();
            }

            let server = match self.select_server(criteria).await {
                Ok(server) => server,
                Err(err) => {
                    retry.first_error()?;
                    return Err(err);
                }
            };
            let address = server.address().clone();

            let mut conn = match server.pool().check_out().await {
                Ok(conn) => conn,
                Err(mut err) => {
                    retry.first_error()?;

                    if err.is_read_retryable() && self.options().retry_writes != Some(false) {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    let retryability = op.retryability().with_options(self.options());
                    let can_retry = match retryability {
                        // Read-retryable operations are retried on pool cleared errors during
                        // connection checkout regardless of transaction status.
                        Retryability::Read if err.is_pool_cleared() => true,
                        _ => {
                            retryability.can_retry_error(&err)
                                && !session.as_ref().map_or(false, |s| s.in_transaction())
                        }
                    };
                    if can_retry {
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            };

            let stream_description = conn.stream_description()?.clone();

            let acknowledged = op.write_concern().map_or(true, |wc| wc.is_acknowledged());
            if !stream_description.supports_sessions() && session.is_some() {
                return Err(ErrorKind::SessionsNotSupported.into());
            }
            if stream_description.supports_sessions()
                && session.is_none()
                && implicit_session.is_none()
                && op.supports_sessions()
                && acknowledged
            {
                *implicit_session = Some(ClientSession::implicit());
            }

            let mut attempt_session = session.as_deref_mut().or(implicit_session.as_mut());

            let retryability =
                self.get_retryability(op, &attempt_session, &stream_description, acknowledged);
            if retryability == Retryability::None {
                retry.first_error()?;
            }

            let txn_number = match retry.as_ref().and_then(|r| r.prior_txn_number) {
                Some(txn_number) => Some(txn_number),
                None => attempt_session
                    .as_mut()
                    .and_then(|s| s.get_txn_number_for_operation(retryability)),
            };

            let result = self
                .execute_command_on_connection(
                    op,
                    conn.as_mut(),
                    &mut attempt_session,
                    txn_number,
                    retryability,
                    criteria,
                )
                .await;

            match result {
                Ok(()) => return Ok(()),
                Err(mut err) => {
                    err.wire_version = stream_description.max_wire_version;

                    // Retryable writes require a storage engine with document-level locking;
                    // servers without one reject the transaction number outright.
                    if let ErrorKind::Command(ref mut command_error) = *err.kind {
                        if command_error.code == 20
                            && command_error.message.starts_with("Transaction numbers")
                        {
                            command_error.message = "This deployment does not support retryable \
                                                     writes. Please disable retryable writes in \
                                                     the topology configuration."
                                .to_string();
                        }
                    }

                    self.handle_application_error(&address, &err);
                    // Release the connection back to its pool before deciding on a retry.
                    drop(conn);
                    drop(server);

                    let unlimited_retries = op.retry_mode() == Some(RetryMode::Context);
                    if let Some(r) = retry.take() {
                        if !unlimited_retries {
                            if (err.is_server_error()
                                || err.is_read_retryable()
                                || err.is_write_retryable())
                                && !err.contains_label("NoWritesPerformed")
                            {
                                return Err(err);
                            } else {
                                return Err(r.first_error);
                            }
                        }
                        retry = Some(r);
                    }

                    if retryability.can_retry_error(&err) {
                        if retry.is_none() {
                            retry = Some(ExecutionRetry {
                                prior_txn_number: txn_number,
                                first_error: err,
                            });
                        }
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Executes one command on the given connection, appending the cross-cutting fields and
    /// the current batch window, and dispatching command monitoring events.
    async fn execute_command_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut dyn Connection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        retryability: Retryability,
        criteria: &SelectionCriteria,
    ) -> Result<()> {
        let stream_description = connection.stream_description()?.clone();
        let mut cmd = op.build(&stream_description)?;

        let batch_offset = {
            let body_size = cmd.payload_size();
            match op.batches() {
                Some(batches) => {
                    let offset = batches.offset();
                    let window = batches.next_window(&stream_description, body_size)?;
                    let identifier = batches.identifier.clone();
                    cmd.add_document_sequence(identifier, window);
                    offset
                }
                None => 0,
            }
        };
        let batch_len = cmd
            .document_sequences
            .last()
            .map(|sequence| sequence.documents.len())
            .unwrap_or(0);

        if let Some(read_concern) = op.read_concern() {
            let read_concern_doc = crate::bson::to_raw_document_buf(read_concern)?;
            cmd.body.append("readConcern", read_concern_doc);
        }
        if let Some(write_concern) = op.write_concern() {
            let write_concern_doc = crate::bson::to_raw_document_buf(write_concern)?;
            cmd.body.append("writeConcern", write_concern_doc);
        }

        self.description()
            .update_command_with_read_pref(connection.address(), &mut cmd, Some(criteria))?;

        let acknowledged = op.write_concern().map_or(true, |wc| wc.is_acknowledged());
        match session.as_deref_mut() {
            Some(session) if op.supports_sessions() && acknowledged => {
                cmd.set_session(session)?;
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }
                if session.in_transaction() {
                    cmd.set_autocommit();
                }
            }
            Some(session) if !op.supports_sessions() && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("{} does not support sessions", cmd.name),
                }
                .into());
            }
            Some(session) if !acknowledged && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: "Cannot use sessions with unacknowledged write concern".to_string(),
                }
                .into());
            }
            _ => {}
        }

        let session_cluster_time = session.as_ref().and_then(|session| session.cluster_time());
        let topology_cluster_time = self.cluster_time();
        let max_cluster_time =
            std::cmp::max(session_cluster_time, topology_cluster_time.as_ref());
        if let Some(cluster_time) = max_cluster_time {
            cmd.set_cluster_time(cluster_time)?;
        }

        if let Some(ref server_api) = self.options().server_api {
            cmd.set_server_api(server_api);
        }

        let connection_info = connection.info();
        let request_id = next_request_id();
        let should_redact = cmd.should_redact();
        let cmd_name = cmd.name.clone();
        let target_db = cmd.target_db.clone();

        self.emit_command_event(|| {
            let command_body = if should_redact {
                Default::default()
            } else {
                cmd.get_command_document()
            };
            CommandEvent::Started(CommandStartedEvent {
                command: command_body,
                db: target_db.clone(),
                command_name: cmd_name.clone(),
                request_id,
                connection: connection_info.clone(),
            })
        });

        let start_time = Instant::now();
        let command_result = match connection.send_command(cmd, request_id).await {
            Ok(response) => match self.parse_response(session, &response) {
                Ok(()) => Ok(response),
                Err(error) => Err(error.with_server_response(&response)),
            },
            Err(err) => Err(err),
        };
        let duration = start_time.elapsed();

        match command_result {
            Err(mut err) => {
                self.emit_command_event(|| {
                    let mut err = err.clone();
                    if should_redact {
                        err.redact();
                    }
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: cmd_name.clone(),
                        failure: err,
                        request_id,
                        connection: connection_info.clone(),
                    })
                });

                if let Some(ref mut session) = session {
                    if err.is_network_error() {
                        session.mark_dirty();
                    }
                }

                err.add_execution_labels(
                    &stream_description,
                    session.as_ref().map_or(false, |s| s.in_transaction()),
                    retryability,
                );

                op.handle_error(err)
            }
            Ok(response) => {
                self.emit_command_event(|| {
                    let reply = if should_redact {
                        Default::default()
                    } else {
                        response.body_document()
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: cmd_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });

                let context = ExecutionContext {
                    connection,
                    session: session.as_deref_mut(),
                    batch_offset,
                };

                match op.handle_response(&response, context) {
                    Ok(()) => {
                        if let Some(batches) = op.batches() {
                            batches.advance(batch_len);
                        }
                        Ok(())
                    }
                    Err(mut err) => {
                        // Per-document failures mean the batch was executed; the remainder
                        // resumes after it.
                        if matches!(*err.kind, ErrorKind::BulkWrite(_)) {
                            if let Some(batches) = op.batches() {
                                batches.advance(batch_len);
                            }
                        }
                        err.add_execution_labels(
                            &stream_description,
                            session.as_ref().map_or(false, |s| s.in_transaction()),
                            retryability,
                        );
                        Err(err.with_server_response(&response))
                    }
                }
            }
        }
    }

    fn parse_response(
        &self,
        session: &mut Option<&mut ClientSession>,
        response: &RawCommandResponse,
    ) -> Result<()> {
        let ok = response.ok()?;

        if let Some(cluster_time) = response.cluster_time()? {
            self.advance_cluster_time(&cluster_time);
            if let Some(session) = session.as_deref_mut() {
                session.advance_cluster_time(&cluster_time);
            }
        }

        if let Some(session) = session.as_deref_mut() {
            if let Some(operation_time) = response.operation_time()? {
                session.advance_operation_time(operation_time);
            }
        }

        if ok == 1 {
            Ok(())
        } else {
            Err(response
                .body::<crate::operation::CommandErrorBody>()
                .map(Error::from)
                .unwrap_or_else(|e| {
                    Error::invalid_response(format!("error deserializing command error: {}", e))
                }))
        }
    }

    /// Returns the retryability level for the execution of this operation with the given
    /// session and connection stream description.
    fn get_retryability<T: Operation>(
        &self,
        op: &T,
        session: &Option<&mut ClientSession>,
        stream_description: &StreamDescription,
        acknowledged: bool,
    ) -> Retryability {
        if session.as_ref().map_or(false, |s| s.in_transaction()) {
            return Retryability::None;
        }
        // Unacknowledged writes cannot be guaranteed at-most-once and are never retried.
        if !acknowledged {
            return Retryability::None;
        }
        if op.retry_mode() == Some(RetryMode::None) {
            return Retryability::None;
        }

        match op.retryability().with_options(self.options()) {
            Retryability::Write if stream_description.supports_retryable_writes() => {
                Retryability::Write
            }
            // All servers compatible with the driver support retryable reads.
            Retryability::Read => Retryability::Read,
            _ => Retryability::None,
        }
    }

    fn emit_command_event(&self, make_event: impl FnOnce() -> CommandEvent) {
        if let Some(ref handler) = self.options().command_event_handler {
            handler.handle(make_event());
        }
    }
}

impl Error {
    /// Adds the necessary labels to this error.
    ///
    /// A `TransientTransactionError` label is added if a transaction is in progress and the
    /// error is a network or server selection error.
    ///
    /// On a pre-4.4 server, a `RetryableWriteError` label is added to any write-retryable
    /// error; on newer servers a label is only added to network errors. Regardless of server
    /// version, a label is only added when the operation is a retryable write.
    fn add_execution_labels(
        &mut self,
        stream_description: &StreamDescription,
        in_transaction: bool,
        retryability: Retryability,
    ) {
        if in_transaction {
            if self.is_network_error() || self.is_server_selection_error() {
                self.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
        } else if retryability == Retryability::Write {
            if let Some(max_wire_version) = stream_description.max_wire_version {
                let server_type: Option<ServerType> =
                    Some(stream_description.initial_server_type);
                if self.should_add_retryable_write_label(max_wire_version, server_type) {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
        }
    }
}

#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
}

trait RetryHelper {
    fn first_error(&mut self) -> Result<()>;
}

impl RetryHelper for Option<ExecutionRetry> {
    fn first_error(&mut self) -> Result<()> {
        match self.take() {
            Some(r) => Err(r.first_error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        bson::{doc, rawdoc, Bson, Document},
        cmap::{Command, RawCommandResponse, StreamDescription},
        event::command::{CommandEvent, CommandEventHandler},
        operation::{Batches, ExecutionContext, Operation, WriteResponseBody},
        options::ServerAddress,
        sdam::{Topology, TopologyType},
        test_util::{
            mock_options,
            mock_stream_description,
            network_error,
            primary_hello,
            secondary_hello,
            standalone_hello,
            MockConnector,
            MockPoolFactory,
            PoolLog,
        },
    };

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    struct InsertOp {
        batches: Batches,
        n: u64,
    }

    impl InsertOp {
        fn new(count: usize, ordered: bool) -> Self {
            let documents = (0..count).map(|i| rawdoc! { "i": i as i32 }).collect();
            Self {
                batches: Batches::new("documents", documents, ordered),
                n: 0,
            }
        }
    }

    impl Operation for InsertOp {
        fn name(&self) -> &str {
            "insert"
        }

        fn target_db(&self) -> &str {
            "db"
        }

        fn operation_type(&self) -> OperationType {
            OperationType::Write
        }

        fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
            let ordered = self.batches.ordered;
            Ok(Command::new(
                "insert",
                "db",
                rawdoc! { "insert": "coll", "ordered": ordered },
            ))
        }

        fn handle_response(
            &mut self,
            response: &RawCommandResponse,
            context: ExecutionContext<'_>,
        ) -> Result<()> {
            let body: WriteResponseBody = response.body()?;
            self.n += body.n;
            body.validate(context.batch_offset)
        }

        fn retryability(&self) -> Retryability {
            Retryability::Write
        }

        fn batches(&mut self) -> Option<&mut Batches> {
            Some(&mut self.batches)
        }
    }

    struct FindOp {
        found: Option<Document>,
    }

    impl Operation for FindOp {
        fn name(&self) -> &str {
            "find"
        }

        fn target_db(&self) -> &str {
            "db"
        }

        fn operation_type(&self) -> OperationType {
            OperationType::Read
        }

        fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
            Ok(Command::new("find", "db", rawdoc! { "find": "coll" }))
        }

        fn handle_response(
            &mut self,
            response: &RawCommandResponse,
            _context: ExecutionContext<'_>,
        ) -> Result<()> {
            self.found = Some(response.body_document());
            Ok(())
        }

        fn retryability(&self) -> Retryability {
            Retryability::Read
        }
    }

    /// Hands each checked-out connection the next script in the queue.
    fn sequential_pool(scripts: Vec<Vec<Result<Document>>>) -> MockPoolFactory {
        let scripts: Mutex<VecDeque<VecDeque<Result<Document>>>> = Mutex::new(
            scripts
                .into_iter()
                .map(VecDeque::from)
                .collect::<VecDeque<_>>(),
        );
        MockPoolFactory::new(move |_| {
            scripts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
                .unwrap_or_default()
        })
    }

    async fn standalone_topology(pool_factory: MockPoolFactory) -> (Topology, Arc<PoolLog>) {
        let log = pool_factory.log();
        let connector = MockConnector::new(|_| Ok(standalone_hello()));
        let topology =
            Topology::new(mock_options(&["a.test:27017"], connector, pool_factory)).unwrap();
        topology.connect().unwrap();

        let mut subscription = topology.subscribe().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while topology.description().topology_type() != TopologyType::Single {
            assert!(Instant::now() < deadline, "standalone never discovered");
            let _ = subscription.recv_timeout(Duration::from_millis(100)).await;
        }

        (topology, log)
    }

    fn sent_commands(log: &PoolLog) -> Vec<(ServerAddress, Document)> {
        log.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn batch_documents(command: &Document) -> Vec<i32> {
        command
            .get_array("documents")
            .unwrap()
            .iter()
            .map(|doc| match doc {
                Bson::Document(doc) => doc.get_i32("i").unwrap(),
                other => panic!("unexpected document entry: {:?}", other),
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_writes_split_into_successive_batches() {
        let pool = sequential_pool(vec![
            vec![Ok(doc! { "ok": 1, "n": 2 })],
            vec![Ok(doc! { "ok": 1, "n": 2 })],
            vec![Ok(doc! { "ok": 1, "n": 1 })],
        ])
        .with_stream_description(StreamDescription {
            max_write_batch_size: 2,
            ..mock_stream_description()
        });
        let (topology, log) = standalone_topology(pool).await;

        let mut op = InsertOp::new(5, false);
        topology.execute_operation(&mut op, None).await.unwrap();

        assert_eq!(op.n, 5);

        let sent = sent_commands(&log);
        assert_eq!(sent.len(), 3);
        let batches: Vec<Vec<i32>> = sent
            .iter()
            .map(|(_, command)| batch_documents(command))
            .collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retryable_write_reuses_txn_number() {
        let pool = sequential_pool(vec![
            vec![Err(network_error())],
            vec![Ok(doc! { "ok": 1, "n": 1 })],
        ]);
        let (topology, log) = standalone_topology(pool).await;

        let mut op = InsertOp::new(1, true);
        topology.execute_operation(&mut op, None).await.unwrap();
        assert_eq!(op.n, 1);

        let sent = sent_commands(&log);
        assert_eq!(sent.len(), 2, "expected exactly one retry");
        let txn_numbers: Vec<i64> = sent
            .iter()
            .map(|(_, command)| command.get_i64("txnNumber").unwrap())
            .collect();
        assert_eq!(txn_numbers[0], txn_numbers[1]);
        assert!(sent[0].1.contains_key("lsid"));
        assert_eq!(
            sent[0].1.get_document("lsid").unwrap(),
            sent[1].1.get_document("lsid").unwrap()
        );

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_most_one_retry_is_attempted() {
        let pool = sequential_pool(vec![
            vec![Err(network_error())],
            vec![Err(network_error())],
            vec![Ok(doc! { "ok": 1, "n": 1 })],
        ]);
        let (topology, log) = standalone_topology(pool).await;

        let mut op = InsertOp::new(1, true);
        let result = topology.execute_operation(&mut op, None).await;
        assert!(result.is_err());

        assert_eq!(sent_commands(&log).len(), 2, "expected exactly two wire attempts");

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_attempt_success_issues_one_wire_call() {
        let pool = sequential_pool(vec![vec![Ok(doc! { "ok": 1, "n": 1 })]]);
        let (topology, log) = standalone_topology(pool).await;

        let mut op = InsertOp::new(1, true);
        topology.execute_operation(&mut op, None).await.unwrap();
        assert_eq!(sent_commands(&log).len(), 1);

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ordered_bulk_write_stops_at_first_failure() {
        let write_error_reply = doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [ { "index": 1, "code": 11000, "errmsg": "duplicate key" } ],
        };
        let pool = sequential_pool(vec![
            vec![Ok(write_error_reply)],
            vec![Ok(doc! { "ok": 1, "n": 2 })],
        ])
        .with_stream_description(StreamDescription {
            max_write_batch_size: 2,
            ..mock_stream_description()
        });
        let (topology, log) = standalone_topology(pool).await;

        let mut op = InsertOp::new(4, true);
        let error = topology.execute_operation(&mut op, None).await.unwrap_err();

        match *error.kind {
            ErrorKind::BulkWrite(ref failure) => {
                let write_errors = failure.write_errors.as_ref().unwrap();
                assert_eq!(write_errors.len(), 1);
                assert_eq!(write_errors[0].index, 1);
            }
            ref other => panic!("expected bulk write error, got {:?}", other),
        }

        // Documents past the failed batch were never delivered.
        assert_eq!(sent_commands(&log).len(), 1);

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unordered_bulk_write_continues_and_accumulates_errors() {
        let first_reply = doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "duplicate key" } ],
        };
        let second_reply = doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [ { "index": 1, "code": 11000, "errmsg": "duplicate key" } ],
        };
        let pool = sequential_pool(vec![vec![Ok(first_reply)], vec![Ok(second_reply)]])
            .with_stream_description(StreamDescription {
                max_write_batch_size: 2,
                ..mock_stream_description()
            });
        let (topology, log) = standalone_topology(pool).await;

        let mut op = InsertOp::new(4, false);
        let error = topology.execute_operation(&mut op, None).await.unwrap_err();

        assert_eq!(sent_commands(&log).len(), 2);
        match *error.kind {
            ErrorKind::BulkWrite(ref failure) => {
                let indexes: Vec<usize> = failure
                    .write_errors
                    .as_ref()
                    .unwrap()
                    .iter()
                    .map(|e| e.index)
                    .collect();
                // Indexes are reported against the original document list.
                assert_eq!(indexes, vec![0, 3]);
            }
            ref other => panic!("expected bulk write error, got {:?}", other),
        }
        assert_eq!(op.n, 2);

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn not_writable_primary_marks_server_unknown_and_retry_succeeds() {
        let failover = Arc::new(AtomicBool::new(false));
        let hosts = ["a.test:27017", "b.test:27017"];

        let connector = {
            let failover = failover.clone();
            MockConnector::new(move |address| {
                let failed_over = failover.load(Ordering::SeqCst);
                match (address.host(), failed_over) {
                    ("a.test", false) => Ok(primary_hello("a.test:27017", &hosts, "rs0")),
                    ("b.test", false) => Ok(secondary_hello("b.test:27017", &hosts, "rs0")),
                    ("a.test", true) => Ok(secondary_hello("a.test:27017", &hosts, "rs0")),
                    ("b.test", true) => Ok(primary_hello("b.test:27017", &hosts, "rs0")),
                    (other, _) => panic!("unexpected host {}", other),
                }
            })
        };

        let not_writable = doc! {
            "ok": 0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "node is not writable",
            "errorLabels": ["RetryableWriteError"],
        };
        let pool = MockPoolFactory::new(move |address| match address.host() {
            "a.test" => VecDeque::from(vec![Ok(not_writable.clone())]),
            _ => VecDeque::from(vec![Ok(doc! { "ok": 1, "n": 1 })]),
        });
        let log = pool.log();

        // A long heartbeat interval keeps the monitors quiet between the requested
        // immediate checks, so the failover is observed only through the error feedback.
        let mut options = mock_options(&["a.test:27017"], connector, pool);
        options.heartbeat_freq = Some(Duration::from_secs(10));
        let topology = Topology::new(options).unwrap();
        topology.connect().unwrap();

        // Wait for the initial primary to be discovered.
        let mut subscription = topology.subscribe().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while topology.description().topology_type() != TopologyType::ReplicaSetWithPrimary {
            assert!(Instant::now() < deadline);
            let _ = subscription.recv_timeout(Duration::from_millis(100)).await;
        }

        // The primary steps down; the topology finds out via the operation's error.
        failover.store(true, Ordering::SeqCst);

        let mut op = InsertOp::new(1, true);
        topology.execute_operation(&mut op, None).await.unwrap();
        assert_eq!(op.n, 1);

        let sent = sent_commands(&log);
        let last = sent.last().unwrap();
        assert_eq!(last.0, addr("b.test:27017"));
        if sent.len() > 1 {
            assert_eq!(sent[0].0, addr("a.test:27017"));
        }

        // A modern server's step-down does not clear the pool.
        assert!(log
            .cleared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty());

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn command_events_carry_request_ids_and_names() {
        #[derive(Default)]
        struct Recorder {
            events: Mutex<Vec<(String, i32, &'static str)>>,
        }

        impl CommandEventHandler for Recorder {
            fn handle(&self, event: CommandEvent) {
                let kind = match event {
                    CommandEvent::Started(_) => "started",
                    CommandEvent::Succeeded(_) => "succeeded",
                    CommandEvent::Failed(_) => "failed",
                };
                self.events
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push((event.command_name().to_string(), event.request_id(), kind));
            }
        }

        let recorder = Arc::new(Recorder::default());
        let pool = sequential_pool(vec![vec![Ok(doc! { "ok": 1 })]]);
        let connector = MockConnector::new(|_| Ok(standalone_hello()));
        let mut options = mock_options(&["a.test:27017"], connector, pool);
        options.command_event_handler = Some(recorder.clone());
        let topology = Topology::new(options).unwrap();
        topology.connect().unwrap();

        let mut subscription = topology.subscribe().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while topology.description().topology_type() != TopologyType::Single {
            assert!(Instant::now() < deadline);
            let _ = subscription.recv_timeout(Duration::from_millis(100)).await;
        }

        let mut op = FindOp { found: None };
        topology.execute_operation(&mut op, None).await.unwrap();
        assert!(op.found.is_some());

        let events = recorder
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].2, "started");
        assert_eq!(events[1].2, "succeeded");
        assert_eq!(events[0].0, "find");
        assert_eq!(events[0].1, events[1].1);

        topology.disconnect().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_with_retry_disabled_fail_fast() {
        let pool = sequential_pool(vec![
            vec![Err(network_error())],
            vec![Ok(doc! { "ok": 1 })],
        ]);
        let log = pool.log();
        let connector = MockConnector::new(|_| Ok(standalone_hello()));
        let mut options = mock_options(&["a.test:27017"], connector, pool);
        options.retry_reads = Some(false);
        let topology = Topology::new(options).unwrap();
        topology.connect().unwrap();

        let mut subscription = topology.subscribe().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while topology.description().topology_type() != TopologyType::Single {
            assert!(Instant::now() < deadline);
            let _ = subscription.recv_timeout(Duration::from_millis(100)).await;
        }

        let mut op = FindOp { found: None };
        let result = topology.execute_operation(&mut op, None).await;
        assert!(result.is_err());
        assert_eq!(sent_commands(&log).len(), 1);

        topology.disconnect().unwrap();
    }
}
