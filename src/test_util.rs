//! Shared mock collaborators and fixtures used across the crate's tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    bson::{doc, Document},
    cmap::{
        Command,
        Connection,
        ConnectionInfo,
        ConnectionPool,
        MonitorConnection,
        MonitorConnector,
        PoolFactory,
        RawCommandResponse,
        StreamDescription,
    },
    error::{Error, ErrorKind, Result},
    hello::HelloReply,
    options::{ClientOptions, ServerAddress},
    sdam::ServerDescription,
};

pub(crate) fn network_error() -> Error {
    ErrorKind::from(std::io::ErrorKind::ConnectionReset).into()
}

/// A hello response for a replica set primary.
pub(crate) fn primary_hello(address: &str, hosts: &[&str], set_name: &str) -> Document {
    let mut doc = base_hello();
    doc.insert("isWritablePrimary", true);
    doc.insert("setName", set_name);
    doc.insert("me", address);
    doc.insert(
        "hosts",
        hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
    );
    doc
}

/// A hello response for a replica set secondary.
pub(crate) fn secondary_hello(address: &str, hosts: &[&str], set_name: &str) -> Document {
    let mut doc = base_hello();
    doc.insert("isWritablePrimary", false);
    doc.insert("secondary", true);
    doc.insert("setName", set_name);
    doc.insert("me", address);
    doc.insert(
        "hosts",
        hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
    );
    doc
}

pub(crate) fn standalone_hello() -> Document {
    base_hello()
}

pub(crate) fn mongos_hello() -> Document {
    let mut doc = base_hello();
    doc.insert("msg", "isdbgrid");
    doc
}

fn base_hello() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "maxWriteBatchSize": 100_000,
        "logicalSessionTimeoutMinutes": 30,
        "minWireVersion": 6,
        "maxWireVersion": 17,
    }
}

pub(crate) fn hello_reply(address: &ServerAddress, doc: &Document) -> HelloReply {
    RawCommandResponse::from_document(doc)
        .and_then(|response| response.into_hello_reply(address.clone()))
        .expect("valid hello fixture")
}

pub(crate) fn server_description(address: &str, hello: &Document) -> ServerDescription {
    server_description_with_rtt(address, hello, Duration::from_millis(5))
}

pub(crate) fn server_description_with_rtt(
    address: &str,
    hello: &Document,
    average_rtt: Duration,
) -> ServerDescription {
    let address = ServerAddress::parse(address).expect("valid address fixture");
    let reply = hello_reply(&address, hello);
    ServerDescription::new_from_hello_reply(address, reply, average_rtt, Some(average_rtt))
}

/// A monitor connector that scripts hello responses per address.
pub(crate) struct MockConnector {
    #[allow(clippy::type_complexity)]
    responses: Arc<dyn Fn(&ServerAddress) -> Result<Document> + Send + Sync>,
}

impl MockConnector {
    pub(crate) fn new(
        responses: impl Fn(&ServerAddress) -> Result<Document> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responses: Arc::new(responses),
        }
    }

    /// A connector whose connections always fail to establish.
    pub(crate) fn empty() -> Self {
        Self::new(|_| Err(network_error()))
    }

    /// A connector whose connection attempts never complete, for tests that drive the
    /// topology by hand without monitor interference.
    pub(crate) fn hanging() -> Hanging {
        Hanging
    }
}

pub(crate) struct Hanging;

#[async_trait]
impl MonitorConnector for Hanging {
    async fn connect_monitoring(
        &self,
        _address: &ServerAddress,
    ) -> Result<Box<dyn MonitorConnection>> {
        crate::runtime::delay_for(Duration::from_secs(3600)).await;
        Err(network_error())
    }
}

#[async_trait]
impl MonitorConnector for MockConnector {
    async fn connect_monitoring(
        &self,
        address: &ServerAddress,
    ) -> Result<Box<dyn MonitorConnection>> {
        // Establishment performs the same probe as the first check.
        (self.responses)(address)?;
        Ok(Box::new(MockMonitorConnection {
            address: address.clone(),
            responses: self.responses.clone(),
        }))
    }
}

struct MockMonitorConnection {
    address: ServerAddress,
    #[allow(clippy::type_complexity)]
    responses: Arc<dyn Fn(&ServerAddress) -> Result<Document> + Send + Sync>,
}

#[async_trait]
impl MonitorConnection for MockMonitorConnection {
    async fn send_command(&mut self, _command: Command) -> Result<RawCommandResponse> {
        let doc = (self.responses)(&self.address)?;
        RawCommandResponse::from_document(&doc)
    }
}

/// Records of what happened to the connections handed out by a [`MockPoolFactory`].
#[derive(Default)]
pub(crate) struct PoolLog {
    pub(crate) cleared: Mutex<Vec<ServerAddress>>,
    pub(crate) sent: Mutex<Vec<(ServerAddress, Document)>>,
}

/// A pool factory whose pools hand out scripted connections.
pub(crate) struct MockPoolFactory {
    #[allow(clippy::type_complexity)]
    replies: Arc<dyn Fn(&ServerAddress) -> VecDeque<Result<Document>> + Send + Sync>,
    stream_description: StreamDescription,
    log: Arc<PoolLog>,
    next_id: Arc<AtomicU32>,
}

impl Default for MockPoolFactory {
    fn default() -> Self {
        Self::new(|_| VecDeque::new())
    }
}

impl MockPoolFactory {
    /// `replies` produces the full scripted reply sequence for one checked-out connection.
    pub(crate) fn new(
        replies: impl Fn(&ServerAddress) -> VecDeque<Result<Document>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            replies: Arc::new(replies),
            stream_description: mock_stream_description(),
            log: Arc::new(PoolLog::default()),
            next_id: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn with_stream_description(
        mut self,
        stream_description: StreamDescription,
    ) -> Self {
        self.stream_description = stream_description;
        self
    }

    pub(crate) fn log(&self) -> Arc<PoolLog> {
        self.log.clone()
    }
}

impl PoolFactory for MockPoolFactory {
    fn build(&self, address: ServerAddress) -> Arc<dyn ConnectionPool> {
        Arc::new(MockPool {
            address,
            replies: self.replies.clone(),
            stream_description: self.stream_description.clone(),
            log: self.log.clone(),
            next_id: self.next_id.clone(),
        })
    }
}

struct MockPool {
    address: ServerAddress,
    #[allow(clippy::type_complexity)]
    replies: Arc<dyn Fn(&ServerAddress) -> VecDeque<Result<Document>> + Send + Sync>,
    stream_description: StreamDescription,
    log: Arc<PoolLog>,
    next_id: Arc<AtomicU32>,
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn check_out(&self) -> Result<Box<dyn Connection>> {
        let replies = (self.replies)(&self.address);
        if replies.is_empty() {
            return Err(network_error());
        }
        Ok(Box::new(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            address: self.address.clone(),
            stream_description: self.stream_description.clone(),
            replies,
            log: self.log.clone(),
        }))
    }

    fn clear(&self, _cause: &Error) {
        let mut cleared = self
            .log
            .cleared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cleared.push(self.address.clone());
    }

    fn mark_as_ready(&self) {}
}

pub(crate) fn mock_stream_description() -> StreamDescription {
    let address = ServerAddress::parse("a.test:27017").expect("valid address fixture");
    let hello = primary_hello("a.test:27017", &["a.test:27017"], "rs0");
    StreamDescription::from_hello_reply(&hello_reply(&address, &hello))
}

struct MockConnection {
    id: u32,
    address: ServerAddress,
    stream_description: StreamDescription,
    replies: VecDeque<Result<Document>>,
    log: Arc<PoolLog>,
}

#[async_trait]
impl Connection for MockConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: None,
            address: self.address.clone(),
        }
    }

    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn stream_description(&self) -> Result<&StreamDescription> {
        Ok(&self.stream_description)
    }

    async fn send_command(
        &mut self,
        command: Command,
        _request_id: i32,
    ) -> Result<RawCommandResponse> {
        {
            let mut sent = self
                .log
                .sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sent.push((self.address.clone(), command.get_command_document()));
        }
        match self.replies.pop_front() {
            Some(Ok(doc)) => RawCommandResponse::from_document(&doc),
            Some(Err(error)) => Err(error),
            None => Err(network_error()),
        }
    }
}

/// Client options wired to mocks suitable for most tests: fast heartbeats, scripted monitor
/// responses, and a pool whose connections are scripted per test.
pub(crate) fn mock_options(
    hosts: &[&str],
    connector: impl MonitorConnector + 'static,
    pool_factory: MockPoolFactory,
) -> ClientOptions {
    ClientOptions::builder()
        .hosts(
            hosts
                .iter()
                .map(|h| ServerAddress::parse(h).expect("valid host fixture"))
                .collect::<Vec<_>>(),
        )
        .pool_factory(Arc::new(pool_factory) as Arc<dyn PoolFactory>)
        .monitor_connector(Arc::new(connector) as Arc<dyn MonitorConnector>)
        .heartbeat_freq(Some(Duration::from_millis(50)))
        .min_heartbeat_freq(Some(Duration::from_millis(10)))
        .build()
}
