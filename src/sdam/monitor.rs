use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;

use crate::{
    bson_util,
    cmap::{MonitorConnection, MonitorConnector},
    error::Error,
    event::sdam::{
        SdamEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    sdam::{ServerDescription, ServerType, TopologyUpdater, TopologyVersion},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// Handle used to request an immediate check from a monitor.
///
/// The underlying channel has capacity 1: at most one request can be pending. A request that
/// arrives while a check is in flight lets that check finish normally and triggers the next
/// one as soon as the minimum frequency allows.
#[derive(Debug, Clone)]
pub(crate) struct MonitorRequester {
    sender: mpsc::Sender<()>,
}

impl MonitorRequester {
    pub(crate) fn request_immediate_check(&self) {
        let _ = self.sender.try_send(());
    }
}

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connector: Arc<dyn MonitorConnector>,
    connection: Option<Box<dyn MonitorConnection>>,
    topology: TopologyUpdater,
    options: ClientOptions,
    request_receiver: mpsc::Receiver<()>,
    handle_listener: WorkerHandleListener,
    rtt_info: Arc<Mutex<RttInfo>>,

    /// The most recent topology version reported by the server. Its presence indicates that
    /// the server supports awaitable hellos.
    topology_version: Option<TopologyVersion>,

    /// The most recently observed type for the monitored server.
    server_type: ServerType,

    /// Increments each time the monitoring connection is re-established.
    driver_connection_id: u32,

    server_connection_id: Option<i64>,

    /// Handle keeping the RTT sampling task alive for the lifetime of this monitor.
    _rtt_worker: WorkerHandle,
}

impl Monitor {
    /// Starts a monitor for the given address, returning the handle used to request immediate
    /// checks and the worker handle that keeps the monitor alive.
    pub(crate) fn start(
        address: ServerAddress,
        topology: TopologyUpdater,
        options: ClientOptions,
    ) -> (MonitorRequester, WorkerHandle) {
        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (sender, request_receiver) = mpsc::channel(1);
        let rtt_info = Arc::new(Mutex::new(RttInfo::default()));

        let (rtt_worker, rtt_listener) = WorkerHandleListener::channel();
        let rtt_monitor = RttMonitor {
            address: address.clone(),
            connector: options.monitor_connector.clone(),
            connection: None,
            options: options.clone(),
            rtt_info: rtt_info.clone(),
            handle_listener: rtt_listener,
        };

        let monitor = Monitor {
            address,
            connector: options.monitor_connector.clone(),
            connection: None,
            topology,
            options,
            request_receiver,
            handle_listener,
            rtt_info,
            topology_version: None,
            server_type: ServerType::Unknown,
            driver_connection_id: 0,
            server_connection_id: None,
            _rtt_worker: rtt_worker,
        };

        runtime::spawn(rtt_monitor.execute());
        runtime::spawn(monitor.execute());

        (MonitorRequester { sender }, handle)
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    async fn execute(mut self) {
        while self.handle_listener.is_alive() && self.topology.is_alive() {
            let awaited = self.check_server().await;

            if awaited {
                // Streaming checks block server-side until a state change, so the next one
                // starts right away.
                continue;
            }

            let min_frequency = self.options.min_heartbeat_frequency();
            tokio::select! {
                _ = runtime::delay_for(min_frequency) => {}
                _ = self.handle_listener.wait_for_all_handle_drops() => { break }
            }

            tokio::select! {
                _ = runtime::delay_for(self.heartbeat_frequency().saturating_sub(min_frequency)) => {}
                Some(_) = self.request_receiver.recv() => {}
                _ = self.handle_listener.wait_for_all_handle_drops() => { break }
            }
        }
    }

    /// Checks the server by running a hello command, reporting the derived description to the
    /// topology. Returns whether the check was an awaitable one.
    async fn check_server(&mut self) -> bool {
        let mut retried = false;

        loop {
            let awaited = self.connection.is_some() && self.topology_version.is_some();
            self.emit_event(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
                driver_connection_id: self.driver_connection_id,
                server_connection_id: self.server_connection_id,
            });

            let start = Instant::now();
            let result = self.perform_hello().await;
            let duration = start.elapsed();

            match result {
                Ok(reply) => {
                    if !awaited {
                        self.acquire_rtt_info().add_sample(duration);
                    }
                    self.server_connection_id = reply
                        .command_response
                        .connection_id
                        .or(self.server_connection_id);
                    self.topology_version = reply.command_response.topology_version;

                    self.emit_event(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: bson_util::to_document(&reply.raw_command_response),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id: self.driver_connection_id,
                        server_connection_id: self.server_connection_id,
                    });

                    let (average_rtt, minimum_rtt) = {
                        let rtt_info = self.acquire_rtt_info();
                        (rtt_info.average.unwrap_or(duration), rtt_info.minimum)
                    };
                    let description = ServerDescription::new_from_hello_reply(
                        self.address.clone(),
                        reply,
                        average_rtt,
                        minimum_rtt,
                    );
                    self.deliver(description);
                    return awaited;
                }
                Err(error) => {
                    self.connection = None;
                    self.topology_version = None;
                    self.acquire_rtt_info().reset();

                    self.emit_event(ServerHeartbeatFailedEvent {
                        duration,
                        failure: error.clone(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id: self.driver_connection_id,
                        server_connection_id: self.server_connection_id,
                    });

                    // A dropped connection on a previously-known server warrants one
                    // immediate re-probe on a fresh connection before the server is
                    // declared unknown. Authentication failures are terminal for the cycle.
                    if !retried
                        && error.is_network_error()
                        && !error.is_auth_error()
                        && self.server_type != ServerType::Unknown
                    {
                        retried = true;
                        self.server_type = ServerType::Unknown;
                        continue;
                    }

                    tracing::debug!(
                        address = %self.address,
                        error = %error,
                        "heartbeat failed; marking server unknown"
                    );
                    self.deliver(ServerDescription::new_from_error(
                        self.address.clone(),
                        error,
                    ));
                    return awaited;
                }
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply, Error> {
        let heartbeat_frequency = self.heartbeat_frequency();
        let result = match self.connection {
            Some(ref mut conn) => {
                let awaitable_options =
                    self.topology_version
                        .map(|topology_version| AwaitableHelloOptions {
                            topology_version,
                            max_await_time: heartbeat_frequency,
                        });
                let command = hello_command(
                    self.options.server_api.as_ref(),
                    self.options.load_balanced,
                    awaitable_options,
                );
                run_hello(conn.as_mut(), command, &self.address).await
            }
            None => {
                self.driver_connection_id += 1;
                let mut connection = self.connector.connect_monitoring(&self.address).await?;
                let command =
                    hello_command(self.options.server_api.as_ref(), self.options.load_balanced, None);
                let result = run_hello(connection.as_mut(), command, &self.address).await;
                self.server_connection_id = connection.server_connection_id();
                self.connection = Some(connection);
                result
            }
        };

        if result
            .as_ref()
            .err()
            .map(|e| e.is_network_error())
            .unwrap_or(false)
        {
            self.connection = None;
        }

        result
    }

    /// Reports the description to the topology and records the canonical description the
    /// topology stored for this address.
    fn deliver(&mut self, description: ServerDescription) {
        if let Some(canonical) = self.topology.apply_update(description) {
            self.server_type = canonical.server_type();
            if let Some(topology_version) = canonical.topology_version() {
                self.topology_version = Some(topology_version);
            }
        }
    }

    fn emit_event(&self, event: impl Into<SdamEvent>) {
        self.topology.emit_sdam_event(event.into());
    }

    fn acquire_rtt_info(&self) -> std::sync::MutexGuard<'_, RttInfo> {
        self.rtt_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl From<ServerHeartbeatStartedEvent> for SdamEvent {
    fn from(event: ServerHeartbeatStartedEvent) -> Self {
        Self::ServerHeartbeatStarted(event)
    }
}

impl From<ServerHeartbeatSucceededEvent> for SdamEvent {
    fn from(event: ServerHeartbeatSucceededEvent) -> Self {
        Self::ServerHeartbeatSucceeded(event)
    }
}

impl From<ServerHeartbeatFailedEvent> for SdamEvent {
    fn from(event: ServerHeartbeatFailedEvent) -> Self {
        Self::ServerHeartbeatFailed(event)
    }
}

/// The monitor's view of a server's round trip times.
#[derive(Debug, Clone, Default)]
pub(crate) struct RttInfo {
    /// Weighted moving average: each new sample contributes one fifth.
    pub(crate) average: Option<Duration>,

    /// The smallest sample observed since the monitoring connection was last established.
    pub(crate) minimum: Option<Duration>,
}

impl RttInfo {
    pub(crate) fn add_sample(&mut self, sample: Duration) {
        match self.average {
            Some(old_rtt) => self.average = Some((sample / 5) + (old_rtt * 4 / 5)),
            None => self.average = Some(sample),
        }
        self.minimum = Some(match self.minimum {
            Some(minimum) => std::cmp::min(minimum, sample),
            None => sample,
        });
    }

    pub(crate) fn reset(&mut self) {
        self.average = None;
        self.minimum = None;
    }
}

/// Samples a server's round trip time on a dedicated connection at the ordinary heartbeat
/// cadence. While the main monitor is blocked in awaitable hellos, these samples keep the
/// server's latency current for the selection window.
struct RttMonitor {
    address: ServerAddress,
    connector: Arc<dyn MonitorConnector>,
    connection: Option<Box<dyn MonitorConnection>>,
    options: ClientOptions,
    rtt_info: Arc<Mutex<RttInfo>>,
    handle_listener: WorkerHandleListener,
}

impl RttMonitor {
    async fn execute(mut self) {
        let frequency = self
            .options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.handle_listener.is_alive() {
            match self.sample().await {
                Ok(duration) => {
                    let mut rtt_info = self
                        .rtt_info
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    rtt_info.add_sample(duration);
                }
                Err(_) => {
                    self.connection = None;
                }
            }

            tokio::select! {
                _ = runtime::delay_for(frequency) => {}
                _ = self.handle_listener.wait_for_all_handle_drops() => { break }
            }
        }
    }

    async fn sample(&mut self) -> Result<Duration, Error> {
        let command = hello_command(self.options.server_api.as_ref(), self.options.load_balanced, None);
        let start = Instant::now();
        match self.connection {
            Some(ref mut conn) => {
                run_hello(conn.as_mut(), command, &self.address).await?;
            }
            None => {
                let mut connection = self.connector.connect_monitoring(&self.address).await?;
                let result = run_hello(connection.as_mut(), command, &self.address).await;
                self.connection = Some(connection);
                result?;
            }
        }
        Ok(start.elapsed())
    }
}
