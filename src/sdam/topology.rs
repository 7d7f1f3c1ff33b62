use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
    time::{Duration, Instant},
};

use tokio::sync::watch;

use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind, Result},
    event::sdam::{
        SdamEvent,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    sdam::{
        description::topology::server_selection::{self, SelectedServer},
        monitor::{Monitor, MonitorRequester},
        server::Server,
        srv_polling::SrvPollingMonitor,
        ServerDescription,
        ServerType,
        TopologyDescription,
        TopologyType,
    },
    selection_criteria::SelectionCriteria,
    session::ClusterTime,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The lifecycle state of a topology. Transitions are `Disconnected` -> `Connecting` ->
/// `Connected` -> `Disconnecting` -> `Disconnected`; `connect` and `disconnect` each occur at
/// most once per direction via atomic compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// The client's view of the deployment: it owns the server monitors, applies their updates to
/// the topology description through the SDAM state machine, fans descriptions out to
/// subscribers, and selects servers for operations.
#[derive(Debug, Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

#[derive(Debug)]
struct TopologyInner {
    id: ObjectId,
    options: ClientOptions,
    state: AtomicU8,

    /// The current snapshot. Readers clone the inner `Arc` under a short read lock and never
    /// contend with the FSM while it computes a new description.
    description: RwLock<Arc<TopologyDescription>>,

    /// The live servers and their monitors, plus the FSM input ordering: all description
    /// updates are applied while holding this lock.
    servers: Mutex<ServerSet>,

    /// The subscriber fan-out map, guarded separately so that publishing never holds the
    /// server lock longer than necessary and never performs I/O.
    subscribers: Mutex<Subscribers>,

    /// Handle keeping the SRV polling task alive, when polling is enabled.
    srv_polling: Mutex<Option<WorkerHandle>>,
}

#[derive(Debug, Default)]
struct ServerSet {
    servers: HashMap<ServerAddress, MonitoredServer>,
    closed: bool,
}

#[derive(Debug)]
struct MonitoredServer {
    server: Arc<Server>,
    requester: Option<MonitorRequester>,
    _worker: Option<WorkerHandle>,
}

#[derive(Debug, Default)]
struct Subscribers {
    senders: HashMap<u64, watch::Sender<Arc<TopologyDescription>>>,
    next_id: u64,
    closed: bool,
}

fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Topology {
    /// Creates a new topology in the `Disconnected` state. No monitoring occurs until
    /// [`Topology::connect`] is called.
    pub fn new(options: ClientOptions) -> Result<Topology> {
        options.validate()?;

        Ok(Topology {
            inner: Arc::new(TopologyInner {
                id: ObjectId::new(),
                options,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                description: RwLock::new(Arc::new(TopologyDescription::default())),
                servers: Mutex::new(ServerSet::default()),
                subscribers: Mutex::new(Subscribers::default()),
                srv_polling: Mutex::new(None),
            }),
        })
    }

    /// The process-scoped id of this topology.
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Initializes the topology from the configured seed list and starts the server monitors
    /// and, when applicable, the SRV polling task.
    ///
    /// Errors if the topology has already been connected.
    pub fn connect(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::invalid_argument("topology is already connected"));
        }

        self.emit_sdam_event(SdamEvent::TopologyOpening(TopologyOpeningEvent {
            topology_id: self.inner.id,
        }));

        let mut initial = TopologyDescription::default();
        initial.initialize(&self.inner.options);

        acquire(&self.inner.subscribers).closed = false;

        {
            let mut servers = acquire(&self.inner.servers);
            servers.closed = false;
            let previous = self.description();
            self.install_description(&mut servers, previous, initial);
        }

        if self.inner.options.load_balanced == Some(true) {
            // There is no monitoring in load-balanced mode; a synthesized description makes
            // the single backend selectable and produces the initial events.
            let mut description = ServerDescription::new(&self.inner.options.hosts[0]);
            description.server_type = ServerType::LoadBalancer;
            self.apply_update(description);
        }

        if self.inner.options.srv_polling_enabled() {
            let (handle, listener) = WorkerHandleListener::channel();
            SrvPollingMonitor::start(self.updater(), self.inner.options.clone(), listener);
            *acquire(&self.inner.srv_polling) = Some(handle);
        }

        self.inner
            .state
            .store(ConnectionState::Connected as u8, Ordering::SeqCst);

        Ok(())
    }

    /// Stops all monitors, closes all subscriptions, and publishes a final stale description.
    /// Idempotent after the first call.
    pub fn disconnect(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        *acquire(&self.inner.srv_polling) = None;

        let drained: Vec<(ServerAddress, MonitoredServer)> = {
            let mut servers = acquire(&self.inner.servers);
            servers.closed = true;
            servers.servers.drain().collect()
        };

        let mut addresses: Vec<_> = drained.iter().map(|(address, _)| address.clone()).collect();
        addresses.sort();

        // Dropping the worker handles shuts the monitors down asynchronously.
        drop(drained);

        for address in addresses {
            self.emit_sdam_event(SdamEvent::ServerClosed(ServerClosedEvent {
                address,
                topology_id: self.inner.id,
            }));
        }

        let previous = self.description();
        let mut cleared = (*previous).clone();
        cleared.servers.clear();
        cleared.topology_type = TopologyType::Unknown;
        cleared.stale = true;
        let cleared = Arc::new(cleared);

        {
            let mut snapshot = self
                .inner
                .description
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *snapshot = cleared.clone();
        }

        self.emit_sdam_event(SdamEvent::TopologyDescriptionChanged(Box::new(
            TopologyDescriptionChangedEvent {
                topology_id: self.inner.id,
                previous_description: (*previous).clone(),
                new_description: (*cleared).clone(),
            },
        )));

        // Subscribers observe the terminal description, then their channels close.
        {
            let mut subscribers = acquire(&self.inner.subscribers);
            for sender in subscribers.senders.values() {
                let _ = sender.send(cleared.clone());
            }
            subscribers.senders.clear();
            subscribers.closed = true;
        }

        self.emit_sdam_event(SdamEvent::TopologyClosed(TopologyClosedEvent {
            topology_id: self.inner.id,
        }));

        self.inner
            .state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);

        Ok(())
    }

    /// The current topology description snapshot.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner
            .description
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The highest cluster time seen across the deployment.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.description().cluster_time().cloned()
    }

    /// Update the topology's highest seen cluster time.
    /// If the provided cluster time is not higher than the topology's currently highest seen
    /// cluster time, this method has no effect.
    pub fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut servers = acquire(&self.inner.servers);
        if servers.closed {
            return;
        }
        let previous = self.description();
        if previous.cluster_time() >= Some(to) {
            return;
        }
        let mut next = (*previous).clone();
        next.advance_cluster_time(to);
        self.install_description(&mut servers, previous, next);
    }

    /// Begin watching for changes in the topology. The returned subscription is pre-populated
    /// with the current description.
    ///
    /// Each subscription holds a channel of capacity one: publishing drains any unseen
    /// description before writing, so slow subscribers observe only the latest state and the
    /// publisher never blocks.
    pub fn subscribe(&self) -> Result<TopologySubscription> {
        if self.state() != ConnectionState::Connected {
            return Err(ErrorKind::Shutdown.into());
        }

        let current = self.description();
        let mut subscribers = acquire(&self.inner.subscribers);
        if subscribers.closed {
            return Err(ErrorKind::Shutdown.into());
        }

        let (sender, receiver) = watch::channel(current.clone());
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.insert(id, sender);

        Ok(TopologySubscription {
            id,
            receiver,
            pending: Some(current),
            topology: Arc::downgrade(&self.inner),
        })
    }

    /// Removes the given subscription. Dropping a subscription has the same effect; this
    /// method exists for symmetry with [`Topology::subscribe`] and is idempotent.
    pub fn unsubscribe(&self, subscription: TopologySubscription) {
        drop(subscription);
    }

    /// Requests that all server monitors perform a check as soon as the minimum heartbeat
    /// frequency allows. No-op when the topology is not connected.
    pub fn request_immediate_check(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let servers = acquire(&self.inner.servers);
        for monitored in servers.servers.values() {
            if let Some(ref requester) = monitored.requester {
                requester.request_immediate_check();
            }
        }
    }

    /// Selects a server according to the given criteria, waiting for topology updates until a
    /// suitable server appears or the server selection timeout elapses.
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Result<SelectedServer> {
        if self.state() != ConnectionState::Connected {
            return Err(ErrorKind::Shutdown.into());
        }

        let timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start = Instant::now();
        let mut subscription: Option<TopologySubscription> = None;

        loop {
            let description = match subscription.as_mut() {
                // The first pass selects from the current description, which avoids the
                // subscription machinery entirely for up-to-date topologies.
                None => self.description(),
                Some(subscription) => {
                    let remaining = match timeout.checked_sub(start.elapsed()) {
                        Some(remaining) if !remaining.is_zero() => remaining,
                        _ => return Err(self.selection_timeout_error(criteria)),
                    };
                    match runtime::timeout(remaining, subscription.recv()).await {
                        Ok(Some(description)) => description,
                        Ok(None) => return Err(ErrorKind::Shutdown.into()),
                        Err(_) => return Err(self.selection_timeout_error(criteria)),
                    }
                }
            };

            let servers = self.server_handles();
            if let Some(selected) =
                server_selection::attempt_to_select_server(criteria, &description, &servers)?
            {
                return Ok(selected);
            }

            if subscription.is_none() {
                subscription = Some(self.subscribe()?);
            }
            // Accelerate convergence while a selection is blocked.
            self.request_immediate_check();
        }
    }

    /// Maps a server description back to a live server handle, if the server is still part of
    /// the topology.
    pub fn find_server(&self, description: &ServerDescription) -> Result<Option<SelectedServer>> {
        if self.state() != ConnectionState::Connected {
            return Err(ErrorKind::Shutdown.into());
        }
        let servers = acquire(&self.inner.servers);
        Ok(servers
            .servers
            .get(description.address())
            .map(|monitored| SelectedServer::new(monitored.server.clone())))
    }

    fn selection_timeout_error(&self, criteria: &SelectionCriteria) -> Error {
        let description = self.description();
        tracing::debug!(
            criteria = %criteria,
            topology = %description,
            "server selection timed out"
        );
        ErrorKind::ServerSelection {
            message: description.server_selection_timeout_error_message(criteria),
        }
        .into()
    }

    pub(crate) fn server_handles(&self) -> HashMap<ServerAddress, Arc<Server>> {
        let servers = acquire(&self.inner.servers);
        servers
            .servers
            .iter()
            .map(|(address, monitored)| (address.clone(), monitored.server.clone()))
            .collect()
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        TopologyUpdater {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Applies a server description produced by a monitor (or synthesized from an application
    /// error) to the topology, returning the canonical description that was stored.
    pub(crate) fn apply_update(&self, description: ServerDescription) -> Option<ServerDescription> {
        let mut servers = acquire(&self.inner.servers);
        if servers.closed {
            return None;
        }

        let previous = self.description();
        match previous.apply(description.clone()) {
            Ok((next, canonical)) => {
                self.install_description(&mut servers, previous, next);
                Some(canonical)
            }
            Err(error) => {
                tracing::warn!(
                    address = %description.address(),
                    error = %error,
                    "discarding invalid topology transition"
                );
                previous.get_server_description(description.address()).cloned()
            }
        }
    }

    /// Handle an error that occurred during operation execution, applying the topology
    /// feedback the error calls for. Returns whether the server was marked unknown.
    pub(crate) fn handle_application_error(&self, address: &ServerAddress, error: &Error) -> bool {
        if error.is_incompatible_server() {
            return false;
        }

        let previous = self.description();
        let existing = match previous.get_server_description(address) {
            Some(existing) => existing,
            None => return false,
        };

        // Errors carrying a stale topology version describe a state the monitor has already
        // moved past.
        if let (Some(existing_tv), Some(error_tv)) =
            (existing.topology_version(), error.topology_version())
        {
            if !error_tv.is_more_recent_than(existing_tv) {
                return false;
            }
        }

        let is_load_balanced = previous.topology_type() == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            let updated = is_load_balanced
                || self
                    .apply_update(ServerDescription::new_from_error(
                        address.clone(),
                        error.clone(),
                    ))
                    .is_some();

            if updated && (error.is_shutting_down() || error.wire_version.unwrap_or(0) < 8) {
                self.clear_server_pool(address, error);
            }
            self.request_immediate_check_for(address);

            updated
        } else if error.is_non_timeout_network_error() {
            let updated = if is_load_balanced {
                false
            } else {
                self.apply_update(ServerDescription::new_from_error(
                    address.clone(),
                    error.clone(),
                ))
                .is_some()
            };

            if updated {
                self.clear_server_pool(address, error);
            }
            updated
        } else {
            false
        }
    }

    fn clear_server_pool(&self, address: &ServerAddress, cause: &Error) {
        let servers = acquire(&self.inner.servers);
        if let Some(monitored) = servers.servers.get(address) {
            monitored.server.pool.clear(cause);
        }
    }

    fn request_immediate_check_for(&self, address: &ServerAddress) {
        let servers = acquire(&self.inner.servers);
        if let Some(monitored) = servers.servers.get(address) {
            if let Some(ref requester) = monitored.requester {
                requester.request_immediate_check();
            }
        }
    }

    /// Installs a new topology description: reconciles the monitor set with the description's
    /// address set, emits the SDAM events implied by the change, swaps the snapshot, and fans
    /// the description out to subscribers.
    ///
    /// Must be called with the server lock held; never performs I/O.
    fn install_description(
        &self,
        servers: &mut ServerSet,
        previous: Arc<TopologyDescription>,
        next: TopologyDescription,
    ) {
        let next = Arc::new(next);

        if let Some(diff) = previous.diff(&next) {
            let mut changed: Vec<_> = diff.changed_servers.into_iter().collect();
            changed.sort_by_key(|(address, _)| (*address).clone());

            for (address, (previous_sd, new_sd)) in changed {
                if new_sd.server_type.is_data_bearing()
                    || (new_sd.server_type != ServerType::Unknown
                        && next.topology_type() == TopologyType::Single)
                {
                    if let Some(monitored) = servers.servers.get(address) {
                        monitored.server.pool.mark_as_ready();
                    }
                } else if new_sd.server_type == ServerType::Unknown
                    && previous_sd.server_type.is_available()
                {
                    if let Some(monitored) = servers.servers.get(address) {
                        // A server that went unknown takes its pooled connections with it,
                        // and needs a prompt re-check to rediscover its role (e.g. a stale
                        // primary that was rejected, or a primary demoted by a newer one).
                        if let Some(error) = new_sd.error() {
                            monitored.server.pool.clear(error);
                        }
                        if let Some(ref requester) = monitored.requester {
                            requester.request_immediate_check();
                        }
                    }
                }

                self.emit_sdam_event(SdamEvent::ServerDescriptionChanged(Box::new(
                    ServerDescriptionChangedEvent {
                        address: address.clone(),
                        topology_id: self.inner.id,
                        previous_description: previous_sd.clone(),
                        new_description: new_sd.clone(),
                    },
                )));
            }

            let mut removed: Vec<_> = diff.removed_addresses.into_iter().cloned().collect();
            removed.sort();
            for address in removed {
                servers.servers.remove(&address);
                self.emit_sdam_event(SdamEvent::ServerClosed(ServerClosedEvent {
                    address,
                    topology_id: self.inner.id,
                }));
            }

            self.emit_sdam_event(SdamEvent::TopologyDescriptionChanged(Box::new(
                TopologyDescriptionChangedEvent {
                    topology_id: self.inner.id,
                    previous_description: (*previous).clone(),
                    new_description: (*next).clone(),
                },
            )));

            let mut added: Vec<_> = diff.added_addresses.into_iter().cloned().collect();
            added.sort();
            for address in added {
                self.add_server(servers, address.clone());
                self.emit_sdam_event(SdamEvent::ServerOpening(ServerOpeningEvent {
                    address,
                    topology_id: self.inner.id,
                }));
            }
        }

        {
            let mut snapshot = self
                .inner
                .description
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *snapshot = next.clone();
        }

        // Latest-wins publish: the watch channel drops any unobserved value.
        let subscribers = acquire(&self.inner.subscribers);
        for sender in subscribers.senders.values() {
            let _ = sender.send(next.clone());
        }
    }

    fn add_server(&self, servers: &mut ServerSet, address: ServerAddress) {
        if servers.servers.contains_key(&address) {
            return;
        }

        let server = Server::new(address.clone(), self.inner.options.pool_factory.as_ref());

        let (requester, worker) = if self.monitoring_enabled() {
            let (requester, worker) =
                Monitor::start(address.clone(), self.updater(), self.inner.options.clone());
            (Some(requester), Some(worker))
        } else {
            (None, None)
        };

        servers.servers.insert(
            address,
            MonitoredServer {
                server,
                requester,
                _worker: worker,
            },
        );
    }

    fn monitoring_enabled(&self) -> bool {
        self.inner.options.load_balanced != Some(true)
    }

    pub(crate) fn emit_sdam_event(&self, event: SdamEvent) {
        if let Some(ref handler) = self.inner.options.sdam_event_handler {
            handler.handle(event);
        }
    }
}

/// A subscription to topology description updates.
///
/// The subscription is pre-populated with the description current at subscribe time. It never
/// observes intermediate states that were superseded before it read them, and it never misses
/// the terminal description published at disconnect.
#[derive(Debug)]
pub struct TopologySubscription {
    id: u64,
    receiver: watch::Receiver<Arc<TopologyDescription>>,
    pending: Option<Arc<TopologyDescription>>,
    topology: Weak<TopologyInner>,
}

impl TopologySubscription {
    /// Receives the next topology description, or `None` once the topology shuts down.
    pub async fn recv(&mut self) -> Option<Arc<TopologyDescription>> {
        if let Some(pending) = self.pending.take() {
            return Some(pending);
        }

        match self.receiver.changed().await {
            Ok(()) => Some(self.receiver.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Receives the next topology description, returning `None` if the timeout elapses first
    /// or the topology shuts down.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Arc<TopologyDescription>> {
        runtime::timeout(timeout, self.recv()).await.ok().flatten()
    }
}

impl Drop for TopologySubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.topology.upgrade() {
            let mut subscribers = acquire(&inner.subscribers);
            subscribers.senders.remove(&self.id);
        }
    }
}

/// Weak handle through which monitors and the SRV poller feed updates back into the topology.
/// Holding one never extends the topology's lifetime.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    inner: Weak<TopologyInner>,
}

impl TopologyUpdater {
    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    fn topology(&self) -> Option<Topology> {
        self.inner.upgrade().map(|inner| Topology { inner })
    }

    /// Applies a monitor-produced description, returning the canonical description stored by
    /// the topology, or `None` if the topology has shut down.
    pub(crate) fn apply_update(
        &self,
        description: ServerDescription,
    ) -> Option<ServerDescription> {
        self.topology()
            .and_then(|topology| topology.apply_update(description))
    }

    pub(crate) fn emit_sdam_event(&self, event: SdamEvent) {
        if let Some(topology) = self.topology() {
            // Monitors race with shutdown; no events escape once the topology is closing.
            if matches!(
                topology.state(),
                ConnectionState::Disconnecting | ConnectionState::Disconnected
            ) {
                return;
            }
            topology.emit_sdam_event(event);
        }
    }

    pub(crate) fn topology_type(&self) -> Option<TopologyType> {
        self.topology()
            .map(|topology| topology.description().topology_type())
    }

    /// Reconciles the topology's address set with the hosts returned from an SRV lookup.
    /// Returns `false` once the topology has shut down.
    pub(crate) fn process_srv_results(&self, hosts: Vec<ServerAddress>) -> bool {
        let topology = match self.topology() {
            Some(topology) => topology,
            None => return false,
        };

        let mut servers = acquire(&topology.inner.servers);
        if servers.closed {
            return false;
        }

        let previous = topology.description();
        let mut next = (*previous).clone();
        next.sync_hosts(hosts.into_iter().collect());
        topology.install_description(&mut servers, previous, next);
        true
    }
}
