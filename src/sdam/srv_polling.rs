use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::Result,
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandleListener},
    sdam::{TopologyType, TopologyUpdater, DEFAULT_HEARTBEAT_FREQUENCY},
};

const DEFAULT_RESCAN_SRV_INTERVAL: Duration = Duration::from_secs(60);

/// The hosts produced by one SRV resolution, along with the smallest record TTL, which
/// overrides the polling cadence when present.
#[derive(Debug, Clone)]
pub struct LookupHosts {
    /// The resolved hosts.
    pub hosts: Vec<ServerAddress>,

    /// The minimum TTL across the returned records.
    pub min_ttl: Option<Duration>,
}

/// Resolves the SRV record behind a seed hostname. The DNS implementation is supplied by an
/// external collaborator.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Resolves the current hosts behind `hostname` for the given SRV service name.
    async fn get_srv_hosts(&self, hostname: &str, service_name: &str) -> Result<LookupHosts>;
}

/// Periodically re-resolves the SRV record that seeded the topology to pick up changes in the
/// deployment's host set.
pub(crate) struct SrvPollingMonitor {
    initial_hostname: String,
    service_name: String,
    resolver: std::sync::Arc<dyn SrvResolver>,
    topology: TopologyUpdater,
    rescan_interval: Option<Duration>,
    client_options: ClientOptions,
    handle_listener: WorkerHandleListener,
}

impl SrvPollingMonitor {
    pub(crate) fn new(
        topology: TopologyUpdater,
        client_options: ClientOptions,
        handle_listener: WorkerHandleListener,
    ) -> Option<Self> {
        let initial_hostname = client_options.original_srv_hostname.clone()?;
        let resolver = client_options.srv_resolver.clone()?;

        Some(Self {
            initial_hostname,
            service_name: client_options
                .srv_service_name
                .clone()
                .unwrap_or_else(|| "docdb".to_string()),
            resolver,
            topology,
            rescan_interval: None,
            client_options,
            handle_listener,
        })
    }

    /// Starts a monitoring task that periodically performs SRV record lookups to determine if
    /// the set of hosts in the cluster has changed.
    pub(crate) fn start(
        topology: TopologyUpdater,
        client_options: ClientOptions,
        handle_listener: WorkerHandleListener,
    ) {
        if let Some(monitor) = Self::new(topology, client_options, handle_listener) {
            runtime::spawn(monitor.execute());
        }
    }

    fn rescan_interval(&self) -> Duration {
        self.rescan_interval
            .or(self.client_options.rescan_srv_interval)
            .unwrap_or(DEFAULT_RESCAN_SRV_INTERVAL)
    }

    fn heartbeat_freq(&self) -> Duration {
        self.client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    async fn execute(mut self) {
        while self.handle_listener.is_alive() && self.topology.is_alive() {
            tokio::select! {
                _ = runtime::delay_for(self.rescan_interval()) => {}
                _ = self.handle_listener.wait_for_all_handle_drops() => { break }
            }

            // Polling only applies while the deployment could still be a sharded cluster;
            // once a replica set or single server is confirmed, the host set is governed by
            // the servers themselves.
            match self.topology.topology_type() {
                Some(TopologyType::Unknown) | Some(TopologyType::Sharded) => {}
                Some(_) => break,
                None => break,
            }

            let lookup = self
                .resolver
                .get_srv_hosts(&self.initial_hostname, &self.service_name)
                .await;

            match lookup {
                Ok(LookupHosts { hosts, .. }) if hosts.is_empty() => {
                    self.no_valid_hosts(None);
                }
                Ok(lookup) => {
                    self.rescan_interval = lookup.min_ttl;
                    if !self.topology.process_srv_results(lookup.hosts) {
                        break;
                    }
                }
                Err(error) => {
                    self.no_valid_hosts(Some(error));
                }
            }
        }
    }

    fn no_valid_hosts(&mut self, error: Option<crate::error::Error>) {
        if let Some(error) = error {
            tracing::warn!(
                hostname = %self.initial_hostname,
                error = %error,
                "SRV lookup failed; rescanning at heartbeat frequency"
            );
        } else {
            tracing::warn!(
                hostname = %self.initial_hostname,
                "SRV lookup returned no hosts; rescanning at heartbeat frequency"
            );
        }

        // Fall back to the shorter cadence until the record resolves again.
        self.rescan_interval = Some(self.heartbeat_freq());
    }
}
