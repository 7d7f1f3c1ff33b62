use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use super::{choose_n, TopologyDescription, TopologyType};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// A live server handle returned from server selection. Holds the server's connection pool
/// open for the duration of the operation using it.
#[derive(Debug, Clone)]
pub struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    pub(crate) fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// The address of the selected server.
    pub fn address(&self) -> &ServerAddress {
        &self.server.address
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

/// Attempt to select a server according to the given criteria, returning `None` if no server
/// in the current description matched and was mapped to a live handle.
pub(crate) fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    topology_description: &TopologyDescription,
    servers: &HashMap<ServerAddress, Arc<Server>>,
) -> Result<Option<SelectedServer>> {
    if let Some(message) = topology_description.compatibility_error() {
        return Err(ErrorKind::ServerSelection {
            message: message.to_string(),
        }
        .into());
    }

    if topology_description.is_replica_set() {
        if let Some(max_staleness) = criteria.as_read_pref().and_then(|rp| rp.max_staleness()) {
            verify_max_staleness(max_staleness, topology_description.heartbeat_frequency())?;
        }
    }

    let mut suitable_servers = topology_description.suitable_servers(criteria);
    topology_description.retain_servers_within_latency_window(&mut suitable_servers);

    // The selected server must still be mapped to a live handle: an address that was just
    // removed from the topology yields another pass rather than an error.
    let in_window: Vec<_> = suitable_servers
        .into_iter()
        .filter_map(|description| servers.get(&description.address))
        .collect();

    let selected = choose_n(&in_window, 1).next().map(|s| (**s).clone());
    Ok(selected.map(SelectedServer::new))
}

impl TopologyDescription {
    pub(crate) fn is_replica_set(&self) -> bool {
        matches!(
            self.topology_type,
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary
        )
    }

    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {criteria:?}. Topology: {self}"
            )
        } else {
            format!("Server selection timeout: No available servers. Topology: {self}")
        }
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    /// The servers eligible under the given criteria, before the latency window is applied.
    ///
    /// In a load-balanced topology the single load balancer is always selectable and the
    /// criteria are advisory.
    pub(crate) fn suitable_servers(
        &self,
        selection_criteria: &SelectionCriteria,
    ) -> Vec<&ServerDescription> {
        if self.topology_type == TopologyType::LoadBalanced {
            return self.servers.values().collect();
        }

        let available = self.servers.values().filter(|sd| sd.is_available());

        match selection_criteria {
            SelectionCriteria::ReadPreference(read_preference) => match self.topology_type {
                TopologyType::Unknown => Vec::new(),
                TopologyType::Single | TopologyType::LoadBalanced => available.collect(),
                TopologyType::Sharded => available
                    .filter(|sd| sd.server_type == ServerType::Mongos)
                    .collect(),
                TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                    self.filter_servers_in_replica_set(available, read_preference)
                }
            },
            SelectionCriteria::Predicate(ref predicate) => available
                .filter(|s| {
                    // With a direct connection the single server is selectable whether or not
                    // it is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && predicate(s)
                })
                .collect(),
        }
    }

    fn filter_servers_in_replica_set<'a>(
        &self,
        servers: impl Iterator<Item = &'a ServerDescription> + Clone,
        read_preference: &ReadPreference,
    ) -> Vec<&'a ServerDescription> {
        match read_preference {
            ReadPreference::Primary => servers
                .filter(|sd| sd.server_type == ServerType::RsPrimary)
                .collect(),
            ReadPreference::Secondary { .. } => self.filter_servers_with_read_preference(
                servers,
                &[ServerType::RsSecondary],
                read_preference,
            ),
            ReadPreference::PrimaryPreferred { .. } => {
                let primary = servers
                    .clone()
                    .filter(|sd| sd.server_type == ServerType::RsPrimary)
                    .collect::<Vec<_>>();
                if !primary.is_empty() {
                    primary
                } else {
                    self.filter_servers_with_read_preference(
                        servers,
                        &[ServerType::RsSecondary],
                        read_preference,
                    )
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let primary = servers
                    .clone()
                    .filter(|sd| sd.server_type == ServerType::RsPrimary);
                let secondaries = self.filter_servers_with_read_preference(
                    servers,
                    &[ServerType::RsSecondary],
                    read_preference,
                );
                if !secondaries.is_empty() {
                    secondaries
                } else {
                    primary.collect()
                }
            }
            ReadPreference::Nearest { .. } => self.filter_servers_with_read_preference(
                servers,
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                read_preference,
            ),
        }
    }

    /// Retains only the servers whose average round trip time falls within the latency
    /// window: `[min_rtt, min_rtt + local_threshold]` over the candidates' average RTTs.
    pub(crate) fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .fold(Option::<Duration>::None, |min, curr| match min {
                Some(prev) => Some(prev.min(curr)),
                None => Some(curr),
            });

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window =
            shortest_average_rtt.map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // Load balancers are not monitored and have no RTT; they are always within
                // the window.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|sd| sd.server_type == ServerType::RsPrimary)
    }

    fn filter_servers_with_read_preference<'a>(
        &self,
        servers: impl Iterator<Item = &'a ServerDescription>,
        types: &[ServerType],
        read_preference: &ReadPreference,
    ) -> Vec<&'a ServerDescription> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let mut servers = servers
            .filter(|sd| types.contains(&sd.server_type))
            .collect();

        if let Some(max_staleness) = max_staleness {
            // A max staleness <= 0 is the same as no max staleness.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        servers
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        match self.primary() {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        servers.retain(|server| {
            let server_staleness = self.calculate_secondary_staleness_with_primary(server, primary);

            server_staleness
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);
        let max_write_date = self
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsSecondary)
            .filter_map(|server| server.last_write_date().ok().flatten())
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let secondary_max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            let server_staleness = self
                .calculate_secondary_staleness_without_primary(server, secondary_max_write_date);

            server_staleness
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date().ok()??.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();

        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = (secondary_last_update - secondary_last_write)
            - (primary_last_update - primary_last_write)
            + heartbeat_frequency;

        Some(staleness)
    }

    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();
        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = max_last_write_date - secondary_last_write + heartbeat_frequency;
        Some(staleness)
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {set_name}")?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {max_set_version}")?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {max_election_id}")?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {compatibility_error}")?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{}", server_summary(server))?;
            }
            for server in iter {
                write!(f, ", {}", server_summary(server))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

fn server_summary(server: &ServerDescription) -> String {
    match server.error() {
        Some(error) => format!(
            "{{ Address: {}, Type: {:?}, Error: {} }}",
            server.address, server.server_type, error
        ),
        None => format!(
            "{{ Address: {}, Type: {:?} }}",
            server.address, server.server_type
        ),
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}

pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        selection_criteria::ReadPreferenceOptions,
        test_util::{
            primary_hello,
            secondary_hello,
            server_description_with_rtt,
            standalone_hello,
        },
        TopologyDescription,
    };

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn rs_topology(
        members: &[(&str, bool, Duration)],
        local_threshold: Option<Duration>,
    ) -> TopologyDescription {
        let hosts: Vec<&str> = members.iter().map(|(host, _, _)| *host).collect();
        let mut description = TopologyDescription {
            topology_type: TopologyType::ReplicaSetWithPrimary,
            set_name: Some("rs0".to_string()),
            local_threshold,
            ..Default::default()
        };
        for (host, is_primary, rtt) in members {
            let hello = if *is_primary {
                primary_hello(host, &hosts, "rs0")
            } else {
                secondary_hello(host, &hosts, "rs0")
            };
            description
                .servers
                .insert(addr(host), server_description_with_rtt(host, &hello, *rtt));
        }
        description
    }

    fn suitable_addresses(
        description: &TopologyDescription,
        criteria: &SelectionCriteria,
    ) -> Vec<ServerAddress> {
        let mut suitable = description.suitable_servers(criteria);
        description.retain_servers_within_latency_window(&mut suitable);
        suitable.into_iter().map(|sd| sd.address().clone()).collect()
    }

    #[test]
    fn latency_window_retains_only_servers_near_the_minimum() {
        let description = rs_topology(
            &[
                ("a:27017", false, Duration::from_millis(10)),
                ("b:27017", false, Duration::from_millis(14)),
                ("c:27017", false, Duration::from_millis(20)),
                ("d:27017", false, Duration::from_millis(45)),
            ],
            Some(Duration::from_millis(15)),
        );
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: None,
        });

        let selected = suitable_addresses(&description, &criteria);

        assert_eq!(
            selected,
            vec![addr("a:27017"), addr("b:27017"), addr("c:27017")]
        );

        // Window property: every retained server is within min_rtt + local_threshold.
        let min_rtt = Duration::from_millis(10);
        for address in &selected {
            let rtt = description
                .get_server_description(address)
                .unwrap()
                .average_round_trip_time()
                .unwrap();
            assert!(rtt <= min_rtt + Duration::from_millis(15));
        }
    }

    #[test]
    fn unknown_servers_are_never_candidates() {
        let mut description = rs_topology(
            &[("a:27017", true, Duration::from_millis(10))],
            None,
        );
        description
            .servers
            .insert(addr("b:27017"), crate::sdam::ServerDescription::new(&addr("b:27017")));

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: None,
        });
        let selected = suitable_addresses(&description, &criteria);
        assert_eq!(selected, vec![addr("a:27017")]);
    }

    #[test]
    fn read_preference_primary_and_secondary() {
        let description = rs_topology(
            &[
                ("a:27017", true, Duration::from_millis(10)),
                ("b:27017", false, Duration::from_millis(10)),
            ],
            None,
        );

        let primary = suitable_addresses(
            &description,
            &SelectionCriteria::ReadPreference(ReadPreference::Primary),
        );
        assert_eq!(primary, vec![addr("a:27017")]);

        let secondary = suitable_addresses(
            &description,
            &SelectionCriteria::ReadPreference(ReadPreference::Secondary { options: None }),
        );
        assert_eq!(secondary, vec![addr("b:27017")]);
    }

    #[test]
    fn primary_preferred_falls_back_to_secondaries() {
        let description = rs_topology(
            &[("b:27017", false, Duration::from_millis(10))],
            None,
        );
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: None,
        });
        assert_eq!(suitable_addresses(&description, &criteria), vec![addr("b:27017")]);
    }

    #[test]
    fn tag_sets_filter_candidates() {
        let hosts = ["a:27017", "b:27017"];
        let mut description = TopologyDescription {
            topology_type: TopologyType::ReplicaSetNoPrimary,
            set_name: Some("rs0".to_string()),
            ..Default::default()
        };
        for (host, dc) in [("a:27017", "east"), ("b:27017", "west")] {
            let mut hello = secondary_hello(host, &hosts, "rs0");
            hello.insert("tags", crate::bson::doc! { "dc": dc });
            description.servers.insert(
                addr(host),
                server_description_with_rtt(host, &hello, Duration::from_millis(5)),
            );
        }

        let tag_set: crate::selection_criteria::TagSet =
            [("dc".to_string(), "west".to_string())].into_iter().collect();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .tag_sets(Some(vec![tag_set]))
                    .build(),
            ),
        });

        assert_eq!(suitable_addresses(&description, &criteria), vec![addr("b:27017")]);
    }

    #[test]
    fn predicate_criteria_filters_servers() {
        let description = rs_topology(
            &[
                ("a:27017", true, Duration::from_millis(10)),
                ("b:27017", false, Duration::from_millis(10)),
            ],
            None,
        );
        let target = addr("b:27017");
        let criteria = SelectionCriteria::Predicate(std::sync::Arc::new(move |sd| {
            sd.address() == &target
        }));
        assert_eq!(suitable_addresses(&description, &criteria), vec![addr("b:27017")]);
    }

    #[test]
    fn compatibility_error_fails_selection_immediately() {
        let mut description = rs_topology(
            &[("a:27017", true, Duration::from_millis(10))],
            None,
        );
        description.compatibility_error = Some("wire version mismatch".to_string());

        let result = attempt_to_select_server(
            &SelectionCriteria::ReadPreference(ReadPreference::Primary),
            &description,
            &HashMap::new(),
        );
        assert!(matches!(
            *result.unwrap_err().kind,
            crate::error::ErrorKind::ServerSelection { .. }
        ));
    }

    #[test]
    fn selection_is_uniformly_random_among_the_window() {
        let mut description = TopologyDescription {
            topology_type: TopologyType::Single,
            single_seed: true,
            ..Default::default()
        };
        description.servers.insert(
            addr("a:27017"),
            server_description_with_rtt("a:27017", &standalone_hello(), Duration::from_millis(5)),
        );

        let servers: HashMap<_, _> = [(
            addr("a:27017"),
            crate::sdam::Server::new(
                addr("a:27017"),
                &crate::test_util::MockPoolFactory::default(),
            ),
        )]
        .into_iter()
        .collect();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let selected = attempt_to_select_server(&criteria, &description, &servers)
            .unwrap()
            .unwrap();
        assert_eq!(selected.address(), &addr("a:27017"));
    }
}

