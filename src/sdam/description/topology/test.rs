use std::{collections::HashSet, sync::Arc, time::Duration};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    cmap::{MonitorConnector, PoolFactory},
    options::{ClientOptions, ServerAddress},
    sdam::{ServerDescription, ServerType, TopologyDescription, TopologyType},
    test_util::{
        mongos_hello,
        primary_hello,
        secondary_hello,
        server_description,
        standalone_hello,
        MockConnector,
        MockPoolFactory,
    },
};

fn addr(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn options(hosts: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts.iter().map(|h| addr(h)).collect::<Vec<_>>())
        .pool_factory(Arc::new(MockPoolFactory::default()) as Arc<dyn PoolFactory>)
        .monitor_connector(Arc::new(MockConnector::empty()) as Arc<dyn MonitorConnector>)
        .build()
}

fn topology(hosts: &[&str]) -> TopologyDescription {
    let mut description = TopologyDescription::default();
    description.initialize(&options(hosts));
    description
}

#[test]
fn replica_set_discovery_from_primary() {
    let mut description = topology(&["a:27017"]);
    assert_eq!(description.topology_type(), TopologyType::Unknown);

    let hello = primary_hello("a:27017", &["a:27017", "b:27017", "c:27017"], "rs0");
    description
        .update(server_description("a:27017", &hello))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.set_name(), Some("rs0"));

    let addresses: Vec<_> = description.server_addresses().cloned().collect();
    assert_eq!(
        addresses,
        vec![addr("a:27017"), addr("b:27017"), addr("c:27017")]
    );

    assert_eq!(
        description
            .get_server_description(&addr("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::RsPrimary
    );
    for host in ["b:27017", "c:27017"] {
        assert_eq!(
            description
                .get_server_description(&addr(host))
                .unwrap()
                .server_type(),
            ServerType::Unknown
        );
    }
}

#[test]
fn primary_disappearance_demotes_topology() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description(
            "a:27017",
            &primary_hello("a:27017", &["a:27017", "b:27017"], "rs0"),
        ))
        .unwrap();
    description
        .update(server_description(
            "b:27017",
            &secondary_hello("b:27017", &["a:27017", "b:27017"], "rs0"),
        ))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);

    // The recorded primary reports a non-primary role.
    description
        .update(server_description(
            "a:27017",
            &secondary_hello("a:27017", &["a:27017", "b:27017"], "rs0"),
        ))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
}

fn primary_hello_with_election(
    address: &str,
    set_version: i32,
    election_id: ObjectId,
) -> Document {
    let mut hello = primary_hello(address, &["a:27017", "b:27017"], "rs0");
    hello.insert("setVersion", set_version);
    hello.insert("electionId", election_id);
    hello
}

fn election_id(byte: u8) -> ObjectId {
    ObjectId::from_bytes([byte; 12])
}

#[test]
fn stale_primary_rejected() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description(
            "a:27017",
            &primary_hello_with_election("a:27017", 2, election_id(100)),
        ))
        .unwrap();

    // An old primary waking up with an older (setVersion, electionId) pair is forced
    // Unknown rather than believed.
    description
        .update(server_description(
            "b:27017",
            &primary_hello_with_election("b:27017", 1, election_id(99)),
        ))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        description
            .get_server_description(&addr("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::RsPrimary
    );
    assert_eq!(
        description
            .get_server_description(&addr("b:27017"))
            .unwrap()
            .server_type(),
        ServerType::Unknown
    );
    assert_eq!(description.max_set_version, Some(2));
    assert_eq!(description.max_election_id, Some(election_id(100)));
}

#[test]
fn newer_primary_demotes_previous() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description(
            "a:27017",
            &primary_hello_with_election("a:27017", 2, election_id(100)),
        ))
        .unwrap();
    description
        .update(server_description(
            "b:27017",
            &primary_hello_with_election("b:27017", 2, election_id(101)),
        ))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        description
            .get_server_description(&addr("b:27017"))
            .unwrap()
            .server_type(),
        ServerType::RsPrimary
    );
    assert_eq!(
        description
            .get_server_description(&addr("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::Unknown
    );
    assert_eq!(description.max_election_id, Some(election_id(101)));
}

#[test]
fn standalone_with_single_seed_becomes_single() {
    let mut description = topology(&["a:27017"]);
    description
        .update(server_description("a:27017", &standalone_hello()))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Single);
}

#[test]
fn standalone_is_removed_from_multi_seed_topology() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description("a:27017", &standalone_hello()))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Unknown);
    assert!(description.get_server_description(&addr("a:27017")).is_none());
}

#[test]
fn mongos_transitions_to_sharded_and_evicts_non_mongos() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description("a:27017", &mongos_hello()))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);

    description
        .update(server_description(
            "b:27017",
            &secondary_hello("b:27017", &["b:27017"], "rs0"),
        ))
        .unwrap();
    assert!(description.get_server_description(&addr("b:27017")).is_none());
}

#[test]
fn set_name_mismatch_discards_member() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description(
            "a:27017",
            &secondary_hello("a:27017", &["a:27017", "b:27017"], "rs0"),
        ))
        .unwrap();
    assert_eq!(description.set_name(), Some("rs0"));

    description
        .update(server_description(
            "b:27017",
            &secondary_hello("b:27017", &["b:27017"], "other"),
        ))
        .unwrap();
    assert!(description.get_server_description(&addr("b:27017")).is_none());
}

#[test]
fn invalid_me_removes_member() {
    let mut description = topology(&["a:27017", "b:27017"]);
    let mut hello = secondary_hello("b:27017", &["a:27017", "b:27017"], "rs0");
    hello.insert("me", "elsewhere:27017");
    description
        .update(server_description("b:27017", &hello))
        .unwrap();
    assert!(description.get_server_description(&addr("b:27017")).is_none());
}

fn hello_with_topology_version(address: &str, process_id: ObjectId, counter: i64) -> Document {
    let mut hello = secondary_hello(address, &["a:27017"], "rs0");
    hello.insert(
        "topologyVersion",
        doc! { "processId": process_id, "counter": counter },
    );
    hello
}

#[test]
fn outdated_topology_version_is_rejected() {
    let process_id = ObjectId::new();
    let mut description = topology(&["a:27017"]);
    description
        .update(server_description(
            "a:27017",
            &hello_with_topology_version("a:27017", process_id, 5),
        ))
        .unwrap();
    assert_eq!(
        description
            .get_server_description(&addr("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::RsSecondary
    );

    // A lower counter from the same process is stale and ignored entirely.
    let mut stale = primary_hello("a:27017", &["a:27017"], "rs0");
    stale.insert(
        "topologyVersion",
        doc! { "processId": process_id, "counter": 4_i64 },
    );
    description
        .update(server_description("a:27017", &stale))
        .unwrap();
    assert_eq!(
        description
            .get_server_description(&addr("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::RsSecondary
    );

    // Equal or greater counters, and versions from other processes, are accepted.
    let mut newer = primary_hello("a:27017", &["a:27017"], "rs0");
    newer.insert(
        "topologyVersion",
        doc! { "processId": process_id, "counter": 5_i64 },
    );
    description
        .update(server_description("a:27017", &newer))
        .unwrap();
    assert_eq!(
        description
            .get_server_description(&addr("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::RsPrimary
    );
}

#[test]
fn last_write_date_is_monotone() {
    let mut description = topology(&["a:27017"]);

    let mut first = secondary_hello("a:27017", &["a:27017"], "rs0");
    first.insert("lastWrite", doc! { "lastWriteDate": DateTime::from_millis(100_000) });
    description
        .update(server_description("a:27017", &first))
        .unwrap();

    let mut older = secondary_hello("a:27017", &["a:27017"], "rs0");
    older.insert("lastWrite", doc! { "lastWriteDate": DateTime::from_millis(50_000) });
    description
        .update(server_description("a:27017", &older))
        .unwrap();

    let stored = description
        .get_server_description(&addr("a:27017"))
        .unwrap()
        .last_write_date()
        .unwrap();
    assert_eq!(stored, Some(DateTime::from_millis(100_000)));

    let mut newer = secondary_hello("a:27017", &["a:27017"], "rs0");
    newer.insert("lastWrite", doc! { "lastWriteDate": DateTime::from_millis(150_000) });
    description
        .update(server_description("a:27017", &newer))
        .unwrap();

    let stored = description
        .get_server_description(&addr("a:27017"))
        .unwrap()
        .last_write_date()
        .unwrap();
    assert_eq!(stored, Some(DateTime::from_millis(150_000)));
}

#[test]
fn session_timeout_is_minimum_of_data_bearing_members() {
    let mut description = topology(&["a:27017", "b:27017"]);

    let mut primary = primary_hello("a:27017", &["a:27017", "b:27017"], "rs0");
    primary.insert("logicalSessionTimeoutMinutes", 30);
    description
        .update(server_description("a:27017", &primary))
        .unwrap();
    assert_eq!(
        description.logical_session_timeout(),
        Some(Duration::from_secs(30 * 60))
    );

    let mut secondary = secondary_hello("b:27017", &["a:27017", "b:27017"], "rs0");
    secondary.insert("logicalSessionTimeoutMinutes", 17);
    description
        .update(server_description("b:27017", &secondary))
        .unwrap();
    assert_eq!(
        description.logical_session_timeout(),
        Some(Duration::from_secs(17 * 60))
    );

    // Any data-bearing member without a timeout disables sessions entirely.
    let mut without = secondary_hello("b:27017", &["a:27017", "b:27017"], "rs0");
    without.remove("logicalSessionTimeoutMinutes");
    description
        .update(server_description("b:27017", &without))
        .unwrap();
    assert_eq!(description.logical_session_timeout(), None);
}

#[test]
fn wire_version_mismatch_sets_compatibility_error() {
    let mut description = topology(&["a:27017"]);
    let mut hello = standalone_hello();
    hello.insert("minWireVersion", 2);
    hello.insert("maxWireVersion", 3);
    description
        .update(server_description("a:27017", &hello))
        .unwrap();
    assert!(description.compatibility_error().is_some());

    let stored = description.get_server_description(&addr("a:27017")).unwrap();
    assert_eq!(stored.min_wire_version().unwrap(), Some(2));
    assert_eq!(stored.max_wire_version().unwrap(), Some(3));

    // The condition clears once the server reports a compatible range.
    description
        .update(server_description("a:27017", &standalone_hello()))
        .unwrap();
    assert!(description.compatibility_error().is_none());
}

#[test]
fn diff_reports_added_and_removed_addresses() {
    let before = topology(&["a:27017", "b:27017"]);
    let mut after = before.clone();
    after
        .update(server_description(
            "a:27017",
            &primary_hello("a:27017", &["a:27017", "c:27017"], "rs0"),
        ))
        .unwrap();

    let diff = before.diff(&after).unwrap();
    assert_eq!(
        diff.added_addresses,
        [&addr("c:27017")].into_iter().collect::<HashSet<_>>()
    );
    assert_eq!(
        diff.removed_addresses,
        [&addr("b:27017")].into_iter().collect::<HashSet<_>>()
    );

    assert!(before.diff(&before.clone()).is_none());
}

#[test]
fn sync_hosts_caps_added_hosts_at_srv_max() {
    let mut opts = options(&["h1:27017", "h2:27017"]);
    opts.srv_max_hosts = Some(3);
    let mut description = TopologyDescription::default();
    description.initialize(&opts);

    let new_hosts: HashSet<_> = ["h1:27017", "h2:27017", "h3:27017", "h4:27017", "h5:27017"]
        .iter()
        .map(|h| addr(h))
        .collect();
    description.sync_hosts(new_hosts);

    let addresses: HashSet<_> = description.server_addresses().cloned().collect();
    assert_eq!(addresses.len(), 3);
    assert!(addresses.contains(&addr("h1:27017")));
    assert!(addresses.contains(&addr("h2:27017")));
}

#[test]
fn apply_is_a_pure_function_of_its_inputs() {
    let description = topology(&["a:27017"]);
    let incoming = server_description(
        "a:27017",
        &primary_hello("a:27017", &["a:27017", "b:27017"], "rs0"),
    );

    let (first, first_canonical) = description.apply(incoming.clone()).unwrap();
    let (second, second_canonical) = description.apply(incoming).unwrap();

    assert_eq!(first, second);
    assert_eq!(first_canonical, second_canonical);
    // The input topology is untouched.
    assert_eq!(description.topology_type(), TopologyType::Unknown);
}

#[test]
fn configured_set_name_starts_no_primary_and_rejects_imposters() {
    let mut opts = options(&["a:27017"]);
    opts.repl_set_name = Some("rs0".to_string());
    let mut description = TopologyDescription::default();
    description.initialize(&opts);
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);

    description
        .update(server_description(
            "a:27017",
            &secondary_hello("a:27017", &["a:27017"], "other"),
        ))
        .unwrap();
    assert!(description.get_server_description(&addr("a:27017")).is_none());
}

#[test]
fn load_balanced_topology_keeps_single_synthetic_server() {
    let mut opts = options(&["lb:27017"]);
    opts.load_balanced = Some(true);
    let mut description = TopologyDescription::default();
    description.initialize(&opts);
    assert_eq!(description.topology_type(), TopologyType::LoadBalanced);

    let mut synthetic = ServerDescription::new(&addr("lb:27017"));
    synthetic.server_type = ServerType::LoadBalancer;
    description.update(synthetic).unwrap();

    assert_eq!(description.servers.len(), 1);
    assert_eq!(
        description
            .get_server_description(&addr("lb:27017"))
            .unwrap()
            .server_type(),
        ServerType::LoadBalancer
    );
}
