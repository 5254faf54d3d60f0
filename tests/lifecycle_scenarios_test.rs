/*!
 * Lifecycle scenarios against a scripted broker and instance
 *
 * Covers:
 * - Creation ordering (create before any instance login)
 * - Reuse of a running instance without creation
 * - Involuntary disconnect detection and cache invalidation
 * - Data requests served through the store after login
 */

use skyrun::{
    testing::{Call, ScriptedConnector},
    wire::{encode_series_batch, encode_structure, Series, SeriesBatch, StructureEntry},
    EventSink, LifecycleManager, LifecycleState, ParameterStore, RemoteError, RemoteStore,
    SkyrunConfig, StatusEvent,
};
use tempfile::TempDir;

const BROKER: &str = "broker.example.org";
const INTERNAL_IP: &str = "10.0.4.17";
const EXTERNAL_IP: &str = "185.19.28.77";

const EMPTY_LISTING: &str = "\
┌──────┬────────────┬───────┐
│ NAME │ IP ADDRESS │ STATE │
└──────┴────────────┴───────┘
";

fn config(keys: &TempDir) -> SkyrunConfig {
    let mut config = SkyrunConfig::from_toml_str(
        r#"
[broker]
host = "broker.example.org"
username = "ops"

[instance]
login_pause_secs = 0

[helper]
program = "/opt/helper"
database = "/data/model.db"
temp_dir = "/tmp"
"#,
    )
    .unwrap();
    config.instance.key_dir = keys.path().to_path_buf();
    config
}

fn manager(connector: &ScriptedConnector, keys: &TempDir) -> LifecycleManager<ScriptedConnector> {
    LifecycleManager::new(connector.clone(), config(keys), EventSink::log_only())
}

fn broker() -> ScriptedConnector {
    let connector = ScriptedConnector::new();
    connector.add_file(BROKER, "keys/alice", b"-----BEGIN KEY-----");
    connector.add_file(BROKER, "keys/alice.pub", b"ssh-ed25519 AAAA alice");
    connector
}

fn listing_with_alice(state: &str) -> String {
    format!(
        "│ NAME  │ IP ADDRESS    │ STATE   │\n│ alice │ {} │ {} │\n",
        EXTERNAL_IP, state
    )
}

fn creation_output() -> String {
    format!(
        "┌───────┬──────────────┬───────────────┐\n\
         │ alice │ {}    │ {}  │\n\
         └───────┴──────────────┴───────────────┘\n",
        INTERNAL_IP, EXTERNAL_IP
    )
}

#[test]
fn test_absent_instance_is_created_before_login() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", EMPTY_LISTING);
    connector.respond(BROKER, "provision create", &creation_output());

    let mut manager = manager(&connector, &keys);
    let instance = manager.ensure_instance("alice").unwrap();

    assert_eq!(instance.ip.unwrap().to_string(), EXTERNAL_IP);
    assert_eq!(manager.state(), LifecycleState::InstanceAuthenticated);

    let script = connector.script();
    let created = script
        .position(|c| {
            matches!(c, Call::Execute { command, .. } if command == "provision create alice")
        })
        .expect("create command issued");
    let first_login = script
        .position(|c| matches!(c, Call::Open { host } if host == EXTERNAL_IP))
        .expect("instance login attempted");
    assert!(created < first_login);
    assert_eq!(script.opens_of(INTERNAL_IP), 0);
}

#[test]
fn test_running_instance_is_not_recreated() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", &listing_with_alice("running"));

    let mut manager = manager(&connector, &keys);
    manager.ensure_instance("alice").unwrap();

    let commands = connector.script().commands_on(BROKER);
    assert_eq!(commands, vec!["provision list".to_string()]);
}

#[test]
fn test_creation_output_with_one_address_is_protocol_error() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", EMPTY_LISTING);
    connector.respond(BROKER, "provision create", "alice 10.0.4.17 pending\n");

    let mut manager = manager(&connector, &keys);
    let err = manager.ensure_instance("alice").unwrap_err();

    assert!(matches!(err, RemoteError::Protocol(_)));
    assert_eq!(manager.state(), LifecycleState::HubAuthenticated);
    assert_eq!(connector.script().opens_of(INTERNAL_IP), 0);
}

#[test]
fn test_lost_instance_is_involuntary_disconnect() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", &listing_with_alice("running"));

    let (events, rx) = EventSink::channel();
    let mut manager = LifecycleManager::new(connector.clone(), config(&keys), events);
    manager.ensure_instance("alice").unwrap();
    rx.try_iter().for_each(drop);

    connector.script().set_live(EXTERNAL_IP, false);
    let err = manager.check_liveness().unwrap_err();

    assert!(err.is_disconnect());
    assert_eq!(manager.state(), LifecycleState::NoSession);
    assert!(!manager.instance().unwrap().authenticated);

    let received: Vec<StatusEvent> = rx.try_iter().collect();
    assert_eq!(
        received,
        vec![
            StatusEvent::Disconnected {
                host: EXTERNAL_IP.to_string()
            },
            StatusEvent::InvalidateStructure,
        ]
    );
}

#[test]
fn test_store_requests_after_disconnect_fail() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", &listing_with_alice("running"));

    let manager = manager(&connector, &keys);
    let mut store = RemoteStore::new(manager);
    store.ensure("alice").unwrap();

    connector.script().set_live(EXTERNAL_IP, false);
    let err = store.export_structure("results").unwrap_err();
    assert!(matches!(err, RemoteError::InvoluntaryDisconnect { .. }));

    let err = store.export_structure("results").unwrap_err();
    assert!(matches!(err, RemoteError::InvalidState(_)));
    assert!(connector.script().commands_on(EXTERNAL_IP).is_empty());
}

#[test]
fn test_store_exports_through_instance() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", &listing_with_alice("running"));

    let entries = vec![
        StructureEntry::new(0, 10, "Catchment", ""),
        StructureEntry::new(10, 11, "Discharge", "m3/s"),
    ];
    let batch = SeriesBatch::new(
        1_104_537_600,
        vec![
            Series::new(vec![1.5, f64::NAN, 2.5]),
            Series::new(vec![]),
        ],
    );

    let script = connector.script();
    script.respond(EXTERNAL_IP, "export_structure", "SUCCESS: 2 entries\n");
    script.file_from_command(EXTERNAL_IP, "export_structure", encode_structure(&entries));
    script.respond(EXTERNAL_IP, "export_values", "reading\nSUCCESS: 2 series\n");
    script.file_from_command(EXTERNAL_IP, "export_values", encode_series_batch(&batch));

    let manager = manager(&connector, &keys);
    let mut store = RemoteStore::new(manager);
    store.ensure("alice").unwrap();

    assert_eq!(store.export_structure("results").unwrap(), entries);

    let values = store.export_values("results", &[11, 12]).unwrap();
    assert!(values.same_samples(&batch));
    assert_eq!(values.series[0].missing_count(), 1);

    let commands = script.commands_on(EXTERNAL_IP);
    assert!(commands.iter().any(|c| {
        c.contains("export_values /data/model.db /tmp/skyrun_") && c.ends_with(" results 11 12")
    }));
    assert!(script.files_on(EXTERNAL_IP).is_empty());
}

#[test]
fn test_destroy_then_reconcile_clears_queue_once_gone() {
    let keys = TempDir::new().unwrap();
    let connector = broker();
    connector.respond(BROKER, "provision list", &listing_with_alice("running"));

    let mut manager = manager(&connector, &keys);
    manager.ensure_instance("alice").unwrap();
    manager.destroy_instance().unwrap();
    assert_eq!(manager.state(), LifecycleState::TornDown);

    assert_eq!(manager.reconcile().unwrap(), vec!["alice".to_string()]);

    connector.respond(BROKER, "provision list", EMPTY_LISTING);
    assert!(manager.reconcile().unwrap().is_empty());
    assert_eq!(manager.pending_destroy().count(), 0);
}
