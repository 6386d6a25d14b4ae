//! Verification of commands defined in files

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vigil_commanding::{
    AckStatus, CommandId, CommandVerificationHandler, InMemoryCommandHistory,
    InMemoryMissionDatabase, InMemoryTelemetryFeed, ManualScheduler, MissionDatabase,
    PreparedCommandBuilder, Scheduler, SubscriptionFailurePolicy, VerificationConfig,
    VerificationServices,
};
use vigil_core::ConfigLoader;

const MISSION: &str = r#"
[[parameters]]
qualified_name = "/gs/history/Acknowledge_Sent_Status"

[[parameters]]
qualified_name = "/sc/heater_current"

[[meta_commands]]
name = "/sc/SWITCH_HEATER"
base = "/sc/BASE"

[[meta_commands.verifiers]]
stage = "Execution"
on_fail = "FAIL"
check_window = { time_to_stop_ms = 2000, relative_to = "last_verifier" }
kind = { type = "parameter_value_change", parameter = "/sc/heater_current", delta = 1.5 }

[[meta_commands]]
name = "/sc/BASE"

[[meta_commands.verifiers]]
stage = "Sent"
on_fail = "FAIL"
check_window = { time_to_stop_ms = 1000 }
kind = { type = "match_criteria", criteria = { comparison = { parameter = "/gs/history/Acknowledge_Sent_Status", operator = "==", value = "OK" } } }

[[meta_commands.verifiers]]
stage = "Complete"
on_success = "SUCCESS"
on_timeout = "FAIL"
check_window = { time_to_start_ms = 100, time_to_stop_ms = 5000, relative_to = "last_verifier" }
kind = { type = "container", container = "/sc/hk" }
"#;

const SETTINGS: &str = r#"
[logging]
filter = "debug"

[verification]
cmdhist_namespace = "/gs/history"
subscription_failure = "abort"
"#;

struct Setup {
    _dir: TempDir,
    mdb: Arc<InMemoryMissionDatabase>,
    config: VerificationConfig,
}

fn setup() -> Setup {
    vigil_core::init_test_tracing("vigil_commanding=debug");
    let dir = tempfile::tempdir().unwrap();
    let mission = dir.path().join("mission.toml");
    let settings = dir.path().join("vigil.toml");
    std::fs::write(&mission, MISSION).unwrap();
    std::fs::write(&settings, SETTINGS).unwrap();

    let mdb = Arc::new(InMemoryMissionDatabase::load_file(&mission).unwrap());
    let loader = ConfigLoader::new().with_file(&settings).unwrap();
    let config = VerificationConfig::load(&loader).unwrap();
    Setup {
        _dir: dir,
        mdb,
        config,
    }
}

#[test]
fn test_settings_file_applies() {
    let setup = setup();
    assert_eq!(setup.config.cmdhist_namespace, "/gs/history");
    assert_eq!(setup.config.cmd_namespace, "/sys/cmd");
    assert_eq!(setup.config.subscription_failure, SubscriptionFailurePolicy::Abort);
    assert!(setup.mdb.meta_command("/sc/SWITCH_HEATER").is_some());
}

#[test]
fn test_command_from_file_verifies_through_chain() {
    let setup = setup();
    let clock = Arc::new(ManualScheduler::new());
    let history = Arc::new(InMemoryCommandHistory::new());
    let telemetry = Arc::new(InMemoryTelemetryFeed::new());
    let services = VerificationServices::builder()
        .scheduler(clock.clone())
        .mission_database(setup.mdb.clone())
        .command_history(history.clone())
        .telemetry(telemetry.clone())
        .config(setup.config.clone())
        .build()
        .unwrap();

    let meta = setup.mdb.meta_command("/sc/SWITCH_HEATER").unwrap();
    let id = CommandId::new("/sc/SWITCH_HEATER", "console", 7, clock.now());
    history.add_command(&id);
    let handler = CommandVerificationHandler::new(
        Arc::new(PreparedCommandBuilder::new(id.clone(), meta).build()),
        services,
    );
    handler.start().unwrap();

    let stages: Vec<_> = handler.verifiers().iter().map(|v| v.stage().to_string()).collect();
    assert_eq!(stages, vec!["Execution", "Sent", "Complete"]);
    // the first verifier is anchored to release since nothing precedes it
    assert_eq!(history.ack_statuses(&id, "Verifier_Execution"), vec![AckStatus::Pending]);
    assert_eq!(history.ack_statuses(&id, "Verifier_Sent"), vec![AckStatus::Pending]);

    let current = |value: f64| {
        let parameter = setup.mdb.parameter("/sc/heater_current").unwrap();
        telemetry.publish_parameters(&[vigil_commanding::ParameterValue::new(
            parameter,
            value.into(),
            clock.now(),
        )]);
    };
    current(0.2);
    clock.advance(Duration::from_millis(50));
    current(1.9);
    assert_eq!(
        history.ack_statuses(&id, "Verifier_Execution"),
        vec![AckStatus::Pending, AckStatus::Ok]
    );

    clock.advance(Duration::from_millis(50));
    history.publish_attribute(&id, "Acknowledge_Sent_Status", "OK".into(), clock.now());
    assert_eq!(
        history.ack_statuses(&id, "Verifier_Sent"),
        vec![AckStatus::Pending, AckStatus::Ok]
    );
    assert_eq!(
        history.ack_statuses(&id, "Verifier_Complete"),
        vec![AckStatus::Scheduled]
    );

    clock.advance(Duration::from_millis(100));
    telemetry.publish_container("/sc/hk", clock.now());
    assert_eq!(
        history.ack_statuses(&id, "Verifier_Complete"),
        vec![AckStatus::Scheduled, AckStatus::Pending, AckStatus::Ok]
    );
    assert_eq!(history.completion(&id).unwrap().status, AckStatus::Ok);
    assert!(!handler.is_subscribed());
}
