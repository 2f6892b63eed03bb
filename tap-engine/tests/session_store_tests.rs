//! Session snapshot, capture and configuration tests

mod helpers;

use helpers::*;
use serial_test::serial;
use std::io::Write;
use tap_common::config::{TomlConfig, CONFIG_ENV_VAR};
use tap_engine::ports::PhaseStore;
use tap_engine::store::{JsonFileStore, MemoryStore, SessionSnapshot};
use tap_engine::timeline::Phase;
use tap_engine::{EngineSettings, Error};
use tempfile::{NamedTempFile, TempDir};

fn two_layers() -> EngineSettings {
    settings(
        vec![layer("drone", Some("hum"), 0.4), layer("nature", None, 0.0)],
        1_200_000,
        4_000,
    )
}

#[tokio::test(start_paused = true)]
async fn test_capture_records_committed_state() {
    let h = harness(two_layers());
    h.engine
        .update_phases(vec![Phase::entry("p0", "Arrive"), Phase::new("p1", "Rest", 40.0)])
        .await
        .unwrap();

    h.engine.set_layer_volume("nature", 0.7).unwrap();
    let captured = h.engine.capture_phase_state("p1").await.unwrap();

    assert_eq!(captured.volumes["drone"], 0.4);
    assert_eq!(captured.volumes["nature"], 0.7);
    assert_eq!(captured.active_track["drone"], "hum");
    assert!(!captured.active_track.contains_key("nature"));

    let phases = h.engine.phases().await;
    assert_eq!(phases[1].captured_state.as_ref(), Some(&captured));

    h.engine.clear_captured_state("p1").await.unwrap();
    assert!(h.engine.phases().await[1].is_label_only());
}

#[tokio::test(start_paused = true)]
async fn test_capture_unknown_phase() {
    let h = harness(two_layers());
    h.engine
        .update_phases(vec![Phase::entry("p0", "Arrive")])
        .await
        .unwrap();
    let result = h.engine.capture_phase_state("ghost").await;
    assert!(matches!(result, Err(Error::UnknownPhase(_))));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_phase_list_keeps_previous() {
    let h = harness(two_layers());
    h.engine
        .update_phases(vec![Phase::entry("p0", "Arrive"), Phase::new("p1", "Rest", 40.0)])
        .await
        .unwrap();

    let duplicate = vec![Phase::entry("p0", "Arrive"), Phase::new("p0", "Again", 60.0)];
    let result = h.engine.update_phases(duplicate).await;
    assert!(matches!(result, Err(Error::InvalidPhaseData(_))));
    assert_eq!(h.engine.phases().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_includes_state_providers() {
    let h = harness(two_layers());
    h.engine
        .update_phases(vec![Phase::entry("p0", "Arrive")])
        .await
        .unwrap();
    h.engine.set_transition_duration(6_000);
    h.engine
        .register_state_provider("editor", || serde_json::json!({"zoom": 3}));

    let snapshot = h.engine.snapshot().await;
    assert_eq!(snapshot.transition_duration_ms, 6_000);
    assert_eq!(snapshot.session_duration_ms, 1_200_000);
    assert_eq!(snapshot.extras["editor"]["zoom"], 3);
    assert_eq!(snapshot.layers[0].track.as_deref(), Some("hum"));

    assert!(h.engine.unregister_state_provider("editor"));
    assert!(h.engine.snapshot().await.extras.is_empty());
}

#[tokio::test]
async fn test_save_and_load_through_file_store() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::new(dir.path().join("sessions/evening.json"));

    let source = harness_on_real_time(two_layers());
    source
        .update_phases(vec![
            Phase::entry("p0", "Arrive"),
            Phase::new("p1", "Drift", 30.0)
                .with_color("#4a90d9")
                .with_state(state(&[("drone", 0.2)], &[])),
        ])
        .await
        .unwrap();
    source.set_session_duration(900_000).unwrap();
    source.set_transition_duration(8_000);
    source.save_to(&store).await.unwrap();

    let target = harness_on_real_time(two_layers());
    let loaded = target.load_from(&store).await.unwrap().unwrap();

    assert_eq!(target.session_duration_ms(), 900_000);
    assert_eq!(target.transition_duration_ms(), 8_000);
    assert_eq!(target.phases().await, source.phases().await);
    assert_eq!(loaded.phases.len(), 2);
}

#[tokio::test]
async fn test_load_from_empty_store() {
    let engine = harness_on_real_time(two_layers());
    assert!(engine.load_from(&MemoryStore::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_load_rejects_zero_duration_snapshot() {
    let store = MemoryStore::with_snapshot(SessionSnapshot {
        session_duration_ms: 0,
        transition_duration_ms: 4_000,
        phases: vec![Phase::entry("p0", "Arrive")],
        layers: Vec::new(),
        extras: Default::default(),
    });
    let engine = harness_on_real_time(two_layers());

    assert!(matches!(engine.load_from(&store).await, Err(Error::Store(_))));
    assert!(engine.phases().await.is_empty());
    assert!(store.load().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_huge_session_duration_seeks_without_panicking() {
    let h = harness(two_layers());
    h.engine.set_session_duration(u64::MAX).unwrap();

    assert_eq!(h.engine.seek_to_time(5_000), 5_000);
    assert_eq!(h.engine.seek_to_time(-20), 0);
    assert_eq!(h.engine.session_duration_ms(), u64::MAX);
}

fn harness_on_real_time(settings: EngineSettings) -> std::sync::Arc<tap_engine::TimelineEngine> {
    harness(settings).engine
}

#[test]
#[serial]
fn test_engine_settings_from_env_config() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[logging]
level = "debug"

[engine]
session_duration_ms = 600000
transition_duration_ms = 2500
poll_interval_ms = 1000
fade_curve = "cosine"

[[engine.layers]]
id = "drone"
track = "drone/low.ogg"
volume = 0.5

[[engine.layers]]
id = "nature"
"#
    )
    .unwrap();

    std::env::set_var(CONFIG_ENV_VAR, file.path());
    let config = TomlConfig::load_or_default(None);
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.logging.level, "debug");
    let settings = EngineSettings::from_table(config.engine.as_ref()).unwrap();
    assert_eq!(settings.session_duration_ms, 600_000);
    assert_eq!(settings.transition_duration_ms, 2_500);
    // Clamped into the 200-300ms window
    assert_eq!(settings.poll_interval_ms, 300);
    assert_eq!(settings.layer_ids(), vec!["drone".to_string(), "nature".to_string()]);
    assert_eq!(settings.layers[0].track.as_deref(), Some("drone/low.ogg"));
    assert_eq!(settings.ramp_step_ms, 50);
}

#[test]
#[serial]
fn test_missing_engine_table_uses_defaults() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let config = TomlConfig::parse("").unwrap();
    let settings = EngineSettings::from_table(config.engine.as_ref()).unwrap();
    assert_eq!(settings, EngineSettings::default().validated().unwrap());
}
