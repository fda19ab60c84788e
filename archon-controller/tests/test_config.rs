// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod support;

use archon_controller::{
    AcfDocument, ArchonConfig, ArchonError, ControllerStatus, UserPreferences,
    WriteConfigOptions,
};
use pretty_assertions::assert_eq;
use support::{connect_with_config, text, MockArchon};

fn small_config() -> ArchonConfig {
    ArchonConfig {
        max_config_lines: 5,
        ..Default::default()
    }
}

fn rconfig_replies() -> Vec<(&'static str, Vec<support::CannedReply>)> {
    vec![
        ("RCONFIG0000", vec![text("<{cid}LINE0=0")]),
        ("RCONFIG0001", vec![text("<{cid}LINE1=1")]),
        ("RCONFIG0002", vec![text("<{cid}LINE2=2=2")]),
        ("RCONFIG0003", vec![text("<{cid}MOD1/FOO=a,b")]),
        ("RCONFIG0004", vec![text("<{cid}")]),
        ("SYSTEM", vec![text("<{cid}BACKPLANE_ID=7 MOD1_TYPE=2")]),
    ]
}

#[tokio::test]
async fn read_config_aggregates_lines_in_slot_order() {
    let mock = MockArchon::start(rconfig_replies()).await;
    let controller = connect_with_config(&mock, small_config()).await;

    let lines = controller.read_config(None).await.unwrap();

    // The empty trailing line is trimmed away.
    assert_eq!(
        lines,
        vec!["LINE0=0", "LINE1=1", "LINE2=2=2", "MOD1/FOO=a,b"]
    );
    assert!(mock.received_contains("POLLOFF"));
    assert!(mock.received_contains("POLLON"));
    assert!(mock.received_contains("RCONFIG0004"));

    controller.stop().await;
}

#[tokio::test]
async fn read_config_save_writes_an_acf_file() {
    let mock = MockArchon::start(rconfig_replies()).await;
    let controller = connect_with_config(&mock, small_config()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.acf");
    controller.read_config(Some(&path)).await.unwrap();

    let saved = std::fs::read_to_string(&path).unwrap();
    let document = AcfDocument::parse(&saved).unwrap();

    let system = document.section("SYSTEM").unwrap();
    assert!(system
        .entries
        .iter()
        .any(|(key, value)| key == "BACKPLANE_ID" && value == "7"));
    // Derived module names stay out of the file.
    assert!(!saved.contains("MOD1_NAME"));

    let config = document.section("CONFIG").unwrap();
    assert_eq!(
        config.entries,
        vec![
            ("LINE0".to_string(), "0".to_string()),
            ("LINE1".to_string(), "1".to_string()),
            ("LINE2".to_string(), "\"2=2\"".to_string()),
            ("MOD1\\FOO".to_string(), "\"a,b\"".to_string()),
        ]
    );

    controller.stop().await;
}

#[tokio::test]
async fn read_config_fails_when_a_command_fails() {
    let mut replies = rconfig_replies();
    replies[3] = ("RCONFIG0003", vec![text("?{cid}")]);
    let mock = MockArchon::start(replies).await;
    let controller = connect_with_config(&mock, small_config()).await;

    let result = controller.read_config(None).await;
    assert!(matches!(result, Err(ArchonError::CommandFailed { .. })));
    // Polling is restored even on failure.
    assert!(mock.received_contains("POLLON"));

    controller.stop().await;
}

const ACF_TEXT: &str = "[CONFIG]\n\
    Mod1\\HeaterUpdateTime=0.2\n\
    TapLine0=\"AD3L, 1, 4900\"\n\
    Parameter1=\"Exposures=0\"\n";

#[tokio::test]
async fn write_config_streams_lines_in_order() {
    let mock = MockArchon::start(vec![]).await;
    let controller = connect_with_config(&mock, small_config()).await;

    controller
        .write_config(ACF_TEXT, WriteConfigOptions::default())
        .await
        .unwrap();

    assert!(mock.received_contains("CLEARCONFIG"));
    assert!(mock.received_contains("WCONFIG0000MOD1/HEATERUPDATETIME=0.2"));
    assert!(mock.received_contains("WCONFIG0001TAPLINE0=AD3L, 1, 4900"));
    assert!(mock.received_contains("WCONFIG0002PARAMETER1=EXPOSURES=0"));
    // Polling is suspended during the burst and the controller is
    // reset afterwards.
    assert!(mock.received_contains("POLLOFF"));
    assert!(mock.received_contains("POLLON"));
    assert!(mock.received_contains("HOLDTIMING"));
    assert_eq!(controller.status(), ControllerStatus::IDLE);
    assert!(!mock.received_contains("APPLYALL"));

    controller.stop().await;
}

#[tokio::test]
async fn write_config_applyall_and_poweron() {
    let mock = MockArchon::start(vec![]).await;
    let controller = connect_with_config(&mock, small_config()).await;

    controller
        .write_config(
            ACF_TEXT,
            WriteConfigOptions {
                applyall: true,
                poweron: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(mock.received_contains("APPLYALL"));
    assert!(mock.received_contains("POWERON"));

    controller.stop().await;
}

#[tokio::test]
async fn write_config_failure_latches_error() {
    let mock = MockArchon::start(vec![(
        "WCONFIG0001",
        vec![text("?{cid}")],
    )])
    .await;
    let controller = connect_with_config(&mock, small_config()).await;

    let result = controller
        .write_config(ACF_TEXT, WriteConfigOptions::default())
        .await;

    assert!(matches!(result, Err(ArchonError::CommandFailed { .. })));
    assert!(controller.status().intersects(ControllerStatus::ERROR));
    assert!(mock.received_contains("POLLON"));

    controller.stop().await;
}

#[tokio::test]
async fn write_config_clearconfig_failure_latches_error() {
    let mock = MockArchon::start(vec![("CLEARCONFIG", vec![text("?{cid}")])]).await;
    let controller = connect_with_config(&mock, small_config()).await;

    let result = controller
        .write_config(ACF_TEXT, WriteConfigOptions::default())
        .await;

    assert!(matches!(result, Err(ArchonError::CommandFailed { .. })));
    assert!(controller.status().intersects(ControllerStatus::ERROR));

    controller.stop().await;
}

#[tokio::test]
async fn write_config_requires_a_config_section() {
    let mock = MockArchon::start(vec![]).await;
    let controller = connect_with_config(&mock, small_config()).await;

    let result = controller
        .write_config("[SYSTEM]\nBACKPLANE_ID=1\n", WriteConfigOptions::default())
        .await;
    assert!(matches!(result, Err(ArchonError::Acf(_))));

    controller.stop().await;
}

#[tokio::test]
async fn write_config_from_a_file_records_the_acf_path() {
    let dir = tempfile::tempdir().unwrap();
    let acf_path = dir.path().join("config.acf");
    std::fs::write(&acf_path, ACF_TEXT).unwrap();
    let preferences_path = dir.path().join("preferences.json");

    let mock = MockArchon::start(vec![]).await;
    let config = ArchonConfig {
        user_config_file: Some(preferences_path.clone()),
        ..small_config()
    };
    let controller = connect_with_config(&mock, config).await;

    assert_eq!(controller.acf_loaded(), None);

    controller
        .write_config(acf_path.to_str().unwrap(), WriteConfigOptions::default())
        .await
        .unwrap();

    let recorded = controller.acf_loaded().unwrap();
    assert_eq!(recorded, std::fs::canonicalize(&acf_path).unwrap());

    // The path is persisted for the next session.
    let preferences = UserPreferences::load(&preferences_path).unwrap();
    assert_eq!(
        preferences.last_acf_loaded.get("test_controller"),
        Some(&recorded.display().to_string())
    );

    controller.stop().await;
}
