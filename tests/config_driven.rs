//! Experiments configured from a TOML file instead of hand-built settings.

use rust_lab::config::DeckConfig;
use rust_lab::logging;
use rust_lab::prelude::*;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn experiment_follows_the_loaded_config() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"

        [protocol]
        tip_policy = "reuse"
        dead_volume_fraction = 0.1

        [deck]
        liquid_handler_slots = 2
        "#,
    );
    let config = LabConfig::load_from(file.path()).unwrap();
    logging::init_from_config(&config).unwrap();

    let lab = SimulatedLab::new();
    let mut session = ExperimentSession::new(lab.actors());
    let id = session
        .experiment_init(ExperimentConfig::from_lab_config("configured", &config))
        .await
        .unwrap();

    let a = session
        .load(ContainerSpec::new("A", Labware::Reservoir).with_liquid("water", 500.0))
        .await
        .unwrap();
    let b = session
        .load(ContainerSpec::new("B", Labware::Reservoir))
        .await
        .unwrap();
    let err = session
        .load(ContainerSpec::new("C", Labware::Reservoir))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LabError::Resource(ResourceError::DeckFull(_))
    ));

    session.transfer(a, b, 100.0).await.unwrap();
    session.transfer(a, b, 100.0).await.unwrap();

    assert!((session.volume(b).unwrap() - 180.0).abs() < 1e-9);
    assert_eq!(lab.count("attach_tip"), 1);
    assert_eq!(lab.count("discard_tip"), 0);

    let summary = session.experiment_end(id).await.unwrap();
    assert!((summary.total_loss - 20.0).abs() < 1e-9);
    assert_eq!(summary.tips_discarded, 1);
}

#[tokio::test]
async fn deck_can_be_sized_per_experiment() {
    let lab = SimulatedLab::new();
    let mut session = ExperimentSession::new(lab.actors());
    session
        .experiment_init(ExperimentConfig::new("one slot").with_deck(DeckConfig {
            liquid_handler_slots: 1,
        }))
        .await
        .unwrap();

    // Wells keep filling the plate in the only slot.
    for i in 0..3 {
        session
            .load(ContainerSpec::new(format!("well-{}", i), Labware::Wellplate))
            .await
            .unwrap();
    }
    let err = session
        .load(ContainerSpec::new("tube", Labware::TestTube))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LabError::Resource(ResourceError::DeckFull(_))
    ));
    assert_eq!(session.container_by_label("well-2").unwrap().location.slot, 1);
}
