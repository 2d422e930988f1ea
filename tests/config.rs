//! Configuration file to connected drivers.

use rust_instr::config::{ConfigError, InstrumentModel, Settings};
use rust_instr::instrument::{build_all, connect_all};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const BENCH: &str = r#"
[application]
log_level = "debug"

[timeouts]
gate_send_wait_ms = 200
connect_settle_ms = 0

[[instruments]]
id = "awg"
model = "orx_402a"
transport = { kind = "dummy" }

[[instruments]]
id = "dmm"
model = "hp3457a"
reset_after_connect = true
transport = { kind = "dummy" }

[[instruments]]
id = "spare"
model = "hp34401a"
enabled = false
transport = { kind = "dummy" }
"#;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[tokio::test]
#[serial]
async fn dummy_bench_builds_and_connects() {
    let file = write_config(BENCH);
    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.timeouts.gate_send_wait_ms, 200);

    let instruments = build_all(&settings).unwrap();
    let models: Vec<_> = instruments.iter().map(|i| i.model()).collect();
    assert_eq!(models, vec![InstrumentModel::Orx402a, InstrumentModel::Hp3457a]);

    let results = connect_all(&instruments).await;
    assert!(results.iter().all(Result::is_ok));
    for instrument in &instruments {
        assert!(instrument.as_instrument().is_connected().await);
    }
}

#[test]
#[serial]
fn shipped_configuration_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/instruments.toml");
    let settings = Settings::load_from(path).unwrap();
    assert_eq!(settings.enabled_instruments().len(), 5);
    assert_eq!(
        settings.instrument("siggen").map(|i| i.model),
        Some(InstrumentModel::Marconi2019)
    );
}

#[test]
#[serial]
fn duplicate_ids_are_rejected() {
    let file = write_config(
        r#"
[[instruments]]
id = "dmm"
model = "hp3457a"
transport = { kind = "dummy" }

[[instruments]]
id = "dmm"
model = "hp34401a"
transport = { kind = "dummy" }
"#,
    );
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("Duplicate")));
}

#[test]
#[serial]
fn unknown_model_is_a_load_error() {
    let file = write_config(
        r#"
[[instruments]]
id = "scope"
model = "tds2024"
transport = { kind = "dummy" }
"#,
    );
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(ConfigError::LoadError(_))
    ));
}
