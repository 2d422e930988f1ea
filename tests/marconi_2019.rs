//! Marconi 2019 driver: state-record handshake and record-backed getters.

use rust_instr::adapters::DummyTransport;
use rust_instr::error::{DecodeError, InstrError};
use rust_instr::instrument::marconi_2019::{Level, Marconi2019, ModulationSource, Oscillator};
use rust_instr::instrument::{HasOutput, Instrument, SignalSource};

const RECORD: &str = "010400000000000000000060210608020000000000";
// 433.5 MHz, FM 5 kHz, FM on, carrier on.
const RECORD_FM: &str = "004335000000000500000060210608031000000100";

async fn connected() -> (Marconi2019, DummyTransport) {
    let dummy = DummyTransport::new();
    dummy.push_reply(RECORD);
    let gen = Marconi2019::new("siggen", Box::new(dummy.clone()));
    gen.connect().await.unwrap();
    dummy.clear_sent();
    (gen, dummy)
}

#[tokio::test]
async fn handshake_reads_the_record_without_sending() {
    let (gen, dummy) = connected().await;
    assert!(gen.is_connected().await);
    assert_eq!(gen.frequency().await.unwrap(), 1.04e9);
    assert!(!gen.output_enabled().await.unwrap());
    assert_eq!(dummy.io_calls(), 0);
}

#[tokio::test]
async fn short_record_fails_the_handshake() {
    let dummy = DummyTransport::new();
    dummy.push_reply(&RECORD[..41]);
    let gen = Marconi2019::new("siggen", Box::new(dummy.clone()));
    let err = gen.connect().await.unwrap_err();
    assert!(matches!(
        err,
        InstrError::Decode(DecodeError::RecordLength {
            expected: 42,
            actual: 41,
            ..
        })
    ));
    assert!(!gen.is_connected().await);
}

#[tokio::test]
async fn getters_reread_the_record_after_a_command() {
    let (gen, dummy) = connected().await;
    gen.set_frequency(433.5e6).await.unwrap();
    gen.set_fm(5e3).await.unwrap();
    gen.set_modulation_source(ModulationSource::Internal(Oscillator::F3k))
        .await
        .unwrap();
    assert_eq!(dummy.sent(), vec!["CF 433.5 MZ", "FM 5.0 KZ", "FM IT, M3"]);

    dummy.push_reply(RECORD_FM);
    let status = gen.status().await.unwrap();
    assert_eq!(status.carrier_hz, 433.5e6);
    assert_eq!(status.fm_deviation_hz, 5e3);
    assert!(status.fm_on);
    assert!(status.carrier_on);
    assert_eq!(
        gen.modulation_source().await.unwrap(),
        Some(ModulationSource::Internal(Oscillator::F3k))
    );
    // One read for the record, none for the cached follow-up.
    assert_eq!(dummy.pending_replies(), 0);
}

#[tokio::test]
async fn level_is_remembered_locally() {
    let (gen, dummy) = connected().await;
    assert!(gen.amplitude().await.is_err());

    gen.set_level(Level::Volts(0.25), true).await.unwrap();
    assert_eq!(dummy.last_sent().as_deref(), Some("LV 250, OF MV"));
    assert_eq!(gen.amplitude().await.unwrap(), 0.25);

    gen.set_level(Level::Db(-20.0), false).await.unwrap();
    assert_eq!(dummy.last_sent().as_deref(), Some("LV -20 DB"));
    assert_eq!(gen.level().await, Some(Level::Db(-20.0)));
    assert!(matches!(
        gen.amplitude().await,
        Err(InstrError::Construction(_))
    ));
}

#[tokio::test]
async fn am_switches_the_modulation_being_configured() {
    let (gen, dummy) = connected().await;
    gen.set_am(0.3).await.unwrap();
    gen.set_modulation_source(ModulationSource::External)
        .await
        .unwrap();
    gen.set_alc(true).await.unwrap();
    gen.enable_output().await.unwrap();
    assert_eq!(dummy.sent(), vec!["AM 30 PC", "AM XT", "A1", "LV ON"]);
}

#[tokio::test]
async fn invalid_level_is_rejected_before_io() {
    let (gen, dummy) = connected().await;
    assert!(gen.set_level(Level::Volts(2.0), false).await.is_err());
    assert!(gen.set_frequency(50e3).await.is_err());
    assert_eq!(dummy.io_calls(), 0);
}
