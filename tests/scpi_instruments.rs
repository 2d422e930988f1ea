//! SCPI drivers (HP 34401A, HP 6632B) and the write-only HP 8954A switch.

use rust_instr::adapters::DummyTransport;
use rust_instr::error::{Bound, InstrError, TransportError};
use rust_instr::instrument::hp8954a::{AuxRelay, Hp8954a, Path, RfMonitor};
use rust_instr::instrument::{Hp34401a, Hp6632b, HasOutput, Instrument, PowerSupply};
use rust_instr::protocol::error_status::StandardEvent;
use rust_instr::protocol::measurement::{Coupling, MeasurementRequest, SignalKind};
use rust_instr::protocol::Setting;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const IDN_34401A: &str = "HEWLETT-PACKARD,34401A,0,11-5-2";
const IDN_6632B: &str = "HEWLETT-PACKARD,6632B,0,A.01.02";

async fn dmm() -> (Hp34401a, DummyTransport) {
    let dummy = DummyTransport::new();
    dummy.push_reply(IDN_34401A);
    let dmm = Hp34401a::new("dmm", Box::new(dummy.clone()));
    dmm.connect().await.unwrap();
    dummy.clear_sent();
    (dmm, dummy)
}

async fn psu() -> (Hp6632b, DummyTransport) {
    let dummy = DummyTransport::new();
    dummy.push_reply(IDN_6632B);
    let psu = Hp6632b::new("psu", Box::new(dummy.clone()));
    psu.connect().await.unwrap();
    dummy.clear_sent();
    (psu, dummy)
}

#[tokio::test]
async fn dmm_checks_model_field() {
    let dummy = DummyTransport::new();
    dummy.push_reply("HEWLETT-PACKARD,34970A,0,1");
    let dmm = Hp34401a::new("dmm", Box::new(dummy.clone()));
    assert!(matches!(
        dmm.connect().await,
        Err(InstrError::WrongDevice { .. })
    ));
    assert_eq!(dummy.sent(), vec!["*IDN?"]);
}

#[tokio::test]
async fn dmm_auto_measurement() {
    let (dmm, dummy) = dmm().await;
    dummy.push_reply("+4.99871000E+00");
    assert_eq!(dmm.voltage(Coupling::Dc).await.unwrap(), 4.99871);
    assert_eq!(dummy.sent(), vec!["MEAS:VOLT:DC? AUTO"]);
}

#[tokio::test]
async fn dmm_ranged_measurement() {
    let (dmm, dummy) = dmm().await;
    dummy.push_reply("+1.00000000E-01");
    let request = MeasurementRequest::new(
        SignalKind::Current(Coupling::Dc),
        Setting::Value(1.0),
        Setting::Value(0.0001),
    )
    .unwrap();
    assert_eq!(dmm.measure_request(&request).await.unwrap(), 0.1);
    assert_eq!(dummy.sent(), vec!["MEAS:CURR:DC? 1,0.0001"]);
}

#[tokio::test]
async fn dmm_reports_standard_events() {
    let (dmm, dummy) = dmm().await;
    dummy.push_reply("+32");
    assert_eq!(
        dmm.standard_events().await.unwrap(),
        vec![StandardEvent::CommandError]
    );
    dummy.push_reply("+128");
    dmm.check_errors().await.unwrap();
    assert_eq!(dummy.sent(), vec!["*ESR?", "*ESR?"]);
}

#[tokio::test]
async fn psu_retries_identification() {
    let dummy = DummyTransport::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    dummy.respond_with(move |cmd| {
        if cmd != "*IDN?" {
            return None;
        }
        // Silent on the first attempt.
        (counter.fetch_add(1, Ordering::SeqCst) > 0).then(|| IDN_6632B.to_string())
    });
    let psu = Hp6632b::new("psu", Box::new(dummy.clone()));
    psu.connect().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(dummy.sent(), vec!["*IDN?", "*IDN?", "DISPLAY:MODE NORMAL"]);
}

#[tokio::test]
async fn psu_gives_up_after_three_attempts() {
    let dummy = DummyTransport::new();
    let psu = Hp6632b::new("psu", Box::new(dummy.clone()));
    let err = psu.connect().await.unwrap_err();
    assert!(matches!(
        err,
        InstrError::Transport {
            source: TransportError::NoReply,
            ..
        }
    ));
    assert_eq!(dummy.sent(), vec!["*IDN?", "*IDN?", "*IDN?"]);
}

#[tokio::test]
async fn psu_setpoints_are_cached() {
    let (psu, dummy) = psu().await;
    dummy.respond_with(|cmd| match cmd {
        "VOLT?" => Some("+5.000000E+00".to_string()),
        "CURR?" => Some("+1.000000E+00".to_string()),
        "OUTP?" => Some("1".to_string()),
        _ => None,
    });
    PowerSupply::set_voltage(&psu, 5.0).await.unwrap();
    psu.set_current_limit(1.0).await.unwrap();
    psu.enable_output().await.unwrap();
    assert_eq!(psu.voltage_setpoint().await.unwrap(), 5.0);
    assert_eq!(psu.voltage_setpoint().await.unwrap(), 5.0);
    assert_eq!(psu.current_limit().await.unwrap(), 1.0);
    assert!(psu.output_enabled().await.unwrap());
    assert_eq!(
        dummy.sent(),
        vec!["VOLT 5", "CURR 1", "OUTP ON", "VOLT?", "CURR?", "OUTP?"]
    );
}

#[tokio::test]
async fn psu_rejects_out_of_range_setpoints() {
    let (psu, dummy) = psu().await;
    let err = psu.set_voltage(25.0).await.unwrap_err();
    assert!(matches!(err, InstrError::Range(ref e) if e.bound == Bound::Max(20.0)));
    assert!(psu.set_current(6.0).await.is_err());
    assert_eq!(dummy.io_calls(), 0);
}

#[tokio::test]
async fn psu_display_text() {
    let (psu, dummy) = psu().await;
    psu.display_text("HELLO").await.unwrap();
    psu.display_text("WORLD").await.unwrap();
    let err = psu.display_text("THIS IS TOO LONG").await.unwrap_err();
    assert!(matches!(
        err,
        InstrError::Range(ref e) if e.parameter == "display_text_length"
    ));
    psu.display_normal().await.unwrap();
    assert_eq!(
        dummy.sent(),
        vec![
            "DISPLAY:MODE TEXT",
            "DISPLAY:TEXT \"HELLO\"",
            "DISPLAY:TEXT \"WORLD\"",
            "DISPLAY:MODE NORMAL",
        ]
    );
}

#[tokio::test]
async fn psu_measurements() {
    let (psu, dummy) = psu().await;
    dummy.push_reply("+4.998E+00");
    dummy.push_reply("+2.5E-01");
    assert_eq!(psu.measured_voltage().await.unwrap(), 4.998);
    assert_eq!(psu.measured_current().await.unwrap(), 0.25);
    assert_eq!(dummy.sent(), vec!["MEAS:VOLT?", "MEAS:CURR?"]);
}

#[tokio::test]
async fn switch_identity_is_a_prefix() {
    let dummy = DummyTransport::new();
    dummy.push_reply("8954A REV 2");
    let switch = Hp8954a::new("switch", Box::new(dummy.clone()));
    switch.connect().await.unwrap();
    assert_eq!(dummy.sent(), vec!["ID"]);
}

#[tokio::test]
async fn switch_commands_and_local_state() {
    let switch = Hp8954a::dummy("switch", DummyTransport::new());
    switch.connect().await.unwrap();
    switch.transmit_key_on().await.unwrap();
    switch.select_rf_monitor(RfMonitor::Mon2).await.unwrap();
    let relays: Vec<_> = ['1', 'g']
        .into_iter()
        .map(|t| (AuxRelay::parse(t).unwrap(), true))
        .collect();
    switch.set_aux_relays(&relays).await.unwrap();
    switch.receive_mode().await.unwrap();

    let state = switch.state().await;
    assert!(!state.transmit_key);
    assert_eq!(state.path, Path::Receive);
    assert_eq!(state.rf_monitor, Some(RfMonitor::Mon2));
    assert!(state.relays_open[0] && state.relays_open[15]);
}

#[tokio::test]
async fn switch_command_text() {
    let dummy = DummyTransport::new();
    let switch = Hp8954a::dummy("switch", dummy.clone());
    switch.connect().await.unwrap();
    switch.transmit_mode().await.unwrap();
    switch.transmit_key_off().await.unwrap();
    switch
        .set_aux_relay(AuxRelay::parse('B').unwrap(), false)
        .await
        .unwrap();
    switch.select_rf_monitor(RfMonitor::Mon1).await.unwrap();
    assert_eq!(dummy.sent(), vec!["XM", "K0", "UB", "F1"]);
}
