//! IEEE 488.2 / SCPI conventions shared by the SCPI drivers.

use crate::error::{InstrError, InstrResult};
use crate::protocol::error_status::{decode_errors, parse_status_word, StandardEvent, STANDARD_EVENTS};
use crate::protocol::EncodedCommand;
use crate::session::SessionCore;

/// Model field (second comma-separated field) of an `*IDN?` reply.
pub fn idn_model(reply: &str) -> Option<&str> {
    reply.split(',').nth(1).map(str::trim)
}

/// Queries `*IDN?` and checks the model field.
pub(crate) async fn identify(core: &mut SessionCore, expected_model: &str) -> InstrResult<()> {
    let reply = core.query(&EncodedCommand::new("*IDN?")).await?;
    match idn_model(&reply) {
        Some(model) if model == expected_model => Ok(()),
        _ => Err(InstrError::WrongDevice {
            instrument: core.name().to_string(),
            expected: expected_model.to_string(),
            actual: reply.trim().to_string(),
        }),
    }
}

/// Reads and clears the standard event status register.
pub(crate) async fn standard_events(core: &mut SessionCore) -> InstrResult<Vec<StandardEvent>> {
    let reply = core.query(&EncodedCommand::new("*ESR?")).await?;
    let status = parse_status_word(&reply)?;
    Ok(decode_errors(status, STANDARD_EVENTS))
}

/// Turns the error bits among `events` into [`InstrError::DeviceReported`].
pub(crate) fn ensure_no_errors(instrument: &str, events: &[StandardEvent]) -> InstrResult<()> {
    let errors: Vec<String> = events
        .iter()
        .filter(|e| e.is_error())
        .map(ToString::to_string)
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(InstrError::DeviceReported {
            instrument: instrument.to_string(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_is_second_field() {
        assert_eq!(
            idn_model("HEWLETT-PACKARD,34401A,0,11-5-2"),
            Some("34401A")
        );
        assert_eq!(idn_model("HP3457A"), None);
    }

    #[test]
    fn only_error_bits_are_reported() {
        assert!(ensure_no_errors(
            "psu",
            &[StandardEvent::OperationComplete, StandardEvent::PowerOn]
        )
        .is_ok());
        let err = ensure_no_errors(
            "psu",
            &[StandardEvent::PowerOn, StandardEvent::CommandError],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            InstrError::DeviceReported { errors, .. } if errors == vec!["CME".to_string()]
        ));
    }
}
