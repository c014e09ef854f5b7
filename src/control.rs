use std::fmt;
use tracing::{debug, info, warn};

use crate::{
    protocol::{
        MACHINE_STATUS_PAUSED, MACHINE_STATUS_RESET, MACHINE_STATUS_STARTED,
        MACHINE_STATUS_STOPPED, TRAINING_STATUS_IDLE, TRAINING_STATUS_MANUAL_MODE,
    },
    types::{
        AppCharacteristic, ControlCommand, ControlResponse, ResultCode, StatusUpdate,
        TargetSettings, MAX_RESISTANCE_LEVEL, MIN_RESISTANCE_LEVEL,
    },
};

/// Control point opcodes the bridge understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Request Control
    RequestControl = 0x00,
    /// Reset
    Reset = 0x01,
    /// Set Target Inclination
    SetTargetInclination = 0x03,
    /// Set Target Resistance Level
    SetTargetResistance = 0x04,
    /// Set Target Power
    SetTargetPower = 0x05,
    /// Start or Resume
    StartResume = 0x07,
    /// Stop or Pause
    StopPause = 0x08,
}

impl ControlOpcode {
    /// Look up an opcode byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x03 => Some(Self::SetTargetInclination),
            0x04 => Some(Self::SetTargetResistance),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartResume),
            0x08 => Some(Self::StopPause),
            _ => None,
        }
    }

    /// Minimum write length, opcode included
    #[must_use]
    pub const fn min_len(self) -> usize {
        match self {
            Self::SetTargetInclination | Self::SetTargetPower => 3,
            Self::SetTargetResistance => 2,
            Self::RequestControl | Self::Reset | Self::StartResume | Self::StopPause => 1,
        }
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestControl => write!(f, "Request Control"),
            Self::Reset => write!(f, "Reset"),
            Self::SetTargetInclination => write!(f, "Set Target Inclination"),
            Self::SetTargetResistance => write!(f, "Set Target Resistance"),
            Self::SetTargetPower => write!(f, "Set Target Power"),
            Self::StartResume => write!(f, "Start/Resume"),
            Self::StopPause => write!(f, "Stop/Pause"),
        }
    }
}

/// What a control point write produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlOutcome {
    /// Response to indicate on the control point
    pub response: ControlResponse,
    /// Status updates to send after the response, in order
    pub follow_ups: Vec<StatusUpdate>,
}

impl ControlOutcome {
    fn new(opcode: u8, result: ResultCode) -> Self {
        Self {
            response: ControlResponse {
                request_opcode: opcode,
                result,
            },
            follow_ups: Vec::new(),
        }
    }

    fn then(mut self, characteristic: AppCharacteristic, value: u8) -> Self {
        self.follow_ups.push(StatusUpdate {
            characteristic,
            value,
            force: true,
        });
        self
    }
}

/// Rescale an app resistance byte to the bike's 1-8 scale.
///
/// Zero clears the target; anything else is divided by ten (half away from
/// zero) and clamped into 1-8.
#[must_use]
pub fn map_resistance(raw: u8) -> u8 {
    if raw == 0 {
        return 0;
    }

    let level = (u16::from(raw) + 5) / 10;
    u8::try_from(level)
        .unwrap_or(MAX_RESISTANCE_LEVEL)
        .clamp(MIN_RESISTANCE_LEVEL, MAX_RESISTANCE_LEVEL)
}

/// Process one write to the FTMS control point.
///
/// Returns `None` for an empty write, which gets no response at all. Any other
/// write yields exactly one response; target effects are applied to `targets`
/// before returning.
pub fn process_control_point(data: &[u8], targets: &mut TargetSettings) -> Option<ControlOutcome> {
    let Some(command) = ControlCommand::from_bytes(data) else {
        debug!("Ignoring empty control point write");
        return None;
    };

    let Some(opcode) = ControlOpcode::from_u8(command.opcode) else {
        warn!(
            "Unsupported control point opcode 0x{:02X}, params {:02X?}",
            command.opcode, command.params
        );
        return Some(ControlOutcome::new(
            command.opcode,
            ResultCode::OpCodeNotSupported,
        ));
    };

    if data.len() < opcode.min_len() {
        warn!(
            "{} needs {} bytes, got {}: {:02X?}",
            opcode,
            opcode.min_len(),
            data.len(),
            data
        );
        return Some(ControlOutcome::new(
            command.opcode,
            ResultCode::InvalidParameter,
        ));
    }

    let params = command.params.as_slice();
    let outcome = ControlOutcome::new(command.opcode, ResultCode::Success);

    let outcome = match opcode {
        ControlOpcode::RequestControl => {
            info!("App requested control");
            outcome
                .then(AppCharacteristic::TrainingStatus, TRAINING_STATUS_MANUAL_MODE)
                .then(AppCharacteristic::FitnessMachineStatus, MACHINE_STATUS_STOPPED)
        }
        ControlOpcode::Reset => {
            info!("App requested reset, clearing targets");
            targets.reset();
            outcome
                .then(AppCharacteristic::TrainingStatus, TRAINING_STATUS_IDLE)
                .then(AppCharacteristic::FitnessMachineStatus, MACHINE_STATUS_RESET)
        }
        ControlOpcode::SetTargetInclination => {
            let inclination = i16::from_le_bytes([params[0], params[1]]);
            targets.target_inclination_percent_x100 = inclination;
            info!(
                "Target inclination set to {:.2}%",
                f32::from(inclination) / 100.0
            );
            outcome
        }
        ControlOpcode::SetTargetResistance => {
            let raw = params[0];
            targets.target_resistance_level = map_resistance(raw);
            info!(
                "Target resistance raw {} mapped to level {}",
                raw, targets.target_resistance_level
            );
            outcome
        }
        ControlOpcode::SetTargetPower => {
            let power = i16::from_le_bytes([params[0], params[1]]);
            info!("Target power {}W requested, not applied", power);
            outcome
        }
        ControlOpcode::StartResume => {
            info!("App requested start/resume");
            outcome.then(AppCharacteristic::FitnessMachineStatus, MACHINE_STATUS_STARTED)
        }
        ControlOpcode::StopPause => {
            let status = match params.first() {
                Some(0x02) => MACHINE_STATUS_PAUSED,
                _ => MACHINE_STATUS_STOPPED,
            };
            info!("App requested stop/pause, param {:02X?}", params.first());
            outcome.then(AppCharacteristic::FitnessMachineStatus, status)
        }
    };

    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(data: &[u8]) -> (Option<ControlOutcome>, TargetSettings) {
        let mut targets = TargetSettings::default();
        let outcome = process_control_point(data, &mut targets);
        (outcome, targets)
    }

    fn response_bytes(data: &[u8]) -> [u8; 3] {
        process(data).0.unwrap().response.to_bytes()
    }

    fn follow_ups(data: &[u8]) -> Vec<(AppCharacteristic, u8)> {
        process(data)
            .0
            .unwrap()
            .follow_ups
            .into_iter()
            .map(|update| (update.characteristic, update.value))
            .collect()
    }

    #[test]
    fn test_empty_write_gets_no_response() {
        let (outcome, targets) = process(&[]);
        assert!(outcome.is_none());
        assert_eq!(targets, TargetSettings::default());
    }

    #[test]
    fn test_request_control() {
        assert_eq!(response_bytes(&[0x00]), [0x80, 0x00, 0x01]);
        assert_eq!(
            follow_ups(&[0x00]),
            vec![
                (AppCharacteristic::TrainingStatus, 0x0D),
                (AppCharacteristic::FitnessMachineStatus, 0x02),
            ]
        );
    }

    #[test]
    fn test_reset_clears_targets() {
        let mut targets = TargetSettings {
            target_inclination_percent_x100: 550,
            target_resistance_level: 4,
        };
        let outcome = process_control_point(&[0x01], &mut targets).unwrap();

        assert_eq!(targets, TargetSettings::default());
        assert_eq!(outcome.response.to_bytes(), [0x80, 0x01, 0x01]);
        assert_eq!(
            follow_ups(&[0x01]),
            vec![
                (AppCharacteristic::TrainingStatus, 0x01),
                (AppCharacteristic::FitnessMachineStatus, 0x01),
            ]
        );
    }

    #[test]
    fn test_set_target_inclination() {
        let (outcome, targets) = process(&[0x03, 0x26, 0x02]);
        assert_eq!(outcome.unwrap().response.to_bytes(), [0x80, 0x03, 0x01]);
        assert_eq!(targets.target_inclination_percent_x100, 550);

        let (_, targets) = process(&[0x03, 0x38, 0xFF]);
        assert_eq!(targets.target_inclination_percent_x100, -200);

        let (outcome, targets) = process(&[0x03, 0x26]);
        assert_eq!(outcome.unwrap().response.to_bytes(), [0x80, 0x03, 0x04]);
        assert_eq!(targets, TargetSettings::default());
    }

    #[test]
    fn test_resistance_mapping() {
        assert_eq!(map_resistance(0), 0);
        assert_eq!(map_resistance(1), 1);
        assert_eq!(map_resistance(4), 1);
        assert_eq!(map_resistance(10), 1);
        assert_eq!(map_resistance(14), 1);
        assert_eq!(map_resistance(15), 2);
        assert_eq!(map_resistance(75), 8);
        assert_eq!(map_resistance(80), 8);
        assert_eq!(map_resistance(255), 8);
    }

    #[test]
    fn test_set_target_resistance() {
        let (outcome, targets) = process(&[0x04, 42]);
        assert_eq!(outcome.unwrap().response.to_bytes(), [0x80, 0x04, 0x01]);
        assert_eq!(targets.target_resistance_level, 4);

        let (outcome, _) = process(&[0x04]);
        assert_eq!(outcome.unwrap().response.to_bytes(), [0x80, 0x04, 0x04]);
    }

    #[test]
    fn test_set_target_power_is_acknowledged_only() {
        let (outcome, targets) = process(&[0x05, 0xC8, 0x00]);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.response.to_bytes(), [0x80, 0x05, 0x01]);
        assert!(outcome.follow_ups.is_empty());
        assert_eq!(targets, TargetSettings::default());

        assert_eq!(response_bytes(&[0x05, 0xC8]), [0x80, 0x05, 0x04]);
    }

    #[test]
    fn test_start_and_stop() {
        assert_eq!(
            follow_ups(&[0x07]),
            vec![(AppCharacteristic::FitnessMachineStatus, 0x04)]
        );
        assert_eq!(
            follow_ups(&[0x08, 0x01]),
            vec![(AppCharacteristic::FitnessMachineStatus, 0x02)]
        );
        assert_eq!(
            follow_ups(&[0x08, 0x02]),
            vec![(AppCharacteristic::FitnessMachineStatus, 0x07)]
        );
        assert_eq!(
            follow_ups(&[0x08]),
            vec![(AppCharacteristic::FitnessMachineStatus, 0x02)]
        );
        assert_eq!(
            follow_ups(&[0x08, 0x33]),
            vec![(AppCharacteristic::FitnessMachineStatus, 0x02)]
        );
        assert_eq!(response_bytes(&[0x08, 0x02]), [0x80, 0x08, 0x01]);
    }

    #[test]
    fn test_unknown_opcode() {
        let (outcome, targets) = process(&[0x99, 0x01, 0x02]);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.response.to_bytes(), [0x80, 0x99, 0x02]);
        assert!(outcome.follow_ups.is_empty());
        assert_eq!(targets, TargetSettings::default());

        assert_eq!(response_bytes(&[0x02]), [0x80, 0x02, 0x02]);
    }

    #[test]
    fn test_dispatch_is_deterministic() {
        for data in [&[0x00][..], &[0x04, 0x20], &[0x03, 0x01], &[0x42]] {
            assert_eq!(process(data), process(data));
        }
    }

    #[test]
    fn test_follow_ups_are_forced() {
        let writes: [&[u8]; 5] = [&[0x00], &[0x01], &[0x07], &[0x08, 0x01], &[0x08, 0x02]];
        for data in writes {
            let outcome = process(data).0.unwrap();
            assert!(!outcome.follow_ups.is_empty());
            assert!(outcome.follow_ups.iter().all(|update| update.force));
        }
    }
}
