use crate::types::{
    BikeFeatures, ControlResponse, SensorDelta, SensorState, MAX_RESISTANCE_LEVEL,
    MIN_RESISTANCE_LEVEL,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// First byte of every proprietary frame on the bike's 0xFFF1 characteristic
pub const PROPRIETARY_FRAME_HEADER: u8 = 0x02;

/// Proprietary sub-type carrying speed, cadence and power
pub const SUBTYPE_SPEED_CADENCE_POWER: u8 = 0x42;

/// Proprietary sub-type carrying calories
pub const SUBTYPE_CALORIES: u8 = 0x43;

/// Minimum length of a 0x42 frame
pub const SPEED_CADENCE_POWER_FRAME_MIN: usize = 11;

/// Minimum length of a 0x43 frame
pub const CALORIES_FRAME_MIN: usize = 8;

/// Indoor Bike Data flags: instantaneous cadence (bit 2) and power (bit 6) present
pub const INDOOR_BIKE_DATA_FLAGS: u16 = (1 << 2) | (1 << 6);

/// Encoded Indoor Bike Data size in bytes
pub const INDOOR_BIKE_DATA_SIZE: usize = 8;

/// First byte of every control point response
pub const CONTROL_RESPONSE_CODE: u8 = 0x80;

/// Control point response size in bytes
pub const CONTROL_RESPONSE_SIZE: usize = 3;

/// Handle range announced in the Service Changed indication
pub const SERVICE_CHANGED_RANGE: (u16, u16) = (0x0001, 0xFFFF);

/// Training Status: idle
pub const TRAINING_STATUS_IDLE: u8 = 0x01;

/// Training Status: manual mode (quick start)
pub const TRAINING_STATUS_MANUAL_MODE: u8 = 0x0D;

/// Fitness Machine Status: reset
pub const MACHINE_STATUS_RESET: u8 = 0x01;

/// Fitness Machine Status: stopped or paused by the user
pub const MACHINE_STATUS_STOPPED: u8 = 0x02;

/// Fitness Machine Status: started or resumed by the user
pub const MACHINE_STATUS_STARTED: u8 = 0x04;

/// Fitness Machine Status reported for a pause request
pub const MACHINE_STATUS_PAUSED: u8 = 0x07;

/// Bike control point init sequence, written one byte at a time after `Ready`
pub const BIKE_INIT_SEQUENCE: [u8; 2] = [0x00, 0x07];

/// FTMS-like resistance frame layouts seen on the bike's 0x2AD2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtmsLikeVariant {
    /// 11 bytes, leading 0x75
    A,
    /// 12 bytes, leading 0x00 0x0B
    B,
}

/// Divide by ten, rounding half away from zero
const fn div10_round(raw: u32) -> u32 {
    (raw + 5) / 10
}

/// Decode a frame from the bike's proprietary data characteristic (0xFFF1).
///
/// Frame layouts, all offsets from the start of the frame:
/// - `[0x02, 0x42, ..]`, at least 11 bytes:
///   - bytes 3-4: speed, u16 little-endian, 0.01 km/h
///   - bytes 6-7: cadence, u16 little-endian, already 0.5 RPM
///   - bytes 9-10: power x10, u16 little-endian
/// - `[0x02, 0x43, ..]`, at least 8 bytes:
///   - bytes 6-7: calories x10, u16 **big-endian**
///
/// The calories field really is big-endian on this device while the 0x42
/// fields are little-endian. Anything else yields `None`.
#[must_use]
pub fn decode_bike_proprietary(frame: &[u8]) -> Option<SensorDelta> {
    if frame.len() < 2 || frame[0] != PROPRIETARY_FRAME_HEADER {
        return None;
    }

    match frame[1] {
        SUBTYPE_SPEED_CADENCE_POWER if frame.len() >= SPEED_CADENCE_POWER_FRAME_MIN => {
            let mut buf = &frame[3..];
            let speed = buf.get_u16_le();
            buf.advance(1);
            let cadence = buf.get_u16_le();
            buf.advance(1);
            let raw_power_x10 = buf.get_u16_le();

            let power = i16::try_from(div10_round(u32::from(raw_power_x10))).unwrap_or(i16::MAX);

            Some(SensorDelta::SpeedCadencePower {
                speed,
                cadence,
                power,
            })
        }
        SUBTYPE_CALORIES if frame.len() >= CALORIES_FRAME_MIN => {
            let mut buf = &frame[6..];
            Some(SensorDelta::Calories {
                calories_x10: buf.get_u16(),
            })
        }
        _ => None,
    }
}

/// Extract the resistance candidate from an FTMS-like frame, in range or not
#[must_use]
pub fn ftms_like_candidate(frame: &[u8]) -> Option<(FtmsLikeVariant, u8)> {
    match frame {
        [0x75, ..] if frame.len() == 11 => Some((FtmsLikeVariant::A, frame[7])),
        [0x00, 0x0B, ..] if frame.len() == 12 => Some((FtmsLikeVariant::B, frame[7])),
        _ => None,
    }
}

/// Decode the apparent resistance from an FTMS-like frame on the bike's 0x2AD2.
///
/// Returns the level only when the frame matches a known layout and byte 7
/// lies within 1-8.
#[must_use]
pub fn decode_bike_ftms_like(frame: &[u8]) -> Option<u8> {
    ftms_like_candidate(frame)
        .map(|(_, candidate)| candidate)
        .filter(|level| (MIN_RESISTANCE_LEVEL..=MAX_RESISTANCE_LEVEL).contains(level))
}

/// Decode the two feature bitfields read from the bike's 0x2ACC
#[must_use]
pub fn decode_bike_features(value: &[u8]) -> Option<BikeFeatures> {
    if value.len() < 4 {
        return None;
    }

    let mut buf = value;
    let machine_features = buf.get_u32_le();
    let target_setting_features = if buf.remaining() >= 4 {
        buf.get_u32_le()
    } else {
        0
    };

    Some(BikeFeatures {
        machine_features,
        target_setting_features,
    })
}

/// Flags field of an FTMS data frame, if the frame is long enough to carry one
#[must_use]
pub fn ftms_data_flags(frame: &[u8]) -> Option<u16> {
    (frame.len() >= 2).then(|| u16::from_le_bytes([frame[0], frame[1]]))
}

/// Encode the 8-byte Indoor Bike Data frame sent to the app.
///
/// Layout (little-endian): flags, instantaneous speed, instantaneous cadence,
/// instantaneous power.
#[must_use]
pub fn encode_indoor_bike_data(state: &SensorState) -> Bytes {
    let mut buf = BytesMut::with_capacity(INDOOR_BIKE_DATA_SIZE);

    buf.put_u16_le(INDOOR_BIKE_DATA_FLAGS);
    buf.put_u16_le(state.speed);
    buf.put_u16_le(state.cadence);
    buf.put_i16_le(state.power);

    buf.freeze()
}

impl ControlResponse {
    /// Serialize as `[0x80, request_opcode, result_code]`
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; CONTROL_RESPONSE_SIZE] {
        [CONTROL_RESPONSE_CODE, self.request_opcode, self.result as u8]
    }
}

/// Encode the Service Changed indication payload
#[must_use]
pub fn encode_service_changed() -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(SERVICE_CHANGED_RANGE.0);
    buf.put_u16_le(SERVICE_CHANGED_RANGE.1);
    buf.freeze()
}

/// Supported range for a quantity the bridge does not control (all zero)
#[must_use]
pub const fn encode_unsupported_range() -> [u8; 6] {
    [0; 6]
}

/// Supported Resistance Level Range: 1.0 to 8.0 in steps of 1.0 (0.1 resolution)
#[must_use]
pub fn encode_supported_resistance_range() -> Bytes {
    encode_range(
        i16::from(MIN_RESISTANCE_LEVEL) * 10,
        i16::from(MAX_RESISTANCE_LEVEL) * 10,
        10,
    )
}

/// Supported Power Range: 0 to 1000 W in 1 W steps
#[must_use]
pub fn encode_supported_power_range() -> Bytes {
    encode_range(0, 1_000, 1)
}

fn encode_range(minimum: i16, maximum: i16, increment: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_i16_le(minimum);
    buf.put_i16_le(maximum);
    buf.put_u16_le(increment);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;

    fn speed_cadence_power_frame(speed: u16, cadence: u16, raw_power_x10: u16) -> Vec<u8> {
        let mut frame = vec![0x02, 0x42, 0x00];
        frame.extend_from_slice(&speed.to_le_bytes());
        frame.push(0x00);
        frame.extend_from_slice(&cadence.to_le_bytes());
        frame.push(0x00);
        frame.extend_from_slice(&raw_power_x10.to_le_bytes());
        frame
    }

    #[test]
    fn test_decode_speed_cadence_power() {
        let frame = speed_cadence_power_frame(2_345, 170, 1_005);
        assert_eq!(frame.len(), SPEED_CADENCE_POWER_FRAME_MIN);

        assert_eq!(
            decode_bike_proprietary(&frame),
            Some(SensorDelta::SpeedCadencePower {
                speed: 2_345,
                cadence: 170,
                power: 101,
            })
        );
    }

    #[test]
    fn test_power_rounds_half_away_from_zero() {
        let power_of = |raw| match decode_bike_proprietary(&speed_cadence_power_frame(0, 0, raw)) {
            Some(SensorDelta::SpeedCadencePower { power, .. }) => power,
            other => panic!("unexpected decode {other:?}"),
        };

        assert_eq!(power_of(1_005), 101);
        assert_eq!(power_of(1_004), 100);
        assert_eq!(power_of(5), 1);
        assert_eq!(power_of(4), 0);
        assert_eq!(power_of(u16::MAX), 6_554);
    }

    #[test]
    fn test_decode_calories_is_big_endian() {
        let frame = [0x02, 0x43, 0x00, 0x00, 0x00, 0x00, 0x01, 0x2C];
        assert_eq!(
            decode_bike_proprietary(&frame),
            Some(SensorDelta::Calories { calories_x10: 300 })
        );
    }

    #[test]
    fn test_decode_rejects_short_or_foreign_frames() {
        let full = speed_cadence_power_frame(100, 100, 100);
        assert_eq!(decode_bike_proprietary(&full[..10]), None);
        assert_eq!(decode_bike_proprietary(&[0x02, 0x43, 0, 0, 0, 0, 0x01]), None);
        assert_eq!(decode_bike_proprietary(&[]), None);
        assert_eq!(decode_bike_proprietary(&[0x02]), None);

        let mut wrong_header = full.clone();
        wrong_header[0] = 0x03;
        assert_eq!(decode_bike_proprietary(&wrong_header), None);

        let mut unknown_subtype = full;
        unknown_subtype[1] = 0x44;
        assert_eq!(decode_bike_proprietary(&unknown_subtype), None);
    }

    #[test]
    fn test_decode_ftms_like_variants() {
        let mut variant_a = [0u8; 11];
        variant_a[0] = 0x75;
        variant_a[7] = 5;
        assert_eq!(ftms_like_candidate(&variant_a), Some((FtmsLikeVariant::A, 5)));
        assert_eq!(decode_bike_ftms_like(&variant_a), Some(5));

        variant_a[7] = 9;
        assert_eq!(decode_bike_ftms_like(&variant_a), None);
        variant_a[7] = 0;
        assert_eq!(decode_bike_ftms_like(&variant_a), None);

        let mut variant_b = [0u8; 12];
        variant_b[1] = 0x0B;
        variant_b[7] = 8;
        assert_eq!(ftms_like_candidate(&variant_b), Some((FtmsLikeVariant::B, 8)));
        assert_eq!(decode_bike_ftms_like(&variant_b), Some(8));
    }

    #[test]
    fn test_decode_ftms_like_requires_exact_length() {
        let mut frame = [0u8; 12];
        frame[0] = 0x75;
        frame[7] = 3;
        assert_eq!(decode_bike_ftms_like(&frame), None);

        let mut frame = [0u8; 11];
        frame[1] = 0x0B;
        frame[7] = 3;
        assert_eq!(decode_bike_ftms_like(&frame), None);
    }

    #[test]
    fn test_decode_bike_features() {
        let value = [0x02, 0x40, 0x00, 0x00, 0x08, 0x20, 0x00, 0x00];
        assert_eq!(
            decode_bike_features(&value),
            Some(BikeFeatures {
                machine_features: 0x4002,
                target_setting_features: 0x2008,
            })
        );

        assert_eq!(
            decode_bike_features(&value[..5]),
            Some(BikeFeatures {
                machine_features: 0x4002,
                target_setting_features: 0,
            })
        );
        assert_eq!(decode_bike_features(&value[..3]), None);
    }

    #[test]
    fn test_encode_indoor_bike_data_layout() {
        let state = SensorState {
            speed: 0x1234,
            cadence: 0x00B4,
            power: -3,
            calories_x10: 999,
            apparent_resistance: 4,
        };
        let frame = encode_indoor_bike_data(&state);

        assert_eq!(frame.len(), INDOOR_BIKE_DATA_SIZE);
        assert_eq!(&frame[..], &[0x44, 0x00, 0x34, 0x12, 0xB4, 0x00, 0xFD, 0xFF]);

        let mut buf = &frame[..];
        assert_eq!(buf.get_u16_le(), 0x0044);
        assert_eq!(buf.get_u16_le(), state.speed);
        assert_eq!(buf.get_u16_le(), state.cadence);
        assert_eq!(buf.get_i16_le(), state.power);
    }

    #[test]
    fn test_encode_indoor_bike_data_zero_state() {
        let frame = encode_indoor_bike_data(&SensorState::default());
        assert_eq!(&frame[..], &[0x44, 0x00, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_control_response_bytes() {
        let response = ControlResponse {
            request_opcode: 0x99,
            result: ResultCode::OpCodeNotSupported,
        };
        assert_eq!(response.to_bytes(), [0x80, 0x99, 0x02]);
    }

    #[test]
    fn test_static_payloads() {
        assert_eq!(&encode_service_changed()[..], &[0x01, 0x00, 0xFF, 0xFF]);
        assert_eq!(
            &encode_supported_resistance_range()[..],
            &[0x0A, 0x00, 0x50, 0x00, 0x0A, 0x00]
        );
        assert_eq!(
            &encode_supported_power_range()[..],
            &[0x00, 0x00, 0xE8, 0x03, 0x01, 0x00]
        );
        assert_eq!(encode_unsupported_range(), [0; 6]);
    }

    #[test]
    fn test_ftms_data_flags() {
        assert_eq!(ftms_data_flags(&[0x44, 0x02, 0x00]), Some(0x0244));
        assert_eq!(ftms_data_flags(&[0x44]), None);
    }
}
