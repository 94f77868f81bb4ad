//! Decoding of the gateway's 25-byte status broadcast frames.
//!
//! Layout: 8-byte fixed header, 15-byte payload whose last byte is the
//! byte-sum of the first 14, then a Modbus CRC16 over header + payload sent
//! little-endian.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::error::FrameError;
use crate::types::{DeviceIdentity, FanSpeed, HvacMode, StatusReport, checked_temperature};

pub const FRAME_LEN: usize = 25;
pub const HEADER: [u8; 8] = [0x55, 0xAA, 0x00, 0x04, 0x02, 0x01, 0x00, 0x0F];

const PAYLOAD_START: usize = HEADER.len();
const PAYLOAD_LEN: usize = 15;
const CRC_START: usize = PAYLOAD_START + PAYLOAD_LEN;

// payload offsets
const GROUP: usize = 0;
const STATUS_KIND: usize = 1;
const OUTDOOR: usize = 4;
const INDOOR: usize = 5;
const POWER: usize = 6;
const TARGET_TEMP: usize = 7;
const MODE: usize = 8;
const FAN: usize = 9;
const CURRENT_TEMP: usize = 10;
const ALARM: usize = 11;
const CHECKSUM: usize = 14;

/// Value seen in byte 1 of every single-unit status broadcast.
const SINGLE_UNIT_STATUS: u8 = 0x50;

pub fn modbus_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn payload_checksum(payload: &[u8]) -> u8 {
    payload[..CHECKSUM]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A successfully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub identity: DeviceIdentity,
    pub report: StatusReport,
    /// Unknown mode/fan codes; the rest of the frame is still valid.
    pub unknown: Vec<FrameError>,
    pub raw: [u8; FRAME_LEN],
}

pub fn decode_frame(frame: &[u8; FRAME_LEN]) -> Result<DecodedFrame, FrameError> {
    if frame[..PAYLOAD_START] != HEADER {
        return Err(FrameError::HeaderMismatch);
    }

    let payload = &frame[PAYLOAD_START..CRC_START];
    let expected = payload_checksum(payload);
    if payload[CHECKSUM] != expected {
        return Err(FrameError::ChecksumInvalid {
            expected,
            actual: payload[CHECKSUM],
        });
    }

    let expected = modbus_crc16(&frame[..CRC_START]);
    let actual = u16::from_le_bytes([frame[CRC_START], frame[CRC_START + 1]]);
    if actual != expected {
        return Err(FrameError::CrcInvalid { expected, actual });
    }

    let mode = HvacMode::from_code(payload[MODE]);
    let fan = FanSpeed::from_code(payload[FAN]);

    let mut unknown = Vec::new();
    if !mode.is_recognized() {
        unknown.push(FrameError::UnknownEnum {
            field: "mode",
            code: payload[MODE],
        });
    }
    if !fan.is_recognized() {
        unknown.push(FrameError::UnknownEnum {
            field: "fan",
            code: payload[FAN],
        });
    }

    Ok(DecodedFrame {
        identity: DeviceIdentity::new(payload[GROUP], payload[OUTDOOR], payload[INDOOR]),
        report: StatusReport {
            power: payload[POWER] != 0,
            mode,
            fan,
            target_temperature: checked_temperature(payload[TARGET_TEMP]),
            current_temperature: checked_temperature(payload[CURRENT_TEMP]),
            alarm_code: payload[ALARM],
        },
        unknown,
        raw: *frame,
    })
}

/// Build a valid broadcast frame, as a gateway would send it.
///
/// Unknown temperatures are sent as 0.
pub fn encode_frame(identity: DeviceIdentity, report: &StatusReport) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..PAYLOAD_START].copy_from_slice(&HEADER);

    let payload = &mut frame[PAYLOAD_START..CRC_START];
    payload[GROUP] = identity.group;
    payload[STATUS_KIND] = SINGLE_UNIT_STATUS;
    payload[2] = 0x01;
    payload[3] = 0x01;
    payload[OUTDOOR] = identity.outdoor;
    payload[INDOOR] = identity.indoor;
    payload[POWER] = report.power as u8;
    payload[TARGET_TEMP] = report.target_temperature.unwrap_or(0);
    payload[MODE] = report.mode.code();
    payload[FAN] = report.fan.code();
    payload[CURRENT_TEMP] = report.current_temperature.unwrap_or(0);
    payload[ALARM] = report.alarm_code;
    payload[CHECKSUM] = payload_checksum(payload);

    let crc = modbus_crc16(&frame[..CRC_START]);
    frame[CRC_START..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Stream decoder that resynchronises on the frame header.
///
/// Bytes before the earliest header occurrence are skipped; a candidate that
/// fails validation costs exactly one byte, so a frame that starts one byte
/// later is still found.
#[derive(Debug, Default)]
pub struct StatusFrameCodec {
    frames: u64,
    skipped_bytes: u64,
    rejected: u64,
}

impl StatusFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER.len()).position(|w| w == HEADER)
}

impl Decoder for StatusFrameCodec {
    type Item = DecodedFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match find_header(src) {
                Some(0) => {}
                Some(offset) => {
                    trace!(skipped = offset, "skipping bytes before frame header");
                    self.skipped_bytes += offset as u64;
                    src.advance(offset);
                }
                None => {
                    // keep a possible partial header at the tail
                    let keep = src.len().min(HEADER.len() - 1);
                    let drop = src.len() - keep;
                    if drop > 0 {
                        self.skipped_bytes += drop as u64;
                        src.advance(drop);
                    }
                    return Ok(None);
                }
            }

            if src.len() < FRAME_LEN {
                src.reserve(FRAME_LEN - src.len());
                return Ok(None);
            }

            let mut raw = [0u8; FRAME_LEN];
            raw.copy_from_slice(&src[..FRAME_LEN]);

            match decode_frame(&raw) {
                Ok(frame) => {
                    src.advance(FRAME_LEN);
                    self.frames += 1;
                    for finding in &frame.unknown {
                        debug!(device = %frame.identity, "{finding}");
                    }
                    return Ok(Some(frame));
                }
                Err(e) => {
                    debug!(error = %e, "rejecting frame candidate");
                    self.rejected += 1;
                    self.skipped_bytes += 1;
                    src.advance(1);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // a truncated trailing frame is not an error on this stream
                self.skipped_bytes += src.len() as u64;
                src.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENTED: &str = "55aa00040201000f01500101020501180100180000008c1975";

    fn from_hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn documented() -> [u8; FRAME_LEN] {
        from_hex(DOCUMENTED).try_into().unwrap()
    }

    #[test]
    fn decodes_documented_packet() {
        let frame = decode_frame(&documented()).unwrap();
        assert_eq!(frame.identity, DeviceIdentity::new(1, 2, 5));
        assert!(frame.report.power);
        assert_eq!(frame.report.target_temperature, Some(24));
        assert_eq!(frame.report.current_temperature, Some(24));
        assert_eq!(frame.report.mode, HvacMode::Cool);
        assert_eq!(frame.report.fan, FanSpeed::Auto);
        assert_eq!(frame.report.alarm_code, 0);
        assert!(frame.unknown.is_empty());
    }

    #[test]
    fn crc_matches_documented_tail() {
        let raw = documented();
        let crc = modbus_crc16(&raw[..23]);
        assert_eq!(crc, 0x7519);
        assert_eq!(crc.to_le_bytes(), [0x19, 0x75]);
        assert_eq!(&raw[23..], &crc.to_le_bytes());
    }

    #[test]
    fn header_mismatch() {
        let mut raw = documented();
        raw[2] = 0x01;
        assert_eq!(decode_frame(&raw), Err(FrameError::HeaderMismatch));
    }

    #[test]
    fn checksum_checked_before_crc() {
        let mut raw = documented();
        raw[8 + 14] = 0x00;
        assert_eq!(
            decode_frame(&raw),
            Err(FrameError::ChecksumInvalid {
                expected: 0x8c,
                actual: 0x00
            })
        );
    }

    #[test]
    fn crc_mismatch() {
        let mut raw = documented();
        raw[24] ^= 0xFF;
        assert!(matches!(
            decode_frame(&raw),
            Err(FrameError::CrcInvalid { expected: 0x7519, .. })
        ));
    }

    #[test]
    fn field_corruption_with_compensating_checksum_still_decodes() {
        let mut raw = documented();
        // target 24 -> 25, indoor-temp byte 24 -> 23: byte sum unchanged
        raw[8 + 7] = 25;
        raw[8 + 10] = 23;
        let crc = modbus_crc16(&raw[..23]);
        raw[23..].copy_from_slice(&crc.to_le_bytes());

        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.report.target_temperature, Some(25));
        assert_eq!(frame.report.current_temperature, Some(23));
    }

    #[test]
    fn unknown_mode_keeps_other_fields() {
        let id = DeviceIdentity::new(1, 1, 3);
        let report = StatusReport {
            power: true,
            mode: HvacMode::Unrecognized(3),
            fan: FanSpeed::High,
            target_temperature: Some(22),
            current_temperature: Some(27),
            alarm_code: 0,
        };
        let frame = decode_frame(&encode_frame(id, &report)).unwrap();
        assert_eq!(frame.identity, id);
        assert_eq!(frame.report, report);
        assert_eq!(
            frame.unknown,
            vec![FrameError::UnknownEnum {
                field: "mode",
                code: 3
            }]
        );
    }

    #[test]
    fn out_of_range_temperature_is_unknown() {
        let mut raw = documented();
        raw[8 + 10] = 40;
        raw[8 + 7] = 8;
        raw[8 + 14] = payload_checksum(&raw[8..23]);
        let crc = modbus_crc16(&raw[..23]);
        raw[23..].copy_from_slice(&crc.to_le_bytes());

        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.report.current_temperature, None);
        assert_eq!(frame.report.target_temperature, None);
    }

    #[test]
    fn encode_reproduces_documented_packet() {
        let decoded = decode_frame(&documented()).unwrap();
        assert_eq!(encode_frame(decoded.identity, &decoded.report), documented());
    }

    #[test]
    fn codec_resyncs_after_one_garbage_byte() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x55]);
        buf.extend_from_slice(&documented());

        let mut codec = StatusFrameCodec::new();
        let frame = codec.decode(&mut buf).unwrap().expect("one frame");
        assert_eq!(frame.identity, DeviceIdentity::new(1, 2, 5));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert_eq!(codec.frames(), 1);
        assert_eq!(codec.skipped_bytes(), 1);
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let raw = documented();
        let mut buf = BytesMut::from(&raw[..10]);
        let mut codec = StatusFrameCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);
        buf.extend_from_slice(&raw[10..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn codec_drops_one_byte_on_bad_candidate() {
        let mut corrupt = documented();
        corrupt[24] ^= 0x01;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&documented());

        let mut codec = StatusFrameCodec::new();
        let frame = codec.decode(&mut buf).unwrap().expect("second frame survives");
        assert_eq!(frame.identity, DeviceIdentity::new(1, 2, 5));
        assert_eq!(codec.rejected(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_keeps_partial_header_tail() {
        let mut buf = BytesMut::from(&[0x01, 0x02, 0x03, 0x55, 0xAA][..]);
        let mut codec = StatusFrameCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03, 0x55, 0xAA][..]);

        buf.extend_from_slice(&documented()[2..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame completes across reads");
        assert_eq!(frame.identity, DeviceIdentity::new(1, 2, 5));
    }
}
