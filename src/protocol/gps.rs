//! GPS timing packet framing.
//!
//! Packet layout (big-endian payload):
//!
//! | bytes | content                        |
//! |-------|--------------------------------|
//! | 3     | prefix `10 8F AB`              |
//! | 4     | time of week, seconds (`u32`)  |
//! | 2     | week number (`u16`)            |
//! | 2     | UTC offset, seconds (`i16`)    |
//! | 8     | latitude, degrees (`f64`)      |
//! | 8     | longitude, degrees (`f64`)     |
//! | 8     | altitude, metres (`f64`)       |
//! | 2     | suffix `10 03`                 |
//!
//! A packet whose suffix does not match is reported as corrupted and only its
//! first prefix byte is skipped, so the next packet is found by rescanning.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

pub const GPS_PREFIX: [u8; 3] = [0x10, 0x8F, 0xAB];
pub const GPS_SUFFIX: [u8; 2] = [0x10, 0x03];
const PAYLOAD_LEN: usize = 32;
pub const GPS_PACKET_LEN: usize = GPS_PREFIX.len() + PAYLOAD_LEN + GPS_SUFFIX.len();

const SECONDS_PER_WEEK: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub time_of_week: u32,
    pub week: u16,
    pub utc_offset: i16,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GpsFix {
    // UTC instant of the fix: GPS epoch + week/time-of-week - leap seconds.
    pub fn utc_time(&self) -> Option<DateTime<Utc>> {
        let epoch = NaiveDate::from_ymd_opt(1980, 1, 6)?
            .and_hms_opt(0, 0, 0)?
            .and_utc();
        let gps_seconds = i64::from(self.week) * SECONDS_PER_WEEK + i64::from(self.time_of_week)
            - i64::from(self.utc_offset);
        epoch.checked_add_signed(TimeDelta::try_seconds(gps_seconds)?)
    }

    // Serialise into a framed packet, as the receiver sends it.
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(GPS_PACKET_LEN);
        packet.extend_from_slice(&GPS_PREFIX);
        packet.extend_from_slice(&self.time_of_week.to_be_bytes());
        packet.extend_from_slice(&self.week.to_be_bytes());
        packet.extend_from_slice(&self.utc_offset.to_be_bytes());
        packet.extend_from_slice(&self.latitude.to_be_bytes());
        packet.extend_from_slice(&self.longitude.to_be_bytes());
        packet.extend_from_slice(&self.altitude.to_be_bytes());
        packet.extend_from_slice(&GPS_SUFFIX);
        packet
    }

    fn from_payload(payload: &[u8]) -> Result<Self> {
        let fix = Self {
            time_of_week: u32::from_be_bytes(be_array(payload, 0)),
            week: u16::from_be_bytes(be_array(payload, 4)),
            utc_offset: i16::from_be_bytes(be_array(payload, 6)),
            latitude: f64::from_be_bytes(be_array(payload, 8)),
            longitude: f64::from_be_bytes(be_array(payload, 16)),
            altitude: f64::from_be_bytes(be_array(payload, 24)),
        };
        if u64::from(fix.time_of_week) >= SECONDS_PER_WEEK as u64 {
            return Err(Error::Parse(format!(
                "time of week {} s exceeds one week",
                fix.time_of_week
            )));
        }
        if !(-90.0..=90.0).contains(&fix.latitude)
            || !(-180.0..=180.0).contains(&fix.longitude)
            || !fix.altitude.is_finite()
        {
            return Err(Error::Parse(format!(
                "position out of range: lat={} lon={} alt={}",
                fix.latitude, fix.longitude, fix.altitude
            )));
        }
        Ok(fix)
    }
}

fn be_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

// Incremental decoder fed with arbitrary chunks of serial bytes.
#[derive(Debug, Default)]
pub struct GpsDecoder {
    buffer: Vec<u8>,
}

impl GpsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    // Next complete packet, `None` when more bytes are needed.
    pub fn next_packet(&mut self) -> Option<Result<GpsFix>> {
        let Some(start) = find(&self.buffer, &GPS_PREFIX) else {
            // Keep a possible partial prefix at the tail.
            let keep = (GPS_PREFIX.len() - 1).min(self.buffer.len());
            if keep < self.buffer.len() {
                self.buffer.drain(..self.buffer.len() - keep);
            }
            return None;
        };
        if start > 0 {
            self.buffer.drain(..start);
        }
        if self.buffer.len() < GPS_PACKET_LEN {
            return None;
        }

        let suffix = &self.buffer[GPS_PACKET_LEN - GPS_SUFFIX.len()..GPS_PACKET_LEN];
        if suffix != GPS_SUFFIX {
            let err = Error::Parse(format!(
                "corrupted packet: expected suffix {:02X} {:02X}, got {:02X} {:02X}",
                GPS_SUFFIX[0], GPS_SUFFIX[1], suffix[0], suffix[1]
            ));
            // Length can't be trusted, skip only the first prefix byte.
            self.buffer.drain(..1);
            return Some(Err(err));
        }

        let payload = &self.buffer[GPS_PREFIX.len()..GPS_PREFIX.len() + PAYLOAD_LEN];
        let result = GpsFix::from_payload(payload);
        self.buffer.drain(..GPS_PACKET_LEN);
        Some(result)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix(tow: u32) -> GpsFix {
        GpsFix {
            time_of_week: tow,
            week: 2304,
            utc_offset: 18,
            latitude: 45.0333,
            longitude: 38.9833,
            altitude: 27.5,
        }
    }

    fn drain(decoder: &mut GpsDecoder) -> Vec<Result<GpsFix>> {
        std::iter::from_fn(|| decoder.next_packet()).collect()
    }

    #[test]
    fn decodes_packet_after_leading_noise() {
        let mut decoder = GpsDecoder::new();
        decoder.push(&[0x00, 0x42, 0x10]);
        decoder.push(&fix(100).to_packet());

        let out = drain(&mut decoder);
        assert_eq!(out.len(), 1);
        assert_eq!(*out[0].as_ref().unwrap(), fix(100));
        assert_eq!(decoder.buffer.len(), 0);
    }

    #[test]
    fn waits_for_split_packet() {
        let packet = fix(7).to_packet();
        let mut decoder = GpsDecoder::new();
        decoder.push(&packet[..20]);
        assert!(decoder.next_packet().is_none());
        decoder.push(&packet[20..]);
        assert_eq!(decoder.next_packet().unwrap().unwrap(), fix(7));
    }

    #[test]
    fn corrupted_suffix_is_reported_and_stream_stays_aligned() {
        let mut corrupted = fix(2).to_packet();
        let last = corrupted.len() - 1;
        corrupted[last] = 0x04;

        let mut stream = fix(1).to_packet();
        stream.extend_from_slice(&corrupted);
        stream.extend_from_slice(&fix(3).to_packet());

        let mut decoder = GpsDecoder::new();
        decoder.push(&stream);
        let out = drain(&mut decoder);

        assert_eq!(out.len(), 3);
        assert_eq!(*out[0].as_ref().unwrap(), fix(1));
        let err = out[1].as_ref().unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("corrupted packet"));
        assert_eq!(*out[2].as_ref().unwrap(), fix(3));
    }

    #[test]
    fn truncated_packet_does_not_swallow_the_next_one() {
        let truncated = &fix(1).to_packet()[..20];
        let mut stream = truncated.to_vec();
        stream.extend_from_slice(&fix(9).to_packet());

        let mut decoder = GpsDecoder::new();
        decoder.push(&stream);
        let fixes: Vec<GpsFix> = drain(&mut decoder).into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(fixes, vec![fix(9)]);
    }

    #[test]
    fn out_of_range_position_is_a_parse_error() {
        let mut bad = fix(5);
        bad.latitude = 123.0;
        let mut decoder = GpsDecoder::new();
        decoder.push(&bad.to_packet());
        decoder.push(&fix(6).to_packet());

        assert!(matches!(decoder.next_packet(), Some(Err(Error::Parse(_)))));
        assert_eq!(decoder.next_packet().unwrap().unwrap(), fix(6));
    }

    #[test]
    fn noise_without_prefix_is_discarded() {
        let mut decoder = GpsDecoder::new();
        decoder.push(&[0x55; 100]);
        assert!(decoder.next_packet().is_none());
        assert!(decoder.buffer.len() < GPS_PREFIX.len());
    }

    #[test]
    fn utc_time_applies_leap_seconds() {
        let fix = GpsFix {
            time_of_week: 18,
            week: 0,
            utc_offset: 18,
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
        };
        assert_eq!(
            fix.utc_time(),
            Some(Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap())
        );
    }
}
