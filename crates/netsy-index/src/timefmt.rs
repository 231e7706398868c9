//! Timestamp columns are stored as RFC 3339 text, matching what the file
//! format carries in its protobuf timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use prost_types::Timestamp;

pub fn to_text(ts: &Timestamp) -> String {
    let dt = DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH);
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn from_text(text: &str) -> Option<Timestamp> {
    let dt = DateTime::parse_from_rfc3339(text).ok()?;
    Some(Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    })
}

pub fn now() -> Timestamp {
    let now = Utc::now();
    Timestamp {
        seconds: now.timestamp(),
        nanos: now.timestamp_subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let ts = Timestamp {
            seconds: 1_700_000_000,
            nanos: 123_456_789,
        };
        let text = to_text(&ts);
        assert_eq!(from_text(&text), Some(ts));
    }

    #[test]
    fn test_from_text_rejects_garbage() {
        assert_eq!(from_text("not-a-timestamp"), None);
        assert_eq!(from_text(""), None);
    }
}
