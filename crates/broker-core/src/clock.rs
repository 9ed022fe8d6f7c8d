use chrono::{DateTime, NaiveDateTime, Utc};

/// Source of "now" for the engine and the store. All time arithmetic goes
/// through this so tests can pin the clock.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(i64),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn fixed(epoch_secs: i64) -> Self {
        Clock::Fixed(epoch_secs)
    }

    pub fn now_epoch(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp(),
            Clock::Fixed(epoch) => *epoch,
        }
    }

    pub fn now_datetime(&self) -> NaiveDateTime {
        datetime_from_epoch(self.now_epoch())
    }
}

pub fn datetime_from_epoch(epoch_secs: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH.naive_utc())
}

/// Accepts the timestamp encodings clients actually send: epoch seconds as a
/// JSON number, or an ISO-8601 / `YYYY-MM-DD HH:MM:SS` string.
pub fn parse_datetime(value: &serde_json::Value) -> Option<NaiveDateTime> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(datetime_from_epoch),
        serde_json::Value::String(raw) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
                return Some(dt.naive_utc());
            }
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
                .ok()
        }
        _ => None,
    }
}
