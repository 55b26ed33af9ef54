//! Day windows and canonical-day arithmetic.
//!
//! Routes carry a fixed UTC offset. A target day maps to the half-open
//! UTC interval `[local midnight, next local midnight)`, and a candidate's
//! canonical day is the receipt instant seen in the route's offset.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

use crate::error::PipelineError;

/// Zone names accepted as aliases for a fixed offset (none observe DST).
const FIXED_ZONES: &[(&str, i32)] = &[
    ("utc", 0),
    ("etc/utc", 0),
    ("gmt", 0),
    ("africa/johannesburg", 2 * 3600),
    ("africa/harare", 2 * 3600),
    ("africa/maputo", 2 * 3600),
    ("africa/gaborone", 2 * 3600),
    ("africa/lagos", 3600),
    ("africa/nairobi", 3 * 3600),
    ("sast", 2 * 3600),
];

/// UTC+02:00, the reference offset for default target days.
pub fn south_africa_offset() -> FixedOffset {
    FixedOffset::east_opt(2 * 3600).unwrap_or_else(|| Utc.fix())
}

/// Parse `+02:00`, `+0200`, `-05`, `UTC+2`, `Z`, or a known fixed-offset zone name.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    if s == "z" {
        return FixedOffset::east_opt(0);
    }
    if let Some((_, secs)) = FIXED_ZONES.iter().find(|(name, _)| *name == s) {
        return FixedOffset::east_opt(*secs);
    }

    let body = s
        .strip_prefix("utc")
        .or_else(|| s.strip_prefix("gmt"))
        .unwrap_or(&s);
    let (sign, digits) = match body.chars().next()? {
        '+' => (1, &body[1..]),
        '-' => (-1, &body[1..]),
        _ => return None,
    };
    if !digits.is_ascii() {
        return None;
    }

    let (hours, minutes) = if let Some((h, m)) = digits.split_once(':') {
        (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?)
    } else if digits.len() == 4 {
        (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?)
    } else if (1..=2).contains(&digits.len()) {
        (digits.parse::<i32>().ok()?, 0)
    } else {
        return None;
    };

    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Parse a `YYYY-MM-DD` target day.
pub fn parse_day(raw: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| PipelineError::InvalidDay(format!("'{raw}': {e}")))
}

/// The local calendar day of `ts` in `offset`.
pub fn canonical_day(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

/// "Yesterday" as seen in `offset` at instant `now`.
pub fn default_target_day(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    let today = canonical_day(now, offset);
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

/// Half-open UTC interval covering one local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub day: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    pub fn for_day(day: NaiveDate, offset: FixedOffset) -> Self {
        let shift = chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
        let local_midnight = day.and_time(NaiveTime::MIN);
        let start = (local_midnight - shift).and_utc();
        let end = start + chrono::Duration::days(1);
        Self { day, start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}
