//! A set of tools for working with the sea_orm date/time types.

use std::time::Duration;

use sea_orm::prelude::TimeDateTime;
use time::OffsetDateTime;

/// Convert from a unix timestamp in seconds to a TimeDateTime object.
/// Timestamps outside of the representable range are clamped to the epoch.
pub fn from_unix_timestamp_s(timestamp: u64) -> TimeDateTime {
    let offset = i64::try_from(timestamp)
        .ok()
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    TimeDateTime::new(offset.date(), offset.time())
}

/// Get the current time as a sql date time object
pub fn now() -> TimeDateTime {
    let offset = OffsetDateTime::now_utc();
    TimeDateTime::new(offset.date(), offset.time())
}

/// `now() - age`, saturating at the epoch.
pub fn ago(age: Duration) -> TimeDateTime {
    let now = OffsetDateTime::now_utc();
    let then = time::Duration::try_from(age)
        .ok()
        .and_then(|age| now.checked_sub(age))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    TimeDateTime::new(then.date(), then.time())
}
