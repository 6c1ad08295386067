//! Alert Normalization
//!
//! Turns client-supplied alerts, whose start and end times may be missing,
//! into canonical alerts under the resolve-timeout policy.

use crate::alert::{Alert, PostableAlert};
use chrono::{DateTime, Duration, Utc};

/// How long an alert without an explicit end stays firing without updates
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::minutes(5);

/// Normalize one postable alert against `now`.
///
/// - `updated_at` is always `now`.
/// - Missing start: `now`, or the client's end time when only the end was
///   given (start never exceeds end).
/// - Missing end: `now + resolve_timeout` with `timeout` set, saturating at
///   the latest representable time.
pub fn normalize(alert: PostableAlert, now: DateTime<Utc>, resolve_timeout: Duration) -> Alert {
    let starts_at = match (alert.starts_at, alert.ends_at) {
        (Some(starts_at), _) => starts_at,
        (None, Some(ends_at)) => ends_at,
        (None, None) => now,
    };

    let (ends_at, timeout) = match alert.ends_at {
        Some(ends_at) => (ends_at, false),
        None => {
            let ends_at = now
                .checked_add_signed(resolve_timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            (ends_at, true)
        }
    };

    Alert {
        labels: alert.labels,
        annotations: alert.annotations,
        starts_at,
        ends_at,
        generator_url: alert.generator_url,
        updated_at: now,
        timeout,
    }
}

/// Normalize a batch, sharing a single `now` across all alerts
pub fn normalize_batch(
    alerts: impl IntoIterator<Item = PostableAlert>,
    now: DateTime<Utc>,
    resolve_timeout: Duration,
) -> Vec<Alert> {
    alerts
        .into_iter()
        .map(|a| normalize(a, now, resolve_timeout))
        .collect()
}
