//! Pure price-series arithmetic for snapshots.

use chrono::{DateTime, Duration, FixedOffset, Utc};

use super::PricePoint;

pub const WINDOW_1M_DAYS: i64 = 30;
pub const WINDOW_3M_DAYS: i64 = 90;
pub const WINDOW_6M_DAYS: i64 = 180;

pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

fn pct_change(from: f64, to: f64) -> Option<f64> {
    if from > 0.0 && from.is_finite() && to.is_finite() {
        Some((to - from) / from * 100.0)
    } else {
        None
    }
}

/// Close of the latest sample at or before `at`. Series must be time-ordered.
pub fn close_on_or_before(series: &[PricePoint], at: DateTime<Utc>) -> Option<f64> {
    series.iter().rev().find(|p| p.at <= at).map(|p| p.close)
}

/// Change from the close `window_days` before `now` to the latest close.
pub fn performance_pct(
    series: &[PricePoint],
    now: DateTime<Utc>,
    window_days: i64,
    precision: u32,
) -> Option<f64> {
    let current = series.last()?.close;
    let past = close_on_or_before(series, now - Duration::days(window_days))?;
    pct_change(past, current).map(|v| round_to(v, precision))
}

/// Daily reaction around an announcement.
///
/// Returns the close of the first trading day on or after the announcement
/// date, and the change from that close to the next trading day's close.
pub fn daily_reaction(
    daily: &[PricePoint],
    announced_at: DateTime<FixedOffset>,
    precision: u32,
) -> (Option<f64>, Option<f64>) {
    let offset = *announced_at.offset();
    let day = announced_at.date_naive();
    let mut on_or_after = daily
        .iter()
        .filter(|p| p.at.with_timezone(&offset).date_naive() >= day);
    let Some(first) = on_or_after.next() else {
        return (None, None);
    };
    let change = on_or_after
        .next()
        .and_then(|next| pct_change(first.close, next.close))
        .map(|v| round_to(v, precision));
    (Some(first.close), change)
}

/// Change from the first hourly sample at or after the announcement to the
/// first one at least an hour later.
pub fn hourly_reaction(
    hourly: &[PricePoint],
    announced_at: DateTime<FixedOffset>,
    precision: u32,
) -> Option<f64> {
    let start = announced_at.with_timezone(&Utc);
    let base = hourly.iter().find(|p| p.at >= start)?;
    let after = hourly
        .iter()
        .find(|p| p.at >= start + Duration::hours(1) && p.at > base.at)?;
    pct_change(base.close, after.close).map(|v| round_to(v, precision))
}
