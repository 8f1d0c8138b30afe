//! Gap detection over trading-day sequences.
//!
//! These helpers are pure: they take the trading days of a request and the
//! dates already stored, and work out what must be fetched and how to split
//! it into adapter calls.

use chrono::NaiveDate;
use market_core::DateRange;
use std::collections::BTreeSet;

/// A run of missing trading days fetched with one adapter call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchChunk {
    /// Calendar range passed to the source, `first..=last` missing day.
    pub range: DateRange,
    /// The missing trading days this chunk covers.
    pub dates: Vec<NaiveDate>,
}

/// Returns the trading days absent from `present`, ascending.
///
/// `revalidate` is always reported missing when it is one of the trading
/// days, even if stored.
#[must_use]
pub fn missing_dates(
    trading_days: &[NaiveDate],
    present: &BTreeSet<NaiveDate>,
    revalidate: Option<NaiveDate>,
) -> Vec<NaiveDate> {
    let mut missing: Vec<NaiveDate> = trading_days
        .iter()
        .copied()
        .filter(|d| !present.contains(d) || Some(*d) == revalidate)
        .collect();
    missing.sort_unstable();
    missing.dedup();
    missing
}

/// Collapses sorted dates into ranges of consecutive calendar days.
#[must_use]
pub fn collapse_ranges(dates: &[NaiveDate]) -> Vec<DateRange> {
    let mut ranges = Vec::new();
    let mut iter = dates.iter().copied();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let (mut start, mut end) = (first, first);
    for date in iter {
        if end.succ_opt() == Some(date) {
            end = date;
        } else {
            ranges.push(DateRange::spanning(start, end));
            start = date;
            end = date;
        }
    }
    ranges.push(DateRange::spanning(start, end));
    ranges
}

/// Splits `missing` into chunks.
///
/// When one request may cover every missing day, the result is a single
/// chunk from the first to the last missing day; stored days inside it are
/// fetched again and dropped by the caller. Otherwise a chunk holds missing
/// days that are adjacent in `trading_days`, so a weekend inside a run does
/// not break it, and spans at most `max_days` calendar days.
#[must_use]
pub fn plan_chunks(
    trading_days: &[NaiveDate],
    missing: &[NaiveDate],
    max_days: usize,
) -> Vec<FetchChunk> {
    let max_days = max_days.max(1);
    let missing: BTreeSet<NaiveDate> = missing.iter().copied().collect();

    if let (Some(first), Some(last)) = (missing.first(), missing.last()) {
        if span_days(*first, *last) <= max_days {
            return vec![FetchChunk {
                range: DateRange::spanning(*first, *last),
                dates: missing.into_iter().collect(),
            }];
        }
    }

    let mut chunks = Vec::new();
    let mut current: Vec<NaiveDate> = Vec::new();

    for day in trading_days {
        if !missing.contains(day) {
            flush(&mut current, &mut chunks);
            continue;
        }
        let fits = current
            .first()
            .is_none_or(|first| span_days(*first, *day) <= max_days);
        if !fits {
            flush(&mut current, &mut chunks);
        }
        current.push(*day);
    }
    flush(&mut current, &mut chunks);
    chunks
}

fn span_days(first: NaiveDate, last: NaiveDate) -> usize {
    usize::try_from((last - first).num_days() + 1).unwrap_or(usize::MAX)
}

fn flush(current: &mut Vec<NaiveDate>, chunks: &mut Vec<FetchChunk>) {
    if let (Some(first), Some(last)) = (current.first(), current.last()) {
        chunks.push(FetchChunk {
            range: DateRange::spanning(*first, *last),
            dates: std::mem::take(current),
        });
    }
}
