//! Row merge rule shared by the stores.

use market_core::TimeSeriesRecord;

/// What an upsert does to one row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Merge {
    Insert(TimeSeriesRecord),
    Update(TimeSeriesRecord),
    Skip,
}

/// Merges `incoming` into the stored row with the same natural key.
///
/// Optional fields absent from `incoming` keep their stored value.
pub(crate) fn merge(stored: Option<&TimeSeriesRecord>, incoming: &TimeSeriesRecord) -> Merge {
    let Some(stored) = stored else {
        return Merge::Insert(incoming.clone());
    };

    let merged = TimeSeriesRecord {
        open: incoming.open.or(stored.open),
        high: incoming.high.or(stored.high),
        low: incoming.low.or(stored.low),
        volume: incoming.volume.or(stored.volume),
        adjusted_close: incoming.adjusted_close.or(stored.adjusted_close),
        change_pct: incoming.change_pct.or(stored.change_pct),
        ..incoming.clone()
    };

    if merged == *stored {
        Merge::Skip
    } else {
        Merge::Update(merged)
    }
}
