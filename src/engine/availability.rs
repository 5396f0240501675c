use crate::model::TimeRange;

/// Merge sorted overlapping or touching ranges into disjoint ranges.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// Free windows of `open` once every `busy` range is taken out.
///
/// `busy` may be unsorted and may reach outside `open`.
pub fn free_windows(open: TimeRange, busy: &[TimeRange]) -> Vec<TimeRange> {
    let mut busy: Vec<TimeRange> = busy.iter().copied().filter(|b| b.overlaps(&open)).collect();
    busy.sort_by_key(|b| b.start);
    let busy = merge_overlapping(&busy);

    let mut free = Vec::new();
    let mut cursor = open.start;
    for b in &busy {
        if b.start > cursor {
            free.push(TimeRange::new(cursor, b.start));
        }
        cursor = cursor.max(b.end);
    }
    if cursor < open.end {
        free.push(TimeRange::new(cursor, open.end));
    }
    free
}
