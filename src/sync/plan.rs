//! UID range planning. Pure functions, no I/O.

use crate::types::UidRange;

/// Range of new UIDs above the local cursor, capped at `batch`.
///
/// `None` when the server's next UID is not ahead of `local_max + 1`.
pub fn plan_delta(local_max: u32, uid_next: u32, batch: u32) -> Option<UidRange> {
    let start = local_max.checked_add(1)?;
    if uid_next <= start || batch == 0 {
        return None;
    }
    let len = batch.min(uid_next - start);
    Some(UidRange::new(start, start + len - 1))
}

/// Most recent `batch` UIDs for a cold cache.
///
/// The range ends at `uid_next` itself; the server simply returns nothing for
/// a UID that has not been assigned yet.
pub fn plan_recent(uid_next: u32, batch: u32) -> Option<UidRange> {
    if uid_next <= 1 || batch == 0 {
        return None;
    }
    let len = batch.min(uid_next);
    Some(UidRange::new(uid_next - len + 1, uid_next))
}

/// Delta when we hold messages, most-recent batch when we hold none.
pub fn plan_fetch(local_max: Option<u32>, uid_next: u32, batch: u32) -> Option<UidRange> {
    match local_max {
        Some(max) => plan_delta(max, uid_next, batch),
        None => plan_recent(uid_next, batch),
    }
}

/// "Load more": up to `count` UIDs directly below the oldest cached one.
pub fn plan_older(first_uid: Option<u32>, count: u32) -> Option<UidRange> {
    let first = first_uid?;
    if first <= 1 || count == 0 {
        return None;
    }
    let end = first - 1;
    let start = first.saturating_sub(count).max(1);
    Some(UidRange::new(start, end))
}

/// Sequence-number window for browsing a folder we do not cache by UID.
pub fn plan_latest_numbers(message_count: u32, count: u32) -> Option<UidRange> {
    if message_count == 0 || count == 0 {
        return None;
    }
    let start = message_count.saturating_sub(count - 1).max(1);
    Some(UidRange::new(start, message_count))
}
