use crate::types::{Flag, Message};

/// Counts from one merge pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub evicted: usize,
    /// Deleted messages the server sent that we never admitted.
    pub skipped_deleted: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.evicted > 0
    }
}

/// The in-memory Inbox: unique UIDs, kept sorted ascending, never longer than
/// `bound` after a merge.
#[derive(Clone, Debug)]
pub struct MailboxCache {
    messages: Vec<Message>,
    bound: usize,
}

impl MailboxCache {
    pub fn new(bound: usize) -> Self {
        Self {
            messages: Vec::new(),
            bound: bound.max(1),
        }
    }

    /// Build from previously persisted messages, repairing order and
    /// duplicates (the later copy of a UID wins).
    pub fn from_messages(bound: usize, messages: Vec<Message>) -> Self {
        let mut cache = Self::new(bound);
        cache.merge(messages);
        cache
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sync cursor: highest UID held locally.
    pub fn max_uid(&self) -> Option<u32> {
        self.messages.last().map(|m| m.uid)
    }

    pub fn min_uid(&self) -> Option<u32> {
        self.messages.first().map(|m| m.uid)
    }

    /// All messages, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The newest `n` messages, oldest first.
    pub fn most_recent(&self, n: usize) -> &[Message] {
        let skip = self.messages.len().saturating_sub(n);
        &self.messages[skip..]
    }

    pub fn get(&self, uid: u32) -> Option<&Message> {
        self.position(uid).ok().map(|idx| &self.messages[idx])
    }

    /// What the message list shows: non-deleted, newest first.
    pub fn visible(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().rev().filter(|m| !m.is_deleted())
    }

    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_seen() && !m.is_deleted())
            .count()
    }

    /// Merge a fetched batch.
    ///
    /// Unknown UIDs are inserted unless the server already marks them
    /// deleted. Known UIDs take the server's flags when they differ; header
    /// and cached body are left alone.
    pub fn merge(&mut self, mut incoming: Vec<Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        incoming.sort_by_key(|m| m.uid);

        for msg in incoming {
            match self.position(msg.uid) {
                Ok(idx) => {
                    let local = &mut self.messages[idx];
                    if local.flags != msg.flags {
                        local.flags = msg.flags;
                        outcome.updated += 1;
                    }
                }
                Err(_) if msg.is_deleted() => outcome.skipped_deleted += 1,
                Err(idx) => {
                    self.messages.insert(idx, msg);
                    outcome.inserted += 1;
                }
            }
        }

        outcome.evicted = self.enforce_bound();
        outcome
    }

    pub fn add_flag(&mut self, uid: u32, flag: Flag) -> bool {
        match self.position(uid) {
            Ok(idx) => self.messages[idx].flags.insert(flag),
            Err(_) => false,
        }
    }

    pub fn set_body(&mut self, uid: u32, body: String) -> bool {
        match self.position(uid) {
            Ok(idx) => {
                self.messages[idx].body = Some(body);
                true
            }
            Err(_) => false,
        }
    }

    pub fn remove(&mut self, uid: u32) -> Option<Message> {
        self.position(uid).ok().map(|idx| self.messages.remove(idx))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn position(&self, uid: u32) -> Result<usize, usize> {
        self.messages.binary_search_by_key(&uid, |m| m.uid)
    }

    /// Drop the oldest UIDs until we fit.
    fn enforce_bound(&mut self) -> usize {
        let excess = self.messages.len().saturating_sub(self.bound);
        if excess > 0 {
            self.messages.drain(..excess);
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn msg(uid: u32, flags: &[Flag]) -> Message {
        let mut m = Message::new(uid).with_flags(flags.iter().cloned());
        m.header.subject = Some(format!("subject {uid}"));
        m
    }

    fn assert_unique_sorted(cache: &MailboxCache) {
        let uids: Vec<u32> = cache.messages().iter().map(|m| m.uid).collect();
        let unique: HashSet<u32> = uids.iter().copied().collect();
        assert_eq!(unique.len(), uids.len(), "duplicate uids: {uids:?}");
        assert!(uids.windows(2).all(|w| w[0] < w[1]), "unsorted: {uids:?}");
    }

    #[test]
    fn merge_inserts_new_messages_in_uid_order() {
        let mut cache = MailboxCache::new(200);
        let outcome = cache.merge(vec![msg(5, &[]), msg(2, &[]), msg(9, &[])]);
        assert_eq!(outcome.inserted, 3);
        assert_eq!(cache.min_uid(), Some(2));
        assert_eq!(cache.max_uid(), Some(9));
        assert_unique_sorted(&cache);
    }

    #[test]
    fn merge_never_duplicates_uids() {
        let mut cache = MailboxCache::new(200);
        cache.merge(vec![msg(1, &[]), msg(2, &[]), msg(3, &[])]);
        let outcome = cache.merge(vec![
            msg(2, &[Flag::Seen]),
            msg(3, &[]),
            msg(4, &[]),
            msg(4, &[Flag::Flagged]),
        ]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(cache.len(), 4);
        assert_unique_sorted(&cache);
        // last copy of a repeated uid wins
        assert!(cache.get(4).unwrap().flags.contains(&Flag::Flagged));
    }

    #[test]
    fn merge_updates_flags_but_keeps_header_and_body() {
        let mut cache = MailboxCache::new(200);
        cache.merge(vec![msg(7, &[])]);
        cache.set_body(7, "hello".into());

        let mut incoming = Message::new(7).with_flags([Flag::Seen]);
        incoming.header.subject = Some("changed".into());
        let outcome = cache.merge(vec![incoming]);

        assert_eq!(outcome.updated, 1);
        let local = cache.get(7).unwrap();
        assert!(local.is_seen());
        assert_eq!(local.header.subject.as_deref(), Some("subject 7"));
        assert_eq!(local.body.as_deref(), Some("hello"));
    }

    #[test]
    fn unchanged_flags_are_not_counted_as_updates() {
        let mut cache = MailboxCache::new(200);
        cache.merge(vec![msg(1, &[Flag::Seen])]);
        let outcome = cache.merge(vec![msg(1, &[Flag::Seen])]);
        assert!(!outcome.changed());
    }

    #[test]
    fn seen_message_turning_deleted_updates_in_place() {
        let mut cache = MailboxCache::new(200);
        cache.merge(vec![msg(10, &[Flag::Seen]), msg(11, &[])]);
        assert_eq!(cache.unread_count(), 1);

        let outcome = cache.merge(vec![msg(10, &[Flag::Seen, Flag::Deleted])]);
        assert_eq!(outcome.updated, 1);
        assert_eq!(cache.len(), 2);
        assert_unique_sorted(&cache);
        assert!(cache.get(10).unwrap().is_deleted());
        assert_eq!(cache.unread_count(), 1);
        assert!(cache.visible().all(|m| m.uid != 10));
    }

    #[test]
    fn unread_deleted_message_leaves_unread_count() {
        let mut cache = MailboxCache::new(200);
        cache.merge(vec![msg(1, &[]), msg(2, &[])]);
        assert_eq!(cache.unread_count(), 2);
        cache.merge(vec![msg(2, &[Flag::Deleted])]);
        assert_eq!(cache.unread_count(), 1);
    }

    #[test]
    fn deleted_messages_with_unknown_uids_are_never_admitted() {
        let mut cache = MailboxCache::new(200);
        let outcome = cache.merge(vec![msg(3, &[Flag::Deleted]), msg(4, &[])]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.skipped_deleted, 1);
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn bound_evicts_lowest_uids() {
        let mut cache = MailboxCache::new(200);
        cache.merge((1..=180).map(|uid| msg(uid, &[])).collect());
        let outcome = cache.merge((181..=230).map(|uid| msg(uid, &[])).collect());

        assert_eq!(outcome.inserted, 50);
        assert_eq!(outcome.evicted, 30);
        assert_eq!(cache.len(), 200);
        assert_eq!(cache.min_uid(), Some(31));
        assert_eq!(cache.max_uid(), Some(230));
    }

    #[test]
    fn bound_holds_across_many_merges() {
        let mut cache = MailboxCache::new(20);
        for round in 0..10u32 {
            let base = round * 7;
            cache.merge((base..base + 15).map(|uid| msg(uid + 1, &[])).collect());
            assert!(cache.len() <= cache.bound());
            assert_unique_sorted(&cache);
        }
    }

    #[test]
    fn from_messages_repairs_order_and_bound() {
        let cache = MailboxCache::from_messages(3, vec![msg(9, &[]), msg(1, &[]), msg(5, &[]), msg(7, &[])]);
        let uids: Vec<u32> = cache.messages().iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![5, 7, 9]);
    }

    #[test]
    fn visible_is_newest_first() {
        let mut cache = MailboxCache::new(10);
        cache.merge(vec![msg(1, &[]), msg(3, &[]), msg(2, &[])]);
        let uids: Vec<u32> = cache.visible().map(|m| m.uid).collect();
        assert_eq!(uids, vec![3, 2, 1]);
        assert_eq!(cache.most_recent(2).len(), 2);
        assert_eq!(cache.most_recent(2)[0].uid, 2);
    }
}
