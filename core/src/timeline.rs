/// Message timeline: merges optimistic local sends with server-delivered frames
///
/// Entries are append-only. Reconciling an optimistic entry with its echo
/// flips its delivery state in place, so the rendered order never jumps.
use crate::negotiation_types::{ChatMessage, MessageKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Delivery state of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Appended locally, server echo not seen yet
    Optimistic,
    /// Seen on the channel (echo or genuinely inbound)
    Confirmed,
    /// Local send that never left the client
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub delivery: Delivery,
}

/// What a merge did to the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// New entry at the tail
    Appended,
    /// Existing optimistic entry confirmed in place
    Confirmed,
    /// Already present; nothing changed
    Duplicate,
}

impl Reconciled {
    pub fn changed(self) -> bool {
        !matches!(self, Reconciled::Duplicate)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    index: HashMap<MessageKey, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from server history; history entries are confirmed by definition
    pub fn from_history(history: impl IntoIterator<Item = ChatMessage>) -> Self {
        let mut timeline = Self::new();
        for message in history {
            timeline.merge_inbound(message);
        }
        timeline
    }

    /// Insert a locally originated message at the tail, marked optimistic.
    ///
    /// If the echo overtook the local append, the existing entry already
    /// represents this message and is left as is.
    pub fn append_local(&mut self, message: ChatMessage) -> Reconciled {
        let key = message.key();
        if self.index.contains_key(&key) {
            debug!("Local message already on timeline (echo arrived first)");
            return Reconciled::Duplicate;
        }
        self.push(key, message, Delivery::Optimistic);
        Reconciled::Appended
    }

    /// Merge a server-delivered message.
    ///
    /// A key match against an optimistic entry is the server's confirmation
    /// of that entry; any other key match is a duplicate frame.
    pub fn merge_inbound(&mut self, message: ChatMessage) -> Reconciled {
        let key = message.key();
        match self.index.get(&key) {
            Some(&pos) => {
                let entry = &mut self.entries[pos];
                match entry.delivery {
                    Delivery::Confirmed => Reconciled::Duplicate,
                    // An echo of a send we flagged as failed means it went out after all
                    Delivery::Optimistic | Delivery::Failed => {
                        entry.delivery = Delivery::Confirmed;
                        Reconciled::Confirmed
                    }
                }
            }
            None => {
                self.push(key, message, Delivery::Confirmed);
                Reconciled::Appended
            }
        }
    }

    /// Flag a local send that could not be transmitted
    pub fn mark_failed(&mut self, key: &MessageKey) -> bool {
        match self.index.get(key) {
            Some(&pos) if self.entries[pos].delivery == Delivery::Optimistic => {
                self.entries[pos].delivery = Delivery::Failed;
                true
            }
            _ => false,
        }
    }

    /// Flag every send still waiting for its echo; the channel carrying them is gone
    pub fn fail_pending(&mut self) -> usize {
        let mut failed = 0;
        for entry in &mut self.entries {
            if entry.delivery == Delivery::Optimistic {
                entry.delivery = Delivery::Failed;
                failed += 1;
            }
        }
        if failed > 0 {
            debug!("{} pending sends flagged as failed", failed);
        }
        failed
    }

    pub fn get(&self, key: &MessageKey) -> Option<&TimelineEntry> {
        self.index.get(key).map(|&pos| &self.entries[pos])
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Owned copy for the presentation layer
    pub fn snapshot(&self) -> Vec<TimelineEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of local sends still waiting for their echo
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.delivery == Delivery::Optimistic)
            .count()
    }

    fn push(&mut self, key: MessageKey, message: ChatMessage, delivery: Delivery) {
        self.index.insert(key, self.entries.len());
        self.entries.push(TimelineEntry { message, delivery });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation_types::SessionId;
    use chrono::{Duration, TimeZone, Utc};

    fn msg(sender: &str, content: &str, offset_ms: i64) -> ChatMessage {
        ChatMessage {
            session_id: SessionId::new("s1"),
            sender: sender.to_string(),
            content: content.to_string(),
            sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + Duration::milliseconds(offset_ms),
        }
    }

    fn contents(timeline: &Timeline) -> Vec<&str> {
        timeline
            .entries()
            .iter()
            .map(|e| e.message.content.as_str())
            .collect()
    }

    #[test]
    fn test_local_then_echo_yields_one_entry() {
        let mut timeline = Timeline::new();
        let hello = msg("ana", "Hello", 0);

        assert_eq!(timeline.append_local(hello.clone()), Reconciled::Appended);
        assert_eq!(timeline.entries()[0].delivery, Delivery::Optimistic);

        assert_eq!(timeline.merge_inbound(hello.clone()), Reconciled::Confirmed);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].message, hello);
        assert_eq!(timeline.entries()[0].delivery, Delivery::Confirmed);
    }

    #[test]
    fn test_echo_before_local_append_yields_one_entry() {
        let mut timeline = Timeline::new();
        let hello = msg("ana", "Hello", 0);

        assert_eq!(timeline.merge_inbound(hello.clone()), Reconciled::Appended);
        assert_eq!(timeline.append_local(hello), Reconciled::Duplicate);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].delivery, Delivery::Confirmed);
    }

    #[test]
    fn test_repeated_echo_is_duplicate() {
        let mut timeline = Timeline::new();
        let hi = msg("bia", "Hi", 5);

        assert_eq!(timeline.merge_inbound(hi.clone()), Reconciled::Appended);
        assert_eq!(timeline.merge_inbound(hi.clone()), Reconciled::Duplicate);
        assert!(!Reconciled::Duplicate.changed());
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_same_text_different_time_is_distinct() {
        let mut timeline = Timeline::new();
        timeline.append_local(msg("ana", "ok", 0));
        timeline.append_local(msg("ana", "ok", 1));
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_confirmation_keeps_position() {
        let mut timeline = Timeline::new();
        let hello = msg("ana", "Hello", 0);
        timeline.append_local(hello.clone());
        timeline.merge_inbound(msg("bia", "Hi", 10));
        timeline.merge_inbound(msg("bia", "Which edition?", 20));

        // Late echo of the first message must not move it to the tail
        timeline.merge_inbound(hello);
        assert_eq!(contents(&timeline), vec!["Hello", "Hi", "Which edition?"]);
        assert_eq!(timeline.pending_count(), 0);
    }

    #[test]
    fn test_inbound_order_is_preserved() {
        let mut timeline = Timeline::new();
        timeline.append_local(msg("ana", "first", 0));
        let settled: Vec<_> = timeline.snapshot();

        for i in 0..5 {
            timeline.merge_inbound(msg("bia", &format!("in-{}", i), 100 - i));
        }

        // Arrival order, not timestamp order
        assert_eq!(
            contents(&timeline),
            vec!["first", "in-0", "in-1", "in-2", "in-3", "in-4"]
        );
        assert_eq!(timeline.entries()[0], settled[0]);
    }

    #[test]
    fn test_fail_pending_flags_only_unconfirmed() {
        let mut timeline = Timeline::new();
        let confirmed = msg("ana", "arrived", 0);
        timeline.append_local(confirmed.clone());
        timeline.merge_inbound(confirmed.clone());
        timeline.append_local(msg("ana", "queued", 1));
        timeline.append_local(msg("ana", "also queued", 2));
        timeline.merge_inbound(msg("bia", "Hi", 3));

        assert_eq!(timeline.fail_pending(), 2);
        assert_eq!(timeline.pending_count(), 0);
        assert_eq!(timeline.get(&confirmed.key()).unwrap().delivery, Delivery::Confirmed);
        assert_eq!(timeline.entries()[1].delivery, Delivery::Failed);
        assert_eq!(timeline.fail_pending(), 0);

        // A later echo (e.g. from re-fetched history) still confirms it in place
        assert_eq!(timeline.merge_inbound(msg("ana", "queued", 1)), Reconciled::Confirmed);
        assert_eq!(contents(&timeline), vec!["arrived", "queued", "also queued", "Hi"]);
    }

    #[test]
    fn test_failed_send_is_not_shown_as_delivered() {
        let mut timeline = Timeline::new();
        let lost = msg("ana", "lost", 0);
        timeline.append_local(lost.clone());

        assert!(timeline.mark_failed(&lost.key()));
        assert_eq!(timeline.get(&lost.key()).unwrap().delivery, Delivery::Failed);

        // Confirmed entries cannot be flagged
        let hi = msg("bia", "Hi", 1);
        timeline.merge_inbound(hi.clone());
        assert!(!timeline.mark_failed(&hi.key()));
    }

    #[test]
    fn test_history_is_deduplicated() {
        let a = msg("ana", "Hello", 0);
        let b = msg("bia", "Hi", 1);
        let timeline = Timeline::from_history(vec![a.clone(), b, a]);
        assert_eq!(timeline.len(), 2);
        assert!(timeline
            .entries()
            .iter()
            .all(|e| e.delivery == Delivery::Confirmed));
    }
}
