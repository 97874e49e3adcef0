// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event bus.
//!
//! Everything observable in the executive flows through here as an
//! [`EventRecord`]: one retained ring holds recent history for replay,
//! and each subscription keeps a bounded, filtered queue with explicit
//! loss accounting. Sequence numbers are global and monotonic, so any
//! subscription's delivered stream is strictly increasing even though it
//! only sees a filtered subset.
//!
//! Back-pressure is cooperative: a subscriber acks the highest seq it
//! has handled, and once the un-acked window fills, `drain` stops
//! handing out events. The queue keeps absorbing with drop-oldest, so a
//! stalled client loses history instead of stalling the executive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use hsx_abi::Pid;
use seqring::SeqRing;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TraceStep,
    DebugBreak,
    TaskState,
    MailboxWait,
    MailboxWake,
    MailboxTimeout,
    WatchUpdate,
    Stdout,
    Stderr,
    Scheduler,
    Log,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    /// Executive tick at emission.
    pub ts: u64,
    pub kind: EventKind,
    pub pid: Option<Pid>,
    pub data: serde_json::Value,
}

/// Subscription filters; `None` means "everything".
#[derive(Clone, Debug, Default)]
pub struct Filters {
    pub pids: Option<Vec<Pid>>,
    pub kinds: Option<Vec<EventKind>>,
}

impl Filters {
    fn matches(&self, ev: &EventRecord) -> bool {
        if let Some(pids) = &self.pids {
            match ev.pid {
                Some(pid) if pids.contains(&pid) => {}
                _ => return false,
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct Subscription {
    filters: Filters,
    queue: VecDeque<Arc<EventRecord>>,
    depth: usize,
    dropped: u64,
    /// Seqs handed out by `drain` but not yet acked; its length is the
    /// open window.
    in_flight: Vec<u64>,
    window: usize,
}

/// Per-subscription health, for diagnostics.
#[derive(Copy, Clone, Debug, Serialize)]
pub struct SubscriptionStats {
    pub queued: usize,
    pub dropped: u64,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct EventBus {
    retained: SeqRing<Arc<EventRecord>>,
    subs: HashMap<u64, Subscription>,
    next_sub: u64,
    sub_depth: usize,
    window: usize,
}

impl EventBus {
    pub fn new(retained: usize, sub_depth: usize, window: usize) -> Self {
        EventBus {
            retained: SeqRing::new(retained),
            subs: HashMap::new(),
            next_sub: 1,
            sub_depth,
            window,
        }
    }

    /// Emits an event, fanning it into every matching subscription.
    /// Returns the assigned global seq.
    pub fn emit(
        &mut self,
        ts: u64,
        kind: EventKind,
        pid: Option<Pid>,
        data: serde_json::Value,
    ) -> u64 {
        let seq = self.retained.next_seq();
        let record = Arc::new(EventRecord { seq, ts, kind, pid, data });
        let assigned = self.retained.push(record.clone());
        debug_assert_eq!(assigned, seq);
        for sub in self.subs.values_mut() {
            if !sub.filters.matches(&record) {
                continue;
            }
            if sub.queue.len() == sub.depth {
                sub.queue.pop_front();
                sub.dropped += 1;
            }
            sub.queue.push_back(record.clone());
        }
        seq
    }

    /// Creates a subscription. With `since_seq`, retained history from
    /// that point is replayed into the queue; the returned flag is true
    /// when part of that history has already fallen off the ring.
    pub fn subscribe(
        &mut self,
        filters: Filters,
        since_seq: Option<u64>,
    ) -> (u64, bool) {
        let id = self.next_sub;
        self.next_sub += 1;
        let mut sub = Subscription {
            filters,
            queue: VecDeque::new(),
            depth: self.sub_depth,
            dropped: 0,
            in_flight: Vec::new(),
            window: self.window,
        };
        let mut gap = false;
        if let Some(since) = since_seq {
            let earliest =
                self.retained.earliest_seq().unwrap_or(self.retained.next_seq());
            gap = since < earliest;
            for (_, record) in self.retained.iter_from(since) {
                if sub.filters.matches(record) {
                    if sub.queue.len() == sub.depth {
                        sub.queue.pop_front();
                        sub.dropped += 1;
                    }
                    sub.queue.push_back(record.clone());
                }
            }
        }
        self.subs.insert(id, sub);
        (id, gap)
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subs.remove(&id).is_some()
    }

    /// Acknowledges receipt of everything up to and including `seq`.
    pub fn ack(&mut self, id: u64, seq: u64) -> bool {
        match self.subs.get_mut(&id) {
            Some(sub) => {
                sub.in_flight.retain(|&s| s > seq);
                true
            }
            None => false,
        }
    }

    /// Hands out up to `max` queued events, stopping early when the
    /// un-acked window is exhausted.
    pub fn drain(&mut self, id: u64, max: usize) -> Vec<Arc<EventRecord>> {
        let Some(sub) = self.subs.get_mut(&id) else {
            return Vec::new();
        };
        let open = sub.window.saturating_sub(sub.in_flight.len());
        let take = open.min(max).min(sub.queue.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            let record = sub.queue.pop_front().unwrap();
            sub.in_flight.push(record.seq);
            out.push(record);
        }
        out
    }

    pub fn stats(&self, id: u64) -> Option<SubscriptionStats> {
        self.subs.get(&id).map(|s| SubscriptionStats {
            queued: s.queue.len(),
            dropped: s.dropped,
            in_flight: s.in_flight.len(),
        })
    }

    /// True when some subscription has deliverable events (used by the
    /// server to decide whether to pump).
    pub fn any_pending(&self) -> bool {
        self.subs.values().any(|s| {
            !s.queue.is_empty() && s.in_flight.len() < s.window
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(16, 4, 8)
    }

    fn emit_n(bus: &mut EventBus, n: u64, kind: EventKind, pid: u32) {
        for i in 0..n {
            bus.emit(i, kind, Some(Pid(pid)), serde_json::json!({ "i": i }));
        }
    }

    #[test]
    fn seqs_are_global_and_monotonic() {
        let mut bus = bus();
        assert_eq!(bus.emit(0, EventKind::Scheduler, None, serde_json::Value::Null), 0);
        assert_eq!(bus.emit(0, EventKind::Log, None, serde_json::Value::Null), 1);
    }

    #[test]
    fn filters_select_pid_and_kind() {
        let mut bus = bus();
        let (id, _) = bus.subscribe(
            Filters {
                pids: Some(vec![Pid(1)]),
                kinds: Some(vec![EventKind::Stdout]),
            },
            None,
        );
        emit_n(&mut bus, 1, EventKind::Stdout, 1); // match
        emit_n(&mut bus, 1, EventKind::Stdout, 2); // wrong pid
        emit_n(&mut bus, 1, EventKind::Stderr, 1); // wrong kind
        bus.emit(0, EventKind::Scheduler, None, serde_json::Value::Null);
        let got = bus.drain(id, 16);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, EventKind::Stdout);
        assert_eq!(got[0].pid, Some(Pid(1)));
    }

    #[test]
    fn delivered_seqs_increase_within_a_subscription() {
        let mut bus = bus();
        let (id, _) = bus.subscribe(Filters::default(), None);
        emit_n(&mut bus, 4, EventKind::Scheduler, 1);
        let got = bus.drain(id, 16);
        let seqs: Vec<u64> = got.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn queue_overflow_drops_oldest_and_counts() {
        let mut bus = bus(); // depth 4
        let (id, _) = bus.subscribe(Filters::default(), None);
        emit_n(&mut bus, 6, EventKind::Scheduler, 1);
        let stats = bus.stats(id).unwrap();
        assert_eq!(stats.queued, 4);
        assert_eq!(stats.dropped, 2);
        let got = bus.drain(id, 16);
        assert_eq!(got.first().unwrap().seq, 2);
    }

    #[test]
    fn window_throttles_until_ack() {
        let mut bus = EventBus::new(64, 64, 4);
        let (id, _) = bus.subscribe(Filters::default(), None);
        emit_n(&mut bus, 10, EventKind::Scheduler, 1);
        assert_eq!(bus.drain(id, 16).len(), 4);
        // Window exhausted; nothing more until an ack.
        assert_eq!(bus.drain(id, 16).len(), 0);
        assert!(bus.ack(id, 3));
        let got = bus.drain(id, 16);
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].seq, 4);
    }

    #[test]
    fn since_seq_replays_and_reports_gaps() {
        let mut bus = EventBus::new(4, 16, 16);
        emit_n(&mut bus, 8, EventKind::Scheduler, 1); // seqs 0..7, ring keeps 4..7
        let (id, gap) = bus.subscribe(Filters::default(), Some(2));
        assert!(gap);
        let got = bus.drain(id, 16);
        assert_eq!(got.first().unwrap().seq, 4);
        // A subscribe from within the retained range has no gap.
        let (id2, gap2) = bus.subscribe(Filters::default(), Some(6));
        assert!(!gap2);
        assert_eq!(bus.drain(id2, 16).len(), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = bus();
        let (id, _) = bus.subscribe(Filters::default(), None);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        emit_n(&mut bus, 1, EventKind::Scheduler, 1);
        assert!(bus.drain(id, 16).is_empty());
    }
}
