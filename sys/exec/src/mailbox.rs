// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mailbox descriptor table.
//!
//! This module is deliberately free of task bookkeeping: operations act
//! on descriptors and report *who should be woken* as lists of pids; the
//! scheduler applies those transitions and performs the register/buffer
//! write-back. That split keeps every mailbox rule testable without
//! standing up an executive.
//!
//! Delivery policy per descriptor mode:
//!
//! - default: one queue, first RECV consumes, remaining subscribers see
//!   nothing; overflow returns `Full`.
//! - `FANOUT`: per-subscriber cursors; a message is retained until every
//!   non-tap subscriber has consumed it (or it is forced out by
//!   overflow policy).
//! - `FANOUT_DROP`: overflow discards the oldest retained message and
//!   counts an overrun.
//! - `FANOUT_BLOCK`: overflow suspends the sender until space frees.
//! - `TAP` subscribers get a private bounded copy queue filled at SEND
//!   time; they never affect retention.

use std::collections::{HashMap, VecDeque};

use hsx_abi::{MailboxStatus, ModeFlags, Namespace, Pid};
use indexmap::IndexMap;

/// A subscriber is one open handle on a descriptor.
pub type SubId = (Pid, u32);

/// Host-side helpers act as this pseudo-subscriber.
pub const HOST_SUB: SubId = (Pid::HOST, 0);

/// Bound on a tap's private copy queue, in messages.
const TAP_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub seq: u64,
    pub src_pid: Pid,
    pub channel: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
}

/// Descriptor identity: `(namespace, name, owner)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DescKey {
    pub ns: Namespace,
    pub name: String,
    pub owner: Option<Pid>,
}

#[derive(Debug)]
struct Subscriber {
    id: SubId,
    /// Next sequence number this subscriber will read (fan-out mode).
    cursor: u64,
    /// Tap subscribers read from a private copy queue instead.
    tap_queue: Option<VecDeque<Message>>,
}

#[derive(Debug)]
pub struct Descriptor {
    pub id: u32,
    pub key: DescKey,
    pub capacity: u32,
    pub mode: ModeFlags,
    queue: VecDeque<Message>,
    bytes_used: u32,
    pub head_seq: u64,
    pub next_seq: u64,
    subscribers: Vec<Subscriber>,
    /// Tasks blocked in RECV, FIFO.
    pub recv_waiters: VecDeque<Pid>,
    /// Tasks blocked in SEND (FANOUT_BLOCK), FIFO.
    pub send_waiters: VecDeque<Pid>,
    pub overruns: u64,
}

/// Result of a successful enqueue: the assigned seq plus the waiters the
/// scheduler should now wake, in FIFO order.
#[derive(Debug, Default)]
pub struct Delivery {
    pub seq: u64,
    pub wake_recv: Vec<Pid>,
}

impl Descriptor {
    fn new(id: u32, key: DescKey, capacity: u32, mode: ModeFlags) -> Self {
        Descriptor {
            id,
            key,
            capacity,
            mode,
            queue: VecDeque::new(),
            bytes_used: 0,
            head_seq: 0,
            next_seq: 0,
            subscribers: Vec::new(),
            recv_waiters: VecDeque::new(),
            send_waiters: VecDeque::new(),
            overruns: 0,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|s| s.tap_queue.is_none()).count()
    }

    pub fn tap_count(&self) -> usize {
        self.subscribers.iter().filter(|s| s.tap_queue.is_some()).count()
    }

    fn fanout(&self) -> bool {
        self.mode.contains(ModeFlags::FANOUT)
    }

    fn subscriber(&mut self, sub: SubId) -> Option<&mut Subscriber> {
        self.subscribers.iter_mut().find(|s| s.id == sub)
    }

    /// Discards fully-consumed head messages (fan-out mode).
    fn gc_consumed(&mut self) {
        while let Some(front) = self.queue.front() {
            let consumed = self
                .subscribers
                .iter()
                .filter(|s| s.tap_queue.is_none())
                .all(|s| s.cursor > front.seq);
            // With no consuming subscribers at all, retain: someone may
            // still open the descriptor and drain it.
            if !consumed || self.subscriber_count() == 0 {
                break;
            }
            let msg = self.queue.pop_front().unwrap();
            self.bytes_used -= msg.payload.len() as u32;
            self.head_seq = msg.seq + 1;
        }
    }

    /// Forces out the oldest retained message (drop-oldest overflow).
    fn drop_oldest(&mut self) -> bool {
        if let Some(msg) = self.queue.pop_front() {
            self.bytes_used -= msg.payload.len() as u32;
            self.head_seq = msg.seq + 1;
            self.overruns += 1;
            true
        } else {
            false
        }
    }
}

/// What SEND wants the scheduler to do.
#[derive(Debug)]
pub enum SendOutcome {
    Sent(Delivery),
    /// Descriptor full under a non-blocking policy.
    Full,
    /// FANOUT_BLOCK overflow: suspend the sender. The payload comes
    /// back so the caller can stash it in the task's wait key.
    BlockSender { payload: Vec<u8> },
}

#[derive(Debug)]
pub struct MailboxTable {
    descs: IndexMap<u32, Descriptor>,
    by_key: HashMap<DescKey, u32>,
    next_id: u32,
}

impl MailboxTable {
    pub fn new() -> Self {
        MailboxTable {
            descs: IndexMap::new(),
            by_key: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, id: u32) -> Option<&Descriptor> {
        self.descs.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Descriptor> {
        self.descs.get_mut(&id)
    }

    pub fn lookup(&self, key: &DescKey) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    /// Iterates descriptors in creation order (stable snapshot order).
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.descs.values()
    }

    /// Creates a descriptor, or updates capacity/mode if the key already
    /// exists (BIND semantics). Returns the descriptor id.
    pub fn bind(&mut self, key: DescKey, capacity: u32, mode: ModeFlags) -> u32 {
        if let Some(&id) = self.by_key.get(&key) {
            let desc = self.descs.get_mut(&id).unwrap();
            desc.capacity = capacity;
            desc.mode = mode;
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_key.insert(key.clone(), id);
        self.descs.insert(id, Descriptor::new(id, key, capacity, mode));
        id
    }

    /// Registers `sub` as a subscriber (or tap) of `id`. New fan-out
    /// subscribers start at the current tail: they see messages sent
    /// after they arrived, not the backlog addressed to others.
    pub fn subscribe(&mut self, id: u32, sub: SubId, tap: bool) {
        let desc = self.descs.get_mut(&id).expect("subscribe to dead descriptor");
        if desc.subscriber(sub).is_some() {
            return;
        }
        let cursor = desc.next_seq;
        desc.subscribers.push(Subscriber {
            id: sub,
            cursor,
            tap_queue: tap.then(VecDeque::new),
        });
    }

    /// Removes a subscriber. Outstanding fan-out copies addressed to it
    /// are dropped immediately; fully-consumed messages are reclaimed.
    pub fn unsubscribe(&mut self, id: u32, sub: SubId) {
        if let Some(desc) = self.descs.get_mut(&id) {
            desc.subscribers.retain(|s| s.id != sub);
            desc.recv_waiters.retain(|&p| p != sub.0);
            desc.send_waiters.retain(|&p| p != sub.0);
            if desc.fanout() {
                desc.gc_consumed();
            }
        }
    }

    /// Toggles tap mode for an existing subscriber.
    pub fn set_tap(&mut self, id: u32, sub: SubId, on: bool) -> bool {
        let Some(desc) = self.descs.get_mut(&id) else {
            return false;
        };
        let fanout = desc.mode.contains(ModeFlags::FANOUT);
        let tail = desc.next_seq;
        let Some(s) = desc.subscriber(sub) else { return false };
        match (on, s.tap_queue.is_some()) {
            (true, false) => s.tap_queue = Some(VecDeque::new()),
            (false, true) => {
                s.tap_queue = None;
                s.cursor = tail;
            }
            _ => {}
        }
        if fanout {
            desc.gc_consumed();
        }
        true
    }

    /// Enqueues a message. On success the returned [`Delivery`] lists
    /// the RECV waiters to wake, FIFO; for fan-out, every waiter that
    /// has not yet consumed this seq.
    pub fn send(
        &mut self,
        id: u32,
        src_pid: Pid,
        channel: u32,
        flags: u32,
        payload: Vec<u8>,
    ) -> SendOutcome {
        let Some(desc) = self.descs.get_mut(&id) else {
            return SendOutcome::Full; // caller validates; defensive
        };
        let len = payload.len() as u32;
        if len > desc.capacity {
            return SendOutcome::Full;
        }
        while desc.bytes_used + len > desc.capacity {
            if desc.mode.contains(ModeFlags::FANOUT_BLOCK) {
                return SendOutcome::BlockSender { payload };
            }
            if desc.mode.contains(ModeFlags::FANOUT_DROP) {
                if !desc.drop_oldest() {
                    return SendOutcome::Full;
                }
                continue;
            }
            return SendOutcome::Full;
        }

        let seq = desc.next_seq;
        desc.next_seq += 1;
        let msg = Message { seq, src_pid, channel, flags, payload };

        // Taps get their copy regardless of consumption policy.
        for s in desc.subscribers.iter_mut() {
            if let Some(q) = s.tap_queue.as_mut() {
                if q.len() == TAP_QUEUE_DEPTH {
                    q.pop_front();
                }
                q.push_back(msg.clone());
            }
        }

        desc.bytes_used += len;
        desc.queue.push_back(msg);

        let wake_recv = if desc.fanout() {
            desc.recv_waiters.drain(..).collect()
        } else {
            desc.recv_waiters.pop_front().into_iter().collect()
        };
        SendOutcome::Sent(Delivery { seq, wake_recv })
    }

    /// Dequeues the next message for `sub` per the descriptor's policy.
    pub fn recv(&mut self, id: u32, sub: SubId) -> Option<Message> {
        let desc = self.descs.get_mut(&id)?;
        // Tap subscribers read their private copies.
        if let Some(s) = desc.subscriber(sub) {
            if let Some(q) = s.tap_queue.as_mut() {
                return q.pop_front();
            }
        }
        if desc.fanout() {
            let cursor = desc.subscriber(sub)?.cursor;
            let msg = desc.queue.iter().find(|m| m.seq >= cursor)?.clone();
            desc.subscriber(sub)?.cursor = msg.seq + 1;
            desc.gc_consumed();
            Some(msg)
        } else {
            let msg = desc.queue.pop_front()?;
            desc.bytes_used -= msg.payload.len() as u32;
            desc.head_seq = msg.seq + 1;
            Some(msg)
        }
    }

    /// Next message metadata for `sub` without consuming.
    pub fn peek(&self, id: u32, sub: SubId) -> Option<Message> {
        let desc = self.descs.get(&id)?;
        if let Some(s) = desc.subscribers.iter().find(|s| s.id == sub) {
            if let Some(q) = s.tap_queue.as_ref() {
                return q.front().cloned();
            }
            if desc.fanout() {
                return desc
                    .queue
                    .iter()
                    .find(|m| m.seq >= s.cursor)
                    .cloned();
            }
        }
        desc.queue.front().cloned()
    }

    /// Senders to wake now that space may have freed on `id`, FIFO.
    pub fn pending_send_wakes(&mut self, id: u32) -> Vec<Pid> {
        let Some(desc) = self.descs.get_mut(&id) else { return vec![] };
        if desc.send_waiters.is_empty()
            || desc.bytes_used >= desc.capacity
        {
            return vec![];
        }
        desc.send_waiters.drain(..).collect()
    }

    /// Reclaims an auto-created global app descriptor once its last
    /// subscriber is gone (the "transient" rule).
    pub fn maybe_reclaim(&mut self, id: u32) {
        let Some(desc) = self.descs.get(&id) else { return };
        let transient =
            desc.key.ns == Namespace::App && desc.key.owner.is_none();
        if transient
            && desc.subscribers.is_empty()
            && desc.recv_waiters.is_empty()
            && desc.send_waiters.is_empty()
        {
            let key = desc.key.clone();
            self.descs.shift_remove(&id);
            self.by_key.remove(&key);
        }
    }

    /// Removes every descriptor owned by a dead task that has no
    /// remaining subscribers, and detaches the dead task from the rest.
    /// Returns the reclaimed descriptor ids.
    pub fn reap_pid(&mut self, pid: Pid) -> Vec<u32> {
        let ids: Vec<u32> = self.descs.keys().copied().collect();
        let mut reclaimed = Vec::new();
        for id in ids {
            let desc = self.descs.get_mut(&id).unwrap();
            desc.subscribers.retain(|s| s.id.0 != pid);
            desc.recv_waiters.retain(|&p| p != pid);
            desc.send_waiters.retain(|&p| p != pid);
            if desc.fanout() {
                desc.gc_consumed();
            }
            if desc.key.owner == Some(pid) && desc.subscribers.is_empty() {
                let key = desc.key.clone();
                self.descs.shift_remove(&id);
                self.by_key.remove(&key);
                reclaimed.push(id);
            }
        }
        reclaimed
    }
}

/// Parses a mailbox target string against the caller's pid.
///
/// Grammar: `pid:<n>` | `svc:<name>[@<pid>]` | `app:<name>[@<pid>]` |
/// `shared:<name>` | `<name>` (defaults to `svc:`).
pub fn parse_target(s: &str, caller: Pid) -> Result<DescKey, MailboxStatus> {
    let (ns, rest) = match s.split_once(':') {
        Some(("pid", rest)) => {
            let n: u32 =
                rest.parse().map_err(|_| MailboxStatus::NoDescriptor)?;
            return Ok(DescKey {
                ns: Namespace::Pid,
                name: format!("pid:{n}"),
                owner: Some(Pid(n)),
            });
        }
        Some(("svc", rest)) => (Namespace::Svc, rest),
        Some(("app", rest)) => (Namespace::App, rest),
        Some(("shared", rest)) => (Namespace::Shared, rest),
        Some(_) => return Err(MailboxStatus::NoDescriptor),
        None => (Namespace::Svc, s),
    };
    if rest.is_empty() {
        return Err(MailboxStatus::NoDescriptor);
    }
    let (name, owner) = match rest.split_once('@') {
        Some((name, owner)) => {
            let n: u32 =
                owner.parse().map_err(|_| MailboxStatus::NoDescriptor)?;
            (name, Some(Pid(n)))
        }
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(MailboxStatus::NoDescriptor);
    }
    let owner = match ns {
        Namespace::Svc => owner.or(Some(caller)),
        Namespace::App => owner,
        Namespace::Shared => None,
        Namespace::Pid => unreachable!(),
    };
    Ok(DescKey { ns, name: name.to_string(), owner })
}

/// May `caller` create a descriptor under `key`?
pub fn may_create(key: &DescKey, caller: Pid) -> bool {
    match key.ns {
        // A task may only create its own pid/svc entries.
        Namespace::Pid | Namespace::Svc => key.owner == Some(caller),
        // Global app names are first-come; owned ones need the owner.
        Namespace::App => key.owner.is_none() || key.owner == Some(caller),
        Namespace::Shared => true,
    }
}
