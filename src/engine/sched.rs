// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use crate::models::Eid;

pub type TimerToken = u64;

/// What to do when a timer fires. Entries referencing transactions carry
/// the generation they were armed against, so a token outliving its owner
/// is ignored instead of acting on a recycled id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    Retransmit {
        trans: u16,
        generation: u64,
        oseqno: u8,
    },
    Autokill {
        trans: u16,
        generation: u64,
    },
    RequestDeadline {
        request: u64,
    },
    Register {
        peer: Eid,
    },
    RegisterExpire {
        peer: Eid,
    },
    Qualify {
        peer: Eid,
    },
    SecretCheck,
}

/// The network loop's timer wheel: a monotonic heap of deadlines with
/// cancellable entries. Cancelled tokens stay in the heap and are skipped
/// lazily when they surface.
#[derive(Debug, Default)]
pub struct Sched {
    heap: BinaryHeap<Reverse<(Instant, TimerToken)>>,
    entries: HashMap<TimerToken, TimerKind>,
    next_token: TimerToken,
}

impl Sched {
    pub fn schedule(&mut self, after: Duration, kind: TimerKind) -> TimerToken {
        self.next_token += 1;
        let token = self.next_token;
        self.heap.push(Reverse((Instant::now() + after, token)));
        self.entries.insert(token, kind);
        token
    }

    pub fn cancel(&mut self, token: TimerToken) {
        self.entries.remove(&token);
    }

    /// The next live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, token))) = self.heap.peek().copied() {
            if self.entries.contains_key(&token) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerToken, TimerKind)> {
        let mut due = Vec::new();
        while let Some(Reverse((at, token))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(kind) = self.entries.remove(&token) {
                due.push((token, kind));
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
