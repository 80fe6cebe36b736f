// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use bitflags::bitflags;
use bytes::Bytes;

use crate::{crypto::SessionCipher, engine::sched::TimerToken, models::Eid};

/// Retransmissions attempted before a packet gives up.
pub const DEFAULT_RETRANS: u8 = 5;
/// Baseline retransmission interval, ms, also the upper clamp.
pub const DEFAULT_RETRANS_TIMER_MS: u64 = 1000;
/// Lower clamp for the RTT-adaptive retransmission interval, ms.
pub const MIN_RETRANS_TIMER_MS: u64 = 150;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TransFlags: u16 {
        /// Registration request dialog.
        const IS_REG       = 1 << 0;
        /// Marked for reaping.
        const DEAD         = 1 << 1;
        /// Our final frame has been sent.
        const FINAL        = 1 << 2;
        /// Qualify (NULL ping) dialog.
        const IS_QUAL      = 1 << 3;
        /// Session key negotiated, payloads travel inside ENCRYPT.
        const ENCRYPT      = 1 << 4;
        /// Next encrypted frame must carry the full wrapped key.
        const SEND_FULLKEY = 1 << 5;
        /// Record timing history when this dialog closes.
        const STORE_HIST   = 1 << 6;
    }
}

/// One outbound frame awaiting acknowledgement.
#[derive(Debug)]
pub struct TxPacket {
    pub oseqno: u8,
    /// The datagram exactly as transmitted; retries resend these bytes.
    pub buf: Bytes,
    pub retries_left: u8,
    pub retrans_timer: TimerToken,
}

/// One two-endpoint conversation, identified by our 16-bit transaction id.
#[derive(Debug)]
pub struct Transaction {
    /// Our transaction id (`strans` on the wire).
    pub id: u16,
    /// Distinguishes this incarnation from a later reuse of the id.
    pub generation: u64,
    pub addr: SocketAddr,
    pub us_eid: Eid,
    pub them_eid: Eid,
    /// Their transaction id; zero until their first frame teaches it.
    pub dtrans: u16,
    /// Next expected incoming sequence number.
    pub iseqno: u8,
    /// The previous incoming sequence number, for duplicate detection.
    pub oiseqno: u8,
    /// Next outgoing sequence number.
    pub oseqno: u8,
    /// Sequence number of the last ACK we produced.
    pub aseqno: u8,
    pub flags: TransFlags,
    /// Remaining hop budget for queries driven by this transaction.
    pub ttl: u16,
    pub retrans_timer_ms: u64,
    /// 0 disables the autokill deadline.
    pub autokill_ms: u64,
    pub autokill_timer: Option<TimerToken>,
    pub packets: Vec<TxPacket>,
    /// The most recently acknowledged frame, kept across the handling of
    /// one inbound frame so an ENCREJ can rebuild it with the full key.
    pub lasttrans: Option<Bytes>,
    /// Loop-avoidance stack carried on queries.
    pub eids: Vec<Eid>,
    /// Owning request, if any.
    pub parent: Option<u64>,
    /// Session contexts once a key is active for this dialog.
    pub cipher: Option<SessionCipher>,
    pub start: Instant,
}

impl Transaction {
    pub fn new(id: u16, generation: u64, addr: SocketAddr) -> Self {
        Transaction {
            id,
            generation,
            addr,
            us_eid: Eid::zero(),
            them_eid: Eid::zero(),
            dtrans: 0,
            iseqno: 0,
            oiseqno: 0,
            oseqno: 0,
            aseqno: 0,
            flags: TransFlags::empty(),
            ttl: 0,
            retrans_timer_ms: DEFAULT_RETRANS_TIMER_MS,
            autokill_ms: 0,
            autokill_timer: None,
            packets: Vec::new(),
            lasttrans: None,
            eids: Vec::new(),
            parent: None,
            cipher: None,
            start: Instant::now(),
        }
    }

    /// Rewinds the dialog onto a fresh id for an ENCREJ re-key: zeroed
    /// sequence state, FINAL cleared, pending frames dropped, everything
    /// else retained. Stale retransmit timers miss on the old id and die.
    pub fn reset(&mut self, new_id: u16) {
        self.id = new_id;
        self.dtrans = 0;
        self.iseqno = 0;
        self.oiseqno = 0;
        self.oseqno = 0;
        self.aseqno = 0;
        self.packets.clear();
        self.lasttrans = None;
        self.flags.remove(TransFlags::FINAL);
    }
}

/// Transaction table keyed by our id. Ids are random in `1..=32766` and
/// never collide with a live dialog.
#[derive(Debug, Default)]
pub struct TransactionTable {
    map: HashMap<u16, Transaction>,
    next_generation: u64,
}

impl TransactionTable {
    /// Draws an unused transaction id from a random start position.
    pub fn alloc_id(&self) -> Option<u16> {
        let start = rand::random_range(1..=32766u16);
        let mut tid = start;
        loop {
            if !self.map.contains_key(&tid) {
                return Some(tid);
            }
            tid = tid % 32766 + 1;
            if tid == start {
                return None;
            }
        }
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn insert(&mut self, trans: Transaction) {
        self.map.insert(trans.id, trans);
    }

    pub fn remove(&mut self, id: u16) -> Option<Transaction> {
        self.map.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&Transaction> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Transaction> {
        self.map.get_mut(&id)
    }

    /// Looks up a transaction checked against its generation, shielding
    /// worker completions from id reuse.
    pub fn get_mut_gen(&mut self, id: u16, generation: u64) -> Option<&mut Transaction> {
        self.map
            .get_mut(&id)
            .filter(|t| t.generation == generation)
    }

    /// Re-keys a live transaction under a fresh id (ENCREJ recovery).
    pub fn rekey(&mut self, old_id: u16, new_id: u16) {
        if let Some(mut trans) = self.map.remove(&old_id) {
            trans.reset(new_id);
            self.map.insert(new_id, trans);
        }
    }

    /// Finds the dialog an inbound frame belongs to: same remote address
    /// and either their destination id names ours, or (before they have
    /// learned our id) their source id names theirs.
    pub fn find_for_frame(
        &mut self,
        addr: SocketAddr,
        strans: u16,
        dtrans: u16,
    ) -> Option<&mut Transaction> {
        let id = self
            .map
            .values()
            .find(|t| {
                t.addr == addr
                    && (t.id == dtrans || (t.dtrans == strans && dtrans == 0))
            })
            .map(|t| t.id)?;
        let trans = self.map.get_mut(&id)?;
        if strans != 0 {
            trans.dtrans = strans;
        }
        Some(trans)
    }

    pub fn ids(&self) -> Vec<u16> {
        self.map.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Introspection snapshot of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionSummary {
    pub addr: SocketAddr,
    pub strans: u16,
    pub dtrans: u16,
    pub oseqno: u8,
    pub iseqno: u8,
    pub aseqno: u8,
}
