//! Sequence allocation and response correlation.
//!
//! The correlator hands out sequence ids and remembers, for every id that has
//! a call waiting on it, where the response should go. Pending entries live in
//! [`SHARD_COUNT`] independently locked maps so unrelated calls do not contend.
//!
//! ```text
//! begin() ──► seq 42, PendingCall ──────────────► wait() ◄──┐
//!                                                           │ oneshot
//! read loop ──► Packet{seq: 42} ──► resolve(42, packet) ────┘
//! ```
//!
//! Each registration also gets a unique call id. Removal on timeout goes
//! through [`Correlator::deregister`], which only removes the entry if it
//! still belongs to the same call, so a caller that gave up can never evict a
//! newer call that was handed the same seq after wraparound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, SeqlinkError};
use crate::protocol::Packet;

/// Number of independently locked shards.
pub const SHARD_COUNT: usize = 10;

/// Upper bound on ids tried by [`Correlator::begin`] before giving up.
const MAX_ALLOCATION_ATTEMPTS: u64 = 1024;

/// Identity of one registration, distinct across seq reuse.
pub type CallId = u64;

struct PendingEntry {
    call_id: CallId,
    slot: oneshot::Sender<Packet>,
}

type Shard = Mutex<HashMap<i32, PendingEntry>>;

/// Maps in-flight sequence ids to their result slots.
pub struct Correlator {
    max_seq: i32,
    counter: AtomicU64,
    next_call_id: AtomicU64,
    shards: Box<[Shard]>,
}

impl Correlator {
    /// Create a correlator issuing ids in `[0, max_seq)`.
    ///
    /// A non-positive `max_seq` is treated as 1.
    pub fn new(max_seq: i32) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            max_seq: max_seq.max(1),
            counter: AtomicU64::new(0),
            next_call_id: AtomicU64::new(1),
            shards,
        }
    }

    /// Exclusive upper bound of issued ids.
    pub fn max_seq(&self) -> i32 {
        self.max_seq
    }

    /// Next id in the cyclic sequence. The first id issued is 1.
    ///
    /// Ids wrap modulo `max_seq` and are never negative. Uniqueness among
    /// pending calls is enforced by [`Correlator::register`], not here.
    pub fn next_seq(&self) -> i32 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        (n % self.max_seq as u64) as i32
    }

    #[inline]
    fn shard(&self, seq: i32) -> &Shard {
        &self.shards[seq.unsigned_abs() as usize % SHARD_COUNT]
    }

    /// Attach `slot` to `seq`.
    ///
    /// Returns `None` (dropping `slot`) if `seq` already has a pending call.
    pub fn register(&self, seq: i32, slot: oneshot::Sender<Packet>) -> Option<CallId> {
        let mut shard = self.shard(seq).lock();
        if shard.contains_key(&seq) {
            return None;
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        shard.insert(seq, PendingEntry { call_id, slot });
        Some(call_id)
    }

    /// Allocate a free id and register a new pending call on it.
    ///
    /// Ids still held by older calls are skipped. Fails with
    /// [`SeqlinkError::SeqExhausted`] if no free id turns up.
    pub fn begin(&self) -> Result<PendingCall> {
        let attempts = (self.max_seq as u64).min(MAX_ALLOCATION_ATTEMPTS);

        for _ in 0..attempts {
            let seq = self.next_seq();
            let (tx, rx) = oneshot::channel();
            if let Some(call_id) = self.register(seq, tx) {
                return Ok(PendingCall { seq, call_id, rx });
            }
        }

        Err(SeqlinkError::SeqExhausted)
    }

    /// Deliver `packet` to the call pending on `seq`.
    ///
    /// Returns `false` if nothing was pending; the packet is dropped. The
    /// entry is removed either way, so a second response for the same id is
    /// also a no-op.
    pub fn resolve(&self, seq: i32, packet: Packet) -> bool {
        let entry = self.shard(seq).lock().remove(&seq);
        match entry {
            // A dropped receiver means the caller already gave up.
            Some(entry) => entry.slot.send(packet).is_ok(),
            None => false,
        }
    }

    /// Remove the entry for `seq` if it still belongs to `call_id`.
    pub fn deregister(&self, seq: i32, call_id: CallId) -> bool {
        let mut shard = self.shard(seq).lock();
        match shard.get(&seq) {
            Some(entry) if entry.call_id == call_id => {
                shard.remove(&seq);
                true
            }
            _ => false,
        }
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("max_seq", &self.max_seq)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A registered call waiting for its response.
#[derive(Debug)]
pub struct PendingCall {
    seq: i32,
    call_id: CallId,
    rx: oneshot::Receiver<Packet>,
}

impl PendingCall {
    /// Sequence id the request must carry.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Registration identity, for [`Correlator::deregister`].
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Wait for the response.
    ///
    /// Fails with [`SeqlinkError::CallAbandoned`] if the entry was removed
    /// without a value.
    pub async fn wait(self) -> Result<Packet> {
        let seq = self.seq;
        self.rx.await.map_err(|_| SeqlinkError::CallAbandoned(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_next_seq_starts_at_one_and_wraps() {
        let correlator = Correlator::new(3);
        let ids: Vec<i32> = (0..6).map(|_| correlator.next_seq()).collect();
        assert_eq!(ids, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_register_refuses_occupied_seq() {
        let correlator = Correlator::new(100);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        assert!(correlator.register(5, tx1).is_some());
        assert!(correlator.register(5, tx2).is_none());
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_delivers_exactly_once() {
        let correlator = Correlator::new(100);
        let call = correlator.begin().unwrap();
        let seq = call.seq();

        assert!(correlator.resolve(seq, Packet::with_seq(seq, "first")));
        assert!(!correlator.resolve(seq, Packet::with_seq(seq, "second")));

        let packet = call.wait().await.unwrap();
        assert_eq!(packet.payload(), b"first");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_seq_is_noop() {
        let correlator = Correlator::new(100);
        assert!(!correlator.resolve(77, Packet::with_seq(77, "stray")));
    }

    #[tokio::test]
    async fn test_deregister_abandons_call() {
        let correlator = Correlator::new(100);
        let call = correlator.begin().unwrap();

        assert!(correlator.deregister(call.seq(), call.call_id()));
        let seq = call.seq();
        assert!(matches!(call.wait().await, Err(SeqlinkError::CallAbandoned(s)) if s == seq));
    }

    #[test]
    fn test_stale_deregister_keeps_newer_call() {
        let correlator = Correlator::new(1);
        let old = correlator.begin().unwrap();
        let (seq, old_id) = (old.seq(), old.call_id());

        // the old caller times out and is removed, then the id is reused
        assert!(correlator.deregister(seq, old_id));
        let newer = correlator.begin().unwrap();
        assert_eq!(newer.seq(), seq);

        // a late duplicate removal from the old caller must not evict it
        assert!(!correlator.deregister(seq, old_id));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_begin_skips_occupied_ids() {
        let correlator = Correlator::new(4);
        let calls: Vec<_> = (0..4).map(|_| correlator.begin().unwrap()).collect();

        let seqs: HashSet<i32> = calls.iter().map(|c| c.seq()).collect();
        assert_eq!(seqs.len(), 4);

        assert!(matches!(correlator.begin(), Err(SeqlinkError::SeqExhausted)));
    }

    #[test]
    fn test_concurrent_begin_yields_unique_ids() {
        let correlator = Arc::new(Correlator::new(1_000_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let correlator = correlator.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| correlator.begin().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seqs = HashSet::new();
        let mut calls = Vec::new();
        for handle in handles {
            for call in handle.join().unwrap() {
                assert!(seqs.insert(call.seq()));
                calls.push(call);
            }
        }

        assert_eq!(seqs.len(), 4000);
        assert_eq!(correlator.pending_count(), 4000);
    }

    #[test]
    fn test_concurrent_next_seq_yields_distinct_ids() {
        let correlator = Arc::new(Correlator::new(1_000_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let correlator = correlator.clone();
                std::thread::spawn(move || {
                    (0..500).map(|_| correlator.next_seq()).collect::<Vec<_>>()
                })
            })
            .collect();

        let seqs: HashSet<i32> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(seqs.len(), 4000);
        assert!(!seqs.contains(&0));
    }
}
