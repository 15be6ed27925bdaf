//! Channel-backed fabric.
//!
//! Uses crossbeam channels to connect every rank's inbox to every other rank.
//! Non-blocking sends are queued per destination and pushed into the
//! destination inbox as capacity allows; non-blocking receives are matched
//! against arriving envelopes in the order they were posted.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use rand::Rng;
use tracing::trace;

use super::error::FabricError;
use super::message::{Envelope, Rank, Source, Status, Tag};

/// How long a blocking call waits on the inbox before retrying its own
/// pending sends.
const RETRY_INTERVAL: Duration = Duration::from_micros(200);

/// Configuration for a fabric.
#[derive(Debug, Clone, Default)]
pub struct FabricConfig {
    /// Capacity of every rank's inbox. `None` means unbounded.
    ///
    /// With a bound, a non-blocking send into a full inbox stays pending
    /// until the receiver drains it.
    pub inbox_capacity: Option<usize>,
    /// Random per-envelope delivery delay (min, max). Delivery into each inbox
    /// stays FIFO.
    pub jitter: Option<(Duration, Duration)>,
}

/// Builds the endpoints of one fabric.
pub struct Fabric;

impl Fabric {
    /// Create a fully connected fabric of `size` ranks.
    ///
    /// Returns one endpoint per rank, indexed by rank.
    pub fn build(size: u32, config: &FabricConfig) -> Vec<Endpoint> {
        let mut links = Vec::with_capacity(size as usize);
        let mut inboxes = Vec::with_capacity(size as usize);

        for _ in 0..size {
            let (tx, rx) = Self::channel(config.inbox_capacity);
            let tx = match config.jitter {
                Some(range) => Self::spawn_relay(tx, config.inbox_capacity, range),
                None => tx,
            };
            links.push(tx);
            inboxes.push(rx);
        }

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                let rank = rank as Rank;
                let peers = links
                    .iter()
                    .enumerate()
                    .map(|(dest, tx)| (dest as Rank != rank).then(|| tx.clone()))
                    .collect();
                Endpoint::new(rank, size, inbox, peers)
            })
            .collect()
    }

    fn channel(capacity: Option<usize>) -> (Sender<Envelope>, Receiver<Envelope>) {
        match capacity {
            Some(cap) => bounded(cap.max(1)),
            None => unbounded(),
        }
    }

    /// Interpose a delay thread in front of an inbox.
    ///
    /// The relay forwards one envelope at a time, so FIFO order into the
    /// inbox is kept. It exits once every upstream sender is gone or the
    /// inbox is dropped.
    fn spawn_relay(
        inbox: Sender<Envelope>,
        capacity: Option<usize>,
        (min, max): (Duration, Duration),
    ) -> Sender<Envelope> {
        let (tx, rx) = Self::channel(capacity);

        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let min_us = min.as_micros() as u64;
            let max_us = max.as_micros() as u64;

            while let Ok(envelope) = rx.recv() {
                let delay_us = if max_us > min_us {
                    rng.gen_range(min_us..=max_us)
                } else {
                    min_us
                };
                if delay_us > 0 {
                    thread::sleep(Duration::from_micros(delay_us));
                }
                if inbox.send(envelope).is_err() {
                    break;
                }
            }
        });

        tx
    }
}

/// Handle to a posted non-blocking receive.
///
/// Not `Clone`: exactly one owner tests or cancels it.
#[derive(Debug)]
#[must_use]
pub struct RecvHandle {
    id: u64,
}

/// Handle to an issued non-blocking send.
#[derive(Debug)]
#[must_use]
pub struct SendHandle {
    dest: Rank,
    /// Position of this send in the per-destination sequence.
    seq: u64,
}

impl SendHandle {
    /// Destination rank.
    pub fn dest(&self) -> Rank {
        self.dest
    }
}

#[derive(Debug)]
struct PostedRecv {
    id: u64,
    source: Source,
    tag: Tag,
}

/// A single rank's view of a fabric.
pub struct Endpoint {
    /// This endpoint's rank.
    rank: Rank,
    /// Number of ranks in the fabric.
    size: u32,
    /// Incoming envelopes from every peer.
    inbox: Receiver<Envelope>,
    /// Senders into each peer's inbox (indexed by rank, `None` for self or a
    /// peer found disconnected).
    links: Vec<Option<Sender<Envelope>>>,
    /// Sends issued but not yet accepted by the destination inbox.
    outbox: Vec<VecDeque<Envelope>>,
    /// Sends issued per destination.
    issued: Vec<u64>,
    /// Sends accepted per destination.
    delivered: Vec<u64>,
    /// Pending receives, in posting order.
    posted: Vec<PostedRecv>,
    /// Completed receives not yet collected by their owner.
    matched: HashMap<u64, Envelope>,
    /// Envelopes that arrived with no matching posted receive.
    unexpected: VecDeque<Envelope>,
    next_recv_id: u64,
}

impl Endpoint {
    fn new(rank: Rank, size: u32, inbox: Receiver<Envelope>, links: Vec<Option<Sender<Envelope>>>) -> Self {
        let n = size as usize;
        Endpoint {
            rank,
            size,
            inbox,
            links,
            outbox: (0..n).map(|_| VecDeque::new()).collect(),
            issued: vec![0; n],
            delivered: vec![0; n],
            posted: Vec::new(),
            matched: HashMap::new(),
            unexpected: VecDeque::new(),
            next_recv_id: 0,
        }
    }

    /// This endpoint's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the fabric.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// All ranks other than this one, ascending.
    pub fn peers(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.size).filter(move |&r| r != self.rank)
    }

    /// Number of sends still waiting for inbox capacity.
    pub fn pending_sends(&self) -> usize {
        self.outbox.iter().map(VecDeque::len).sum()
    }

    /// Issue a non-blocking send.
    pub fn isend(&mut self, dest: Rank, tag: Tag, body: Vec<u8>) -> Result<SendHandle, FabricError> {
        let idx = self.link_index(dest)?;
        let seq = self.issued[idx];
        self.issued[idx] += 1;
        self.outbox[idx].push_back(Envelope {
            source: self.rank,
            tag,
            body,
        });
        self.flush_link(idx)?;

        Ok(SendHandle { dest, seq })
    }

    /// Whether a send has been accepted by its destination.
    pub fn test_send(&mut self, handle: &SendHandle) -> Result<bool, FabricError> {
        let idx = handle.dest as usize;
        if self.delivered[idx] <= handle.seq {
            self.flush_link(idx)?;
        }
        Ok(self.delivered[idx] > handle.seq)
    }

    /// Blocking send: returns once the destination inbox accepted the
    /// envelope. Keeps draining this endpoint's own inbox while it waits.
    pub fn send(&mut self, dest: Rank, tag: Tag, body: Vec<u8>) -> Result<(), FabricError> {
        let handle = self.isend(dest, tag, body)?;
        while !self.test_send(&handle)? {
            self.progress()?;
            thread::yield_now();
        }
        Ok(())
    }

    /// Post a non-blocking receive.
    ///
    /// An envelope already waiting in the unexpected queue completes it
    /// immediately.
    pub fn irecv(&mut self, source: Source, tag: Tag) -> RecvHandle {
        let id = self.next_recv_id;
        self.next_recv_id += 1;

        let waiting = self
            .unexpected
            .iter()
            .position(|e| e.matches(source, tag))
            .and_then(|pos| self.unexpected.remove(pos));

        match waiting {
            Some(envelope) => {
                self.matched.insert(id, envelope);
            }
            None => self.posted.push(PostedRecv { id, source, tag }),
        }

        RecvHandle { id }
    }

    /// Test a posted receive. Yields the envelope exactly once; after that
    /// the handle is spent.
    pub fn test_recv(&mut self, handle: &RecvHandle) -> Result<Option<Envelope>, FabricError> {
        if !self.matched.contains_key(&handle.id) {
            self.progress()?;
        }
        Ok(self.matched.remove(&handle.id))
    }

    /// Blocking receive.
    pub fn recv(&mut self, source: Source, tag: Tag) -> Result<Envelope, FabricError> {
        let handle = self.irecv(source, tag);
        match self.wait(&handle) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                self.cancel(handle);
                Err(e)
            }
        }
    }

    fn wait(&mut self, handle: &RecvHandle) -> Result<Envelope, FabricError> {
        loop {
            if let Some(envelope) = self.test_recv(handle)? {
                return Ok(envelope);
            }

            // Own pending sends may be what the peer is waiting on, so never
            // park indefinitely while any remain.
            let next = if self.pending_sends() > 0 {
                match self.inbox.recv_timeout(RETRY_INTERVAL) {
                    Ok(envelope) => Some(envelope),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(FabricError::Closed { rank: self.rank })
                    }
                }
            } else {
                Some(
                    self.inbox
                        .recv()
                        .map_err(|_| FabricError::Closed { rank: self.rank })?,
                )
            };

            if let Some(envelope) = next {
                self.deliver(envelope);
            }
        }
    }

    /// Cancel a posted receive.
    ///
    /// Returns true if it was still pending. A receive that already matched
    /// cannot be cancelled; its envelope is discarded with the handle.
    pub fn cancel(&mut self, handle: RecvHandle) -> bool {
        match self.posted.iter().position(|p| p.id == handle.id) {
            Some(pos) => {
                self.posted.remove(pos);
                true
            }
            None => {
                self.matched.remove(&handle.id);
                false
            }
        }
    }

    /// Non-blocking probe for a message that no posted receive has claimed.
    pub fn iprobe(&mut self, source: Source, tag: Tag) -> Result<Option<Status>, FabricError> {
        self.progress()?;
        Ok(self
            .unexpected
            .iter()
            .find(|e| e.matches(source, tag))
            .map(Status::from))
    }

    /// Push pending sends and match everything waiting in the inbox.
    pub fn progress(&mut self) -> Result<(), FabricError> {
        for idx in 0..self.outbox.len() {
            if !self.outbox[idx].is_empty() {
                self.flush_link(idx)?;
            }
        }

        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => self.deliver(envelope),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        Ok(())
    }

    fn link_index(&self, dest: Rank) -> Result<usize, FabricError> {
        if dest >= self.size || dest == self.rank {
            return Err(FabricError::UnknownRank {
                rank: dest,
                size: self.size,
            });
        }
        Ok(dest as usize)
    }

    fn flush_link(&mut self, idx: usize) -> Result<(), FabricError> {
        let Some(link) = self.links[idx].as_ref() else {
            return if self.delivered[idx] < self.issued[idx] {
                Err(FabricError::Disconnected { rank: idx as Rank })
            } else {
                Ok(())
            };
        };

        while let Some(envelope) = self.outbox[idx].pop_front() {
            match link.try_send(envelope) {
                Ok(()) => self.delivered[idx] += 1,
                Err(TrySendError::Full(envelope)) => {
                    self.outbox[idx].push_front(envelope);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.outbox[idx].clear();
                    self.links[idx] = None;
                    return Err(FabricError::Disconnected { rank: idx as Rank });
                }
            }
        }

        Ok(())
    }

    fn deliver(&mut self, envelope: Envelope) {
        trace!(rank = self.rank, from = envelope.source, tag = ?envelope.tag, "envelope arrived");

        match self.posted.iter().position(|p| envelope.matches(p.source, p.tag)) {
            Some(pos) => {
                let posted = self.posted.remove(pos);
                self.matched.insert(posted.id, envelope);
            }
            None => self.unexpected.push_back(envelope),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        for idx in 0..self.outbox.len() {
            if !self.outbox[idx].is_empty() {
                let _ = self.flush_link(idx);
            }
        }
        let stranded = self.pending_sends();
        if stranded > 0 {
            trace!(rank = self.rank, stranded, "endpoint dropped with undelivered sends");
        }
    }
}
