//! Console lock: Lamport-clock mutual exclusion over the worker group.
//!
//! A worker that wants the console broadcasts a timestamped request and
//! posts one reply slot per peer (a round). It may print once every slot of
//! its head round has completed. Peers answer requests immediately or defer
//! the answer until they release their own round.
//!
//! Rounds queue: a worker may request again before its earlier rounds are
//! released, and rounds are granted strictly in request order.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, trace};

use crate::fabric::{Endpoint, FabricError, Rank, Source, Tag};

use super::clock::LogicalClock;
use super::exchange::TrackedExchange;

/// How an incoming request is prioritised against this worker's own rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyPolicy {
    /// Ricart–Agrawala ordering. Each round keeps the stamp it was broadcast
    /// with; an incoming `(stamp, rank)` is deferred iff the head round's
    /// `(stamp, rank)` is lower. Released rounds answer every deferred request
    /// that now precedes the new head.
    #[default]
    RequestOrder,
    /// Compare the incoming stamp against the local clock as it stands when
    /// the request is serviced, with no rank tie-break; deferred replies go
    /// out only once no round remains. The receive rule always leaves the
    /// clock past the incoming stamp, so this policy never defers.
    LocalClock,
}

/// Misuse of the lock, or a fabric failure underneath it.
#[derive(Debug, Error)]
pub enum LockError {
    /// `exit` with no round queued.
    #[error("no active round to release")]
    NoActiveRound,

    /// `exit` before every peer of the head round replied.
    #[error("head round has {received} of {expected} replies")]
    NotGranted { received: usize, expected: usize },

    /// `test` before `init`.
    #[error("console lock was not initialised")]
    NotInitialised,

    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// One acquisition attempt: the stamp it was broadcast with and a reply slot
/// per peer.
#[derive(Debug)]
struct Round {
    stamp: u64,
    slots: Vec<TrackedExchange>,
}

impl Round {
    fn replies(&self) -> usize {
        self.slots.iter().filter(|s| s.is_complete()).count()
    }

    fn granted(&self) -> bool {
        self.slots.iter().all(TrackedExchange::is_complete)
    }
}

/// A request whose reply is being withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredReply {
    peer: Rank,
    stamp: u64,
}

/// Distributed mutual-exclusion engine for one worker.
///
/// Owns the worker-group endpoint; every operation is non-blocking.
pub struct ConsoleLock {
    /// Worker-group endpoint.
    endpoint: Endpoint,
    policy: ReplyPolicy,
    clock: LogicalClock,
    /// Standing receive for requests from any peer.
    standing: Option<TrackedExchange>,
    /// Outstanding rounds; the front is the active one.
    rounds: VecDeque<Round>,
    /// Requests answered later, in arrival order.
    deferred: Vec<DeferredReply>,
    /// In-flight requests and replies this worker sent.
    ledger: Vec<TrackedExchange>,
}

impl ConsoleLock {
    /// Lock over a worker-group endpoint. Call [`ConsoleLock::init`] before
    /// servicing peers.
    pub fn new(endpoint: Endpoint, policy: ReplyPolicy) -> Self {
        ConsoleLock {
            endpoint,
            policy,
            clock: LogicalClock::new(),
            standing: None,
            rounds: VecDeque::new(),
            deferred: Vec::new(),
            ledger: Vec::new(),
        }
    }

    /// Post the standing receive for incoming requests. Call once, before
    /// any `test`.
    pub fn init(&mut self) {
        if self.standing.is_none() {
            self.standing = Some(TrackedExchange::recv(&mut self.endpoint, Source::Any, Tag::CriticalRequest));
        }
    }

    /// Broadcast a new request and queue a round for its replies.
    ///
    /// Returns the stamp the request was broadcast with.
    pub fn request(&mut self) -> Result<u64, LockError> {
        let stamp = self.clock.tick();
        let peers: Vec<Rank> = self.endpoint.peers().collect();

        for &peer in &peers {
            let sent = TrackedExchange::send(&mut self.endpoint, peer, Tag::CriticalRequest, stamp)?;
            self.ledger.push(sent);
        }

        let slots = peers
            .iter()
            .map(|&peer| TrackedExchange::recv(&mut self.endpoint, Source::Rank(peer), Tag::CriticalResponse))
            .collect();
        self.rounds.push_back(Round { stamp, slots });

        debug!(rank = self.rank(), stamp, queued = self.rounds.len(), "requested console");
        Ok(stamp)
    }

    /// Poll the head round once. True iff every peer has replied to it.
    pub fn lock(&mut self) -> Result<bool, LockError> {
        let Some(head) = self.rounds.front_mut() else {
            return Ok(false);
        };

        for slot in head.slots.iter_mut().filter(|s| !s.is_complete()) {
            if slot.poll(&mut self.endpoint)? {
                self.clock.advance(slot.payload());
                trace!(rank = self.endpoint.rank(), peer = ?slot.peer(), stamp = slot.payload(), "reply received");
            }
        }

        Ok(head.granted())
    }

    /// Release the head round and answer the requests it was holding back.
    ///
    /// Only valid after `lock` returned true for that round.
    pub fn exit(&mut self) -> Result<(), LockError> {
        let head = self.rounds.front().ok_or(LockError::NoActiveRound)?;
        if !head.granted() {
            return Err(LockError::NotGranted {
                received: head.replies(),
                expected: head.slots.len(),
            });
        }

        if let Some(round) = self.rounds.pop_front() {
            for slot in round.slots {
                slot.release(&mut self.endpoint);
            }
            debug!(rank = self.rank(), stamp = round.stamp, "released console");
        }

        self.release_deferred()
    }

    /// Service incoming requests and prune completed sends.
    ///
    /// Drains every request that has already arrived before returning.
    pub fn test(&mut self) -> Result<(), LockError> {
        loop {
            let standing = self.standing.as_mut().ok_or(LockError::NotInitialised)?;
            if !standing.poll(&mut self.endpoint)? {
                break;
            }

            if let Some(request) = self.standing.take() {
                let (peer, stamp) = (request.peer(), request.payload());
                request.release(&mut self.endpoint);
                if let Some(peer) = peer {
                    self.handle_incoming_ask(peer, stamp)?;
                }
            }
            self.standing = Some(TrackedExchange::recv(&mut self.endpoint, Source::Any, Tag::CriticalRequest));
        }

        self.prune_ledger()
    }

    /// Current logical clock.
    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    /// This worker's rank in the group.
    pub fn rank(&self) -> Rank {
        self.endpoint.rank()
    }

    /// The reply policy in force.
    pub fn policy(&self) -> ReplyPolicy {
        self.policy
    }

    /// Whether any round is outstanding.
    pub fn wants_output(&self) -> bool {
        !self.rounds.is_empty()
    }

    /// Number of outstanding rounds.
    pub fn pending_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Stamp of the active round, if any.
    pub fn head_stamp(&self) -> Option<u64> {
        self.rounds.front().map(|r| r.stamp)
    }

    /// Number of requests currently being held back.
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Number of sends not yet confirmed complete.
    pub fn in_flight_sends(&self) -> usize {
        self.ledger.len()
    }

    fn handle_incoming_ask(&mut self, peer: Rank, stamp: u64) -> Result<(), LockError> {
        self.clock.advance(stamp);

        let defer = match self.policy {
            ReplyPolicy::LocalClock => self.clock.value() <= stamp && self.wants_output(),
            ReplyPolicy::RequestOrder => self
                .rounds
                .front()
                .is_some_and(|head| (head.stamp, self.endpoint.rank()) < (stamp, peer)),
        };

        if defer {
            debug!(rank = self.rank(), peer, stamp, head = ?self.head_stamp(), "deferring reply");
            self.deferred.push(DeferredReply { peer, stamp });
            Ok(())
        } else {
            trace!(rank = self.rank(), peer, stamp, "replying");
            self.send_reply(peer)
        }
    }

    /// Answer deferred requests that no longer conflict with this worker's
    /// rounds, keeping arrival order. With no round left, that is all of them.
    fn release_deferred(&mut self) -> Result<(), LockError> {
        if self.deferred.is_empty() {
            return Ok(());
        }

        let ready: Vec<DeferredReply> = match (self.policy, self.rounds.front()) {
            (_, None) => std::mem::take(&mut self.deferred),
            (ReplyPolicy::LocalClock, Some(_)) => Vec::new(),
            (ReplyPolicy::RequestOrder, Some(head)) => {
                let head_key = (head.stamp, self.endpoint.rank());
                let (ready, held): (Vec<_>, Vec<_>) = self
                    .deferred
                    .iter()
                    .copied()
                    .partition(|d| (d.stamp, d.peer) < head_key);
                self.deferred = held;
                ready
            }
        };

        if !ready.is_empty() {
            debug!(rank = self.rank(), count = ready.len(), "sending deferred replies");
        }
        for reply in ready {
            self.send_reply(reply.peer)?;
        }
        Ok(())
    }

    fn send_reply(&mut self, peer: Rank) -> Result<(), LockError> {
        let stamp = self.clock.tick();
        let sent = TrackedExchange::send(&mut self.endpoint, peer, Tag::CriticalResponse, stamp)?;
        self.ledger.push(sent);
        Ok(())
    }

    fn prune_ledger(&mut self) -> Result<(), LockError> {
        let mut i = 0;
        while i < self.ledger.len() {
            if self.ledger[i].poll(&mut self.endpoint)? {
                let done = self.ledger.remove(i);
                done.release(&mut self.endpoint);
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}

impl Drop for ConsoleLock {
    fn drop(&mut self) {
        if let Some(standing) = self.standing.take() {
            standing.release(&mut self.endpoint);
        }
        for round in std::mem::take(&mut self.rounds) {
            for slot in round.slots {
                slot.release(&mut self.endpoint);
            }
        }
    }
}
