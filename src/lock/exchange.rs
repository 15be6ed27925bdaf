//! One in-flight non-blocking exchange and the integer it carries.

use crate::fabric::{encode, Endpoint, FabricError, Rank, RecvHandle, SendHandle, Source, Tag};

/// The fabric-level operation behind an exchange.
#[derive(Debug)]
enum Operation {
    Recv(RecvHandle),
    Send(SendHandle),
}

/// Owns one pending send or receive together with its integer payload.
///
/// The completion flag only changes through [`TrackedExchange::poll`]. Release
/// goes through [`TrackedExchange::release`], which cancels a receive that is
/// still pending so no fabric-level operation outlives its owner.
#[derive(Debug)]
#[must_use]
pub struct TrackedExchange {
    op: Operation,
    payload: u64,
    /// Peer on the other side (filled on completion for `Source::Any`).
    peer: Option<Rank>,
    complete: bool,
}

impl TrackedExchange {
    /// Post a receive for a single integer.
    pub fn recv(endpoint: &mut Endpoint, source: Source, tag: Tag) -> Self {
        let peer = match source {
            Source::Rank(rank) => Some(rank),
            Source::Any => None,
        };
        TrackedExchange {
            op: Operation::Recv(endpoint.irecv(source, tag)),
            payload: 0,
            peer,
            complete: false,
        }
    }

    /// Issue a send of a single integer.
    pub fn send(endpoint: &mut Endpoint, dest: Rank, tag: Tag, payload: u64) -> Result<Self, FabricError> {
        let handle = endpoint.isend(dest, tag, encode(&payload)?)?;
        Ok(TrackedExchange {
            op: Operation::Send(handle),
            payload,
            peer: Some(dest),
            complete: false,
        })
    }

    /// Poll the underlying operation once. Returns the completion flag.
    pub fn poll(&mut self, endpoint: &mut Endpoint) -> Result<bool, FabricError> {
        if self.complete {
            return Ok(true);
        }

        match &self.op {
            Operation::Recv(handle) => {
                if let Some(envelope) = endpoint.test_recv(handle)? {
                    self.payload = envelope.decode()?;
                    self.peer = Some(envelope.source);
                    self.complete = true;
                }
            }
            Operation::Send(handle) => {
                self.complete = endpoint.test_send(handle)?;
            }
        }

        Ok(self.complete)
    }

    /// Whether the operation has completed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The carried integer. For a receive, meaningful once complete.
    #[inline]
    pub fn payload(&self) -> u64 {
        self.payload
    }

    /// The other party, once known.
    #[inline]
    pub fn peer(&self) -> Option<Rank> {
        self.peer
    }

    /// Release the exchange, cancelling a receive that is still pending.
    ///
    /// A pending send is left with the fabric, which still delivers it.
    pub fn release(self, endpoint: &mut Endpoint) {
        if let Operation::Recv(handle) = self.op {
            if !self.complete {
                endpoint.cancel(handle);
            }
        }
    }
}
