use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::FabricError;

/// A process's identity within one fabric.
pub type Rank = u32;

/// Message tags.
///
/// The set is closed: every envelope on every fabric carries exactly one of
/// these, and receives select on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Mutual-exclusion request. Payload: sender's logical clock (`u64`).
    CriticalRequest,
    /// Mutual-exclusion reply. Payload: replier's logical clock (`u64`).
    CriticalResponse,
    /// Job text from the coordinator. Payload: raw UTF-8, length = transfer size.
    Job,
    /// No more jobs will arrive. Payload: `u64`, value unused.
    EndOfInput,
    /// Fatal shutdown. Payload: signal code (`u64`).
    Abort,
    /// Completion notice (worker to coordinator) and group-done
    /// acknowledgment (coordinator to worker). Payload: `bool`; a worker that
    /// failed locally sends `false`.
    EndOfJobs,
}

/// Sender selector for receives and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Accept any sender.
    Any,
    /// Accept only this rank.
    Rank(Rank),
}

impl Source {
    /// Whether an envelope from `rank` is accepted.
    #[inline]
    pub fn accepts(&self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(r) => *r == rank,
        }
    }
}

/// A message in flight between two ranks of the same fabric.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sending rank.
    pub source: Rank,
    /// Message tag.
    pub tag: Tag,
    /// Encoded payload.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Whether this envelope satisfies a `(source, tag)` selector.
    #[inline]
    pub fn matches(&self, source: Source, tag: Tag) -> bool {
        self.tag == tag && source.accepts(self.source)
    }

    /// Transfer size in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Decode a bincode payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FabricError> {
        bincode::deserialize(&self.body).map_err(FabricError::Decode)
    }

    /// Interpret the payload as raw text.
    pub fn into_text(self) -> Result<String, FabricError> {
        Ok(String::from_utf8(self.body)?)
    }
}

/// Metadata of a message found by a probe, before it is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: Rank,
    pub tag: Tag,
    /// Transfer size in bytes.
    pub len: usize,
}

impl From<&Envelope> for Status {
    fn from(envelope: &Envelope) -> Self {
        Status {
            source: envelope.source,
            tag: envelope.tag,
            len: envelope.len(),
        }
    }
}

/// Encode a scalar payload (clock, signal, flag) for the wire.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FabricError> {
    bincode::serialize(value).map_err(FabricError::Encode)
}
