use thiserror::Error;

use super::message::Rank;

/// Errors surfaced by fabric operations.
///
/// The fabric itself never loses messages; these only occur when a peer has
/// already torn down its endpoint or a payload does not decode.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The destination's inbox has been dropped.
    #[error("rank {rank} is no longer reachable")]
    Disconnected { rank: Rank },

    /// Every sender into this endpoint's inbox has been dropped.
    #[error("inbox of rank {rank} is closed")]
    Closed { rank: Rank },

    /// Destination outside the fabric, or a send to self.
    #[error("rank {rank} is not a peer in a fabric of {size}")]
    UnknownRank { rank: Rank, size: u32 },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] bincode::Error),

    /// Text payload was not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidText(#[from] std::string::FromUtf8Error),
}
