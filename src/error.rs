//! Errors raised by the communicator and its collaborators.

use crate::generators::Device;

/// Errors returned by every fallible communicator operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No communicator is available, either because `initialize` was never called or because
    /// it has been shut down since.
    #[error("communicator is not initialized")]
    NotInitialized,
    /// The communicator could not be constructed from the provided options.
    #[error("communicator initialization failed: {0}")]
    Initialization(#[from] InitializationError),
    /// A message could not be exchanged with another party.
    #[error("communication failed: {0}")]
    Communication(#[from] CommunicationError),
    /// Only generator slots 0 and 1 exist.
    #[error("generator slot {slot} is out of range, expected 0 or 1")]
    OutOfRange {
        /// The requested slot.
        slot: usize,
    },
    /// The requested generator was never provisioned.
    #[error("generator {slot} on {device} is not initialized, set up generators first")]
    GeneratorNotInitialized {
        /// The requested slot.
        slot: usize,
        /// The requested device class.
        device: Device,
    },
    /// The caller broke a precondition of the called operation.
    #[error("contract violation: {0}")]
    ContractViolation(#[from] Violation),
}

/// Reasons why communicator options were rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitializationError {
    /// A world without parties cannot communicate.
    #[error("world size must be at least 1")]
    EmptyWorld,
    /// The own rank must be a valid index into the world.
    #[error("rank {rank} is out of range for a world of {world_size} parties")]
    RankOutOfRange {
        /// The configured rank.
        rank: usize,
        /// The configured world size.
        world_size: usize,
    },
    /// Byte accounting needs a non-zero element width.
    #[error("bytes per element must be greater than 0")]
    ZeroElementWidth,
}

/// Failures while exchanging messages with other parties.
#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    /// The peer rank is the own rank or does not exist.
    #[error("party {party} is not a valid peer of party {rank} in a world of {world_size}")]
    InvalidRank {
        /// The requested peer.
        party: usize,
        /// The own rank.
        rank: usize,
        /// The number of parties.
        world_size: usize,
    },
    /// The transport could not send the message.
    #[error("error while sending message to party {party}: {reason}")]
    Send {
        /// The destination of the message.
        party: usize,
        /// The transport's description of the failure.
        reason: String,
    },
    /// The transport could not deliver a message.
    #[error("error while receiving message from {}: {reason}", describe_source(.party))]
    Recv {
        /// The expected source, `None` if any source was accepted.
        party: Option<usize>,
        /// The transport's description of the failure.
        reason: String,
    },
    /// A message could not be (de-)serialized.
    #[error("message could not be (de-)serialized: {0}")]
    Serde(#[from] bincode::Error),
    /// A message of a different kind than expected arrived.
    #[error("unexpected {actual} frame from party {party}, expected {expected}")]
    UnexpectedFrame {
        /// The sender of the frame.
        party: usize,
        /// The kind of frame the protocol expected.
        expected: &'static str,
        /// The kind of frame that arrived (or `empty`).
        actual: &'static str,
    },
    /// A party opened a seed that does not match its commitment.
    #[error("party {party} opened a generator seed that does not match its commitment")]
    InconsistentSeed {
        /// The party that sent the inconsistent opening.
        party: usize,
    },
    /// A background operation panicked or was cancelled.
    #[error("background operation failed: {0}")]
    Task(String),
}

fn describe_source(party: &Option<usize>) -> String {
    match party {
        Some(party) => format!("party {party}"),
        None => "any party".to_string(),
    }
}

/// Preconditions a caller of the communicator can break.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// The scatter source must provide exactly one value per party.
    #[error("scatter source must provide {expected} values, got {actual}")]
    ScatterLength {
        /// The world size.
        expected: usize,
        /// The number of provided values.
        actual: usize,
    },
    /// Two payloads that must have the same shape do not.
    #[error("payload has {actual} elements, expected {expected}")]
    LengthMismatch {
        /// The element count of the reference payload.
        expected: usize,
        /// The element count of the offending payload.
        actual: usize,
    },
    /// The broadcast source did not provide an object.
    #[error("broadcast source {src} did not provide an object")]
    MissingObject {
        /// The rank of the broadcast source.
        src: usize,
    },
    /// `initialize` was called twice without an intervening `shutdown`.
    #[error("communicator is already initialized")]
    AlreadyInitialized,
    /// The device name does not map to a device class.
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
}
