//! Bandlink protocol core: tagged envelopes, liveness handshake, peer-paced file transfer.
//! Host-driven: no I/O; host passes events and receives commands.

pub mod envelope;
pub mod format;
pub mod handshake;
pub mod protocol;
pub mod transfer;

pub use envelope::{payload_from, Envelope, EnvelopeError, RouterError, TagRouter};
pub use format::{file_name, format_bytes};
pub use handshake::{
    AttemptId, Gate, Handshake, HandshakeConfig, HandshakeReaction, SessionEvent, SessionState,
};
pub use protocol::{
    DeviceMessage, FileCommand, HandshakeMessage, ProtocolError, CHUNK_BYTES, FILE_TAG,
    HANDSHAKE_TAG, STORAGE_QUOTA,
};
pub use transfer::{
    ChunkPlan, Command, FileOffer, JobId, TextRange, TransferConfig, TransferController,
    TransferError,
};
