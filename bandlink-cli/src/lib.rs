//! Bandlink host: runs the protocol core over tokio. Raw channels, the gated handshake
//! session, the transfer actor and file access live here; `main.rs` wires them to UDP.

pub mod channel;
pub mod config;
pub mod files;
pub mod memory;
pub mod session;
pub mod transfer;
pub mod udp;

pub use channel::{ChannelError, EnvelopeChannel, RawChannel};
pub use config::{Config, ConfigError};
pub use files::{measure, FileSource, FsSource};
pub use memory::MemoryChannel;
pub use session::{Session, SessionError};
pub use transfer::{FnObserver, TransferHandle, TransferObserver};
pub use udp::UdpChannel;
