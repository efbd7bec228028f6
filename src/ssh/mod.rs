//! Object transfer over `git-lfs-transfer` sub-processes speaking pktline.

mod adapter;
mod command;
mod connection;
mod pktline;
mod session;

pub use adapter::{register, SshTransfer, SSH_ADAPTER_NAME};
pub use command::{SshMetadata, SshVariant, TransferCommand};
pub use connection::{Channel, ChildReader, ChildWriter, Connection};
pub use pktline::{DataReader, Packet, Pktline, MAX_PACKET_DATA, MAX_PACKET_LENGTH};
pub use session::Session;
