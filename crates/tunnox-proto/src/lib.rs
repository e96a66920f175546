//! Wire codec shared by the Tunnox client and server halves.
//!
//! A frame on the wire is a single type octet followed, for every kind but
//! heartbeat, by a big-endian length and that many body bytes. The low six
//! bits of the type octet carry the packet kind, the top two bits flag
//! encryption and compression of the body. Bodies of [`PacketKind::JsonCommand`]
//! and [`PacketKind::CommandResp`] frames are UTF-8 JSON of a [`Command`].

mod command;
mod error;
mod frame;
mod packet;
pub mod payload;

pub use command::*;
pub use error::*;
pub use frame::*;
pub use packet::*;

pub type Result<T, E = ProtoError> = std::result::Result<T, E>;
