//! Byte-stream transform pipeline shared by the control connection and every
//! tunnel connection.
//!
//! A [`StreamProcessor`] wraps one bidirectional byte stream and layers, per
//! the wire contract: gzip on packet bodies, chunked AEAD on bodies and on
//! raw tunnel bytes, and a token-bucket limiter shaping what actually hits
//! the wire. Encryption is a construction-time decision; there is no runtime
//! toggle, rekeying happens by building a new pipeline.

mod crypto;
mod error;
mod gzip;
mod manager;
mod pool;
mod processor;
mod rate;

pub use crypto::*;
pub use error::*;
pub use gzip::*;
pub use manager::*;
pub use pool::*;
pub use processor::*;
pub use rate::*;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
