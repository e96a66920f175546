//! The Tunnox client core: one long-lived control session to the rendezvous
//! server, a broker fanning out short-lived tunnel connections per mapping,
//! and the quota enforcer that retunes both.

pub mod broker;
mod error;
mod identity;
pub mod quota;
pub mod session;

pub use broker::{BrokerOpts, MappingStats, TunnelBroker};
pub use error::*;
pub use identity::*;
pub use quota::{QuotaApi, QuotaEnforcer, QuotaEnforcerOpts};
pub use session::{ControlSession, PushHandler, SessionOpts, SessionState};

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
