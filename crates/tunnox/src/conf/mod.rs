mod persistent;
mod runtime;

pub use persistent::*;
pub use runtime::*;
