//! The Upstream Session component (§4.3).

pub mod session;
pub mod wire;

pub use session::{ping_loop, PingSender, RunExit, SessionState, UpstreamSession};
