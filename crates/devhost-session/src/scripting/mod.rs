//! Scripting service sessions
//!
//! ## Module Structure
//!
//! - `pool` - Sessions of one device keyed by [`SessionKey`](devhost_core::SessionKey)
//! - `dispatcher` - Background `eventWait` polling with per-name queues

pub mod dispatcher;
pub mod pool;

pub use dispatcher::EventDispatcher;
pub use pool::{RpcSession, SessionPool};
