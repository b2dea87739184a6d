//! Client for the on-device scripting service
//!
//! ## Module Structure
//!
//! - `protocol` - Handshake and request/response wire types, event payloads
//! - `client` - TCP client: one background task per connection
//!
//! Session bookkeeping lives in `devhost-session`; it is generic over
//! [`ScriptingConnector`] so tests can swap in an in-memory service.

pub mod client;
pub mod protocol;

use std::future::Future;

use serde_json::Value;

use devhost_core::prelude::*;
use devhost_core::ScriptSessionId;

pub use client::{ScriptingClient, TcpConnector};
pub use protocol::{Handshake, ScriptEvent};

/// Device port the scripting service listens on
pub const SCRIPTING_DEVICE_PORT: u16 = 8082;

/// Shell command that launches the scripting service on the device
pub const LAUNCH_SERVICE_COMMAND: &str = "am start -a com.googlecode.android_scripting.action.LAUNCH_SERVER \
--ei com.googlecode.android_scripting.extra.USE_SERVICE_PORT 8082 \
com.googlecode.android_scripting/.activity.ScriptingLayerServiceLauncher";

/// RPC that ends a session on the service side
pub const CLOSE_SESSION_METHOD: &str = "closeSl4aSession";

/// RPC that blocks up to the given milliseconds for the next event
pub const EVENT_WAIT_METHOD: &str = "eventWait";

/// One connection bound to a scripting session
pub trait RpcConnection: Clone + Send + Sync + 'static {
    /// Session this connection was bound to by its handshake
    fn session_id(&self) -> ScriptSessionId;

    /// Send one request and wait for its reply
    fn call(&self, method: &str, params: Vec<Value>) -> impl Future<Output = Result<Value>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens connections to the scripting service through a forwarded host port
pub trait ScriptingConnector: Send + Sync + 'static {
    type Connection: RpcConnection;

    fn connect(
        &self,
        host_port: u16,
        handshake: Handshake,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;
}
