//! Scripting sessions of one device

use std::collections::BTreeMap;

use devhost_bridge::scripting::{CLOSE_SESSION_METHOD, LAUNCH_SERVICE_COMMAND};
use devhost_bridge::{CommandBridge, Handshake, RpcConnection, ScriptingConnector};
use devhost_core::prelude::*;
use devhost_core::{PortRole, ScriptSessionId, SessionKey};

use super::dispatcher::EventDispatcher;
use crate::config::TimingSettings;
use crate::ports::PortLeaseTracker;

/// One session on the scripting service and the connections bound to it
pub struct RpcSession<Conn> {
    pub session_id: ScriptSessionId,
    primary: Conn,
    auxiliary: Vec<Conn>,
    dispatcher: Option<EventDispatcher>,
}

impl<Conn: RpcConnection> RpcSession<Conn> {
    fn new(primary: Conn) -> Self {
        Self {
            session_id: primary.session_id(),
            primary,
            auxiliary: Vec::new(),
            dispatcher: None,
        }
    }

    pub fn primary(&self) -> &Conn {
        &self.primary
    }

    pub fn connection_count(&self) -> usize {
        1 + self.auxiliary.len()
    }

    async fn close(self) {
        if let Err(e) = self
            .primary
            .call(CLOSE_SESSION_METHOD, Vec::new())
            .await
        {
            debug!("session {}: {} failed: {}", self.session_id, CLOSE_SESSION_METHOD, e);
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.stop().await;
        }
        self.primary.close().await;
        for conn in &self.auxiliary {
            conn.close().await;
        }
    }
}

/// Sessions on one device's scripting service, reached through a single
/// forwarded host port.
pub struct SessionPool<C: ScriptingConnector> {
    serial: String,
    connector: C,
    host_port: u16,
    connect_attempts: u32,
    connect_interval: std::time::Duration,
    event_poll_ms: u64,
    sessions: BTreeMap<SessionKey, RpcSession<C::Connection>>,
}

impl<C: ScriptingConnector> SessionPool<C> {
    pub fn new(
        serial: impl Into<String>,
        connector: C,
        host_port: u16,
        timing: &TimingSettings,
    ) -> Self {
        Self {
            serial: serial.into(),
            connector,
            host_port,
            connect_attempts: timing.scripting_connect_attempts.max(1),
            connect_interval: timing.scripting_connect_interval(),
            event_poll_ms: timing.event_poll_ms,
            sessions: BTreeMap::new(),
        }
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    fn key(&self, session_id: ScriptSessionId) -> SessionKey {
        SessionKey::new(&self.serial, session_id)
    }

    /// Open a new session. If the service does not answer, launch it on the
    /// device and retry.
    pub async fn open_session<B: CommandBridge>(&mut self, bridge: &B) -> Result<ScriptSessionId> {
        let conn = match self.connector.connect(self.host_port, Handshake::Initiate).await {
            Ok(conn) => conn,
            Err(e) => {
                info!(
                    "{}: scripting service not reachable ({}), launching it",
                    self.serial, e
                );
                bridge.run_shell(LAUNCH_SERVICE_COMMAND).await?;
                self.connect_with_retry().await?
            }
        };

        let session_id = conn.session_id();
        let key = self.key(session_id);
        if self.sessions.contains_key(&key) {
            conn.close().await;
            return Err(Error::DuplicateSessionId { session_id });
        }

        info!("{}: opened scripting session {}", self.serial, session_id);
        self.sessions.insert(key, RpcSession::new(conn));
        Ok(session_id)
    }

    async fn connect_with_retry(&self) -> Result<C::Connection> {
        let mut last_err = Error::ConnectTimeout {
            port: self.host_port,
        };
        for attempt in 1..=self.connect_attempts {
            tokio::time::sleep(self.connect_interval).await;
            match self.connector.connect(self.host_port, Handshake::Initiate).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(
                        "{}: scripting connect attempt {}/{} failed: {}",
                        self.serial, attempt, self.connect_attempts, e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Open another connection bound to an existing session
    pub async fn add_connection(&mut self, session_id: ScriptSessionId) -> Result<C::Connection> {
        let key = self.key(session_id);
        if !self.sessions.contains_key(&key) {
            return Err(Error::UnknownSession { session_id });
        }

        let conn = self
            .connector
            .connect(self.host_port, Handshake::Continue(session_id))
            .await?;

        let session = self
            .sessions
            .get_mut(&key)
            .ok_or(Error::UnknownSession { session_id })?;
        session.auxiliary.push(conn.clone());
        Ok(conn)
    }

    /// The session's event dispatcher, started on first use
    pub async fn attach_event_dispatcher(
        &mut self,
        session_id: ScriptSessionId,
    ) -> Result<EventDispatcher> {
        let key = self.key(session_id);
        let session = self
            .sessions
            .get(&key)
            .ok_or(Error::UnknownSession { session_id })?;
        if let Some(dispatcher) = &session.dispatcher {
            return Ok(dispatcher.clone());
        }

        let conn = self
            .connector
            .connect(self.host_port, Handshake::Continue(session_id))
            .await?;
        let dispatcher = EventDispatcher::start(conn, self.event_poll_ms);

        match self.sessions.get_mut(&key) {
            Some(session) => {
                session.dispatcher = Some(dispatcher);
            }
            None => {
                dispatcher.stop().await;
                return Err(Error::UnknownSession { session_id });
            }
        }

        self.dispatcher(session_id)
            .ok_or(Error::DispatcherMissing { session_id })
    }

    pub fn dispatcher(&self, session_id: ScriptSessionId) -> Option<EventDispatcher> {
        self.sessions
            .get(&self.key(session_id))
            .and_then(|s| s.dispatcher.clone())
    }

    pub fn session(&self, session_id: ScriptSessionId) -> Option<&RpcSession<C::Connection>> {
        self.sessions.get(&self.key(session_id))
    }

    /// Call `method` on the session's primary connection
    pub async fn call(
        &self,
        session_id: ScriptSessionId,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let session = self
            .session(session_id)
            .ok_or(Error::UnknownSession { session_id })?;
        session.primary.call(method, params).await
    }

    /// End a session and close its connections. Unknown ids are ignored.
    pub async fn close_session(&mut self, session_id: ScriptSessionId) {
        let Some(session) = self.sessions.remove(&self.key(session_id)) else {
            return;
        };
        session.close().await;
        info!("{}: closed scripting session {}", self.serial, session_id);
    }

    /// Close every session and release the scripting port. Safe to repeat.
    pub async fn close_all<B: CommandBridge>(&mut self, bridge: &B, ports: &mut PortLeaseTracker) {
        for session_id in self.session_ids() {
            self.close_session(session_id).await;
        }
        if let Err(e) = ports.release(bridge, PortRole::Scripting).await {
            warn!("{}: failed to remove scripting forward: {}", self.serial, e);
        }
    }

    /// Lowest open session id
    pub fn default_session(&self) -> Option<ScriptSessionId> {
        self.sessions.keys().next().map(|k| k.session_id)
    }

    pub fn session_ids(&self) -> Vec<ScriptSessionId> {
        self.sessions.keys().map(|k| k.session_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl<C: ScriptingConnector> Drop for SessionPool<C> {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            warn!(
                "{}: session pool dropped with {} open session(s)",
                self.serial,
                self.sessions.len()
            );
        }
    }
}
