//! Wire types for the on-device scripting service.
//!
//! The service speaks newline-delimited JSON over TCP. Every connection
//! starts with a handshake that either creates a session
//! (`{"cmd":"initiate","uid":-1}`) or binds to an existing one
//! (`{"cmd":"continue","uid":N}`), answered by `{"status":true,"uid":N}`.
//! After that the client sends `{"id","method","params"}` and the service
//! replies `{"id","result","error"}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use devhost_core::prelude::*;
use devhost_core::ScriptSessionId;

/// Which session a new connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Ask the service to create a new session
    Initiate,
    /// Bind this connection to an existing session
    Continue(ScriptSessionId),
}

impl Handshake {
    pub fn to_request(self) -> HandshakeRequest {
        match self {
            Handshake::Initiate => HandshakeRequest {
                cmd: "initiate",
                uid: -1,
            },
            Handshake::Continue(uid) => HandshakeRequest {
                cmd: "continue",
                uid: i64::from(uid),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeRequest {
    pub cmd: &'static str,
    pub uid: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeResponse {
    pub status: bool,
    #[serde(default)]
    pub uid: Option<i64>,
}

impl HandshakeResponse {
    /// Validate the reply to `handshake` and return the session id it names.
    pub fn session_id(&self, handshake: Handshake) -> Result<ScriptSessionId> {
        if !self.status {
            return Err(Error::protocol(format!(
                "scripting service rejected {handshake:?} handshake"
            )));
        }

        let uid = self
            .uid
            .and_then(|uid| ScriptSessionId::try_from(uid).ok())
            .ok_or_else(|| Error::protocol(format!("handshake reply has no valid uid: {:?}", self.uid)))?;

        match handshake {
            Handshake::Continue(expected) if expected != uid => Err(Error::protocol(format!(
                "continue handshake for session {expected} was answered for session {uid}"
            ))),
            _ => Ok(uid),
        }
    }
}

/// One RPC call
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

/// Reply to an [`RpcRequest`]
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcResponse {
    /// Turn the reply into the call's result. A non-null `error` wins.
    pub fn into_result(self, method: &str) -> Result<Value> {
        match self.error {
            Some(Value::Null) | None => Ok(self.result.unwrap_or(Value::Null)),
            Some(Value::String(message)) => Err(Error::rpc(method, message)),
            Some(other) => Err(Error::rpc(method, other.to_string())),
        }
    }
}

/// An asynchronous notification delivered by `eventWait`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptEvent {
    pub name: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub data: Value,
}

impl ScriptEvent {
    /// Parse an `eventWait` result; `null` means no event arrived in time
    pub fn from_result(result: Value) -> Result<Option<Self>> {
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }
}

struct PendingRequest {
    method: String,
    response_tx: oneshot::Sender<Result<Value>>,
}

/// Correlates request ids with the callers waiting on them
#[derive(Default)]
pub struct RequestTracker {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for `method` and remember who wants the reply
    pub fn register(&mut self, method: &str, response_tx: oneshot::Sender<Result<Value>>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                response_tx,
            },
        );
        id
    }

    /// Route a reply to its caller. Returns false for unknown ids.
    pub fn complete(&mut self, response: RpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        match self.pending.remove(&id) {
            Some(pending) => {
                let _ = pending
                    .response_tx
                    .send(response.into_result(&pending.method));
                true
            }
            None => false,
        }
    }

    /// Fail one waiting caller
    pub fn fail_request(&mut self, id: u64, reason: &str) {
        if let Some(pending) = self.pending.remove(&id) {
            let _ = pending
                .response_tx
                .send(Err(Error::rpc(pending.method, reason)));
        }
    }

    /// Fail every waiting caller, e.g. when the connection drops
    pub fn fail_all(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            let _ = pending
                .response_tx
                .send(Err(Error::rpc(pending.method, reason)));
        }
    }

    /// Drop requests whose caller stopped waiting (e.g. timed out);
    /// returns their ids
    pub fn cleanup_abandoned(&mut self) -> Vec<u64> {
        let abandoned: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.response_tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &abandoned {
            self.pending.remove(id);
        }
        abandoned
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
