//! Event dispatcher for a scripting session
//!
//! The dispatcher owns a dedicated connection to its session and runs a
//! background task that repeatedly calls `eventWait`, filing each event into
//! a queue keyed by event name. Callers pop events by name with a timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use devhost_bridge::scripting::EVENT_WAIT_METHOD;
use devhost_bridge::{RpcConnection, ScriptEvent};
use devhost_core::prelude::*;
use devhost_core::ScriptSessionId;

/// Pause after a failed `eventWait` before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

struct DispatcherInner {
    session_id: ScriptSessionId,
    queues: Mutex<HashMap<String, VecDeque<ScriptEvent>>>,
    arrived: Notify,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherInner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<ScriptEvent>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn file(&self, event: ScriptEvent) {
        trace!("session {}: event {}", self.session_id, event.name);
        self.queues()
            .entry(event.name.clone())
            .or_default()
            .push_back(event);
        self.arrived.notify_waiters();
    }

    fn take(&self, name: &str) -> Option<ScriptEvent> {
        self.queues().get_mut(name).and_then(VecDeque::pop_front)
    }
}

/// Cheap-to-clone handle to a running dispatcher. Clones share the queues.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    /// Start polling `connection` for events every `poll_ms` milliseconds
    pub fn start<Conn: RpcConnection>(connection: Conn, poll_ms: u64) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(DispatcherInner {
            session_id: connection.session_id(),
            queues: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            running: AtomicBool::new(true),
            shutdown_tx,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(poll_events(
            connection,
            poll_ms,
            Arc::clone(&inner),
            shutdown_rx,
        ));
        *inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        debug!("session {}: event dispatcher started", inner.session_id);
        Self { inner }
    }

    pub fn session_id(&self) -> ScriptSessionId {
        self.inner.session_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same dispatcher
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait up to `timeout` for the next event called `name`.
    ///
    /// Events already queued are returned immediately, even after
    /// [`stop`](Self::stop).
    pub async fn pop_event(&self, name: &str, timeout: Duration) -> Result<ScriptEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so an event filed in between wakes us
            let arrived = self.inner.arrived.notified();
            if let Some(event) = self.inner.take(name) {
                return Ok(event);
            }
            if !self.is_running() {
                return Err(Error::ChannelClosed);
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(Error::EventTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Drain every queued event called `name`
    pub fn pop_all(&self, name: &str) -> Vec<ScriptEvent> {
        self.inner
            .queues()
            .remove(name)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drop queued events called `name`
    pub fn clear_events(&self, name: &str) {
        self.inner.queues().remove(name);
    }

    pub fn clear_all_events(&self) {
        self.inner.queues().clear();
    }

    /// Number of queued events called `name`
    pub fn pending(&self, name: &str) -> usize {
        self.inner.queues().get(name).map_or(0, VecDeque::len)
    }

    /// Stop polling and close the dispatcher's connection. Idempotent.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    "session {}: event dispatcher task failed: {}",
                    self.inner.session_id, e
                );
            }
        }
        self.inner.running.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("session_id", &self.inner.session_id)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn poll_events<Conn: RpcConnection>(
    connection: Conn,
    poll_ms: u64,
    inner: Arc<DispatcherInner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = connection.call(EVENT_WAIT_METHOD, vec![json!(poll_ms)]) => {
                match result.and_then(ScriptEvent::from_result) {
                    Ok(Some(event)) => inner.file(event),
                    Ok(None) => {}
                    Err(Error::ChannelClosed) => {
                        warn!("session {}: event connection closed", inner.session_id);
                        break;
                    }
                    Err(e) => {
                        debug!("session {}: eventWait failed: {}", inner.session_id, e);
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }

    connection.close().await;
    inner.running.store(false, Ordering::Release);
    inner.arrived.notify_waiters();
    debug!("session {}: event dispatcher stopped", inner.session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhost_bridge::scripting::Handshake;
    use devhost_bridge::test_utils::FakeConnector;
    use devhost_bridge::ScriptingConnector;

    async fn dispatcher(connector: &FakeConnector) -> EventDispatcher {
        let conn = connector.connect(9000, Handshake::Continue(1)).await.unwrap();
        EventDispatcher::start(conn, 10)
    }

    #[tokio::test]
    async fn test_pop_event_by_name() {
        let connector = FakeConnector::new();
        connector.push_event("BatteryChanged", json!({"level": 80}));
        connector.push_event("WifiStateChanged", json!(true));
        connector.push_event("BatteryChanged", json!({"level": 79}));

        let d = dispatcher(&connector).await;
        let first = d
            .pop_event("BatteryChanged", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(first.data["level"], 80);

        let wifi = d
            .pop_event("WifiStateChanged", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(wifi.data, json!(true));

        let second = d
            .pop_event("BatteryChanged", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second.data["level"], 79);

        d.stop().await;
        assert_eq!(connector.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_pop_event_times_out() {
        let connector = FakeConnector::new();
        let d = dispatcher(&connector).await;

        let err = d
            .pop_event("NeverSent", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EventTimeout { ref name, .. } if name == "NeverSent"));
        d.stop().await;
    }

    #[tokio::test]
    async fn test_pop_all_and_clear() {
        let connector = FakeConnector::new();
        for i in 0..3 {
            connector.push_event("Tick", json!(i));
        }
        connector.push_event("Done", json!(null));

        let d = dispatcher(&connector).await;
        d.pop_event("Done", Duration::from_secs(2)).await.unwrap();

        assert_eq!(d.pending("Tick"), 3);
        let ticks = d.pop_all("Tick");
        assert_eq!(
            ticks.iter().map(|e| e.data.clone()).collect::<Vec<_>>(),
            vec![json!(0), json!(1), json!(2)]
        );
        assert_eq!(d.pending("Tick"), 0);

        connector.push_event("Tick", json!(3));
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.clear_events("Tick");
        assert!(d.pop_all("Tick").is_empty());
        d.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let connector = FakeConnector::new();
        let d = dispatcher(&connector).await;
        let other = d.clone();
        assert!(d.ptr_eq(&other));

        d.stop().await;
        other.stop().await;
        assert!(!d.is_running());
        assert_eq!(connector.closed_connections(), 1);

        let err = d
            .pop_event("Anything", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }
}
