//! Live worker stream bookkeeping.
//!
//! The hub owns nothing but handles: each stream's receive loop is the
//! sole owner of its teardown, and the dispatcher only ever enqueues
//! frames onto a stream's outbound channel. Registering a new stream for
//! a node returns the superseded handle so the caller can close it.

use onlyboxes_api_grpc::worker_v1::ConsoleFrame;
use onlyboxes_protocol::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Handle to one live worker stream.
#[derive(Debug)]
pub struct StreamHandle {
    session_id: String,
    outbound: mpsc::Sender<ConsoleFrame>,
    close: watch::Sender<bool>,
}

impl StreamHandle {
    pub fn new(session_id: String, outbound: mpsc::Sender<ConsoleFrame>) -> Self {
        let (close, _) = watch::channel(false);
        Self {
            session_id,
            outbound,
            close,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Enqueue a frame without waiting. A full or closed channel is a
    /// send failure; the caller decides whether that fails the command.
    pub fn try_send(&self, frame: ConsoleFrame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Ask the stream's receive loop to exit. Idempotent.
    pub fn signal_close(&self) {
        let _ = self.close.send(true);
    }

    /// Receiver for the close signal; the receive loop selects on this.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }
}

/// node_id → live stream handle. At most one per node.
#[derive(Debug, Default)]
pub struct StreamHub {
    inner: Mutex<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the stream for a node, returning the handle it replaced
    /// (if any) so the caller can signal it closed.
    pub fn register(&self, node_id: &NodeId, handle: Arc<StreamHandle>) -> Option<Arc<StreamHandle>> {
        let mut inner = self.inner.lock().expect("stream hub lock poisoned");
        inner.insert(node_id.as_str().to_string(), handle)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<StreamHandle>> {
        let inner = self.inner.lock().expect("stream hub lock poisoned");
        inner.get(node_id.as_str()).cloned()
    }

    /// Remove the node's entry only if it still belongs to `session_id`.
    /// A superseded stream's teardown must not evict its successor.
    pub fn remove_if_match(&self, node_id: &NodeId, session_id: &str) -> Option<Arc<StreamHandle>> {
        let mut inner = self.inner.lock().expect("stream hub lock poisoned");
        match inner.get(node_id.as_str()) {
            Some(handle) if handle.session_id() == session_id => inner.remove(node_id.as_str()),
            _ => None,
        }
    }

    /// Signal every stream closed (process shutdown).
    pub fn close_all(&self) {
        let inner = self.inner.lock().expect("stream hub lock poisoned");
        for handle in inner.values() {
            handle.signal_close();
        }
    }
}
