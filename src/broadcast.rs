//! Fan-out of live events to connected dashboard viewers.
//!
//! A [`Broadcaster`] is created once in `app::run` and shared through
//! `AppState`. Each viewer holds a [`Subscription`]; dropping it (for
//! example when the SSE connection closes) removes the viewer. Delivery is
//! best effort: only viewers subscribed at publish time see an event.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

#[derive(Default)]
struct Inner {
    next_client_id: AtomicUsize,
    clients: Mutex<HashMap<usize, mpsc::UnboundedSender<Frame>>>,
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    // Held only for map edits, never across an await.
    fn clients(&self) -> MutexGuard<'_, HashMap<usize, mpsc::UnboundedSender<Frame>>> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients().insert(id, tx);
        tracing::debug!(client_id = id, "viewer subscribed");
        Subscription {
            id,
            rx,
            owner: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: usize) {
        if self.clients().remove(&id).is_some() {
            tracing::debug!(client_id = id, "viewer unsubscribed");
        }
    }

    /// Drops every subscriber; their streams end. Called on server shutdown.
    pub fn shutdown(&self) {
        let closed = {
            let mut clients = self.clients();
            let count = clients.len();
            clients.clear();
            count
        };
        tracing::info!(closed, "broadcaster shut down");
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients().len()
    }

    /// Sends `payload` to every current subscriber and returns how many
    /// received it. Subscribers whose connection is gone are dropped.
    pub fn publish<T: Serialize>(&self, event: &str, payload: &T) -> usize {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(event, error = %err, "dropping unserializable event");
                return 0;
            }
        };
        let frame = Frame {
            event: event.to_string(),
            data,
        };

        let mut clients = self.clients();
        let mut dead = Vec::new();
        for (id, sender) in clients.iter() {
            if sender.send(frame.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            clients.remove(id);
        }
        let delivered = clients.len();
        drop(clients);

        if !dead.is_empty() {
            tracing::debug!(event, pruned = dead.len(), "pruned disconnected viewers");
        }
        delivered
    }
}

/// One viewer's feed. Unsubscribes itself when dropped.
pub struct Subscription {
    id: usize,
    rx: mpsc::UnboundedReceiver<Frame>,
    owner: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.owner.unsubscribe(self.id);
    }
}
