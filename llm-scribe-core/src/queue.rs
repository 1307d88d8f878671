//! Global request queue for completion calls.
//!
//! Every completion request in the process goes through one FIFO. A single
//! worker task drains it, waiting so that no two dispatches start less than
//! `interval` apart. The worker exits when the queue is empty and is started
//! again by the next [`RequestQueue::enqueue`]; at most one worker runs at a
//! time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::completion::CompletionAdapter;
use crate::contract::CompletionError;

/// A pending completion request and the channel its result is sent on.
struct QueueItem {
    content: String,
    prompt: String,
    reply: oneshot::Sender<Result<String, CompletionError>>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    worker_active: bool,
    last_dispatch: Option<Instant>,
}

struct QueueInner {
    adapter: CompletionAdapter,
    interval: Duration,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(adapter: CompletionAdapter, interval: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                adapter,
                interval,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a completion and wait for its result.
    pub async fn enqueue(&self, content: String, prompt: String) -> Result<String, CompletionError> {
        let (reply, receiver) = oneshot::channel();
        let start_worker = {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            state.items.push_back(QueueItem {
                content,
                prompt,
                reply,
            });
            debug!(depth = state.items.len(), "[QUEUE] Request enqueued");
            let start = !state.worker_active;
            state.worker_active = true;
            start
        };
        if start_worker {
            debug!("[QUEUE] Starting worker");
            tokio::spawn(Self::drain(Arc::clone(&self.inner)));
        }
        receiver.await.unwrap_or(Err(CompletionError::QueueClosed))
    }

    async fn drain(inner: Arc<QueueInner>) {
        loop {
            let (item, last_dispatch) = {
                let mut state = inner.state.lock().expect("queue lock poisoned");
                match state.items.pop_front() {
                    Some(item) => (item, state.last_dispatch),
                    None => {
                        state.worker_active = false;
                        debug!("[QUEUE] Queue empty; worker going idle");
                        return;
                    }
                }
            };

            if let Some(last) = last_dispatch {
                let ready_at = last + inner.interval;
                if ready_at > Instant::now() {
                    debug!(wait = ?(ready_at - Instant::now()), "[QUEUE] Waiting out request interval");
                    tokio::time::sleep_until(ready_at).await;
                }
            }

            inner.state.lock().expect("queue lock poisoned").last_dispatch = Some(Instant::now());
            info!("[QUEUE] Dispatching completion request");
            let result = inner.adapter.complete(&item.content, &item.prompt).await;
            if item.reply.send(result).is_err() {
                debug!("[QUEUE] Requester went away before the result arrived");
            }
        }
    }
}
