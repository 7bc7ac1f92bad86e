//! Per-document push scheduling.
//!
//! Change notifications are debounced, serialized per document, and retried
//! with exponential backoff on transient failures. Every document moves
//! through `Idle → Dirty → Uploading → (Idle | Dirty)`; uploads for one
//! document never overlap, and notifications arriving while an upload is in
//! flight collapse into exactly one follow-up upload. Uploads of distinct
//! documents run in parallel under a global ceiling.
//!
//! The scheduler does not know how to push; it drives an [`Uploader`] (the
//! storage manager) through a weak reference, mirroring how the handle and
//! its worker are split in two-phase initialization.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt as _;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Semaphore};

use crate::error::{Result, StorageError};

/// The push operation itself, provided by the storage manager.
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    /// Perform one complete push of the document's current content,
    /// returning the minted snapshot id.
    async fn push(&self, doc_id: &str, label: Option<String>) -> Result<String>;

    /// Whether an error from [`Self::push`] is beyond retrying.
    fn is_fatal_push_error(&self, err: &StorageError) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocStatus {
    Idle,
    Dirty,
    Uploading,
}

#[derive(Clone, Debug)]
pub struct PushOptions {
    /// Delay between a change notification and the push it schedules.
    pub debounce: Duration,
    /// First retry delay after a transient failure; doubles per attempt.
    pub first_retry: Duration,
    /// Transient failures tolerated before giving up.
    pub retry_attempts: u32,
    /// Global ceiling on concurrent uploads.
    pub max_parallel: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            first_retry: Duration::from_secs(3),
            retry_attempts: 5,
            max_parallel: 4,
        }
    }
}

type FlushReply = core::result::Result<Option<String>, Arc<StorageError>>;

enum Msg {
    Dirty,
    Flush {
        label: Option<String>,
        force: bool,
        done: oneshot::Sender<FlushReply>,
    },
    Stop,
}

struct DocPusher {
    tx: mpsc::UnboundedSender<Msg>,
    status: Arc<Mutex<DocStatus>>,
}

/// Handle to the scheduling state. Freely cloneable; the manager and the
/// document handles share it.
#[derive(Clone)]
pub struct PushScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    uploader: OnceLock<Weak<dyn Uploader>>,
    opts: PushOptions,
    limiter: Arc<Semaphore>,
    docs: Mutex<HashMap<String, DocPusher>>,
    /// Publishes `(doc_id, snapshot_id)` of the most recent completed push.
    pushed: watch::Sender<Option<(String, String)>>,
}

impl PushScheduler {
    pub fn new(opts: PushOptions) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                uploader: OnceLock::new(),
                limiter: Arc::new(Semaphore::new(opts.max_parallel.max(1))),
                opts,
                docs: Mutex::new(HashMap::new()),
                pushed: watch::channel(None).0,
            }),
        }
    }

    /// Finish initialization by wiring up the [`Uploader`].
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&self, uploader: Weak<dyn Uploader>) {
        self.inner
            .uploader
            .set(uploader)
            .unwrap_or_else(|_| panic!("push scheduler already started"));
    }

    /// Note that the document changed. Schedules a debounced push, or a
    /// follow-up if an upload is already in flight.
    pub fn mark_dirty(&self, doc_id: &str) {
        let mut docs = self.inner.docs.lock();
        let pusher = self.pusher_entry(&mut *docs, doc_id);
        {
            let mut status = pusher.status.lock();
            if *status == DocStatus::Idle {
                *status = DocStatus::Dirty;
            }
        }
        let _ = pusher.tx.unbounded_send(Msg::Dirty);
    }

    /// Push now and wait for completion.
    ///
    /// With `force`, a push happens even if the document is clean (used for
    /// labeled backups and post-migration snapshots); otherwise a clean
    /// document resolves to `Ok(None)` without touching storage.
    pub async fn flush_doc(&self, doc_id: &str, label: Option<String>, force: bool) -> Result<Option<String>> {
        let (tx, status) = {
            let mut docs = self.inner.docs.lock();
            if !force && !docs.contains_key(doc_id) {
                return Ok(None);
            }
            let pusher = self.pusher_entry(&mut *docs, doc_id);
            (pusher.tx.clone(), Arc::clone(&pusher.status))
        };
        if !force && *status.lock() == DocStatus::Idle {
            return Ok(None);
        }
        let (done, wait) = oneshot::channel();
        tx.unbounded_send(Msg::Flush { label, force, done })
            .map_err(|_| StorageError::Transient(format!("push worker for {doc_id} is gone")))?;
        match wait.await {
            Ok(Ok(snapshot_id)) => Ok(snapshot_id),
            Ok(Err(shared)) => Err(match Arc::try_unwrap(shared) {
                Ok(err) => err,
                Err(shared) => StorageError::Transient(shared.to_string()),
            }),
            Err(_) => Err(StorageError::Transient(format!("push worker for {doc_id} exited"))),
        }
    }

    /// Flush the pending dirt of every known document.
    pub async fn flush_all(&self) -> Result<()> {
        let doc_ids: Vec<String> = self.inner.docs.lock().keys().cloned().collect();
        for doc_id in doc_ids {
            self.flush_doc(&doc_id, None, false).await?;
        }
        Ok(())
    }

    /// True iff any document has work pending or in flight.
    pub fn needs_update(&self) -> bool {
        self.inner
            .docs
            .lock()
            .values()
            .any(|p| *p.status.lock() != DocStatus::Idle)
    }

    /// Drop the document's pusher, discarding any pending dirt.
    pub fn stop_doc(&self, doc_id: &str) {
        if let Some(pusher) = self.inner.docs.lock().remove(doc_id) {
            let _ = pusher.tx.unbounded_send(Msg::Stop);
        }
    }

    /// Observe completed pushes as `(doc_id, snapshot_id)` pairs.
    pub fn subscribe(&self) -> watch::Receiver<Option<(String, String)>> {
        self.inner.pushed.subscribe()
    }

    fn pusher_entry<'a>(&self, docs: &'a mut HashMap<String, DocPusher>, doc_id: &str) -> &'a DocPusher {
        docs.entry(doc_id.to_string()).or_insert_with(|| {
            let uploader = self
                .inner
                .uploader
                .get()
                .expect("push scheduler used before start()")
                .clone();
            let (tx, rx) = mpsc::unbounded();
            let status = Arc::new(Mutex::new(DocStatus::Idle));
            let actor = PusherActor {
                doc_id: doc_id.to_string(),
                rx,
                status: Arc::clone(&status),
                uploader,
                opts: self.inner.opts.clone(),
                limiter: Arc::clone(&self.inner.limiter),
                pushed: self.inner.pushed.clone(),
            };
            tokio::spawn(actor.run());
            DocPusher { tx, status }
        })
    }
}

struct PusherActor {
    doc_id: String,
    rx: mpsc::UnboundedReceiver<Msg>,
    status: Arc<Mutex<DocStatus>>,
    uploader: Weak<dyn Uploader>,
    opts: PushOptions,
    limiter: Arc<Semaphore>,
    pushed: watch::Sender<Option<(String, String)>>,
}

impl PusherActor {
    /// One iteration per upload cycle: collect dirt through the debounce
    /// window, upload once, answer any flush waiters, repeat. Messages that
    /// queue up during an upload are absorbed by the next cycle, which is
    /// what collapses them into a single follow-up.
    async fn run(mut self) {
        let mut carry: Option<Msg> = None;
        loop {
            let msg = match carry.take() {
                Some(msg) => msg,
                None => match self.rx.next().await {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let mut dirty = false;
            let mut force = false;
            let mut label: Option<String> = None;
            let mut waiters: Vec<oneshot::Sender<FlushReply>> = Vec::new();
            let mut stopping = false;

            match msg {
                Msg::Dirty => dirty = true,
                Msg::Flush { label: l, force: f, done } => {
                    if l.is_some() {
                        label = l;
                    }
                    force |= f;
                    waiters.push(done);
                }
                Msg::Stop => break,
            }
            *self.status.lock() = DocStatus::Dirty;

            // Debounce: absorb further notifications until the window
            // closes. A flush request short-circuits the window.
            if waiters.is_empty() {
                let window = tokio::time::sleep(self.opts.debounce);
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        _ = &mut window => break,
                        msg = self.rx.next() => match msg {
                            Some(Msg::Dirty) => dirty = true,
                            Some(Msg::Flush { label: l, force: f, done }) => {
                                if l.is_some() {
                                    label = l;
                                }
                                force |= f;
                                waiters.push(done);
                                break;
                            }
                            Some(Msg::Stop) | None => {
                                stopping = true;
                                break;
                            }
                        }
                    }
                }
            }
            if stopping {
                break;
            }

            if !dirty && !force {
                // A flush of a clean document: nothing to publish.
                *self.status.lock() = DocStatus::Idle;
                for done in waiters {
                    let _ = done.send(Ok(None));
                }
                continue;
            }

            *self.status.lock() = DocStatus::Uploading;
            let result = self.push_with_retries(label).await;
            match &result {
                Ok(snapshot_id) => {
                    debug!("pushed {} as snapshot {snapshot_id}", self.doc_id);
                    self.pushed
                        .send_replace(Some((self.doc_id.clone(), snapshot_id.clone())));
                }
                Err(e) => warn!("push of {} failed: {e}", self.doc_id),
            }
            // Settle the next state before answering waiters, so a caller
            // observing its flush completion sees a consistent status.
            // Anything queued during the upload starts the next cycle.
            let mut closed = false;
            match self.rx.try_next() {
                Ok(Some(msg)) => {
                    *self.status.lock() = DocStatus::Dirty;
                    carry = Some(msg);
                }
                Ok(None) => closed = true,
                Err(_) => {
                    *self.status.lock() = if result.is_ok() {
                        DocStatus::Idle
                    } else {
                        // Retries exhausted with unpushed changes: stay
                        // dirty so close-time flushes try again.
                        DocStatus::Dirty
                    };
                }
            }

            let shared = result.as_ref().err().cloned();
            for done in waiters {
                let _ = done.send(match (&result, &shared) {
                    (Ok(id), _) => Ok(Some(id.clone())),
                    (_, Some(err)) => Err(Arc::clone(err)),
                    _ => unreachable!(),
                });
            }
            if closed {
                break;
            }
        }
        *self.status.lock() = DocStatus::Idle;
    }

    async fn push_with_retries(&self, label: Option<String>) -> core::result::Result<String, Arc<StorageError>> {
        let mut delay = self.opts.first_retry;
        let mut attempt = 0u32;
        loop {
            let Some(uploader) = self.uploader.upgrade() else {
                return Err(Arc::new(StorageError::Transient(
                    "storage manager shut down".into(),
                )));
            };
            let result = {
                let _permit = self.limiter.acquire().await.expect("push limiter closed");
                uploader.push(&self.doc_id, label.clone()).await
            };
            match result {
                Ok(snapshot_id) => return Ok(snapshot_id),
                Err(e) if !uploader.is_fatal_push_error(&e) && attempt < self.opts.retry_attempts => {
                    attempt += 1;
                    warn!(
                        "transient push failure for {} (attempt {attempt}): {e}",
                        self.doc_id
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(Arc::new(e)),
            }
        }
    }
}
