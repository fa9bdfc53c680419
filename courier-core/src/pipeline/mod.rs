//! Event pipeline
//!
//! Two queues decouple the caller from disk and network I/O:
//!
//! ```text
//!   put() ──▶ write queue ──▶ [writer]  ──▶ Storage::write_event
//!                                │ flush policy fired / flush()
//!                                ▼
//!                          upload queue ──▶ [uploader] ──▶ retry gate ──▶ BatchUploader
//! ```
//!
//! `put` and `flush` never block. The writer is the only task appending to
//! the open batch; the uploader is the only task reading and removing closed
//! batches, one file at a time, so retry state updates are serialized.

mod policies;
mod upload;

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::Event;
use crate::retry::{
    load_retry_state, save_retry_state, BatchDisposition, ResponseInfo, RetryConfig, RetryState,
    RetryStateMachine, SystemTimeProvider, TimeProvider, UploadDecision,
};
use crate::storage::Storage;

pub use policies::{
    default_policies, CountBasedFlushPolicy, FlushPolicy, FlushTrigger, FrequencyFlushPolicy,
    StartupFlushPolicy, DEFAULT_FLUSH_AT,
};
pub use upload::{BatchUploader, UploadError};

enum WriteMessage {
    Event(Box<Event>),
    /// Upload now; the sender is completed once the upload cycle is done.
    Flush(Option<oneshot::Sender<()>>),
}

type UploadSignal = Option<oneshot::Sender<()>>;

struct Shared {
    write_key: String,
    storage: Arc<dyn Storage>,
    uploader: Arc<dyn BatchUploader>,
    policies: Vec<Arc<dyn FlushPolicy>>,
    api_host: RwLock<String>,
    retry_config: RwLock<Arc<RetryConfig>>,
    time: Arc<dyn TimeProvider>,
    running: AtomicBool,
    upload_lock: tokio::sync::Mutex<()>,
}

struct Control {
    write_tx: mpsc::UnboundedSender<WriteMessage>,
    /// Present until a writer task takes it
    write_rx: Option<mpsc::UnboundedReceiver<WriteMessage>>,
    token: Option<CancellationToken>,
}

/// Per-destination queue from `put` to the collection endpoint.
pub struct EventPipeline {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl EventPipeline {
    pub fn new(
        write_key: impl Into<String>,
        storage: Arc<dyn Storage>,
        uploader: Arc<dyn BatchUploader>,
        api_host: impl Into<String>,
        policies: Vec<Arc<dyn FlushPolicy>>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                write_key: write_key.into(),
                storage,
                uploader,
                policies,
                api_host: RwLock::new(api_host.into()),
                retry_config: RwLock::new(Arc::new(RetryConfig::default())),
                time: Arc::new(SystemTimeProvider),
                running: AtomicBool::new(false),
                upload_lock: tokio::sync::Mutex::new(()),
            }),
            control: Mutex::new(Control {
                write_tx,
                write_rx: Some(write_rx),
                token: None,
            }),
        }
    }

    /// Replace the clock used for retry decisions. Only valid before `start`.
    pub fn with_time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.time = time;
        }
        self
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        match self.control.lock() {
            Ok(control) => control,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn write_key(&self) -> &str {
        &self.shared.write_key
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.storage
    }

    pub fn policies(&self) -> &[Arc<dyn FlushPolicy>] {
        &self.shared.policies
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn api_host(&self) -> String {
        self.shared.api_host()
    }

    pub fn set_api_host(&self, api_host: impl Into<String>) {
        if let Ok(mut host) = self.shared.api_host.write() {
            *host = api_host.into();
        }
    }

    pub fn retry_config(&self) -> Arc<RetryConfig> {
        self.shared.retry_config()
    }

    /// Takes effect from the next upload cycle.
    pub fn set_retry_config(&self, config: RetryConfig) {
        if config.is_legacy_mode() {
            tracing::info!(write_key = %self.shared.write_key, "Retry handling in legacy mode");
        }
        if let Ok(mut current) = self.shared.retry_config.write() {
            *current = Arc::new(config);
        }
    }

    /// Queue an event for persistence. Never blocks.
    pub fn put(&self, event: Event) {
        let control = self.lock_control();
        if control
            .write_tx
            .send(WriteMessage::Event(Box::new(event)))
            .is_err()
        {
            tracing::warn!(write_key = %self.shared.write_key, "Pipeline stopped, event dropped");
        }
    }

    /// Ask for an upload of everything persisted so far. Never blocks.
    pub fn flush(&self) {
        let control = self.lock_control();
        let _ = control.write_tx.send(WriteMessage::Flush(None));
    }

    /// Like [`flush`](Self::flush), but resolves once the upload cycle it
    /// triggered has finished.
    pub async fn flush_and_wait(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Runtime("pipeline is not running".to_string()));
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let control = self.lock_control();
            control
                .write_tx
                .send(WriteMessage::Flush(Some(ack_tx)))
                .map_err(|_| Error::Runtime("pipeline queue closed".to_string()))?;
        }
        ack_rx
            .await
            .map_err(|_| Error::Runtime("pipeline stopped before flush completed".to_string()))
    }

    /// Run one upload cycle on the caller's task, outside the queues.
    pub async fn upload_pending(&self) {
        self.shared.upload_all().await;
    }

    /// Spawn the writer and uploader tasks and schedule flush policies.
    ///
    /// Calling it on a running pipeline does nothing. After `stop`, a fresh
    /// write queue replaces the closed one.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("no async runtime: {}", e)))?;

        let mut control = self.lock_control();
        if control.token.is_some() {
            return Ok(());
        }

        let write_rx = match control.write_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                control.write_tx = tx;
                rx
            }
        };
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        handle.spawn(write_loop(
            Arc::clone(&self.shared),
            write_rx,
            upload_tx,
            token.clone(),
        ));
        handle.spawn(upload_loop(Arc::clone(&self.shared), upload_rx, token.clone()));

        let trigger_tx = control.write_tx.clone();
        let trigger = FlushTrigger::new(move || {
            let _ = trigger_tx.send(WriteMessage::Flush(None));
        });
        for policy in &self.shared.policies {
            policy.schedule(trigger.clone());
        }

        control.token = Some(token);
        self.shared.running.store(true, Ordering::SeqCst);
        tracing::debug!(write_key = %self.shared.write_key, "Pipeline started");
        Ok(())
    }

    /// Cancel both tasks and unschedule policies. Events still in the write
    /// queue are discarded; persisted batches stay on disk.
    pub fn stop(&self) {
        let mut control = self.lock_control();
        let Some(token) = control.token.take() else {
            return;
        };
        token.cancel();
        for policy in &self.shared.policies {
            policy.unschedule();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        tracing::debug!(write_key = %self.shared.write_key, "Pipeline stopped");
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<WriteMessage>,
    upload_tx: mpsc::UnboundedSender<UploadSignal>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let ack = match message {
            WriteMessage::Event(event) => {
                shared.persist(&event);
                if !shared.policies.iter().any(|p| p.should_flush()) {
                    continue;
                }
                None
            }
            WriteMessage::Flush(ack) => ack,
        };

        for policy in &shared.policies {
            policy.reset();
        }
        if upload_tx.send(ack).is_err() {
            break;
        }
    }
}

async fn upload_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<UploadSignal>,
    token: CancellationToken,
) {
    loop {
        let ack = tokio::select! {
            _ = token.cancelled() => break,
            signal = rx.recv() => match signal {
                Some(ack) => ack,
                None => break,
            },
        };

        shared.upload_all().await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

impl Shared {
    fn api_host(&self) -> String {
        self.api_host
            .read()
            .map(|host| host.to_string())
            .unwrap_or_default()
    }

    fn retry_config(&self) -> Arc<RetryConfig> {
        self.retry_config
            .read()
            .map(|config| Arc::clone(&*config))
            .unwrap_or_default()
    }

    fn persist(&self, event: &Event) {
        let written = event
            .to_payload()
            .and_then(|payload| self.storage.write_event(&payload));
        if let Err(e) = written {
            tracing::warn!(
                write_key = %self.write_key,
                message_id = %event.message_id,
                error = %e,
                "Failed to persist event"
            );
        }
        for policy in &self.policies {
            policy.update_state(event);
        }
    }

    fn save_state(&self, state: &RetryState) {
        if !save_retry_state(self.storage.as_ref(), state) {
            tracing::warn!(write_key = %self.write_key, "Retry state not persisted");
        }
    }

    fn read_batch(&self, file: &Path) -> Option<Vec<u8>> {
        let mut stream = self.storage.read_as_stream(file)?;
        let mut body = Vec::new();
        match stream.read_to_end(&mut body) {
            Ok(_) => Some(body),
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Failed to read batch");
                None
            }
        }
    }

    /// Roll over, then walk closed batches oldest first through the retry
    /// gate and the uploader.
    async fn upload_all(&self) {
        let _cycle = self.upload_lock.lock().await;

        if let Err(e) = self.storage.rollover() {
            tracing::warn!(write_key = %self.write_key, error = %e, "Rollover failed");
        }
        let files = match self.storage.read_event_files() {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(write_key = %self.write_key, error = %e, "Failed to list batches");
                return;
            }
        };
        if files.is_empty() {
            return;
        }

        let config = self.retry_config();
        let machine = RetryStateMachine::new(config.as_ref().clone());
        let mut state = load_retry_state(self.storage.as_ref());
        let api_host = self.api_host();

        for file in files {
            let batch_id = file
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();

            let now = self.time.current_time_millis();
            let (decision, gated) = machine.should_upload_batch(&state, &batch_id, now);
            if gated != state {
                state = gated;
                self.save_state(&state);
            }

            match decision {
                UploadDecision::Proceed => {}
                UploadDecision::SkipThisBatch => {
                    tracing::debug!(file = %file.display(), "Batch in backoff, skipping");
                    continue;
                }
                UploadDecision::SkipAllBatches => {
                    tracing::debug!(write_key = %self.write_key, "Rate limited, skipping upload cycle");
                    break;
                }
                UploadDecision::DropBatch(reason) => {
                    tracing::warn!(file = %file.display(), %reason, "Dropping batch");
                    self.storage.remove_file(&file);
                    continue;
                }
            }

            let Some(body) = self.read_batch(&file) else {
                continue;
            };
            let size = body.len();

            let (status_code, retry_after_seconds) =
                match self.uploader.upload(&api_host, body).await {
                    Ok(()) => (200, None),
                    Err(UploadError::Http {
                        status,
                        retry_after,
                    }) => (status, retry_after),
                    Err(UploadError::Transport(e)) => {
                        tracing::warn!(file = %file.display(), error = %e, "Upload failed, batch kept");
                        continue;
                    }
                };

            let response = ResponseInfo {
                status_code,
                retry_after_seconds,
                batch_file: batch_id,
                current_time: self.time.current_time_millis(),
            };
            let (next, disposition) = machine.handle_response(&state, &response);

            match disposition {
                BatchDisposition::Delete => {
                    if (200..300).contains(&status_code) {
                        tracing::info!(file = %file.display(), bytes = size, "Batch uploaded");
                    } else {
                        tracing::warn!(file = %file.display(), status = status_code, "Batch rejected, dropped");
                    }
                    self.storage.remove_file(&file);
                }
                BatchDisposition::Keep => {
                    tracing::info!(file = %file.display(), status = status_code, "Batch kept for retry");
                }
            }

            if next != state {
                state = next;
                self.save_state(&state);
            }

            if status_code == 429
                && config.rate_limit_config.enabled
                && state.global_retry_count > config.rate_limit_config.max_retry_count
            {
                tracing::warn!(
                    write_key = %self.write_key,
                    count = state.global_retry_count,
                    "Rate limited beyond the configured retry count"
                );
            }
        }
    }
}
