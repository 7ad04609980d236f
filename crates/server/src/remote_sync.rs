//! Background push of local file writes to object storage.
//!
//! Connections enqueue a [`SyncCommand`] after the local write has landed and
//! move on without waiting; when the queue is full the push is dropped and
//! logged. A single [`RemoteSyncWriter`] drains the queue in batches: within
//! a batch only the newest write per key is uploaded, distinct keys upload
//! concurrently, and batches run in order, so the remote copy ends up
//! last-write-wins like the local one. Upload failures are durability loss and
//! are logged; they never reach the client.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::storage::{join_key, StorageClient};

/// Commands accepted by the writer
#[derive(Debug)]
pub enum SyncCommand {
    /// Upload `data` to `prefix + path`
    Push {
        workspace: String,
        prefix: String,
        path: String,
        data: Bytes,
    },
    /// Upload everything queued before this command, then reply with the
    /// totals since the previous `Flush`
    Flush { reply: oneshot::Sender<FlushReport> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub uploaded: usize,
    pub failed: usize,
}

/// Cheap-to-clone sender side
#[derive(Clone)]
pub struct RemoteSync {
    tx: mpsc::Sender<SyncCommand>,
}

impl RemoteSync {
    pub fn new(tx: mpsc::Sender<SyncCommand>) -> Self {
        Self { tx }
    }

    /// Queue an upload without waiting for queue space or for the upload.
    pub fn push(&self, workspace: &str, prefix: &str, path: &str, data: Bytes) {
        let cmd = SyncCommand::Push {
            workspace: workspace.to_string(),
            prefix: prefix.to_string(),
            path: path.to_string(),
            data,
        };
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let e = GatewayError::RemoteSyncQueueFull;
                error!(
                    component = "remote_sync",
                    event = "remote_sync.queue_full",
                    workspace = %workspace,
                    path = %path,
                    code = e.code(),
                    error = %e,
                    "Remote sync queue is full, write will not reach object storage"
                );
            }
            Err(TrySendError::Closed(_)) => {
                error!(
                    component = "remote_sync",
                    event = "remote_sync.queue_closed",
                    workspace = %workspace,
                    path = %path,
                    "Remote sync writer is gone, write will not reach object storage"
                );
            }
        }
    }

    /// Wait for everything queued so far to be uploaded.
    pub async fn flush(&self) -> FlushReport {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SyncCommand::Flush { reply }).await.is_err() {
            return FlushReport::default();
        }
        rx.await.unwrap_or_default()
    }
}

pub fn create_sync_channel() -> (mpsc::Sender<SyncCommand>, mpsc::Receiver<SyncCommand>) {
    mpsc::channel(1000)
}

struct PendingPush {
    workspace: String,
    key: String,
    data: Bytes,
}

/// Drains the sync queue in batches.
pub struct RemoteSyncWriter {
    rx: mpsc::Receiver<SyncCommand>,
    storage: StorageClient,
    batch: Vec<PendingPush>,
    batch_size: usize,
    flush_interval: Duration,
    upload_timeout: Duration,
    since_last_report: FlushReport,
}

impl RemoteSyncWriter {
    pub fn new(
        rx: mpsc::Receiver<SyncCommand>,
        storage: StorageClient,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            rx,
            storage,
            batch: Vec::with_capacity(64),
            batch_size: 32,
            flush_interval: Duration::from_millis(100),
            upload_timeout,
            since_last_report: FlushReport::default(),
        }
    }

    /// Run until every sender is dropped (call from tokio::spawn)
    pub async fn run(mut self) {
        info!(
            component = "remote_sync",
            event = "remote_sync.started",
            "RemoteSyncWriter started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(SyncCommand::Push { workspace, prefix, path, data }) => {
                        self.batch.push(PendingPush {
                            workspace,
                            key: join_key(&prefix, &path),
                            data,
                        });
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    Some(SyncCommand::Flush { reply }) => {
                        self.flush().await;
                        let _ = reply.send(std::mem::take(&mut self.since_last_report));
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        info!(
            component = "remote_sync",
            event = "remote_sync.stopped",
            "RemoteSyncWriter stopped"
        );
    }

    async fn flush(&mut self) -> FlushReport {
        if self.batch.is_empty() {
            return FlushReport::default();
        }

        let batch = coalesce(std::mem::take(&mut self.batch));
        let uploads = batch.into_iter().map(|push| {
            let storage = self.storage.clone();
            let timeout = self.upload_timeout;
            async move {
                let result =
                    match tokio::time::timeout(timeout, storage.put(&push.key, "", push.data))
                        .await
                    {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(GatewayError::RemoteSync(e)),
                        Err(_) => Err(GatewayError::RemoteSyncTimeout(timeout)),
                    };
                if let Err(e) = &result {
                    error!(
                        component = "remote_sync",
                        event = "remote_sync.push_failed",
                        workspace = %push.workspace,
                        key = %push.key,
                        code = e.code(),
                        error = %e,
                        "Write was not pushed to object storage"
                    );
                }
                result.is_ok()
            }
        });

        let results = join_all(uploads).await;
        let uploaded = results.iter().filter(|ok| **ok).count();
        let report = FlushReport {
            uploaded,
            failed: results.len() - uploaded,
        };
        self.since_last_report.uploaded += report.uploaded;
        self.since_last_report.failed += report.failed;
        if report.failed > 0 {
            warn!(
                component = "remote_sync",
                event = "remote_sync.flush_partial",
                uploaded = report.uploaded,
                failed = report.failed,
                "Some writes were not pushed"
            );
        } else {
            debug!(
                component = "remote_sync",
                event = "remote_sync.flushed",
                uploaded = report.uploaded,
                "Pushed batch"
            );
        }
        report
    }
}

/// Keep only the newest push per key, in first-seen key order.
fn coalesce(batch: Vec<PendingPush>) -> Vec<PendingPush> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<PendingPush> = Vec::with_capacity(batch.len());
    for push in batch {
        match index.get(&push.key) {
            Some(&i) => out[i] = push,
            None => {
                index.insert(push.key.clone(), out.len());
                out.push(push);
            }
        }
    }
    out
}
