//! Background sweep of expired upload sessions.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use memos_core::{Error, Result};

use super::attachment_service::AttachmentService;

/// Handle for controlling a running janitor.
pub struct JanitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Signal the janitor to stop and wait for it to finish its current pass.
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the loop already exited.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("upload janitor task failed: {}", e)))
    }
}

/// Periodically runs [`AttachmentService::cleanup_expired_upload_sessions`].
pub struct UploadJanitor {
    attachments: AttachmentService,
    interval: Duration,
}

impl UploadJanitor {
    pub fn new(attachments: AttachmentService, interval: Duration) -> Self {
        Self {
            attachments,
            interval,
        }
    }

    /// Start the sweep loop. The first pass runs immediately.
    pub fn start(self) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        JanitorHandle { shutdown_tx, task }
    }

    /// One sweep; errors are logged.
    pub async fn sweep(&self) -> usize {
        match self
            .attachments
            .cleanup_expired_upload_sessions(Utc::now())
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(
                    subsystem = "upload",
                    component = "janitor",
                    error = %e,
                    "Upload session sweep finished with errors"
                );
                0
            }
        }
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        info!(
            subsystem = "upload",
            component = "janitor",
            interval_secs = self.interval.as_secs(),
            "Upload janitor started"
        );
        loop {
            let removed = self.sweep().await;
            debug!(subsystem = "upload", component = "janitor", result_count = removed, "Sweep done");

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(subsystem = "upload", component = "janitor", "Upload janitor received shutdown signal");
                    break;
                }
                _ = sleep(self.interval) => {}
            }
        }
    }
}
