use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::*;

use super::{FetchOptions, FetchResult, Progress, WalkFetchConnection};
use crate::cancel::CancelFlag;
use crate::error::{Error, Result};
use crate::object_id::ObjectId;
use crate::odb::ObjectDatabase;
use crate::remote::WalkRemoteObjectDatabase;

/// A fetch running on its own worker thread.
///
/// Progress arrives on [`FetchJob::progress`] until the worker finishes, at which point the
/// channel disconnects.
pub struct FetchJob {
    cancel: CancelFlag,
    progress: Receiver<Progress>,
    handle: JoinHandle<Result<FetchResult>>,
}

impl FetchJob {
    pub fn spawn(
        local: Arc<ObjectDatabase>,
        remote: Box<dyn WalkRemoteObjectDatabase>,
        wants: Vec<ObjectId>,
        haves: Vec<ObjectId>,
        options: FetchOptions,
    ) -> Result<Self> {
        let cancel = CancelFlag::new();
        let (tx, progress) = mpsc::channel();

        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("rit-fetch".into())
            .spawn(move || {
                WalkFetchConnection::new(&local, remote, options)
                    .with_cancel(worker_cancel)
                    .with_progress(tx)
                    .fetch(&wants, &haves)
            })?;

        Ok(Self {
            cancel,
            progress,
            handle,
        })
    }

    /// Ask the worker to stop. It winds down at its next frontier step or read, closing every
    /// connection, and [`FetchJob::join`] then returns [`Error::Cancelled`].
    pub fn cancel(&self) {
        debug!("Cancelling fetch");
        self.cancel.cancel();
    }

    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    /// Wait for the worker and return its outcome.
    pub fn join(self) -> Result<FetchResult> {
        self.handle
            .join()
            .map_err(|_| Error::Transport("fetch worker panicked".into()))?
    }
}
