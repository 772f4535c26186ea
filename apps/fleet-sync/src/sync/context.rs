//! Per-cycle state shared by the upload and download phases

use std::future::Future;

use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::remote::RemoteStore;
use crate::store::LocalStore;

pub(crate) struct CycleContext<'a> {
    pub store: &'a LocalStore,
    pub remote: &'a dyn RemoteStore,
    pub config: &'a SyncConfig,
    /// Host cancellation (suspend, explicit cancel)
    cancel: watch::Receiver<bool>,
    /// Tripped by a cycle-fatal error in any table
    abort: watch::Sender<bool>,
}

impl<'a> CycleContext<'a> {
    pub fn new(
        store: &'a LocalStore,
        remote: &'a dyn RemoteStore,
        config: &'a SyncConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            store,
            remote,
            config,
            cancel,
            abort,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || *self.abort.borrow()
    }

    /// Stop sibling tables at their next remote call
    pub fn abort(&self) {
        self.abort.send_replace(true);
    }

    /// Run a remote call under the request timeout, racing cancellation
    pub async fn call<T, F>(&self, request: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let timeout = self.config.request_timeout();
        let mut cancel = self.cancel.clone();
        let mut abort = self.abort.subscribe();

        tokio::select! {
            biased;
            _ = raised(&mut cancel) => Err(RemoteError::Cancelled),
            _ = raised(&mut abort) => Err(RemoteError::Cancelled),
            result = tokio::time::timeout(timeout, request) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(RemoteError::Timeout(timeout)),
            },
        }
    }
}

/// Resolves once the flag is set; never resolves if the sender is gone
async fn raised(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
