//! Supervision of a process's long-lived sessions: replica accept loops, the
//! client's freshness owner and completion listener.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cloneable handle for starting sessions under a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SessionSpawner {
    failures: mpsc::UnboundedSender<crate::Error>,
    shutdown: CancellationToken,
}

impl SessionSpawner {
    /// Runs `session` until it returns or the supervisor shuts down. An error
    /// or a panic is reported to the supervisor under `name`.
    pub fn spawn<F>(&self, name: &'static str, session: F)
    where
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let failures = self.failures.clone();
        let shutdown = self.shutdown.clone();
        let mut handle = tokio::spawn(session);
        tokio::spawn(async move {
            let joined = tokio::select! {
                joined = &mut handle => joined,
                () = shutdown.cancelled() => {
                    handle.abort();
                    debug!("{name} stopped");
                    return;
                }
            };
            let failure = match joined {
                Ok(Ok(())) => {
                    debug!("{name} finished");
                    return;
                }
                Ok(Err(err)) => err.context(format!("{name} failed")),
                Err(err) if err.is_panic() => crate::err!("{name} panicked"),
                Err(_) => return,
            };
            if failures.send(failure).is_err() {
                debug!("{name} failed after its supervisor exited")
            }
        });
    }
}

#[derive(Debug)]
pub struct Supervisor {
    failure_sender: mpsc::UnboundedSender<crate::Error>,
    failures: mpsc::UnboundedReceiver<crate::Error>,
    shutdown: CancellationToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        let (failure_sender, failures) = mpsc::unbounded_channel();
        Self {
            failure_sender,
            failures,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Supervisor {
    pub fn spawner(&self) -> SessionSpawner {
        SessionSpawner {
            failures: self.failure_sender.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Resolves with the first session failure, stopping every other session,
    /// or with `Ok` after [`Supervisor::shutdown`].
    pub async fn wait(&mut self) -> crate::Result<()> {
        tokio::select! {
            Some(failure) = self.failures.recv() => {
                self.shutdown.cancel();
                Err(failure)
            }
            () = self.shutdown.cancelled() => Ok(()),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel()
    }
}
