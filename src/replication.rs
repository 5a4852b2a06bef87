//! Leader-side fan-out of a write to every follower.
//!
//! The gate is all-of: a write counts as replicated only when every follower
//! configured at construction has answered `ReplicationOk`. There is no
//! quorum and, unless a timeout is configured, no deadline: a silent follower
//! blocks acknowledgement indefinitely.

use std::{net::SocketAddr, time::Duration};

use tokio::{task::JoinSet, time::timeout};
use tracing::warn;

use crate::{
    envelope::{Envelope, Replication, Response},
    net,
};

#[derive(Debug, Clone)]
pub struct Replicator {
    followers: Vec<SocketAddr>,
    timeout: Option<Duration>,
}

impl Replicator {
    pub fn new(followers: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            followers: followers.into_iter().collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn followers(&self) -> &[SocketAddr] {
        &self.followers
    }

    /// Sends `write` to all followers concurrently and returns once all of
    /// them acknowledged it.
    ///
    /// Every follower is contacted even if another one fails; the first
    /// failure is reported after the rest have finished.
    pub async fn replicate(&self, write: &Replication) -> crate::Result<()> {
        let mut tasks = JoinSet::new();
        for &follower in &self.followers {
            let envelope = Envelope::from(write.clone());
            tasks.spawn(async move { (follower, replicate_to(follower, &envelope).await) });
        }
        let barrier = join_all(&mut tasks);
        match self.timeout {
            None => barrier.await,
            Some(duration) => {
                let result = timeout(duration, barrier).await;
                let Ok(result) = result else {
                    // dropping the set aborts followers still in flight
                    crate::bail!(
                        "{} of {} followers did not acknowledge {:?} within {duration:?}",
                        tasks.len(),
                        self.followers.len(),
                        write.key
                    )
                };
                result
            }
        }
    }
}

async fn join_all(tasks: &mut JoinSet<(SocketAddr, crate::Result<()>)>) -> crate::Result<()> {
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let (follower, result) = joined?;
        if let Err(err) = result {
            warn!("replication to {follower} failed: {err:#}");
            if failure.is_none() {
                failure = Some(err.context(format!("replicate to {follower}")))
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn replicate_to(follower: SocketAddr, envelope: &Envelope) -> crate::Result<()> {
    match net::call(follower, envelope).await?.into_response()? {
        Response::ReplicationOk => Ok(()),
        response => crate::bail!("expected REPLICATION_OK, received {}", response.kind()),
    }
}
