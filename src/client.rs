//! Client side: random-replica requests plus the PUT completion listener.
//!
//! The client owns two endpoints. Requests go out on fresh connections to a
//! uniformly chosen replica; `PutOk` notices come back on a listener bound to
//! the client's advertised address. Both report observed timestamps to a
//! single freshness session that owns the [`FreshnessTable`], so neither
//! endpoint shares the table directly.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    channel::{mailbox, Inbox, Mailbox, QueryHandle, QueryInbox},
    envelope::{Envelope, Get, Put, Response, Timestamp},
    net,
    task::SessionSpawner,
};

pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as _
}

/// Highest server timestamp observed per key. Never decreases.
#[derive(Debug, Clone, Default)]
pub struct FreshnessTable(HashMap<String, Timestamp>);

impl FreshnessTable {
    pub fn last_seen(&self, key: &str) -> Timestamp {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// Returns whether the bound for `key` advanced.
    pub fn observe(&mut self, key: &str, timestamp: Timestamp) -> bool {
        match self.0.get_mut(key) {
            Some(bound) if *bound >= timestamp => false,
            Some(bound) => {
                *bound = timestamp;
                true
            }
            None => {
                self.0.insert(key.into(), timestamp);
                true
            }
        }
    }
}

/// Server timestamps reported by either client endpoint.
pub type Observations = Mailbox<(String, Timestamp)>;

/// Answers `last_seen` for a key.
pub type LastSeenHandle = QueryHandle<String, Timestamp>;

/// Sole owner of a client's [`FreshnessTable`]. Pending observations are
/// applied before any lookup, so a lookup issued after an observation was
/// posted sees it.
pub async fn freshness_session(
    mut observations: Inbox<(String, Timestamp)>,
    mut lookups: QueryInbox<String, Timestamp>,
) -> crate::Result<()> {
    let mut table = FreshnessTable::default();
    loop {
        tokio::select! {
            biased;
            Some((key, timestamp)) = observations.recv() => {
                if !table.observe(&key, timestamp) {
                    debug!("ignoring ts:{timestamp} for key:{key}, already at {}", table.last_seen(&key))
                }
            }
            Some((key, reply)) = lookups.recv() => {
                if !reply.answer(table.last_seen(&key)) {
                    debug!("lookup of key:{key} abandoned")
                }
            }
            else => break,
        }
    }
    Ok(())
}

/// A `PutOk` delivered to the client's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCompletion {
    pub key: String,
    pub value: String,
    pub server_timestamp: Timestamp,
    pub server_addr: SocketAddr,
}

/// A PUT that left the client. Completion arrives separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutSent {
    pub replica: SocketAddr,
    pub client_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Value {
        value: String,
        server_timestamp: Timestamp,
        replica: SocketAddr,
    },
    NotFound {
        replica: SocketAddr,
    },
    /// The replica's copy is older than what this client has already seen.
    /// Nothing is retried automatically.
    Retry {
        server_timestamp: Timestamp,
        replica: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct Client {
    addr: SocketAddr,
    replicas: Vec<SocketAddr>,
    observations: Observations,
    last_seen: LastSeenHandle,
}

impl Client {
    /// Binds the completion listener on `listen` and spawns it together with
    /// the freshness session. Completed PUTs are surfaced on the returned
    /// source.
    pub async fn start(
        listen: SocketAddr,
        replicas: Vec<SocketAddr>,
        spawner: &SessionSpawner,
    ) -> crate::Result<(Self, Inbox<PutCompletion>)> {
        if replicas.is_empty() {
            crate::bail!("no replica to talk to")
        }
        let listener = net::bind(listen).with_context(|| format!("bind listener {listen}"))?;
        let addr = listener.local_addr()?;
        let (observations, observation_inbox) = mailbox();
        let (last_seen, lookup_inbox) = mailbox();
        let (completions, completion_inbox) = mailbox();
        spawner.spawn(
            "freshness",
            freshness_session(observation_inbox, lookup_inbox),
        );
        spawner.spawn(
            "completion listener",
            completion_loop(listener, observations.clone(), completions),
        );
        info!("client listening on {addr} for {} replicas", replicas.len());
        Ok((
            Self {
                addr,
                replicas,
                observations,
                last_seen,
            },
            completion_inbox,
        ))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn replicas(&self) -> &[SocketAddr] {
        &self.replicas
    }

    fn pick_replica(&self) -> SocketAddr {
        self.replicas[rand::thread_rng().gen_range(0..self.replicas.len())]
    }

    pub async fn last_seen(&self, key: &str) -> crate::Result<Timestamp> {
        self.last_seen.ask(key.into()).await
    }

    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> crate::Result<PutSent> {
        self.put_to(self.pick_replica(), key, value).await
    }

    /// Returns once the request is written; does not wait for replication.
    pub async fn put_to(
        &self,
        replica: SocketAddr,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> crate::Result<PutSent> {
        let client_timestamp = now();
        let put = Put {
            key: key.into(),
            value: value.into(),
            client_addr: self.addr,
            client_timestamp,
        };
        net::send_to(replica, &Envelope::from(put))
            .await
            .with_context(|| format!("send PUT to {replica}"))?;
        Ok(PutSent {
            replica,
            client_timestamp,
        })
    }

    pub async fn get(&self, key: impl Into<String>) -> crate::Result<GetOutcome> {
        self.get_from(self.pick_replica(), key).await
    }

    pub async fn get_from(
        &self,
        replica: SocketAddr,
        key: impl Into<String>,
    ) -> crate::Result<GetOutcome> {
        let key = key.into();
        let last_seen = self.last_seen(&key).await?;
        let get = Get {
            key: key.clone(),
            client_timestamp: last_seen,
            client_addr: Some(self.addr),
        };
        let response = net::call(replica, &Envelope::from(get))
            .await
            .with_context(|| format!("send GET to {replica}"))?
            .into_response()?;
        let outcome = match response {
            // a conforming replica answers RETRY here instead
            Response::GetOk {
                server_timestamp, ..
            } if server_timestamp < last_seen => GetOutcome::Retry {
                server_timestamp,
                replica,
            },
            Response::GetOk {
                value,
                server_timestamp,
                ..
            } => {
                self.observations.post((key, server_timestamp))?;
                GetOutcome::Value {
                    value,
                    server_timestamp,
                    replica,
                }
            }
            Response::NotFound => GetOutcome::NotFound { replica },
            Response::Retry { server_timestamp } => GetOutcome::Retry {
                server_timestamp,
                replica,
            },
            response => crate::bail!("unexpected {} in reply to GET", response.kind()),
        };
        Ok(outcome)
    }
}

async fn completion_loop(
    listener: TcpListener,
    observations: Observations,
    completions: Mailbox<PutCompletion>,
) -> crate::Result<()> {
    loop {
        let (stream, remote) = net::accept(&listener).await;
        let observations = observations.clone();
        let completions = completions.clone();
        tokio::spawn(async move {
            if let Err(err) = receive_completion(stream, &observations, &completions).await {
                warn!("dropping notice from {remote}: {err:#}")
            }
        });
    }
}

async fn receive_completion(
    mut stream: TcpStream,
    observations: &Observations,
    completions: &Mailbox<PutCompletion>,
) -> crate::Result<()> {
    match net::read_envelope(&mut stream).await?.into_response()? {
        Response::PutOk {
            key,
            value,
            server_timestamp,
            server_addr,
        } => {
            observations.post((key.clone(), server_timestamp))?;
            completions.post(PutCompletion {
                key,
                value,
                server_timestamp,
                server_addr,
            })
        }
        response => crate::bail!("expected PUT_OK, received {}", response.kind()),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn unseen_key_has_zero_bound() {
        let table = FreshnessTable::default();
        assert_eq!(table.last_seen("a"), 0);
    }

    #[test]
    fn bound_never_lowers() {
        let mut table = FreshnessTable::default();
        assert!(table.observe("a", 10));
        assert!(!table.observe("a", 5));
        assert!(!table.observe("a", 10));
        assert_eq!(table.last_seen("a"), 10);
        assert!(table.observe("a", 11));
        assert_eq!(table.last_seen("b"), 0);
    }

    #[tokio::test]
    async fn session_answers_after_observations() {
        let (observations, observation_inbox) = mailbox();
        let (last_seen, lookup_inbox): (LastSeenHandle, _) = mailbox();
        let session = tokio::spawn(freshness_session(observation_inbox, lookup_inbox));
        observations.post(("a".into(), 7)).unwrap();
        observations.post(("a".into(), 3)).unwrap();
        assert_eq!(last_seen.ask("a".into()).await.unwrap(), 7);
        assert_eq!(last_seen.ask("b".into()).await.unwrap(), 0);
        drop(observations);
        drop(last_seen);
        session.await.unwrap().unwrap();
    }

    proptest! {
        #[test]
        fn bound_is_running_max(observations in prop::collection::vec(0i64..1000, 0..32)) {
            let mut table = FreshnessTable::default();
            let mut previous = 0;
            for timestamp in &observations {
                table.observe("k", *timestamp);
                prop_assert!(table.last_seen("k") >= previous);
                previous = table.last_seen("k");
            }
            prop_assert_eq!(
                table.last_seen("k"),
                observations.iter().copied().max().unwrap_or(0)
            );
        }
    }
}
