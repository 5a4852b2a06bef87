//! A cluster member serving PUT, GET and REPLICATION requests.
//!
//! Every inbound connection carries one request and is handled on its own
//! task. GET and REPLICATION are answered on the same connection. PUT is
//! never answered inline: the leader writes, replicates to all followers and
//! then dials the client's listening address with `PutOk`; a follower only
//! forwards the PUT to the leader.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::BufStream,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use crate::{
    envelope::{Envelope, Get, Put, Replication, Request, Response},
    net,
    replication::Replicator,
    store::{Lookup, Store},
    topology::{ClusterTopology, Role},
};

/// Substitutes the answer of a GET before the store is consulted.
pub trait ReadHook: Send + Sync + 'static {
    fn intercept(&self, get: &Get) -> Option<Response>;
}

impl<F> ReadHook for F
where
    F: Fn(&Get) -> Option<Response> + Send + Sync + 'static,
{
    fn intercept(&self, get: &Get) -> Option<Response> {
        self(get)
    }
}

pub struct Replica {
    addr: SocketAddr,
    role: Role,
    topology: Arc<ClusterTopology>,
    store: Store,
    replicator: Replicator,
    read_hook: Option<Box<dyn ReadHook>>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("addr", &self.addr)
            .field("role", &self.role)
            .field("topology", &self.topology)
            .field("store", &self.store)
            .field("replicator", &self.replicator)
            .finish_non_exhaustive()
    }
}

impl Replica {
    pub fn new(addr: SocketAddr, topology: Arc<ClusterTopology>) -> crate::Result<Self> {
        let Some(role) = topology.role_of(addr) else {
            crate::bail!("{addr} is not a member of {topology:?}")
        };
        Ok(Self {
            addr,
            role,
            replicator: Replicator::new(topology.followers()),
            topology,
            store: Store::new(),
            read_hook: None,
        })
    }

    /// Bounds how long a PUT waits for follower acknowledgements. Without it
    /// the leader waits forever.
    pub fn with_replication_timeout(mut self, duration: Duration) -> Self {
        self.replicator = self.replicator.with_timeout(duration);
        self
    }

    pub fn with_read_hook(mut self, hook: impl ReadHook) -> Self {
        self.read_hook = Some(Box::new(hook));
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        info!(
            "replica {} serving as {:?}, leader {}",
            self.addr,
            self.role,
            self.topology.leader()
        );
        loop {
            let (stream, remote) = net::accept(&listener).await;
            debug!("accepted connection from {remote}");
            let replica = self.clone();
            tokio::spawn(async move {
                if let Err(err) = replica.handle_connection(stream).await {
                    warn!("dropping connection from {remote}: {err:#}")
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> crate::Result<()> {
        stream.set_nodelay(true)?;
        let mut stream = BufStream::new(stream);
        let response = match net::read_envelope(&mut stream).await?.into_request()? {
            Request::Put(put) => return self.handle_put(put).await,
            Request::Get(get) => self.handle_get(&get),
            Request::Replication(replication) => self.handle_replication(replication),
        };
        net::write_envelope(&mut stream, &Envelope::Response(response)).await
    }

    pub async fn handle_put(&self, put: Put) -> crate::Result<()> {
        if !self.is_leader() {
            let leader = self.topology.leader();
            info!(
                "forwarding PUT key:{} value:{} from {} to leader {leader}",
                put.key, put.value, put.client_addr
            );
            return net::send_to(leader, &Envelope::from(put))
                .await
                .with_context(|| format!("forward PUT to leader {leader}"));
        }

        info!(
            "client {} PUT key:{} value:{} ts:{}",
            put.client_addr, put.key, put.value, put.client_timestamp
        );
        self.store
            .put(put.key.clone(), put.value.clone(), put.client_timestamp);
        let write = Replication {
            key: put.key,
            value: put.value,
            server_timestamp: put.client_timestamp,
        };
        self.replicator.replicate(&write).await?;

        info!(
            "sending PUT_OK to client {} key:{} ts:{}",
            put.client_addr, write.key, write.server_timestamp
        );
        let put_ok = Response::PutOk {
            key: write.key,
            value: write.value,
            server_timestamp: write.server_timestamp,
            server_addr: self.addr,
        };
        net::send_to(put.client_addr, &Envelope::Response(put_ok))
            .await
            .with_context(|| format!("notify client {}", put.client_addr))
    }

    pub fn handle_get(&self, get: &Get) -> Response {
        let response = if let Some(response) = self
            .read_hook
            .as_ref()
            .and_then(|hook| hook.intercept(get))
        {
            response
        } else {
            match self.store.read(&get.key, get.client_timestamp) {
                Lookup::Missing => Response::NotFound,
                Lookup::Fresh(entry) => Response::GetOk {
                    value: entry.value,
                    server_timestamp: entry.timestamp,
                    server_addr: Some(self.addr),
                },
                Lookup::Stale(server_timestamp) => Response::Retry { server_timestamp },
            }
        };
        let local = match &response {
            Response::GetOk {
                server_timestamp, ..
            }
            | Response::Retry { server_timestamp } => server_timestamp.to_string(),
            _ => "absent".into(),
        };
        info!(
            "client {:?} GET key:{} ts:{}, local ts {local}, answering {}",
            get.client_addr,
            get.key,
            get.client_timestamp,
            response.kind()
        );
        response
    }

    pub fn handle_replication(&self, replication: Replication) -> Response {
        info!(
            "REPLICATION key:{} value:{} ts:{}",
            replication.key, replication.value, replication.server_timestamp
        );
        self.store.put(
            replication.key,
            replication.value,
            replication.server_timestamp,
        );
        Response::ReplicationOk
    }
}
