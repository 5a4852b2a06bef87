pub mod channel;
pub mod client;
pub mod envelope;
pub mod net;
pub mod replica;
pub mod replication;
pub mod store;
pub mod task;
pub mod topology;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::client::Client;
pub use crate::envelope::{Envelope, Request, Response, Timestamp};
pub use crate::replica::Replica;
pub use crate::store::Store;
pub use crate::topology::ClusterTopology;
