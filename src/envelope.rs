//! Messages exchanged between clients and replicas, and between replicas.
//!
//! Every connection carries exactly one [`Envelope`] per direction. Requests
//! and responses are separate enums so that a response can never carry a
//! request operation.

use std::net::SocketAddr;

use bincode::Options;
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::net::{WireError, MAX_FRAME_LEN};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// The single frame a connection carries in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, From)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

/// Operations a replica accepts, from clients or from the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, From)]
pub enum Request {
    Put(Put),
    Get(Get),
    Replication(Replication),
}

/// A client write. Answered out of band with [`Response::PutOk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Put {
    pub key: String,
    pub value: String,
    /// Where the leader delivers `PutOk`, preserved across forwarding.
    pub client_addr: SocketAddr,
    pub client_timestamp: Timestamp,
}

/// A client read, answered on the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    pub key: String,
    /// Highest timestamp the client has observed for `key`, 0 if none.
    pub client_timestamp: Timestamp,
    pub client_addr: Option<SocketAddr>,
}

/// Leader to follower copy of a write, stamped by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replication {
    pub key: String,
    pub value: String,
    pub server_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Sent by the leader to the client's listener once every follower
    /// acknowledged.
    PutOk {
        key: String,
        value: String,
        server_timestamp: Timestamp,
        server_addr: SocketAddr,
    },
    GetOk {
        value: String,
        server_timestamp: Timestamp,
        server_addr: Option<SocketAddr>,
    },
    ReplicationOk,
    NotFound,
    /// The local copy is older than the client's bound.
    Retry {
        server_timestamp: Timestamp,
    },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PutOk { .. } => "PUT_OK",
            Self::GetOk { .. } => "GET_OK",
            Self::ReplicationOk => "REPLICATION_OK",
            Self::NotFound => "NOT_FOUND",
            Self::Retry { .. } => "RETRY",
        }
    }
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Put(_) => "PUT",
            Self::Get(_) => "GET",
            Self::Replication(_) => "REPLICATION",
        }
    }
}

impl From<Put> for Envelope {
    fn from(value: Put) -> Self {
        Self::Request(value.into())
    }
}

impl From<Get> for Envelope {
    fn from(value: Get) -> Self {
        Self::Request(value.into())
    }
}

impl From<Replication> for Envelope {
    fn from(value: Replication) -> Self {
        Self::Request(value.into())
    }
}

impl Envelope {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let buf = bincode::options().serialize(self)?;
        if buf.len() > MAX_FRAME_LEN {
            Err(WireError::FrameTooLarge(buf.len()))?
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        let envelope = bincode::options()
            .with_limit(MAX_FRAME_LEN as _)
            .deserialize(buf)
            .map_err(WireError::Decode)?;
        Ok(envelope)
    }

    pub fn into_request(self) -> crate::Result<Request> {
        match self {
            Self::Request(request) => Ok(request),
            Self::Response(response) => {
                crate::bail!("expected a request, received {}", response.kind())
            }
        }
    }

    pub fn into_response(self) -> crate::Result<Response> {
        match self {
            Self::Response(response) => Ok(response),
            Self::Request(request) => {
                crate::bail!("expected a response, received {}", request.kind())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_addr() -> SocketAddr {
        ([127, 0, 0, 1], 20000).into()
    }

    #[test]
    fn put_survives_codec() {
        let put = Envelope::from(Put {
            key: "a".into(),
            value: "1".into(),
            client_addr: client_addr(),
            client_timestamp: 1_700_000_000_000,
        });
        let buf = put.encode().unwrap();
        assert_eq!(Envelope::decode(&buf).unwrap(), put);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = Envelope::Response(Response::NotFound).encode().unwrap();
        buf.push(0);
        let err = Envelope::decode(&buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WireError>(),
            Some(WireError::Decode(_))
        ));
    }

    #[test]
    fn garbage_rejected() {
        assert!(Envelope::decode(&[0xff; 7]).is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn direction_checked() {
        let response = Envelope::Response(Response::ReplicationOk);
        assert!(response.clone().into_request().is_err());
        assert_eq!(response.into_response().unwrap(), Response::ReplicationOk);

        let request = Envelope::from(Get {
            key: "a".into(),
            client_timestamp: 0,
            client_addr: None,
        });
        let err = request.into_response().unwrap_err();
        assert!(err.to_string().contains("GET"));
    }

    #[test]
    fn oversized_value_refused_on_encode() {
        let put = Envelope::from(Replication {
            key: "big".into(),
            value: "x".repeat(MAX_FRAME_LEN + 1),
            server_timestamp: 1,
        });
        assert!(put.encode().is_err());
    }
}
