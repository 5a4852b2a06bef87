use std::{collections::HashSet, net::SocketAddr, path::Path};

use serde::{Deserialize, Serialize};

/// Ports used when no membership is configured.
pub const DEFAULT_PORTS: [u16; 3] = [10097, 10098, 10099];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Leader,
    Follower,
}

/// Static cluster membership, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTopology")]
pub struct ClusterTopology {
    leader: SocketAddr,
    replicas: Vec<SocketAddr>,
}

#[derive(Deserialize)]
struct RawTopology {
    leader: SocketAddr,
    replicas: Vec<SocketAddr>,
}

impl TryFrom<RawTopology> for ClusterTopology {
    type Error = crate::Error;

    fn try_from(value: RawTopology) -> Result<Self, Self::Error> {
        Self::new(value.leader, value.replicas)
    }
}

impl ClusterTopology {
    /// `replicas` lists every member, the leader included.
    pub fn new(leader: SocketAddr, replicas: Vec<SocketAddr>) -> crate::Result<Self> {
        let mut seen = HashSet::new();
        for addr in &replicas {
            if !seen.insert(addr) {
                crate::bail!("replica {addr} listed more than once")
            }
        }
        if !seen.contains(&leader) {
            crate::bail!("leader {leader} is not a member of {replicas:?}")
        }
        Ok(Self { leader, replicas })
    }

    /// Default localhost membership with `leader` picked among it.
    pub fn localhost(leader: SocketAddr) -> crate::Result<Self> {
        let replicas = DEFAULT_PORTS
            .iter()
            .map(|&port| SocketAddr::from(([127, 0, 0, 1], port)))
            .collect();
        Self::new(leader, replicas)
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| crate::err!("read topology {}: {err}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn leader(&self) -> SocketAddr {
        self.leader
    }

    pub fn replicas(&self) -> &[SocketAddr] {
        &self.replicas
    }

    pub fn followers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.replicas
            .iter()
            .copied()
            .filter(move |&addr| addr != self.leader)
    }

    pub fn role_of(&self, addr: SocketAddr) -> Option<Role> {
        if addr == self.leader {
            Some(Role::Leader)
        } else if self.replicas.contains(&addr) {
            Some(Role::Follower)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn followers_exclude_leader() {
        let topology = ClusterTopology::localhost(addr(10098)).unwrap();
        assert_eq!(
            topology.followers().collect::<Vec<_>>(),
            [addr(10097), addr(10099)]
        );
        assert_eq!(topology.role_of(addr(10098)), Some(Role::Leader));
        assert_eq!(topology.role_of(addr(10097)), Some(Role::Follower));
        assert_eq!(topology.role_of(addr(10100)), None);
    }

    #[test]
    fn leader_must_be_member() {
        assert!(ClusterTopology::new(addr(1), vec![addr(2), addr(3)]).is_err());
        assert!(ClusterTopology::localhost(addr(10100)).is_err());
    }

    #[test]
    fn duplicate_member_refused() {
        assert!(ClusterTopology::new(addr(1), vec![addr(1), addr(2), addr(1)]).is_err());
    }

    #[test]
    fn json_is_validated() {
        let topology: ClusterTopology = serde_json::from_str(
            r#"{"leader": "127.0.0.1:7000", "replicas": ["127.0.0.1:7000", "127.0.0.1:7001"]}"#,
        )
        .unwrap();
        assert_eq!(topology.followers().collect::<Vec<_>>(), [addr(7001)]);

        let invalid = serde_json::from_str::<ClusterTopology>(
            r#"{"leader": "127.0.0.1:9000", "replicas": ["127.0.0.1:7000"]}"#,
        );
        assert!(invalid.is_err());
    }
}
