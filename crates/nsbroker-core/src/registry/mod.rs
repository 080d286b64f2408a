//! Namespace registry.
//!
//! Maps every namespace name to exactly one owner: a [`Namespace`] living in
//! this process, or a [`RemotePeer`] relaying to the broker that owns it.
//! One map holds both kinds, so a name can never be local and remote at the
//! same time, and registration checks and inserts under the per-name shard
//! lock of the map.
//!
//! No operation here blocks on an execution; namespace locks are separate.

pub mod namespace;
pub mod remote;

pub use namespace::{ConnectionId, DisconnectHook, Namespace, NamespaceLock, NamespaceLockGuard};
pub use remote::RemotePeer;

use crate::{BrokerError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
enum Owner {
    Local(Arc<Namespace>),
    Remote(Arc<RemotePeer>),
}

/// Result of resolving a namespace name.
#[derive(Debug, Clone)]
pub enum Lookup {
    Local(Arc<Namespace>),
    Remote(Arc<RemotePeer>),
    Absent,
}

/// A connection that imported a namespace from this broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub connection: ConnectionId,
    pub peer: String,
}

/// Owner table plus per-connection bookkeeping.
#[derive(Debug, Default)]
pub struct Registry {
    owners: DashMap<String, Owner>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    users: DashMap<ConnectionId, HashSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Lookup {
        match self.owners.get(name).map(|entry| entry.value().clone()) {
            Some(Owner::Local(ns)) => Lookup::Local(ns),
            Some(Owner::Remote(peer)) => Lookup::Remote(peer),
            None => Lookup::Absent,
        }
    }

    /// Local namespace `name`, created if `allow_create` permits.
    ///
    /// Fails with a namespace error if the name is unknown and creation is
    /// not allowed, or if the name belongs to a remote owner.
    pub fn get_or_create(&self, name: &str, allow_create: bool) -> Result<Arc<Namespace>> {
        match self.owners.entry(name.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Owner::Local(ns) => Ok(ns.clone()),
                Owner::Remote(peer) => Err(BrokerError::namespace(format!(
                    "namespace \"{}\" is owned by {}",
                    name,
                    peer.label()
                ))),
            },
            Entry::Vacant(entry) => {
                if !allow_create {
                    return Err(BrokerError::namespace(format!(
                        "unknown namespace \"{}\"",
                        name
                    )));
                }
                info!("added local namespace \"{}\"", name);
                let ns = Arc::new(Namespace::new(name));
                entry.insert(Owner::Local(ns.clone()));
                Ok(ns)
            }
        }
    }

    /// Route all future traffic for `name` through `peer`.
    ///
    /// Fails if `name` already has an owner, local or remote.
    pub fn register_remote(&self, name: &str, peer: Arc<RemotePeer>) -> Result<()> {
        match self.owners.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let kind = match entry.get() {
                    Owner::Local(_) => "local",
                    Owner::Remote(_) => "remote",
                };
                Err(BrokerError::namespace(format!(
                    "namespace \"{}\" already registered as {}",
                    name, kind
                )))
            }
            Entry::Vacant(entry) => {
                info!(
                    "added remote namespace \"{}\", origin {}",
                    name,
                    peer.label()
                );
                entry.insert(Owner::Remote(peer));
                Ok(())
            }
        }
    }

    /// Forget the remote proxy for `name`. Local namespaces are left alone.
    pub fn drop_remote(&self, name: &str) -> Option<Arc<RemotePeer>> {
        let (_, owner) = self
            .owners
            .remove_if(name, |_, owner| matches!(owner, Owner::Remote(_)))?;
        info!("dropped remote namespace \"{}\"", name);
        match owner {
            Owner::Remote(peer) => Some(peer),
            Owner::Local(_) => None,
        }
    }

    /// Forget every namespace relayed through the peer with `peer_id`.
    pub fn drop_peer(&self, peer_id: u64) -> Vec<String> {
        let names: Vec<String> = self
            .owners
            .iter()
            .filter(|entry| matches!(entry.value(), Owner::Remote(p) if p.id() == peer_id))
            .map(|entry| entry.key().clone())
            .collect();
        let mut dropped = Vec::new();
        for name in names {
            let removed = self.owners.remove_if(&name, |_, owner| {
                matches!(owner, Owner::Remote(p) if p.id() == peer_id)
            });
            if removed.is_some() {
                info!("dropped remote namespace \"{}\"", name);
                dropped.push(name);
            }
        }
        dropped
    }

    /// Remove a local namespace from the table. Remote proxies are left alone.
    pub fn drop_local(&self, name: &str) -> Option<Arc<Namespace>> {
        let (_, owner) = self
            .owners
            .remove_if(name, |_, owner| matches!(owner, Owner::Local(_)))?;
        self.subscribers.remove(name);
        info!("dropped local namespace \"{}\"", name);
        match owner {
            Owner::Local(ns) => Some(ns),
            Owner::Remote(_) => None,
        }
    }

    /// `"local"`, `"remote"`, or `None` for unknown names.
    pub fn ns_type(&self, name: &str) -> Option<&'static str> {
        match self.lookup(name) {
            Lookup::Local(_) => Some("local"),
            Lookup::Remote(_) => Some("remote"),
            Lookup::Absent => None,
        }
    }

    pub fn local_names(&self) -> Vec<String> {
        self.names(|owner| matches!(owner, Owner::Local(_)))
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.names(|owner| matches!(owner, Owner::Remote(_)))
    }

    fn names(&self, keep: impl Fn(&Owner) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .owners
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Record that `connection` imported `name`.
    pub fn add_subscriber(&self, name: &str, connection: ConnectionId, peer: impl Into<String>) {
        self.subscribers
            .entry(name.to_string())
            .or_default()
            .push(Subscriber {
                connection,
                peer: peer.into(),
            });
    }

    pub fn subscribers(&self, name: &str) -> Vec<Subscriber> {
        self.subscribers
            .get(name)
            .map(|subs| subs.value().clone())
            .unwrap_or_default()
    }

    /// Record that `connection` executed in `name`.
    pub fn note_user(&self, connection: ConnectionId, name: &str) {
        self.users
            .entry(connection)
            .or_default()
            .insert(name.to_string());
    }

    /// Forget `connection`; returns the namespaces it used, sorted.
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<String> {
        for mut subs in self.subscribers.iter_mut() {
            subs.value_mut().retain(|s| s.connection != connection);
        }
        let mut used: Vec<String> = self
            .users
            .remove(&connection)
            .map(|(_, names)| names.into_iter().collect())
            .unwrap_or_default();
        used.sort();
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    fn peer(label: &str) -> Arc<RemotePeer> {
        let (a, _b) = tokio::io::duplex(16);
        let (r, w) = tokio::io::split(a);
        Arc::new(RemotePeer::from_connection(Connection::from_io(r, w, label)))
    }

    #[test]
    fn test_get_or_create_policy() {
        let registry = Registry::new();

        let err = registry.get_or_create("n", false).unwrap_err();
        assert!(matches!(err, BrokerError::Namespace { .. }));
        assert!(matches!(registry.lookup("n"), Lookup::Absent));

        let ns = registry.get_or_create("n", true).unwrap();
        assert_eq!(ns.name(), "n");
        // existing namespaces resolve regardless of the policy
        let again = registry.get_or_create("n", false).unwrap();
        assert!(Arc::ptr_eq(&ns, &again));
    }

    #[test]
    fn test_register_remote_rejects_any_existing_owner() {
        let registry = Registry::new();
        registry.get_or_create("local", true).unwrap();

        assert!(registry.register_remote("local", peer("a")).is_err());
        assert!(registry.register_remote("r", peer("a")).is_ok());
        let err = registry.register_remote("r", peer("b")).unwrap_err();
        assert!(err.to_string().contains("already registered"));

        match registry.lookup("r") {
            Lookup::Remote(p) => assert_eq!(p.label(), "a"),
            other => panic!("Expected remote, got: {:?}", other),
        }
        assert!(registry.get_or_create("r", true).is_err());
    }

    #[test]
    fn test_drop_remote_and_peer() {
        let registry = Registry::new();
        let p = peer("a");
        registry.register_remote("x", p.clone()).unwrap();
        registry.register_remote("y", p.clone()).unwrap();
        registry.register_remote("z", peer("b")).unwrap();
        registry.get_or_create("l", true).unwrap();

        assert!(registry.drop_remote("l").is_none());
        assert!(registry.drop_remote("z").is_some());
        assert!(registry.drop_remote("z").is_none());

        let mut dropped = registry.drop_peer(p.id());
        dropped.sort();
        assert_eq!(dropped, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(registry.remote_names(), Vec::<String>::new());
        assert_eq!(registry.local_names(), vec!["l".to_string()]);
    }

    #[test]
    fn test_ns_type() {
        let registry = Registry::new();
        registry.get_or_create("l", true).unwrap();
        registry.register_remote("r", peer("a")).unwrap();
        assert_eq!(registry.ns_type("l"), Some("local"));
        assert_eq!(registry.ns_type("r"), Some("remote"));
        assert_eq!(registry.ns_type("x"), None);
    }

    #[test]
    fn test_connection_bookkeeping() {
        let registry = Registry::new();
        registry.get_or_create("a", true).unwrap();
        registry.note_user(7, "b");
        registry.note_user(7, "a");
        registry.add_subscriber("a", 7, "peer");
        registry.add_subscriber("a", 8, "other");

        assert_eq!(registry.subscribers("a").len(), 2);
        assert_eq!(
            registry.remove_connection(7),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            registry.subscribers("a"),
            vec![Subscriber {
                connection: 8,
                peer: "other".into()
            }]
        );
        assert!(registry.remove_connection(7).is_empty());
    }
}
