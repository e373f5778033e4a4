//! In-process sessions bound to a client address.

use crate::limits::SessionLimits;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Per-client state that survives between requests.
#[derive(Debug)]
pub struct Session {
    id: String,
    addr: IpAddr,
    expires: Mutex<Instant>,
    data: Mutex<HashMap<String, Value>>,
}

impl Session {
    fn new(addr: IpAddr, ttl: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            addr,
            expires: Mutex::new(Instant::now() + ttl),
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Opaque id, the cookie value.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address the session belongs to.
    #[inline]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn expires(&self) -> Instant {
        *self.expires.lock()
    }

    fn is_expired(&self, now: Instant) -> bool {
        *self.expires.lock() <= now
    }

    fn prolong(&self, ttl: Duration) {
        *self.expires.lock() = Instant::now() + ttl;
    }

    /// Stored value under `key`, `None` when absent or of another shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data.lock().get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    /// Stores `value` under `key`, returning the previous raw value.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> serde_json::Result<Option<Value>> {
        let value = serde_json::to_value(value)?;
        Ok(self.data.lock().insert(key.to_owned(), value))
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }
}

/// Table of live sessions.
///
/// There is no background sweeper: every lookup drops at most one expired
/// session, the first it comes across.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(limits: &SessionLimits) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: limits.ttl,
        }
    }

    /// Finds the session `id` for `addr`, or opens a new one.
    ///
    /// A hit renews the expiry. An unknown or expired id, or an id owned by
    /// another address, gives a new session; the flag reports that case.
    pub fn lookup(&self, id: Option<&str>, addr: IpAddr) -> (Arc<Session>, bool) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        let stale = sessions
            .iter()
            .find(|(_, session)| session.is_expired(now))
            .map(|(key, _)| key.clone());
        if let Some(key) = stale {
            debug!(session = %key, "session expired");
            sessions.remove(&key);
        }

        if let Some(id) = id {
            let found = sessions.get(id).cloned();
            match found {
                Some(session) if session.addr == addr && !session.is_expired(now) => {
                    session.prolong(self.ttl);
                    return (session, false);
                }
                Some(_) => {
                    sessions.remove(id);
                }
                None => {}
            }
        }

        let session = Arc::new(Session::new(addr, self.ttl));
        sessions.insert(session.id.clone(), session.clone());
        (session, true)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl: Duration) -> SessionStore {
        SessionStore::new(&SessionLimits {
            ttl,
            ..SessionLimits::default()
        })
    }

    const HOME: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));
    const AWAY: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn continuity() {
        let store = store(Duration::from_secs(60));

        let (first, created) = store.lookup(None, HOME);
        assert!(created);
        first.set("name", "alice").unwrap();

        let (again, created) = store.lookup(Some(first.id()), HOME);
        assert!(!created);
        assert_eq!(again.id(), first.id());
        assert_eq!(again.get::<String>("name").as_deref(), Some("alice"));
    }

    #[test]
    fn other_address_gets_new_session() {
        let store = store(Duration::from_secs(60));
        let (first, _) = store.lookup(None, HOME);

        let (other, created) = store.lookup(Some(first.id()), AWAY);
        assert!(created);
        assert_ne!(other.id(), first.id());
        assert_eq!(other.get::<String>("name"), None);

        // The stolen id is gone for its owner too.
        let (_, created) = store.lookup(Some(first.id()), HOME);
        assert!(created);
    }

    #[test]
    fn unknown_id() {
        let store = store(Duration::from_secs(60));
        let (session, created) = store.lookup(Some("nope"), HOME);

        assert!(created);
        assert_ne!(session.id(), "nope");
        assert_eq!(session.id().len(), 32);
    }

    #[test]
    fn lazy_reaping_one_per_lookup() {
        let store = store(Duration::from_millis(1));
        for _ in 0..3 {
            store.lookup(None, HOME);
        }
        std::thread::sleep(Duration::from_millis(5));

        // Reaps one expired session and adds a fresh one.
        store.lookup(None, AWAY);
        assert_eq!(store.len(), 3);
        store.lookup(None, AWAY);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn hit_prolongs() {
        let store = store(Duration::from_secs(60));
        let (session, _) = store.lookup(None, HOME);
        let before = session.expires();

        std::thread::sleep(Duration::from_millis(2));
        store.lookup(Some(session.id()), HOME);
        assert!(session.expires() > before);
    }
}
