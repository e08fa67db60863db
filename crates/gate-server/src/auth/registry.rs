//! Auth registry: who is logged in on which connection.
//!
//! Both directions (connection → auth info, identity → connection) live
//! behind one mutex so the single-device-login swap is atomic: an observer
//! that sees the new binding can never see the old one again.

use super::Identity;
use crate::connection::ConnectionId;
use gate_core::frame::unix_millis;
use std::collections::HashMap;
use std::sync::Mutex;

/// Immutable record of a successful login.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub identity: Identity,
    pub token: String,
    pub authenticated_at_ms: i64,
}

#[derive(Debug, Default)]
struct AuthMaps {
    by_conn: HashMap<ConnectionId, AuthInfo>,
    by_identity: HashMap<Identity, ConnectionId>,
}

/// Tracks authenticated connections and enforces single-device login.
#[derive(Debug, Default)]
pub struct AuthRegistry {
    inner: Mutex<AuthMaps>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `conn`. The new binding always wins: if the
    /// identity was bound to a different connection, that connection is
    /// evicted from the registry and returned; the caller must close it.
    ///
    /// Re-authenticating the same `(conn, identity)` pair refreshes the
    /// token and timestamp without evicting anything.
    pub fn authenticate(
        &self,
        conn: ConnectionId,
        identity: Identity,
        token: String,
    ) -> Option<ConnectionId> {
        let mut maps = self.inner.lock().expect("auth registry lock poisoned");

        let evicted = match maps.by_identity.get(&identity) {
            Some(&old) if old == conn => None,
            Some(&old) => {
                maps.by_conn.remove(&old);
                Some(old)
            }
            None => None,
        };

        maps.by_identity.insert(identity.clone(), conn);
        maps.by_conn.insert(
            conn,
            AuthInfo {
                identity,
                token,
                authenticated_at_ms: unix_millis(),
            },
        );

        evicted
    }

    /// Drop both bindings for `conn`, if present. The identity mapping is
    /// only cleared when it still points at this connection, so an evicted
    /// loser closing late cannot erase the winner's binding.
    pub fn deauthenticate(&self, conn: ConnectionId) -> Option<AuthInfo> {
        let mut maps = self.inner.lock().expect("auth registry lock poisoned");
        let info = maps.by_conn.remove(&conn)?;
        if maps.by_identity.get(&info.identity) == Some(&conn) {
            maps.by_identity.remove(&info.identity);
        }
        Some(info)
    }

    pub fn is_authenticated(&self, conn: ConnectionId) -> bool {
        self.inner
            .lock()
            .expect("auth registry lock poisoned")
            .by_conn
            .contains_key(&conn)
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<Identity> {
        self.inner
            .lock()
            .expect("auth registry lock poisoned")
            .by_conn
            .get(&conn)
            .map(|i| i.identity.clone())
    }

    pub fn lookup_by_identity(&self, identity: &str) -> Option<ConnectionId> {
        self.inner
            .lock()
            .expect("auth registry lock poisoned")
            .by_identity
            .get(identity)
            .copied()
    }

    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .expect("auth registry lock poisoned")
            .by_conn
            .len()
    }

    /// Drop auth entries whose connection fails `is_live`; returns how
    /// many were removed. Used by the periodic consistency sweep.
    pub fn retain_live(&self, is_live: impl Fn(ConnectionId) -> bool) -> usize {
        let mut maps = self.inner.lock().expect("auth registry lock poisoned");
        let dead: Vec<ConnectionId> = maps
            .by_conn
            .keys()
            .copied()
            .filter(|&c| !is_live(c))
            .collect();
        for conn in &dead {
            if let Some(info) = maps.by_conn.remove(conn) {
                if maps.by_identity.get(&info.identity) == Some(conn) {
                    maps.by_identity.remove(&info.identity);
                }
            }
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_then_lookup() {
        let reg = AuthRegistry::new();
        assert_eq!(reg.authenticate(1, "u1".into(), "tok".into()), None);
        assert!(reg.is_authenticated(1));
        assert_eq!(reg.lookup_by_identity("u1"), Some(1));
        assert_eq!(reg.identity_of(1).as_deref(), Some("u1"));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn second_device_evicts_first() {
        let reg = AuthRegistry::new();
        reg.authenticate(1, "u1".into(), "tok-a".into());
        let evicted = reg.authenticate(2, "u1".into(), "tok-b".into());

        assert_eq!(evicted, Some(1));
        assert!(!reg.is_authenticated(1));
        assert!(reg.is_authenticated(2));
        assert_eq!(reg.lookup_by_identity("u1"), Some(2));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn reauth_same_pair_refreshes_without_eviction() {
        let reg = AuthRegistry::new();
        reg.authenticate(1, "u1".into(), "tok-a".into());
        let evicted = reg.authenticate(1, "u1".into(), "tok-b".into());

        assert_eq!(evicted, None);
        assert!(reg.is_authenticated(1));
        assert_eq!(reg.lookup_by_identity("u1"), Some(1));
    }

    #[test]
    fn deauthenticate_clears_both_maps() {
        let reg = AuthRegistry::new();
        reg.authenticate(1, "u1".into(), "tok".into());
        let info = reg.deauthenticate(1).unwrap();
        assert_eq!(info.identity, "u1");
        assert!(!reg.is_authenticated(1));
        assert_eq!(reg.lookup_by_identity("u1"), None);
        assert!(reg.deauthenticate(1).is_none());
    }

    #[test]
    fn evicted_loser_cannot_erase_winner_binding() {
        let reg = AuthRegistry::new();
        reg.authenticate(1, "u1".into(), "tok-a".into());
        reg.authenticate(2, "u1".into(), "tok-b".into());

        // Connection 1 closes late and deauthenticates; the winner's
        // binding must survive.
        assert!(reg.deauthenticate(1).is_none());
        assert_eq!(reg.lookup_by_identity("u1"), Some(2));
        assert!(reg.is_authenticated(2));
    }

    #[test]
    fn racing_logins_leave_exactly_one_winner() {
        use std::sync::Arc;
        use std::thread;

        let reg = Arc::new(AuthRegistry::new());
        let mut handles = Vec::new();
        for conn in 1..=8u64 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || {
                reg.authenticate(conn, "u1".into(), format!("tok-{conn}"))
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let winner = reg.lookup_by_identity("u1").unwrap();
        assert!(reg.is_authenticated(winner));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn sweep_drops_entries_for_dead_connections() {
        let reg = AuthRegistry::new();
        reg.authenticate(1, "u1".into(), "tok".into());
        reg.authenticate(2, "u2".into(), "tok".into());

        let removed = reg.retain_live(|c| c == 2);
        assert_eq!(removed, 1);
        assert!(!reg.is_authenticated(1));
        assert_eq!(reg.lookup_by_identity("u1"), None);
        assert!(reg.is_authenticated(2));
    }
}
