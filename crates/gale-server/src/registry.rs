//! In-memory tunnel registry.
//!
//! Maps subdomain labels to live control sessions. The registry is an
//! explicitly constructed value owned by the server bootstrap and handed to
//! both listeners; all operations are bounded map work under a single lock,
//! never I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::session::{SessionHandle, TunnelInfo};

/// Registration failed because the subdomain is taken. Exposes only the
/// existing registration's coarse age, never the session itself.
#[derive(Debug)]
pub struct RegisterConflict {
    pub existing_age: Duration,
}

/// Thread-safe table of active tunnels, keyed by subdomain.
#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Atomically insert the session iff the subdomain is free.
    pub async fn register(
        &self,
        subdomain: &str,
        session: Arc<SessionHandle>,
    ) -> Result<(), RegisterConflict> {
        let mut tunnels = self.tunnels.write().await;
        if let Some(existing) = tunnels.get(subdomain) {
            return Err(RegisterConflict {
                existing_age: Duration::from_secs(existing.age().as_secs()),
            });
        }
        tunnels.insert(subdomain.to_string(), session);
        info!(subdomain = %subdomain, "Registry: tunnel added");
        Ok(())
    }

    /// Remove the tunnel, but only if `client_id` still owns it. A stale
    /// session that lost its subdomain to a successor must not evict it.
    pub async fn unregister(&self, subdomain: &str, client_id: &str) {
        let mut tunnels = self.tunnels.write().await;
        match tunnels.get(subdomain) {
            Some(current) if current.client_id == client_id => {
                tunnels.remove(subdomain);
                info!(subdomain = %subdomain, "Registry: tunnel removed");
            }
            Some(_) => {
                warn!(
                    subdomain = %subdomain,
                    "Registry: skipped unregister, subdomain owned by a newer session"
                );
            }
            None => {
                debug!(subdomain = %subdomain, "Registry: unregister for unknown subdomain");
            }
        }
    }

    /// Non-blocking lookup. Never returns a closed session.
    pub async fn lookup(&self, subdomain: &str) -> Option<Arc<SessionHandle>> {
        self.tunnels
            .read()
            .await
            .get(subdomain)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Status-page view of every registered tunnel.
    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self
            .tunnels
            .read()
            .await
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        infos
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(subdomain: &str) -> Arc<SessionHandle> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(SessionHandle::new(
            subdomain.into(),
            "127.0.0.1:4000".parse().unwrap(),
            false,
            tx,
        ))
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = TunnelRegistry::new();
        let s = session("p");
        registry.register("p", Arc::clone(&s)).await.unwrap();

        let found = registry.lookup("p").await.unwrap();
        assert_eq!(found.client_id, s.client_id);
        assert!(registry.lookup("q").await.is_none());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let registry = TunnelRegistry::new();
        registry.register("p", session("p")).await.unwrap();

        let err = registry.register("p", session("p")).await.unwrap_err();
        assert!(err.existing_age < Duration::from_secs(5));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn stale_unregister_is_a_no_op() {
        let registry = TunnelRegistry::new();
        let first = session("p");
        registry.register("p", Arc::clone(&first)).await.unwrap();

        // First session loses the subdomain, a successor takes it.
        registry.unregister("p", &first.client_id).await;
        let second = session("p");
        registry.register("p", Arc::clone(&second)).await.unwrap();

        // The old session's teardown must not evict the successor.
        registry.unregister("p", &first.client_id).await;
        let found = registry.lookup("p").await.unwrap();
        assert_eq!(found.client_id, second.client_id);
    }

    #[tokio::test]
    async fn lookup_never_returns_closed_sessions() {
        let registry = TunnelRegistry::new();
        let s = session("p");
        registry.register("p", Arc::clone(&s)).await.unwrap();

        s.mark_closed();
        assert!(registry.lookup("p").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_lists_all_tunnels_sorted() {
        let registry = TunnelRegistry::new();
        registry.register("zeta", session("zeta")).await.unwrap();
        registry.register("alpha", session("alpha")).await.unwrap();

        let snapshot = registry.snapshot().await;
        let names: Vec<&str> = snapshot.iter().map(|t| t.subdomain.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn concurrent_registration_admits_exactly_one() {
        let registry = TunnelRegistry::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register("p", session("p")).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.count().await, 1);
    }
}
