//! Session-registry port and an in-memory implementation.
//!
//! The registry tracks which sidecar instance is reachable through which
//! connection. The tunnel touches it only from the `PluginInfo` workers:
//! a positive TTL flushes (creates or extends) the session, a zero TTL
//! deletes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::RegistryError;
use crate::protocol::Agent;
use crate::tunnel::PushHandle;

/// A sidecar instance as announced by `PluginInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSession {
    pub instance_id: String,
    pub biz_id: u32,
    pub app: String,
    pub agent: Agent,
}

pub type SessionHook = Arc<dyn Fn(&PluginSession) + Send + Sync>;

/// Callbacks run by the registry after a flush.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// The session did not exist before this flush.
    pub on_create: Option<SessionHook>,
    /// The session existed and its TTL was extended.
    pub on_update: Option<SessionHook>,
}

pub trait SessionRegistry: Send + Sync + 'static {
    /// Create or extend `session` for `ttl`, remembering `push` as its route.
    fn flush_session(
        &self,
        session: PluginSession,
        push: PushHandle,
        hooks: &SessionHooks,
        ttl: Duration,
    ) -> Result<(), RegistryError>;

    fn delete_session(&self, instance_id: &str) -> Result<(), RegistryError>;

    fn session_count(&self) -> Result<usize, RegistryError>;
}

struct Entry {
    session: PluginSession,
    push: PushHandle,
    expires_at: Instant,
}

/// Registry kept in process memory. Expired entries are removed by [`sweep`](Self::sweep).
#[derive(Default)]
pub struct MemoryRegistry {
    sessions: Mutex<HashMap<String, Entry>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, RegistryError> {
        self.sessions
            .lock()
            .map_err(|_| RegistryError::Unavailable("session map poisoned".into()))
    }

    /// Remove sessions whose TTL ran out. Returns their instance ids.
    pub fn sweep(&self) -> Result<Vec<String>, RegistryError> {
        let now = Instant::now();
        let mut sessions = self.lock()?;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            info!(instance_id = %id, "Registry: session expired");
        }
        Ok(expired)
    }

    /// Route to a live instance, for pushes addressed by instance id.
    pub fn lookup(&self, instance_id: &str) -> Result<(PluginSession, PushHandle), RegistryError> {
        let sessions = self.lock()?;
        sessions
            .get(instance_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| (e.session.clone(), e.push.clone()))
            .ok_or_else(|| RegistryError::NotFound(instance_id.to_string()))
    }
}

impl SessionRegistry for MemoryRegistry {
    fn flush_session(
        &self,
        session: PluginSession,
        push: PushHandle,
        hooks: &SessionHooks,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        let expires_at = Instant::now() + ttl;
        let created = {
            let mut sessions = self.lock()?;
            let created = !sessions.contains_key(&session.instance_id);
            sessions.insert(
                session.instance_id.clone(),
                Entry {
                    session: session.clone(),
                    push,
                    expires_at,
                },
            );
            created
        };

        // Hooks run outside the lock; they may call back into the registry.
        let hook = if created {
            debug!(instance_id = %session.instance_id, ttl_secs = ttl.as_secs(), "Registry: session created");
            hooks.on_create.as_ref()
        } else {
            hooks.on_update.as_ref()
        };
        if let Some(hook) = hook {
            hook(&session);
        }
        Ok(())
    }

    fn delete_session(&self, instance_id: &str) -> Result<(), RegistryError> {
        match self.lock()?.remove(instance_id) {
            Some(_) => {
                debug!(instance_id, "Registry: session deleted");
                Ok(())
            }
            None => Err(RegistryError::NotFound(instance_id.to_string())),
        }
    }

    fn session_count(&self) -> Result<usize, RegistryError> {
        Ok(self.lock()?.len())
    }
}
