//! Cookie-bound per-client state with TTL and throttled sweeps.
//!
//! The cookie value is the only thing a client ever holds; all state
//! lives server-side, keyed by a 128-bit random identifier. Writes to one
//! session never block reads of another: the map is sharded and each
//! session guards only its own slot map.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use tracing::debug;

/// One client's server-side state.
pub struct Session {
    id: String,
    last_access_millis: AtomicI64,
    slots: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            last_access_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Millis-since-epoch of the most recent access. Monotonic.
    pub fn last_access_millis(&self) -> i64 {
        self.last_access_millis.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_access_millis
            .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    /// Stores a value under a named slot, replacing any previous value.
    pub fn put<T: Send + Sync + 'static>(&self, name: &str, value: T) {
        self.slots
            .lock()
            .expect("session lock poisoned")
            .insert(name.to_string(), Box::new(value));
    }

    /// Clones the value out of a named slot, if present with type `T`.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        self.slots
            .lock()
            .expect("session lock poisoned")
            .get(name)
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns a named slot. The one-shot consumption used
    /// for replay-protected state.
    pub fn take<T: Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        let mut slots = self.slots.lock().expect("session lock poisoned");
        let boxed = slots.remove(name)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                // Wrong type requested; put the value back untouched.
                slots.insert(name.to_string(), other);
                None
            }
        }
    }

    pub fn remove(&self, name: &str) {
        self.slots
            .lock()
            .expect("session lock poisoned")
            .remove(name);
    }
}

/// Result of a session lookup.
pub struct SessionHandle {
    pub session: Arc<Session>,
    /// True when this call created the session; the caller must then send
    /// the cookie.
    pub created: bool,
}

/// Manages the session map, the cookie binding, and expiry.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    cookie_name: String,
    secure: bool,
    ttl: Duration,
    max_cleanup_interval: Duration,
    last_sweep_millis: AtomicI64,
}

impl SessionManager {
    pub fn new(
        cookie_name: impl Into<String>,
        secure: bool,
        ttl: Duration,
        max_cleanup_interval: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            cookie_name: cookie_name.into(),
            secure,
            ttl,
            max_cleanup_interval,
            last_sweep_millis: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Looks up the session bound to `cookie_header`, updating its
    /// last-access time. With `create_if_absent`, a missing or expired
    /// session is replaced by a fresh one.
    pub fn get_session(
        &self,
        cookie_header: Option<&str>,
        create_if_absent: bool,
    ) -> Option<SessionHandle> {
        self.maybe_sweep();

        if let Some(id) = cookie_header.and_then(|header| self.cookie_value(header)) {
            if let Some(session) = self.sessions.get(id) {
                if !self.is_expired(&session) {
                    session.touch();
                    return Some(SessionHandle {
                        session: Arc::clone(&session),
                        created: false,
                    });
                }
                drop(session);
                self.sessions.remove(id);
            }
        }

        if !create_if_absent {
            return None;
        }

        let session = Arc::new(Session::new(random_session_id()));
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        debug!(session_id = session.id(), "created session");
        Some(SessionHandle {
            session,
            created: true,
        })
    }

    /// Drops one session immediately.
    pub fn delete(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// `Set-Cookie` value binding `session` to the client.
    pub fn cookie_for(&self, session: &Session) -> String {
        let mut cookie = format!("{}={}; Path=/; HttpOnly", self.cookie_name, session.id());
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn cookie_value<'a>(&self, header: &'a str) -> Option<&'a str> {
        header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == self.cookie_name).then_some(value)
        })
    }

    fn is_expired(&self, session: &Session) -> bool {
        let idle = Utc::now().timestamp_millis() - session.last_access_millis();
        idle > self.ttl.as_millis() as i64
    }

    /// Removes expired sessions, at most once per `max_cleanup_interval`.
    fn maybe_sweep(&self) {
        let now = Utc::now().timestamp_millis();
        let last = self.last_sweep_millis.load(Ordering::Acquire);
        if now - last < self.max_cleanup_interval.as_millis() as i64 {
            return;
        }
        if self
            .last_sweep_millis
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller is sweeping.
            return;
        }
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !self.is_expired(session));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
    }
}

/// Cryptographically random 128-bit identifier, hex-encoded.
fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
