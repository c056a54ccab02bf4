use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;
use streamgate_core::UserId;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Key under which an upstream connection handle is cached.
///
/// Public connections are shared per exchange; private connections are
/// per user and exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Public(String),
    Private(UserId, String),
}

impl SessionKey {
    pub fn public(exchange: &str) -> Self {
        SessionKey::Public(exchange.to_lowercase())
    }

    pub fn private(user: &UserId, exchange: &str) -> Self {
        SessionKey::Private(user.clone(), exchange.to_lowercase())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Public(exchange) => f.write_str(exchange),
            SessionKey::Private(user, exchange) => write!(f, "{user}:{exchange}"),
        }
    }
}

struct Entry<T> {
    value: T,
    deadline: Option<Instant>,
}

/// Keyed store of cached connection handles with optional sliding
/// time-to-live eviction.
///
/// With a finite TTL, every `get` that finds a live entry pushes its
/// deadline out again, and `set` (re)arms it; entries left untouched past
/// the TTL are removed on the next access through the same path `remove`
/// uses, so an expired entry can never be observed half-evicted. With no
/// TTL, entries live until explicitly removed. Eviction drops the handle
/// without side effects; whoever misses next is responsible for recreating
/// it.
pub struct SessionCache<T> {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<SessionKey, Entry<T>>>,
}

impl<T: Clone> SessionCache<T> {
    pub fn new(ttl: Option<Duration>) -> Self {
        SessionCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a handle, sliding its expiry on a hit.
    pub async fn get(&self, key: &SessionKey) -> Option<T> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) => entry.deadline.is_some_and(|d| d <= Instant::now()),
            None => return None,
        };
        if expired {
            entries.remove(key);
            tracing::debug!(session = %key, "session expired");
            return None;
        }
        let entry = entries.get_mut(key)?;
        entry.deadline = self.next_deadline();
        Some(entry.value.clone())
    }

    /// Insert or replace a handle, (re)arming its expiry.
    pub async fn set(&self, key: SessionKey, value: T) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            Entry {
                value,
                deadline: self.next_deadline(),
            },
        );
    }

    /// Remove a handle, returning it so the caller can release any
    /// exchange-side resources it holds.
    pub async fn remove(&self, key: &SessionKey) -> Option<T> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(key)?;
        if entry.deadline.is_some_and(|d| d <= Instant::now()) {
            return None;
        }
        Some(entry.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }
}
