#![forbid(unsafe_code)]

//! Tile-query cache: a short-lived snapshot of an expensive filtered query,
//! keyed by an opaque token the downstream tile renderer replays. The cache
//! backend is a capability interface so request handling couples to nothing
//! beyond store/fetch and an explicit unavailability error.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CacheError {
    /// The cache backend could not be reached. Distinct from a miss: a
    /// miss is an `Ok(None)` fetch, never an error.
    #[error("tile cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TileToken(pub Ulid);

impl TileToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// A malformed token is `None`, mirroring the fetch-miss contract.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for TileToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TileToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait TileCache: Send + Sync {
    /// Stores a rendered query under a fresh token and returns the token.
    ///
    /// # Errors
    /// Returns [`CacheError::Unavailable`] when the backend cannot accept
    /// the write; callers decide whether the surrounding request proceeds.
    fn store(&self, sql: &str) -> Result<TileToken, CacheError>;

    /// Resolves a token to its stored query. Expired and unknown tokens
    /// are `Ok(None)`.
    ///
    /// # Errors
    /// Returns [`CacheError::Unavailable`] when the backend cannot be
    /// reached.
    fn fetch(&self, token: &TileToken) -> Result<Option<String>, CacheError>;

    /// Drops every expired entry, returning how many were removed.
    ///
    /// # Errors
    /// Returns [`CacheError::Unavailable`] when the backend cannot be
    /// reached.
    fn purge_expired(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    sql: String,
    expires_at: OffsetDateTime,
}

/// Process-local cache with per-entry expiry. Entries are written once and
/// never updated in place; expiry removes them on the next touch.
pub struct MemoryTileCache {
    ttl: Duration,
    entries: Mutex<HashMap<TileToken, CacheEntry>>,
}

impl MemoryTileCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TileToken, CacheEntry>>, CacheError>
    {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache mutex poisoned".to_string()))
    }
}

impl TileCache for MemoryTileCache {
    fn store(&self, sql: &str) -> Result<TileToken, CacheError> {
        let token = TileToken::new();
        let entry = CacheEntry {
            sql: sql.to_string(),
            expires_at: OffsetDateTime::now_utc() + self.ttl,
        };
        self.locked()?.insert(token, entry);
        Ok(token)
    }

    fn fetch(&self, token: &TileToken) -> Result<Option<String>, CacheError> {
        let mut entries = self.locked()?;
        let Some(entry) = entries.get(token) else {
            return Ok(None);
        };

        if entry.expires_at < OffsetDateTime::now_utc() {
            entries.remove(token);
            return Ok(None);
        }

        Ok(Some(entry.sql.clone()))
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let mut entries = self.locked()?;
        let now = OffsetDateTime::now_utc();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    #[test]
    fn store_then_fetch_returns_query() {
        let cache = MemoryTileCache::new(Duration::seconds(30));
        let token = must_ok(cache.store("SELECT record_id FROM records"));
        let sql = must_some(must_ok(cache.fetch(&token)));
        assert_eq!(sql, "SELECT record_id FROM records");
    }

    #[test]
    fn tokens_are_unique_per_store() {
        let cache = MemoryTileCache::new(Duration::seconds(30));
        let first = must_ok(cache.store("SELECT 1"));
        let second = must_ok(cache.store("SELECT 1"));
        assert_ne!(first, second);
    }

    #[test]
    fn expired_entries_miss_and_vanish() {
        let cache = MemoryTileCache::new(Duration::milliseconds(-1));
        let token = must_ok(cache.store("SELECT 1"));
        assert_eq!(must_ok(cache.fetch(&token)), None);
        // The expired entry was dropped on fetch, not just hidden.
        assert_eq!(must_ok(cache.purge_expired()), 0);
    }

    #[test]
    fn unknown_token_is_a_miss_not_an_error() {
        let cache = MemoryTileCache::new(Duration::seconds(30));
        assert_eq!(must_ok(cache.fetch(&TileToken::new())), None);
    }

    #[test]
    fn purge_counts_only_expired_entries() {
        let cache = MemoryTileCache::new(Duration::seconds(30));
        let _ = must_ok(cache.store("SELECT 1"));

        let stale = MemoryTileCache::new(Duration::milliseconds(-1));
        let _ = must_ok(stale.store("SELECT 1"));
        let _ = must_ok(stale.store("SELECT 2"));

        assert_eq!(must_ok(cache.purge_expired()), 0);
        assert_eq!(must_ok(stale.purge_expired()), 2);
    }

    #[test]
    fn token_round_trips_as_string() {
        let token = TileToken::new();
        let parsed = must_some(TileToken::parse(&token.to_string()));
        assert_eq!(parsed, token);
        assert_eq!(TileToken::parse("not-a-token"), None);
    }
}
