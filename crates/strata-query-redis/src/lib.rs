//! Redis helpers for strata-query
//!
//! Key-value stores do not run composed filters; this crate provides the
//! operations record-oriented code needs next to them: short-lived locks,
//! hash counters that keep a TTL, hash reads with nil handling, and id
//! sets parsed to `u64`.
//!
//! A nil reply where a value is required surfaces as `DataError::NotFound`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use strata_query_redis::RedisStore;
//! use std::time::Duration;
//!
//! # async fn example() -> strata_query::Result<()> {
//! let store = RedisStore::new("redis://localhost:6379").await?;
//!
//! if store.apply_lock("order:42", Duration::from_secs(5)).await? {
//!     let views = store.hincr("stats:2024-06-01", "order:42", Duration::from_secs(86_400)).await?;
//!     # let _ = views;
//!     store.release_lock("order:42").await?;
//! }
//! # Ok(())
//! # }
//! ```

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_query::{ClientRegistry, ConnectionConfig, DataError, DriverSettings, Result};
use tracing::{debug, error, warn};

pub const BACKEND: &str = "redis";

/// Map a client error to `Upstream`, tagged with the caller
#[track_caller]
pub fn map_error(e: RedisError) -> DataError {
    error!("Redis operation failed: {}", e);
    DataError::upstream(e)
}

/// Name of the lock key guarding `key`
pub fn lock_key(key: &str) -> String {
    format!("{}:lock", key)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Parse set members as ids.
///
/// An empty list is `NotFound`; members that are not ids are logged and
/// read as `0` so positions still line up with the input.
pub fn parse_u64s(values: &[String]) -> Result<Vec<u64>> {
    if values.is_empty() {
        return Err(DataError::not_found("no ids"));
    }
    Ok(values
        .iter()
        .map(|v| {
            v.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!("redis member {:?} is not a u64", v);
                0
            })
        })
        .collect())
}

/// Flatten a serializable struct into hash fields; strings are stored as
/// is, other values as JSON
pub fn hash_fields<T: Serialize>(value: &T) -> Result<Vec<(String, String)>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()),
        other => Err(DataError::invalid_argument(format!(
            "hash fields need an object, got {}",
            other
        ))),
    }
}

/// Redis client shared across tasks through a connection manager
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    url: String,
}

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379/0")
    pub async fn new(url: &str) -> Result<Self> {
        debug!("Creating Redis store for URL: {}", url);

        let client = redis::Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            DataError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            DataError::ConnectionFailed(format!("Failed to connect to Redis: {}", e))
        })?;

        debug!("Redis client created successfully");

        Ok(Self {
            connection,
            url: url.to_string(),
        })
    }

    /// Connect using a resolved config section; `db` selects the database
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Self::new(&config.url(BACKEND)).await
    }

    /// The shared store for a config section, connecting on first use
    pub async fn shared(
        registry: &ClientRegistry<RedisStore>,
        settings: &DriverSettings,
        section: &str,
    ) -> Result<Arc<RedisStore>> {
        let key = if section.is_empty() { BACKEND } else { section };
        registry
            .get_or_try_init(key, || async move {
                let config = ConnectionConfig::from_section(settings, BACKEND, section)?;
                RedisStore::connect(&config).await
            })
            .await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Try to take the lock on `key` for `expires`; `false` when someone
    /// else holds it
    pub async fn apply_lock(&self, key: &str, expires: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let lock = lock_key(key);
        debug!("LOCK {} for {:?}", lock, expires);

        let reply: Option<String> = redis::cmd("SET")
            .arg(&lock)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis(expires))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(e))?;
        Ok(reply.is_some())
    }

    /// Drop the lock on `key`; `false` when it was not held
    pub async fn release_lock(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let deleted: i64 = conn.del(lock_key(key)).await.map_err(|e| map_error(e))?;
        Ok(deleted > 0)
    }

    /// Remaining TTL in milliseconds; negative when the key has no expiry
    /// (`-1`) or does not exist (`-2`)
    pub async fn pttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection();
        conn.pttl(key).await.map_err(|e| map_error(e))
    }

    /// `HINCRBY`, (re)arming the key's expiry unless it is already running
    /// and shorter than `expires`
    pub async fn hincr_by(&self, key: &str, field: &str, incr: i64, expires: Duration) -> Result<i64> {
        let ttl = self.pttl(key).await?;
        let mut conn = self.connection();
        debug!("HINCRBY {} {} {}", key, field, incr);

        if ttl > 0 && ttl < millis(expires) {
            return conn.hincr(key, field, incr).await.map_err(|e| map_error(e));
        }

        let (reply,): (i64,) = redis::pipe()
            .atomic()
            .hincr(key, field, incr)
            .pexpire(key, millis(expires))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(e))?;
        Ok(reply)
    }

    pub async fn hincr(&self, key: &str, field: &str, expires: Duration) -> Result<i64> {
        self.hincr_by(key, field, 1, expires).await
    }

    /// Increment each field by one in one round trip; the expiry is set
    /// only when the key has none
    pub async fn hmincr<F: AsRef<str>>(&self, key: &str, fields: &[F], expires: Duration) -> Result<Vec<i64>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let ttl = self.pttl(key).await?;
        let mut conn = self.connection();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for field in fields {
            pipe.hincr(key, field.as_ref(), 1);
        }
        if ttl <= 0 {
            pipe.pexpire(key, millis(expires)).ignore();
        }
        debug!("HMINCR {} x{}", key, fields.len());

        pipe.query_async(&mut conn).await.map_err(|e| map_error(e))
    }

    pub async fn hmincr_ids(&self, key: &str, ids: &[u64], expires: Duration) -> Result<Vec<i64>> {
        let fields: Vec<String> = ids.iter().map(u64::to_string).collect();
        self.hmincr(key, &fields, expires).await
    }

    /// `HSET` the pairs; a key without a running TTL gets `expires`
    pub async fn hset(&self, key: &str, pairs: &[(String, String)], expires: Duration) -> Result<()> {
        if pairs.is_empty() {
            return Err(DataError::invalid_argument(format!("HSET {} without fields", key)));
        }
        let ttl = self.pttl(key).await?;
        let mut conn = self.connection();
        debug!("HSET {} x{}", key, pairs.len());

        if ttl > 0 {
            let _: () = conn.hset_multiple(key, pairs).await.map_err(|e| map_error(e))?;
            return Ok(());
        }

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(key, pairs)
            .ignore()
            .pexpire(key, millis(expires))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(e))?;
        Ok(())
    }

    /// Store a struct's fields as a hash
    pub async fn hset_entity<T: Serialize>(&self, key: &str, value: &T, expires: Duration) -> Result<()> {
        let pairs = hash_fields(value)?;
        self.hset(key, &pairs, expires).await
    }

    /// All fields parsed as integers. With `strict`, a non-integer field is
    /// an error; otherwise it is skipped.
    pub async fn hget_all_int(&self, key: &str, strict: bool) -> Result<HashMap<String, i64>> {
        let mut conn = self.connection();
        let raw: HashMap<String, String> = conn.hgetall(key).await.map_err(|e| map_error(e))?;
        if raw.is_empty() {
            return Err(DataError::not_found(format!("redis key {} not found", key)));
        }

        let mut values = HashMap::with_capacity(raw.len());
        for (field, value) in raw {
            match value.trim().parse::<i64>() {
                Ok(n) => {
                    values.insert(field, n);
                }
                Err(_) if strict => {
                    return Err(DataError::invalid_argument(format!(
                        "field {} of {} is not an integer: {:?}",
                        field, key, value
                    )))
                }
                Err(_) => {}
            }
        }
        Ok(values)
    }

    async fn hmget_raw<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field.as_ref());
        }
        let values: Vec<Option<String>> = cmd.query_async(&mut conn).await.map_err(|e| map_error(e))?;
        if values.len() != fields.len() {
            return Err(DataError::not_found(format!("redis key {} not found", key)));
        }
        Ok(values)
    }

    /// `HMGET` tolerating missing fields. Returns the values and whether
    /// every field was present; all fields missing is `NotFound`.
    pub async fn try_hmget<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> Result<(Vec<Option<String>>, bool)> {
        let values = self.hmget_raw(key, fields).await?;
        if !values.is_empty() && values.iter().all(Option::is_none) {
            return Err(DataError::not_found(format!("redis key {} not found", key)));
        }
        let complete = values.iter().all(Option::is_some);
        Ok((values, complete))
    }

    /// `HMGET` where every field must be present
    pub async fn must_hmget<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> Result<Vec<String>> {
        self.hmget_raw(key, fields)
            .await?
            .into_iter()
            .zip(fields)
            .map(|(value, field)| {
                value.ok_or_else(|| {
                    DataError::not_found(format!("field {} of {} is nil", field.as_ref(), key))
                })
            })
            .collect()
    }

    /// `GET` a value written by [`RedisStore::set_json`]
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let mut conn = self.connection();
        let raw: Option<String> = conn.get(key).await.map_err(|e| map_error(e))?;
        let raw = raw.ok_or_else(|| DataError::not_found(format!("redis key {} not found", key)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, expires: Duration) -> Result<()> {
        let mut conn = self.connection();
        let serialized = serde_json::to_string(value)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(serialized)
            .arg("PX")
            .arg(millis(expires))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(e))?;
        Ok(())
    }

    pub async fn smembers_u64(&self, key: &str) -> Result<Vec<u64>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(key).await.map_err(|e| map_error(e))?;
        parse_u64s(&members)
    }

    /// Union of id sets
    pub async fn sunion_u64(&self, keys: &[String]) -> Result<Vec<u64>> {
        if keys.is_empty() {
            return Err(DataError::invalid_argument("SUNION without keys"));
        }
        let mut conn = self.connection();
        let members: Vec<String> = conn.sunion(keys).await.map_err(|e| map_error(e))?;
        parse_u64s(&members)
    }

    pub async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();
        let deleted: i64 = conn.del(keys).await.map_err(|e| map_error(e))?;
        Ok(deleted.max(0) as u64)
    }

    pub async fn close(&self) -> Result<()> {
        debug!("Closing Redis store");
        // Connection manager handles cleanup automatically
        Ok(())
    }
}
