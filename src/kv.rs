//! Thin async wrapper over the shared key/value store.
//!
//! Every higher-level store (`session`, `symbols`) goes through this client
//! rather than talking to `redis` directly, so the backing driver can be
//! swapped without touching business logic.

use eyre::{Result, WrapErr};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

#[derive(Clone)]
pub struct KvClient {
    conn: ConnectionManager,
}

impl KvClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).wrap_err("invalid redis url")?;
        let conn = client
            .get_connection_manager()
            .await
            .wrap_err("failed to connect to redis")?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .clone()
            .get(key)
            .await
            .wrap_err_with(|| format!("GET {key} failed"))
    }

    pub async fn set(&self, key: &str, value: &str, ex_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ex_secs {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .wrap_err_with(|| format!("SET {key} failed"))
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        self.conn
            .clone()
            .del::<_, ()>(key)
            .await
            .wrap_err_with(|| format!("DEL {key} failed"))
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.conn
            .clone()
            .hget(key, field)
            .await
            .wrap_err_with(|| format!("HGET {key} {field} failed"))
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.conn
            .clone()
            .hset::<_, _, _, ()>(key, field, value)
            .await
            .wrap_err_with(|| format!("HSET {key} {field} failed"))
    }

    pub async fn hset_multiple(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.conn
            .clone()
            .hset_multiple::<_, _, _, ()>(key, pairs)
            .await
            .wrap_err_with(|| format!("HSET {key} (multi) failed"))
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.conn
            .clone()
            .hgetall(key)
            .await
            .wrap_err_with(|| format!("HGETALL {key} failed"))
    }

    pub async fn hlen(&self, key: &str) -> Result<u64> {
        self.conn
            .clone()
            .hlen(key)
            .await
            .wrap_err_with(|| format!("HLEN {key} failed"))
    }

    /// Incremental hash scan, returning one page of `(field, value)` pairs and
    /// the cursor to resume from (`0` means the scan is complete).
    pub async fn hscan_page(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: u64,
    ) -> Result<(u64, Vec<(String, String)>)> {
        let mut conn = self.conn.clone();
        let (next_cursor, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .wrap_err_with(|| format!("HSCAN {key} failed"))?;

        let pairs = flat
            .chunks_exact(2)
            .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
            .collect();
        Ok((next_cursor, pairs))
    }

    pub async fn expire(&self, key: &str, secs: i64) -> Result<()> {
        self.conn
            .clone()
            .expire::<_, ()>(key, secs)
            .await
            .wrap_err_with(|| format!("EXPIRE {key} failed"))
    }
}
