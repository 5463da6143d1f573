//! Persistent per-(user, env, account) symbol catalog.
//!
//! Stored as a hash `symbols:<userId>:<env>:<accountId>` mapping uppercase
//! symbol name to a stringified positive integer id.

use eyre::{Result, WrapErr};
use std::collections::HashMap;

use crate::kv::KvClient;
use crate::types::Environment;

const SCAN_PAGE_COUNT: u64 = 200;

fn catalog_key(user_id: &str, env: Environment, account_id: i64) -> String {
    format!("symbols:{user_id}:{env}:{account_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMatch {
    pub symbol: String,
    pub symbol_id: i64,
}

#[derive(Clone)]
pub struct SymbolStore {
    kv: KvClient,
    ttl_secs: u64,
}

impl SymbolStore {
    pub fn new(kv: KvClient, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    pub async fn count(&self, user_id: &str, env: Environment, account_id: i64) -> Result<u64> {
        self.kv.hlen(&catalog_key(user_id, env, account_id)).await
    }

    pub async fn get_symbol_id(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        name: &str,
    ) -> Result<Option<i64>> {
        let key = catalog_key(user_id, env, account_id);
        let Some(raw) = self.kv.hget(&key, &name.to_ascii_uppercase()).await? else {
            return Ok(None);
        };
        match raw.parse::<i64>() {
            Ok(id) if id > 0 => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    /// Atomically replace the whole catalog with `entries` (symbol name,
    /// case-insensitive, mapped to its id).
    pub async fn replace_all(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        entries: &HashMap<String, i64>,
    ) -> Result<()> {
        let key = catalog_key(user_id, env, account_id);
        self.kv.del(&key).await?;

        let pairs: Vec<(String, String)> = entries
            .iter()
            .map(|(name, id)| (name.to_ascii_uppercase(), id.to_string()))
            .collect();
        self.kv
            .hset_multiple(&key, &pairs)
            .await
            .wrap_err("failed to write symbol catalog")?;
        self.kv.expire(&key, self.ttl_secs as i64).await?;
        Ok(())
    }

    /// Find up to `limit` symbols whose uppercase name contains `needle`
    /// (case-insensitive). Empty needle matches everything.
    pub async fn search(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<SymbolMatch>> {
        let key = catalog_key(user_id, env, account_id);
        let needle_upper = needle.to_ascii_uppercase();
        let pattern = if needle_upper.is_empty() {
            "*".to_string()
        } else {
            format!("*{needle_upper}*")
        };

        let mut matches = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next_cursor, page) = self
                .kv
                .hscan_page(&key, cursor, &pattern, SCAN_PAGE_COUNT)
                .await?;
            for (field, value) in page {
                if let Ok(id) = value.parse::<i64>() {
                    matches.push(SymbolMatch {
                        symbol: field,
                        symbol_id: id,
                    });
                    if matches.len() >= limit {
                        return Ok(matches);
                    }
                }
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        if matches.is_empty() {
            // Defends against server-side pattern quirks: fall back to a
            // full read and filter client-side.
            let all = self.kv.hgetall(&key).await?;
            for (field, value) in all {
                if !needle_upper.is_empty() && !field.contains(&needle_upper) {
                    continue;
                }
                if let Ok(id) = value.parse::<i64>() {
                    matches.push(SymbolMatch {
                        symbol: field,
                        symbol_id: id,
                    });
                    if matches.len() >= limit {
                        break;
                    }
                }
            }
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_map(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn catalog_key_includes_user_env_account() {
        let key = catalog_key("u1", Environment::Live, 42);
        assert_eq!(key, "symbols:u1:live:42");
    }

    #[test]
    fn uppercase_names_normalize_for_storage_and_lookup() {
        let map = build_map(&[("eurusd", 1)]);
        let pairs: Vec<(String, String)> = map
            .iter()
            .map(|(name, id)| (name.to_ascii_uppercase(), id.to_string()))
            .collect();
        assert_eq!(pairs, vec![("EURUSD".to_string(), "1".to_string())]);
    }
}
