//! In-process last-quote map plus bounded waiter queues.
//!
//! `upsert` stores the tick and wakes every waiter on that key; `wait_for_next`
//! parks a caller until the next tick or its own timeout fires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::GatewayError;
use crate::types::{Quote, QuoteKey};

const MAX_WAITERS_PER_KEY: usize = 50;

struct Inner {
    last: HashMap<QuoteKey, Quote>,
    waiters: HashMap<QuoteKey, Vec<oneshot::Sender<Quote>>>,
}

pub struct QuoteBus {
    inner: Mutex<Inner>,
}

impl QuoteBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: HashMap::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    /// Store `quote` and resolve every waiter currently parked on its key.
    pub fn upsert(&self, quote: Quote) {
        let key = QuoteKey::from_quote(&quote);
        let mut inner = self.inner.lock().expect("quote bus mutex poisoned");
        inner.last.insert(key.clone(), quote.clone());
        if let Some(waiters) = inner.waiters.remove(&key) {
            for tx in waiters {
                let _ = tx.send(quote.clone());
            }
        }
    }

    pub fn get_last(&self, key: &QuoteKey) -> Option<Quote> {
        self.inner
            .lock()
            .expect("quote bus mutex poisoned")
            .last
            .get(key)
            .cloned()
    }

    /// Park until the next `upsert` on `key` or until `timeout` elapses.
    pub async fn wait_for_next(&self, key: &QuoteKey, timeout: Duration) -> Result<Quote, GatewayError> {
        let rx = {
            let mut inner = self.inner.lock().expect("quote bus mutex poisoned");
            let waiters = inner.waiters.entry(key.clone()).or_default();
            if waiters.len() >= MAX_WAITERS_PER_KEY {
                return Err(GatewayError::QuoteTimeout);
            }
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(quote)) => Ok(quote),
            Ok(Err(_)) => Err(GatewayError::QuoteTimeout),
            Err(_) => Err(GatewayError::QuoteTimeout),
        }
    }
}

impl Default for QuoteBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_quote(key: &QuoteKey, bid: f64) -> Quote {
        Quote {
            user_id: key.user_id.clone(),
            env: key.env,
            account_id: key.account_id,
            symbol_id: key.symbol_id,
            bid: Some(bid),
            ask: Some(bid + 0.0001),
            timestamp: Some(1),
        }
    }

    #[test]
    fn upsert_then_get_last_returns_the_same_quote() {
        let bus = QuoteBus::new();
        let key = QuoteKey::new("u1", crate::types::Environment::Demo, 1, 100);
        let q = sample_quote(&key, 1.1);
        bus.upsert(q.clone());
        assert_eq!(bus.get_last(&key), Some(q));
    }

    #[test]
    fn get_last_on_unknown_key_is_none() {
        let bus = QuoteBus::new();
        let key = QuoteKey::new("u1", crate::types::Environment::Demo, 1, 999);
        assert_eq!(bus.get_last(&key), None);
    }

    #[tokio::test]
    async fn wait_for_next_resolves_on_upsert() {
        let bus = std::sync::Arc::new(QuoteBus::new());
        let key = QuoteKey::new("u1", crate::types::Environment::Demo, 1, 5);

        let bus2 = bus.clone();
        let key2 = key.clone();
        let waiter = tokio::spawn(async move {
            bus2.wait_for_next(&key2, Duration::from_secs(2)).await
        });

        tokio::task::yield_now().await;
        bus.upsert(sample_quote(&key, 2.5));

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap().bid, Some(2.5));
    }

    #[tokio::test]
    async fn wait_for_next_times_out_without_a_matching_upsert() {
        let bus = QuoteBus::new();
        let key = QuoteKey::new("u1", crate::types::Environment::Demo, 1, 6);
        let result = bus.wait_for_next(&key, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(GatewayError::QuoteTimeout)));
    }

    #[tokio::test]
    async fn waiter_bound_is_never_exceeded() {
        let bus = QuoteBus::new();
        let key = QuoteKey::new("u1", crate::types::Environment::Demo, 1, 7);

        let mut handles = Vec::new();
        for _ in 0..MAX_WAITERS_PER_KEY {
            let rx = {
                let mut inner = bus.inner.lock().unwrap();
                let waiters = inner.waiters.entry(key.clone()).or_default();
                let (tx, rx) = oneshot::channel::<Quote>();
                waiters.push(tx);
                rx
            };
            handles.push(rx);
        }

        let result = bus.wait_for_next(&key, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(GatewayError::QuoteTimeout)));
        drop(handles);
    }
}
