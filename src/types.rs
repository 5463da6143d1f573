//! Shared value types that cross module boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which cTrader venue a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Demo,
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Demo => "demo",
            Environment::Live => "live",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "demo" => Some(Environment::Demo),
            "live" => Some(Environment::Live),
            _ => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A spot price tick for one symbol on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub user_id: String,
    pub env: Environment,
    pub account_id: i64,
    pub symbol_id: i64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
}

/// Key identifying one quote stream: `(user, env, account, symbol)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub user_id: String,
    pub env: Environment,
    pub account_id: i64,
    pub symbol_id: i64,
}

impl QuoteKey {
    pub fn new(user_id: impl Into<String>, env: Environment, account_id: i64, symbol_id: i64) -> Self {
        Self {
            user_id: user_id.into(),
            env,
            account_id,
            symbol_id,
        }
    }

    pub fn from_quote(q: &Quote) -> Self {
        Self::new(q.user_id.clone(), q.env, q.account_id, q.symbol_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().replace('_', "").as_str() {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            "STOP" => Some(OrderType::Stop),
            "STOPLIMIT" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }
}

/// Body of `POST /trade`, prior to validation in the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub user_id: Option<String>,
    pub env: Option<String>,
    pub account_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub volume_units: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub comment: Option<String>,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_roundtrips_through_str() {
        assert_eq!(Environment::parse("demo"), Some(Environment::Demo));
        assert_eq!(Environment::parse("live"), Some(Environment::Live));
        assert_eq!(Environment::parse("staging"), None);
        assert_eq!(Environment::Demo.to_string(), "demo");
    }

    #[test]
    fn trade_side_parses_case_insensitively() {
        assert_eq!(TradeSide::parse("buy"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("SELL"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("hold"), None);
    }

    #[test]
    fn order_type_parses_with_or_without_underscore() {
        assert_eq!(OrderType::parse("stop_limit"), Some(OrderType::StopLimit));
        assert_eq!(OrderType::parse("STOPLIMIT"), Some(OrderType::StopLimit));
        assert_eq!(OrderType::parse("trailing"), None);
    }

    #[test]
    fn quote_key_derives_from_quote() {
        let q = Quote {
            user_id: "u1".to_string(),
            env: Environment::Demo,
            account_id: 42,
            symbol_id: 1,
            bid: Some(1.1),
            ask: Some(1.2),
            timestamp: None,
        };
        let k = QuoteKey::from_quote(&q);
        assert_eq!(k, QuoteKey::new("u1", Environment::Demo, 42, 1));
    }
}
