//! Orchestration layer: per-request resolution of environment / access token
//! / active account / symbol id, on-demand account reauthorization, symbol
//! catalog refresh, and order validation/encoding.
//!
//! This is the one place that ties the upstream connection, the quote bus,
//! and the two KV-backed stores together. Nothing below this module knows
//! about HTTP; nothing above it talks to the connection directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::Config;
use crate::connection::{Connection, SendMeta};
use crate::error::GatewayError;
use crate::quotebus::QuoteBus;
use crate::session::{SessionData, SessionStore};
use crate::symbols::{SymbolMatch, SymbolStore};
use crate::types::{Environment, OrderType, TradeRequest, TradeSide};

/// Default timeout for request/response round-trips that don't call out a
/// different figure in SPEC_FULL.md (12 s is reserved for AppAuth, 5 s for
/// the heartbeat — both live in `crate::connection`).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct AccountListResult {
    pub count: usize,
    pub items: Vec<Value>,
}

pub struct AuthorizeAccountResult {
    pub authorized: bool,
    pub active_account_id: i64,
    pub response: Value,
}

pub struct SymbolListResult {
    pub active_account_id: i64,
    pub count: usize,
    pub items: Vec<SymbolMatch>,
}

pub struct TradeResult {
    pub request: Value,
    pub response: Value,
}

pub struct Gateway {
    config: Arc<Config>,
    connection: Arc<Connection>,
    quote_bus: Arc<QuoteBus>,
    sessions: SessionStore,
    symbols: SymbolStore,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        connection: Arc<Connection>,
        quote_bus: Arc<QuoteBus>,
        sessions: SessionStore,
        symbols: SymbolStore,
    ) -> Self {
        Self {
            config,
            connection,
            quote_bus,
            sessions,
            symbols,
        }
    }

    // --- resolution helpers -------------------------------------------------

    /// `override_env ?? session.env ?? configured default`.
    pub async fn resolve_env(
        &self,
        user_id: &str,
        override_env: Option<Environment>,
    ) -> Result<Environment, GatewayError> {
        if let Some(env) = override_env {
            return Ok(env);
        }
        if let Some(session) = self.sessions.load_session(user_id).await? {
            if let Some(env) = session.env {
                return Ok(env);
            }
        }
        Ok(self.config.ctrader_env)
    }

    /// Reads and decrypts the stored access token, or `override_token` if one
    /// was supplied by the caller (e.g. via `x-ctrader-access-token`).
    pub async fn resolve_access_token(
        &self,
        user_id: &str,
        override_token: Option<&str>,
    ) -> Result<String, GatewayError> {
        if let Some(token) = override_token {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
        self.sessions.access_token(user_id).await?.ok_or_else(|| {
            GatewayError::AuthMissing(
                "no access token on file for this user; exchange an OAuth code first".to_string(),
            )
        })
    }

    /// Positive `override_account_id`, else the session's active account.
    pub async fn resolve_account_id(
        &self,
        user_id: &str,
        override_account_id: Option<i64>,
    ) -> Result<i64, GatewayError> {
        if let Some(id) = override_account_id {
            if id > 0 {
                return Ok(id);
            }
        }
        let session = self.sessions.load_session(user_id).await?;
        session
            .and_then(|s| s.active_account_id)
            .filter(|id| *id > 0)
            .ok_or_else(|| {
                GatewayError::AuthMissing(
                    "no active account selected; call POST /auth/account first".to_string(),
                )
            })
    }

    /// Authorizes `account_id` on the upstream channel if it isn't already.
    /// cTrader replies with an "already authorized" error when the channel
    /// has already authorized this account; that's treated as success
    /// because the channel is stateful, not per-request.
    pub async fn ensure_account_authorized(
        &self,
        env: Environment,
        account_id: i64,
        access_token: &str,
    ) -> Result<(), GatewayError> {
        let body = json!({
            "ctidTraderAccountId": account_id,
            "accessToken": access_token,
        });
        let result = self
            .connection
            .send(
                "PROTO_OA_ACCOUNT_AUTH_REQ",
                &body,
                DEFAULT_TIMEOUT,
                SendMeta {
                    env: Some(env),
                    user_id: None,
                },
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(GatewayError::Upstream(desc)) if is_already_authorized(&desc) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // --- public operations ---------------------------------------------------

    pub async fn list_accounts(
        &self,
        user_id: &str,
        override_token: Option<&str>,
    ) -> Result<AccountListResult, GatewayError> {
        let access_token = self.resolve_access_token(user_id, override_token).await?;
        let env = self.resolve_env(user_id, None).await?;
        let body = json!({ "accessToken": access_token });
        let response = self
            .connection
            .send(
                "PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_REQ",
                &body,
                DEFAULT_TIMEOUT,
                SendMeta {
                    env: Some(env),
                    user_id: None,
                },
            )
            .await?;

        let items = response
            .decoded
            .get("ctidTraderAccount")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(AccountListResult {
            count: items.len(),
            items,
        })
    }

    pub async fn authorize_account(
        &self,
        user_id: &str,
        account_id: i64,
        override_env: Option<Environment>,
        override_token: Option<&str>,
    ) -> Result<AuthorizeAccountResult, GatewayError> {
        if account_id <= 0 {
            return Err(GatewayError::Validation("accountId must be a positive integer".to_string()));
        }
        let env = self.resolve_env(user_id, override_env).await?;
        let access_token = self.resolve_access_token(user_id, override_token).await?;

        let body = json!({
            "ctidTraderAccountId": account_id,
            "accessToken": access_token,
        });
        let response = self
            .connection
            .send(
                "PROTO_OA_ACCOUNT_AUTH_REQ",
                &body,
                DEFAULT_TIMEOUT,
                SendMeta {
                    env: Some(env),
                    user_id: None,
                },
            )
            .await;

        let (authorized, response_json) = match response {
            Ok(r) => (true, r.decoded),
            Err(GatewayError::Upstream(desc)) if is_already_authorized(&desc) => {
                (true, json!({ "description": desc }))
            }
            Err(e) => return Err(e),
        };

        self.sessions
            .patch_session(
                user_id,
                crate::session::SessionPatch {
                    env: Some(env),
                    active_account_id: Some(account_id),
                    ..Default::default()
                },
                None,
                Utc::now().timestamp(),
            )
            .await?;

        Ok(AuthorizeAccountResult {
            authorized,
            active_account_id: account_id,
            response: response_json,
        })
    }

    pub async fn list_symbols(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        override_env: Option<Environment>,
        override_account_id: Option<i64>,
        override_token: Option<&str>,
    ) -> Result<SymbolListResult, GatewayError> {
        let env = self.resolve_env(user_id, override_env).await?;
        let account_id = self.resolve_account_id(user_id, override_account_id).await?;
        let access_token = self.resolve_access_token(user_id, override_token).await?;
        self.ensure_account_authorized(env, account_id, &access_token).await?;

        let count = self.symbols.count(user_id, env, account_id).await?;
        if count == 0 {
            self.refresh_symbols(user_id, env, account_id, &access_token).await?;
        }

        let items = self.symbols.search(user_id, env, account_id, query, limit).await?;
        Ok(SymbolListResult {
            active_account_id: account_id,
            count: items.len(),
            items,
        })
    }

    pub async fn get_quote(
        &self,
        user_id: &str,
        symbol: &str,
        wait_seconds: i64,
        override_env: Option<Environment>,
        override_account_id: Option<i64>,
        override_token: Option<&str>,
    ) -> Result<crate::types::Quote, GatewayError> {
        let env = self.resolve_env(user_id, override_env).await?;
        let account_id = self.resolve_account_id(user_id, override_account_id).await?;
        let access_token = self.resolve_access_token(user_id, override_token).await?;
        self.ensure_account_authorized(env, account_id, &access_token).await?;

        let symbol_id = self
            .ensure_symbol_id(user_id, env, account_id, &access_token, symbol)
            .await?;

        let body = json!({
            "ctidTraderAccountId": account_id,
            "symbolId": [symbol_id],
            "subscribeToSpotTimestamp": true,
        });
        self.connection
            .send(
                "PROTO_OA_SUBSCRIBE_SPOTS_REQ",
                &body,
                DEFAULT_TIMEOUT,
                SendMeta {
                    env: Some(env),
                    user_id: Some(user_id.to_string()),
                },
            )
            .await?;

        let key = crate::types::QuoteKey::new(user_id, env, account_id, symbol_id);
        if wait_seconds <= 0 {
            return self.quote_bus.get_last(&key).ok_or_else(|| {
                GatewayError::Validation("No quote received yet.".to_string())
            });
        }
        self.quote_bus
            .wait_for_next(&key, Duration::from_secs(wait_seconds as u64))
            .await
    }

    pub async fn get_account_info(
        &self,
        user_id: &str,
        override_env: Option<Environment>,
        override_account_id: Option<i64>,
        override_token: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let env = self.resolve_env(user_id, override_env).await?;
        let account_id = self.resolve_account_id(user_id, override_account_id).await?;
        let access_token = self.resolve_access_token(user_id, override_token).await?;
        self.ensure_account_authorized(env, account_id, &access_token).await?;

        let body = json!({ "ctidTraderAccountId": account_id });
        let response = self
            .connection
            .send(
                "PROTO_OA_TRADER_REQ",
                &body,
                DEFAULT_TIMEOUT,
                SendMeta {
                    env: Some(env),
                    user_id: None,
                },
            )
            .await?;
        Ok(response.decoded)
    }

    pub async fn place_trade(&self, req: &TradeRequest) -> Result<TradeResult, GatewayError> {
        let user_id = req
            .user_id
            .as_deref()
            .ok_or_else(|| GatewayError::AuthMissing("userId is required".to_string()))?;

        let override_env = req
            .env
            .as_deref()
            .map(|raw| {
                Environment::parse(raw)
                    .ok_or_else(|| GatewayError::Validation(format!("invalid env '{raw}'")))
            })
            .transpose()?;

        let env = self.resolve_env(user_id, override_env).await?;
        let account_id = self.resolve_account_id(user_id, req.account_id).await?;
        let access_token = self.resolve_access_token(user_id, None).await?;
        self.ensure_account_authorized(env, account_id, &access_token).await?;

        let symbol_id = self
            .ensure_symbol_id(user_id, env, account_id, &access_token, &req.symbol)
            .await?;

        let side = TradeSide::parse(&req.side)
            .ok_or_else(|| GatewayError::Validation(format!("side must be BUY or SELL, got '{}'", req.side)))?;
        let order_type = OrderType::parse(&req.order_type).ok_or_else(|| {
            GatewayError::Validation(format!(
                "orderType must be one of MARKET, LIMIT, STOP, STOP_LIMIT, got '{}'",
                req.order_type
            ))
        })?;
        let volume = scale_volume(req.volume_units)?;
        validate_price_fields(order_type, req.limit_price, req.stop_price, req.stop_loss, req.take_profit)?;

        let mut body = json!({
            "ctidTraderAccountId": account_id,
            "symbolId": symbol_id,
            "orderType": order_type.as_str(),
            "tradeSide": side.as_str(),
            "volume": volume,
        });
        let map = body.as_object_mut().expect("body is always a json object");
        if let Some(limit_price) = req.limit_price {
            map.insert("limitPrice".to_string(), json!(limit_price));
        }
        if let Some(stop_price) = req.stop_price {
            map.insert("stopPrice".to_string(), json!(stop_price));
        }
        if let Some(stop_loss) = req.stop_loss {
            map.insert("stopLoss".to_string(), json!(stop_loss));
        }
        if let Some(take_profit) = req.take_profit {
            map.insert("takeProfit".to_string(), json!(take_profit));
        }
        if let Some(comment) = &req.comment {
            map.insert("comment".to_string(), json!(comment));
        }
        if let Some(label) = &req.label {
            map.insert("label".to_string(), json!(label));
        }

        let response = self
            .connection
            .send(
                "PROTO_OA_NEW_ORDER_REQ",
                &body,
                Duration::from_secs(15),
                SendMeta {
                    env: Some(env),
                    user_id: None,
                },
            )
            .await?;

        Ok(TradeResult {
            request: body,
            response: response.decoded,
        })
    }

    pub async fn refresh_symbols(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        access_token: &str,
    ) -> Result<(), GatewayError> {
        self.ensure_account_authorized(env, account_id, access_token).await?;

        let body = json!({ "includeArchivedSymbols": false });
        let response = self
            .connection
            .send(
                "PROTO_OA_SYMBOLS_LIST_REQ",
                &body,
                DEFAULT_TIMEOUT,
                SendMeta {
                    env: Some(env),
                    user_id: None,
                },
            )
            .await?;

        let mut entries = HashMap::new();
        if let Some(symbols) = response.decoded.get("symbol").and_then(|v| v.as_array()) {
            for symbol in symbols {
                let (Some(name), Some(id)) = (
                    symbol.get("symbolName").and_then(|v| v.as_str()),
                    symbol.get("symbolId").and_then(|v| v.as_i64()),
                ) else {
                    continue;
                };
                entries.insert(name.to_string(), id);
            }
        }

        self.symbols.replace_all(user_id, env, account_id, &entries).await?;
        Ok(())
    }

    pub async fn ensure_symbol_id(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        access_token: &str,
        name: &str,
    ) -> Result<i64, GatewayError> {
        if let Some(id) = self.symbols.get_symbol_id(user_id, env, account_id, name).await? {
            return Ok(id);
        }
        self.refresh_symbols(user_id, env, account_id, access_token).await?;
        self.symbols
            .get_symbol_id(user_id, env, account_id, name)
            .await?
            .ok_or_else(|| GatewayError::SymbolNotFound(name.to_string()))
    }

    pub async fn load_session(&self, user_id: &str) -> Result<Option<SessionData>, GatewayError> {
        Ok(self.sessions.load_session(user_id).await?)
    }
}

/// cTrader's wording for "this account is already authorized on this
/// channel" varies in case but always contains this phrase.
fn is_already_authorized(description: &str) -> bool {
    description.to_ascii_lowercase().contains("already authorized")
}

/// `volumeUnits * 100`, rounded to the nearest integer lot unit. Must be
/// strictly positive.
fn scale_volume(volume_units: f64) -> Result<i64, GatewayError> {
    let scaled = (volume_units * 100.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        return Err(GatewayError::Validation(
            "volumeUnits must scale to a positive integer".to_string(),
        ));
    }
    Ok(scaled as i64)
}

/// Required/forbidden price fields per order type (SPEC_FULL.md §4.10).
fn validate_price_fields(
    order_type: OrderType,
    limit_price: Option<f64>,
    stop_price: Option<f64>,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Result<(), GatewayError> {
    match order_type {
        OrderType::Limit if limit_price.is_none() => Err(GatewayError::Validation(
            "limitPrice is required for LIMIT orders".to_string(),
        )),
        OrderType::Stop | OrderType::StopLimit if stop_price.is_none() => Err(GatewayError::Validation(
            "stopPrice is required for STOP and STOP_LIMIT orders".to_string(),
        )),
        OrderType::Market if stop_loss.is_some() || take_profit.is_some() => Err(GatewayError::Validation(
            "MARKET orders cannot set an absolute stopLoss/takeProfit; use a distance-based stop instead"
                .to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_authorized_matching_is_case_insensitive() {
        assert!(is_already_authorized("Account already authorized"));
        assert!(is_already_authorized("ALREADY AUTHORIZED on this channel"));
        assert!(!is_already_authorized("invalid access token"));
    }

    #[test]
    fn scale_volume_rounds_and_rejects_nonpositive() {
        assert_eq!(scale_volume(0.01).unwrap(), 1);
        assert_eq!(scale_volume(1.0).unwrap(), 100);
        assert!(scale_volume(0.0).is_err());
        assert!(scale_volume(-1.0).is_err());
    }

    #[test]
    fn limit_orders_require_a_limit_price() {
        assert!(validate_price_fields(OrderType::Limit, None, None, None, None).is_err());
        assert!(validate_price_fields(OrderType::Limit, Some(1.1), None, None, None).is_ok());
    }

    #[test]
    fn stop_and_stop_limit_orders_require_a_stop_price() {
        assert!(validate_price_fields(OrderType::Stop, None, None, None, None).is_err());
        assert!(validate_price_fields(OrderType::StopLimit, None, None, None, None).is_err());
        assert!(validate_price_fields(OrderType::Stop, None, Some(1.1), None, None).is_ok());
    }

    #[test]
    fn market_orders_forbid_absolute_stop_loss_and_take_profit() {
        assert!(validate_price_fields(OrderType::Market, None, None, Some(1.0), None).is_err());
        assert!(validate_price_fields(OrderType::Market, None, None, None, Some(1.0)).is_err());
        assert!(validate_price_fields(OrderType::Market, None, None, None, None).is_ok());
    }
}
