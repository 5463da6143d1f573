//! Route handlers. Each one resolves its request context, calls into the
//! gateway, and shapes the JSON response — no business logic lives here.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use crate::http::error::HttpError;
use crate::http::extract::{clamp_limit, RequestContext};
use crate::http::AppState;
use crate::types::TradeRequest;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct OAuthExchangeBody {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub code: String,
}

pub async fn oauth_exchange(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<OAuthExchangeBody>,
) -> Result<Response, HttpError> {
    let user_id = body
        .user_id
        .or_else(|| ctx.user_id.clone())
        .ok_or_else(|| ctx.err(HttpError::bad_request("userId is required")))?;
    if body.code.trim().is_empty() {
        return Err(ctx.err(HttpError::bad_request("code is required")));
    }

    let token = state
        .oauth
        .exchange_code(&body.code)
        .await
        .map_err(|e| ctx.err(e))?;

    persist_and_render(&state, &ctx, &user_id, token).await
}

#[derive(Debug, Deserialize)]
pub struct OAuthRefreshBody {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

pub async fn oauth_refresh(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<OAuthRefreshBody>,
) -> Result<Response, HttpError> {
    let user_id = body
        .user_id
        .or_else(|| ctx.user_id.clone())
        .ok_or_else(|| ctx.err(HttpError::bad_request("userId is required")))?;

    let refresh_token = state
        .sessions
        .refresh_token(&user_id)
        .await
        .map_err(|e| ctx.err(e))?
        .ok_or_else(|| {
            ctx.err(HttpError::bad_request(
                "no refresh token on file for this user; exchange an OAuth code first",
            ))
        })?;

    let token = state
        .oauth
        .refresh(&refresh_token)
        .await
        .map_err(|e| ctx.err(e))?;

    persist_and_render(&state, &ctx, &user_id, token).await
}

async fn persist_and_render(
    state: &AppState,
    ctx: &RequestContext,
    user_id: &str,
    token: crate::oauth::TokenResponse,
) -> Result<Response, HttpError> {
    let refresh_token = match &token.refresh_token {
        Some(r) => r.clone(),
        None => state
            .sessions
            .refresh_token(user_id)
            .await
            .map_err(|e| ctx.err(e))?
            .unwrap_or_default(),
    };
    let expires_in = if token.expires_in > 0 { token.expires_in } else { 3600 };

    state
        .sessions
        .save_tokens(user_id, &token.access_token, &refresh_token, expires_in, chrono::Utc::now().timestamp())
        .await
        .map_err(|e| ctx.err(e))?;

    Ok(Json(json!({
        "accessToken": token.access_token,
        "refreshToken": refresh_token,
        "expiresIn": expires_in,
    }))
    .into_response())
}

pub async fn list_accounts(State(state): State<AppState>, ctx: RequestContext) -> Result<Response, HttpError> {
    let user_id = ctx.require_user_id().map_err(|e| ctx.err(e))?;
    let result = state
        .gateway
        .list_accounts(user_id, ctx.token_override.as_deref())
        .await
        .map_err(|e| ctx.err(e))?;
    Ok(Json(json!({ "count": result.count, "items": result.items })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AuthAccountBody {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "accountId")]
    pub account_id: i64,
}

pub async fn auth_account(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<AuthAccountBody>,
) -> Result<Response, HttpError> {
    let user_id = body
        .user_id
        .or_else(|| ctx.user_id.clone())
        .ok_or_else(|| ctx.err(HttpError::bad_request("userId is required")))?;

    let result = state
        .gateway
        .authorize_account(&user_id, body.account_id, ctx.env, ctx.token_override.as_deref())
        .await
        .map_err(|e| ctx.err(e))?;

    Ok(Json(json!({
        "authorized": result.authorized,
        "activeAccountId": result.active_account_id,
        "response": result.response,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SymbolsQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
}

pub async fn list_symbols(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<SymbolsQuery>,
) -> Result<Response, HttpError> {
    let user_id = ctx.require_user_id().map_err(|e| ctx.err(e))?;
    let limit = clamp_limit(query.limit, 200);

    let result = state
        .gateway
        .list_symbols(user_id, &query.q, limit, ctx.env, None, ctx.token_override.as_deref())
        .await
        .map_err(|e| ctx.err(e))?;

    let items: Vec<_> = result
        .items
        .iter()
        .map(|m| json!({ "symbol": m.symbol, "symbolId": m.symbol_id }))
        .collect();

    Ok(Json(json!({
        "activeAccountId": result.active_account_id,
        "count": result.count,
        "items": items,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub symbol: Option<String>,
    #[serde(default)]
    pub wait: i64,
}

pub async fn get_quote(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<QuoteQuery>,
) -> Result<Response, HttpError> {
    let user_id = ctx.require_user_id().map_err(|e| ctx.err(e))?;
    let symbol = query
        .symbol
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ctx.err(HttpError::bad_request("symbol query parameter is required")))?;

    let quote = state
        .gateway
        .get_quote(user_id, &symbol, query.wait, ctx.env, None, ctx.token_override.as_deref())
        .await
        .map_err(|e| ctx.err(e))?;

    Ok(Json(quote).into_response())
}

pub async fn get_account(State(state): State<AppState>, ctx: RequestContext) -> Result<Response, HttpError> {
    let user_id = ctx.require_user_id().map_err(|e| ctx.err(e))?;
    let info = state
        .gateway
        .get_account_info(user_id, ctx.env, None, ctx.token_override.as_deref())
        .await
        .map_err(|e| ctx.err(e))?;
    Ok(Json(info).into_response())
}

pub async fn place_trade(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(mut body): Json<TradeRequest>,
) -> Result<Response, HttpError> {
    if body.user_id.is_none() {
        body.user_id = ctx.user_id.clone();
    }
    if body.env.is_none() {
        body.env = ctx.env.map(|e| e.as_str().to_string());
    }

    let result = state.gateway.place_trade(&body).await.map_err(|e| ctx.err(e))?;

    Ok(Json(json!({
        "request": result.request,
        "response": result.response,
    }))
    .into_response())
}
