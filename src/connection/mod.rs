//! The upstream TLS connection: dial, frame I/O, request/response
//! correlation, readiness gating, reconnection, and heartbeating.
//!
//! This is the single most intricate component in the gateway. The
//! supervisor task in [`Connection::start`] owns the socket end to end; every
//! other task (HTTP handlers, the quote bus) only ever talks to it through
//! [`Connection::send`] and [`Connection::ensure_ready`].

mod backoff;
mod io;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::protobuf::ProtoRegistry;
use crate::quotebus::QuoteBus;
use crate::types::Environment;

use backoff::Backoff;

const APP_AUTH_TIMEOUT: Duration = Duration::from_secs(12);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(9);
pub const APPLICATION_AUTH_REQ_KEY: &str = "PROTO_OA_APPLICATION_AUTH_REQ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
}

#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub payload_name: String,
    pub type_name: String,
    pub decoded: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SendMeta {
    pub env: Option<Environment>,
    /// Needed only for `PROTO_OA_SUBSCRIBE_SPOTS_REQ`, to index the spot
    /// events that come back by the user who asked for them.
    pub user_id: Option<String>,
}

type PendingTx = oneshot::Sender<Result<InboundResponse, GatewayError>>;

/// Client-message-id allocator: monotonic, wraps at 2e9, never yields 0.
struct ClientMsgIdAllocator {
    next: u64,
}

impl ClientMsgIdAllocator {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next = if self.next + 1 >= 2_000_000_000 {
            1
        } else {
            self.next + 1
        };
        id
    }
}

struct State {
    status: ConnStatus,
    current_env: Environment,
    shutting_down: bool,
    connect_in_flight: bool,
    ids: ClientMsgIdAllocator,
    pending: HashMap<u64, PendingTx>,
    /// Insertion order of `pending`, oldest first. Consulted only as a
    /// best-effort fallback when an inbound frame carries no resolvable
    /// `clientMsgId` (see `Connection::take_oldest_pending`).
    pending_order: VecDeque<u64>,
    /// (symbol_id, ctid_trader_account_id) -> (userId, env), populated whenever
    /// a SUBSCRIBE_SPOTS request is sent, consulted when a spot event arrives.
    subscriptions: HashMap<(i64, i64), (String, Environment)>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

pub struct Connection {
    state: Mutex<State>,
    ready: AtomicBool,
    generation: AtomicU64,
    ready_notify: Notify,
    reconnect_kick: Notify,
    config: Arc<Config>,
    registry: Arc<ProtoRegistry>,
    quote_bus: Arc<QuoteBus>,
}

impl Connection {
    pub fn new(config: Arc<Config>, registry: Arc<ProtoRegistry>, quote_bus: Arc<QuoteBus>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                status: ConnStatus::Disconnected,
                current_env: config.ctrader_env,
                shutting_down: false,
                connect_in_flight: false,
                ids: ClientMsgIdAllocator::new(),
                pending: HashMap::new(),
                pending_order: VecDeque::new(),
                subscriptions: HashMap::new(),
                outbound: None,
            }),
            ready: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            ready_notify: Notify::new(),
            reconnect_kick: Notify::new(),
            config,
            registry,
            quote_bus,
        })
    }

    /// Begin connecting in the background. Does not block on readiness.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.supervise().await });
    }

    /// Stop the connection: shut down the heartbeat and reconnect loop, close
    /// the socket, and reject every pending request and the ready gate.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("connection mutex poisoned");
        state.shutting_down = true;
        state.status = ConnStatus::Disconnected;
        state.outbound = None;
        self.reject_all_pending(&mut state, || GatewayError::ShuttingDown);
        drop(state);
        self.clear_ready();
        self.ready_notify.notify_waiters();
        self.reconnect_kick.notify_waiters();
    }

    fn reject_all_pending(&self, state: &mut State, make_err: impl Fn() -> GatewayError) {
        state.pending_order.clear();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(make_err()));
        }
    }

    /// Remove and return the pending request for `id`, if any, keeping
    /// `pending_order` consistent.
    fn remove_pending(&self, id: u64) -> Option<PendingTx> {
        let mut state = self.state.lock().expect("connection mutex poisoned");
        let tx = state.pending.remove(&id);
        if tx.is_some() {
            state.pending_order.retain(|&queued| queued != id);
        }
        tx
    }

    /// Pop the oldest still-pending request, skipping ids that were already
    /// resolved (by a timeout or a correlated match) but not yet pruned from
    /// the order queue. Used only as a fallback when an inbound frame has no
    /// resolvable `clientMsgId` — see `io::dispatch_inbound`.
    fn take_oldest_pending(&self) -> Option<(u64, PendingTx)> {
        let mut state = self.state.lock().expect("connection mutex poisoned");
        while let Some(id) = state.pending_order.pop_front() {
            if let Some(tx) = state.pending.remove(&id) {
                return Some((id, tx));
            }
        }
        None
    }

    fn set_status(&self, status: ConnStatus) {
        self.state.lock().expect("connection mutex poisoned").status = status;
    }

    fn current_env(&self) -> Environment {
        self.state.lock().expect("connection mutex poisoned").current_env
    }

    fn is_shutting_down(&self) -> bool {
        self.state.lock().expect("connection mutex poisoned").shutting_down
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    fn clear_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Await both TLS-connected and app-authorized on `target_env`. If the
    /// channel is currently on a different environment this forces a
    /// reconnect first, which rejects every in-flight request on the old env.
    pub async fn ensure_ready(&self, target_env: Environment) -> Result<(), GatewayError> {
        if self.current_env() != target_env {
            self.force_reconnect(target_env);
        }

        loop {
            // Register interest before checking the condition: if `mark_ready`
            // runs `notify_waiters` between the check and the await below, a
            // `Notified` created only after the check would miss it and park
            // forever. `enable()` makes this instance catch any notification
            // fired from this point on, even before it is first polled.
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutting_down() {
                return Err(GatewayError::ShuttingDown);
            }
            if self.ready.load(Ordering::SeqCst) && self.current_env() == target_env {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Disrupt the current channel and switch to `target_env`. Every pending
    /// request on the old channel is rejected with a disconnect error.
    pub fn force_reconnect(&self, target_env: Environment) {
        let mut state = self.state.lock().expect("connection mutex poisoned");
        if state.current_env == target_env && state.status == ConnStatus::Ready {
            return;
        }
        state.current_env = target_env;
        state.status = ConnStatus::Disconnected;
        state.outbound = None;
        self.reject_all_pending(&mut state, || GatewayError::Disconnected);
        drop(state);
        self.clear_ready();
        self.reconnect_kick.notify_waiters();
    }

    /// Encode, frame, and send `obj` as payload type `payload_key`, awaiting
    /// the correlated response (or a timeout, or a disconnect rejection).
    pub async fn send(
        self: &Arc<Self>,
        payload_key: &str,
        obj: &serde_json::Value,
        timeout: Duration,
        meta: SendMeta,
    ) -> Result<InboundResponse, GatewayError> {
        if payload_key != APPLICATION_AUTH_REQ_KEY {
            let target_env = meta.env.unwrap_or_else(|| self.current_env());
            self.ensure_ready(target_env).await?;
        } else if !matches!(
            self.state.lock().expect("connection mutex poisoned").status,
            ConnStatus::Connected | ConnStatus::Ready
        ) {
            return Err(GatewayError::Disconnected);
        }

        let payload_type_id = self.registry.payload_type_id(payload_key)?;
        let type_name = ProtoRegistry::message_type_from_payload_name(payload_key);

        let (client_msg_id, outbound_tx) = {
            let mut state = self.state.lock().expect("connection mutex poisoned");
            let id = state.ids.allocate();

            if payload_key == "PROTO_OA_SUBSCRIBE_SPOTS_REQ" {
                let record_env = meta.env.unwrap_or(state.current_env);
                let record_user = meta.user_id.clone().unwrap_or_default();
                self.record_subscription(&mut state, obj, record_env, record_user);
            }

            let outbound_tx = state
                .outbound
                .clone()
                .ok_or(GatewayError::Disconnected)?;

            (id, outbound_tx)
        };

        let mut payload_obj = obj.clone();
        if self.registry.has_field(&type_name, "clientMsgId") {
            if let Some(map) = payload_obj.as_object_mut() {
                map.insert(
                    "clientMsgId".to_string(),
                    serde_json::Value::String(client_msg_id.to_string()),
                );
            }
        }

        let payload_bytes = self.registry.encode_message(&type_name, &payload_obj)?;
        let framed = self.registry.encode_proto_message(
            payload_type_id,
            payload_bytes,
            Some(client_msg_id.to_string()),
        )?;
        let wire = crate::frame::frame(&framed).to_vec();

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().expect("connection mutex poisoned");
            state.pending.insert(client_msg_id, tx);
            state.pending_order.push_back(client_msg_id);
        }

        if outbound_tx.send(wire).is_err() {
            if let Some(tx) = self.remove_pending(client_msg_id) {
                let _ = tx.send(Err(GatewayError::Disconnected));
            }
        } else {
            self.spawn_timeout_guard(client_msg_id, payload_key.to_string(), timeout);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Disconnected),
        }
    }

    /// Encode, frame, and write `obj` as payload type `payload_key` without
    /// registering a pending request — no correlation, no timeout, no
    /// response awaited. Used only for the heartbeat, which is genuinely
    /// one-way on the wire (see SPEC_FULL.md §4.6).
    pub async fn send_one_way(&self, payload_key: &str, obj: &serde_json::Value) -> Result<(), GatewayError> {
        if !matches!(
            self.state.lock().expect("connection mutex poisoned").status,
            ConnStatus::Ready
        ) {
            return Err(GatewayError::Disconnected);
        }

        let payload_type_id = self.registry.payload_type_id(payload_key)?;
        let type_name = ProtoRegistry::message_type_from_payload_name(payload_key);

        let outbound_tx = self
            .state
            .lock()
            .expect("connection mutex poisoned")
            .outbound
            .clone()
            .ok_or(GatewayError::Disconnected)?;

        let payload_bytes = self.registry.encode_message(&type_name, obj)?;
        let framed = self.registry.encode_proto_message(payload_type_id, payload_bytes, None)?;
        let wire = crate::frame::frame(&framed).to_vec();

        outbound_tx.send(wire).map_err(|_| GatewayError::Disconnected)
    }

    fn spawn_timeout_guard(self: &Arc<Self>, client_msg_id: u64, payload_key: String, timeout: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = this.remove_pending(client_msg_id) {
                let _ = tx.send(Err(GatewayError::Timeout {
                    payload: payload_key,
                    client_msg_id,
                }));
            }
        });
    }

    fn record_subscription(
        &self,
        state: &mut State,
        payload_obj: &serde_json::Value,
        env: Environment,
        user_id: String,
    ) {
        let Some(account_id) = payload_obj.get("ctidTraderAccountId").and_then(|v| v.as_i64()) else {
            return;
        };
        let Some(symbol_ids) = payload_obj.get("symbolId").and_then(|v| v.as_array()) else {
            return;
        };
        for id in symbol_ids {
            if let Some(symbol_id) = id.as_i64() {
                state
                    .subscriptions
                    .insert((symbol_id, account_id), (user_id.clone(), env));
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = Backoff::new();
        loop {
            if self.is_shutting_down() {
                break;
            }
            self.set_status(ConnStatus::Connecting);
            {
                let mut state = self.state.lock().expect("connection mutex poisoned");
                state.connect_in_flight = true;
            }

            let outcome = io::connect_and_run(self.clone()).await;

            {
                let mut state = self.state.lock().expect("connection mutex poisoned");
                state.connect_in_flight = false;
                state.status = ConnStatus::Disconnected;
                state.outbound = None;
                self.reject_all_pending(&mut state, || GatewayError::Disconnected);
            }
            self.clear_ready();

            match outcome {
                Ok(()) => {
                    info!("upstream connection closed, reconnecting");
                    backoff.reset();
                }
                Err(e) => {
                    warn!(error = %e, "upstream connect attempt failed");
                }
            }

            if self.is_shutting_down() {
                break;
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect_kick.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_msg_id_allocator_wraps_and_skips_zero() {
        let mut alloc = ClientMsgIdAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);

        let mut alloc = ClientMsgIdAllocator { next: 1_999_999_999 };
        assert_eq!(alloc.allocate(), 1_999_999_999);
        assert_eq!(alloc.allocate(), 1);
    }

    #[tokio::test]
    async fn ensure_ready_rejects_immediately_once_shutting_down() {
        let config = Arc::new(test_config());
        let registry = Arc::new(test_registry());
        let bus = Arc::new(QuoteBus::new());
        let conn = Connection::new(config, registry, bus);
        conn.stop();
        let result = conn.ensure_ready(Environment::Demo).await;
        assert!(matches!(result, Err(GatewayError::ShuttingDown)));
    }

    #[tokio::test]
    async fn send_without_a_live_socket_fails_disconnected() {
        let config = Arc::new(test_config());
        let registry = Arc::new(test_registry());
        let bus = Arc::new(QuoteBus::new());
        let conn = Connection::new(config, registry, bus);
        // Force status to Connected without a real socket so ensure_ready's
        // env check passes trivially (env already matches) but send still
        // has no outbound channel to write to.
        conn.mark_ready();
        let result = conn
            .send(
                "PROTO_OA_TRADER_REQ",
                &serde_json::json!({"ctidTraderAccountId": 1}),
                Duration::from_millis(50),
                SendMeta::default(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_one_way_requires_ready_status_and_never_registers_a_pending_request() {
        let config = Arc::new(test_config());
        let registry = Arc::new(test_registry());
        let bus = Arc::new(QuoteBus::new());
        let conn = Connection::new(config, registry, bus);

        let result = conn
            .send_one_way("PROTO_HEARTBEAT_EVENT", &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(GatewayError::Disconnected)));
        assert!(conn.state.lock().unwrap().pending.is_empty());
    }

    fn test_config() -> Config {
        Config {
            port: 8088,
            ctrader_client_id: "id".to_string(),
            ctrader_client_secret: "secret".to_string(),
            ctrader_redirect_uri: "https://example.com".to_string(),
            ctrader_env: Environment::Demo,
            ctrader_demo_host: "demo.ctraderapi.com".to_string(),
            ctrader_live_host: "live.ctraderapi.com".to_string(),
            ctrader_port: 5035,
            ctrader_proto_dir: std::env::var("CARGO_MANIFEST_DIR")
                .map(|d| format!("{d}/proto"))
                .unwrap_or_else(|_| "proto".to_string()),
            redis_url: "redis://localhost".to_string(),
            token_encryption_key: "ab".repeat(32),
            internal_api_key: None,
            log_level: "info".to_string(),
            symbol_cache_ttl_secs: 86_400,
        }
    }

    #[tokio::test]
    async fn take_oldest_pending_returns_in_insertion_order_and_skips_already_resolved() {
        let config = Arc::new(test_config());
        let registry = Arc::new(test_registry());
        let bus = Arc::new(QuoteBus::new());
        let conn = Connection::new(config, registry, bus);

        let (tx1, _rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        {
            let mut state = conn.state.lock().unwrap();
            state.pending.insert(1, tx1);
            state.pending_order.push_back(1);
            state.pending.insert(2, tx2);
            state.pending_order.push_back(2);
            state.pending.insert(3, tx3);
            state.pending_order.push_back(3);
        }

        // id 1 already resolved elsewhere (e.g. by a timeout guard) without
        // going through remove_pending, so it's still in the order queue.
        conn.state.lock().unwrap().pending.remove(&1);

        let (id, tx) = conn.take_oldest_pending().expect("id 2 should be returned");
        assert_eq!(id, 2);
        let _ = tx.send(Err(GatewayError::Disconnected));
        assert!(rx2.await.is_ok());

        let (id, tx) = conn.take_oldest_pending().expect("id 3 should be returned");
        assert_eq!(id, 3);
        let _ = tx.send(Err(GatewayError::Disconnected));
        assert!(rx3.await.is_ok());

        assert!(conn.take_oldest_pending().is_none());
    }

    fn test_registry() -> ProtoRegistry {
        let dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("proto");
        ProtoRegistry::load(&dir).expect("proto dir should compile")
    }
}
