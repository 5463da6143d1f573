//! TLS dial, the writer/reader tasks that own each half of the socket, the
//! AppAuth handshake, and the heartbeat loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::frame;
use crate::protobuf::ProtoRegistry;

use super::{ConnStatus, Connection, InboundResponse, SendMeta, APPLICATION_AUTH_REQ_KEY, APP_AUTH_TIMEOUT, HEARTBEAT_INTERVAL};

/// Dial the upstream host, run the AppAuth handshake, then pump the socket
/// until it drops. Returns `Ok(())` on a clean disconnect, `Err` if dialing
/// or AppAuth itself failed.
pub(super) async fn connect_and_run(conn: Arc<Connection>) -> Result<(), GatewayError> {
    let env = conn.current_env();
    let host = conn.config.upstream_host(env);
    let port = conn.config.ctrader_port;

    debug!(host, port, "dialing upstream");
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| GatewayError::Upstream(format!("tcp connect to {host}:{port} failed: {e}")))?;
    tcp.set_nodelay(true).ok();

    let tls_connector = build_tls_connector()?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| GatewayError::Upstream(format!("invalid TLS server name '{host}': {e}")))?;
    let tls_stream = tls_connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| GatewayError::Upstream(format!("TLS handshake failed: {e}")))?;

    let (mut read_half, mut write_half) = tokio::io::split(tls_stream);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut state = conn.state.lock().expect("connection mutex poisoned");
        state.status = ConnStatus::Connected;
        state.outbound = Some(outbound_tx);
    }

    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!(error = %e, "upstream write failed, closing socket");
                break;
            }
        }
        let _ = writer_conn; // keep the connection alive for the duration of the writer task
        let _ = write_half.shutdown().await;
    });

    // The reader has to be pumping frames *before* AppAuth is awaited: the
    // auth response arrives as just another inbound frame, and nothing else
    // reads off the socket to dispatch it to the pending request.
    let reader_conn = conn.clone();
    let reader = tokio::spawn(async move { run_reader(&reader_conn, &mut read_half).await });

    if let Err(e) = run_app_auth(&conn).await {
        writer.abort();
        reader.abort();
        return Err(e);
    }

    conn.set_status(ConnStatus::Ready);
    conn.mark_ready();
    info_ready(&conn);

    let heartbeat_conn = conn.clone();
    let heartbeat = tokio::spawn(async move { run_heartbeat(heartbeat_conn).await });

    let result = match reader.await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::Upstream(format!("reader task panicked: {e}"))),
    };

    heartbeat.abort();
    writer.abort();
    result
}

fn info_ready(conn: &Arc<Connection>) {
    tracing::info!(env = ?conn.current_env(), "upstream channel ready");
}

fn build_tls_connector() -> Result<TlsConnector, GatewayError> {
    let native_certs = rustls_native_certs::load_native_certs();
    if !native_certs.errors.is_empty() {
        warn!(?native_certs.errors, "some native root certificates failed to load");
    }

    let mut root_store = rustls::RootCertStore::empty();
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| GatewayError::Upstream(format!("invalid root certificate: {e}")))?;
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

async fn run_app_auth(conn: &Arc<Connection>) -> Result<(), GatewayError> {
    let body = serde_json::json!({
        "clientId": conn.config.ctrader_client_id,
        "clientSecret": conn.config.ctrader_client_secret,
    });

    let response = conn
        .send(APPLICATION_AUTH_REQ_KEY, &body, APP_AUTH_TIMEOUT, SendMeta::default())
        .await?;

    debug!(payload = response.payload_name, "application auth accepted");
    Ok(())
}

async fn run_heartbeat(conn: Arc<Connection>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // first tick fires immediately; we just connected
    loop {
        interval.tick().await;
        if conn.is_shutting_down() || !conn.ready.load(Ordering::SeqCst) {
            return;
        }
        let result = conn.send_one_way("PROTO_HEARTBEAT_EVENT", &serde_json::json!({})).await;
        if let Err(e) = result {
            warn!(error = %e, "heartbeat failed");
        }
    }
}

async fn run_reader<R: tokio::io::AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    read_half: &mut R,
) -> Result<(), GatewayError> {
    let mut buf = bytes::BytesMut::new();
    let mut scratch = [0u8; 8192];

    loop {
        let n = match read_half.read(&mut scratch).await {
            Ok(0) => return Ok(()), // clean EOF
            Ok(n) => n,
            Err(e) => return Err(GatewayError::Upstream(format!("upstream read failed: {e}"))),
        };
        buf.extend_from_slice(&scratch[..n]);

        let (frames, tail) = frame::deframe(&buf);
        buf = tail;
        for payload in frames {
            dispatch_inbound(conn, &payload).await;
        }
    }
}

async fn dispatch_inbound(conn: &Arc<Connection>, frame_bytes: &[u8]) {
    let decoded = match conn.registry.decode_proto_message(frame_bytes) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to decode inbound frame, dropping");
            return;
        }
    };

    let payload_name = match conn.registry.payload_type_name(decoded.payload_type as i32) {
        Ok(name) => name,
        Err(e) => {
            warn!(error = %e, payload_type = decoded.payload_type, "unknown inbound payload type, dropping");
            return;
        }
    };
    let type_name = ProtoRegistry::message_type_from_payload_name(&payload_name);

    let json = match conn.registry.decode_message(&type_name, &decoded.payload) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, payload_name, "failed to decode payload body, dropping");
            return;
        }
    };

    if payload_name == "PROTO_OA_SPOT_EVENT" {
        route_spot_event(conn, &json);
        return;
    }

    let client_msg_id = decoded
        .client_msg_id
        .as_deref()
        .or_else(|| json.get("clientMsgId").and_then(|v| v.as_str()))
        .and_then(|s| s.parse::<u64>().ok());

    let resolved = match client_msg_id.and_then(|id| conn.remove_pending(id)) {
        Some(tx) => Some(tx),
        // Upstream occasionally replies to APP auth / account auth / a bare
        // error without echoing the request's clientMsgId. Best-effort: hand
        // the reply to whichever request has been waiting longest. Documented
        // in DESIGN.md as an accepted tradeoff rather than a guarantee.
        None if is_fallback_correlated(&payload_name) => conn.take_oldest_pending().map(|(_, tx)| tx),
        None => None,
    };

    let Some(tx) = resolved else {
        debug!(client_msg_id, payload_name, "inbound frame matched no pending request, routing as event only");
        return;
    };

    if payload_name == "PROTO_OA_ERROR_RES" {
        let description = json
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("upstream error")
            .to_string();
        let _ = tx.send(Err(GatewayError::Upstream(description)));
    } else {
        let _ = tx.send(Ok(InboundResponse {
            payload_name,
            type_name,
            decoded: json,
        }));
    }
}

/// Payload types upstream is known to sometimes reply with no resolvable
/// `clientMsgId`, eligible for the oldest-pending fallback above.
fn is_fallback_correlated(payload_name: &str) -> bool {
    matches!(
        payload_name,
        "PROTO_OA_APPLICATION_AUTH_RES" | "PROTO_OA_ERROR_RES" | "PROTO_OA_ACCOUNT_AUTH_RES"
    )
}

fn route_spot_event(conn: &Arc<Connection>, json: &serde_json::Value) {
    let Some(account_id) = json.get("ctidTraderAccountId").and_then(|v| v.as_i64()) else {
        return;
    };
    let Some(symbol_id) = json.get("symbolId").and_then(|v| v.as_i64()) else {
        return;
    };

    let subscription = conn
        .state
        .lock()
        .expect("connection mutex poisoned")
        .subscriptions
        .get(&(symbol_id, account_id))
        .cloned();

    let Some((user_id, env)) = subscription else {
        debug!(account_id, symbol_id, "spot event for an unknown subscription, dropping");
        return;
    };

    let bid = json.get("bid").and_then(|v| v.as_f64());
    let ask = json.get("ask").and_then(|v| v.as_f64());

    conn.quote_bus.upsert(crate::types::Quote {
        user_id,
        env,
        account_id,
        symbol_id,
        bid,
        ask,
        timestamp: Some(chrono::Utc::now().timestamp_millis()),
    });
}
