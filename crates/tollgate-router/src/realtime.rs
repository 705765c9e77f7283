//! `/v1/realtime` WebSocket relay: one upstream socket per accepted client
//! upgrade, frames pumped both ways, usage scanned from `response.done`
//! events and settled when either side closes.

use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{info, warn};

use tollgate_adapter::{ApiType, usage_from_json};
use tollgate_common::RelayError;
use tollgate_core::engine::RealtimeSession;
use tollgate_protocol::Usage;

use crate::{RealtimeQuery, RouterState, auth_header, error_response, new_trace_id};

pub(crate) async fn realtime_upgrade(
    State(state): State<RouterState>,
    Query(query): Query<RealtimeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let trace_id = new_trace_id();
    let auth = auth_header(&headers);
    // Validation, selection, and the reservation all happen before the
    // upgrade is accepted, so auth failures return a proper HTTP envelope.
    match state
        .engine
        .begin_realtime(auth.as_deref(), query.model.as_deref())
        .await
    {
        Ok(session) => {
            let engine = state.engine.clone();
            info!(
                event = "realtime_accepted",
                trace_id = %trace_id,
                channel_id = session.descriptor.channel_id,
                model = %session.descriptor.actual_model
            );
            ws.on_upgrade(move |socket| bridge(engine, session, socket, trace_id))
        }
        Err(err) => error_response(&trace_id, err),
    }
}

async fn bridge(
    engine: tollgate_core::engine::RelayEngine,
    session: RealtimeSession,
    client: WebSocket,
    trace_id: String,
) {
    let upstream = match connect_upstream(&session).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(event = "realtime_connect_failed", trace_id = %trace_id, error = %err);
            // Zero-charge path: nothing billable happened.
            engine.finish_realtime(session, None);
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();
    let mut usage: Option<Usage> = None;

    loop {
        tokio::select! {
            inbound = client_rx.next() => {
                match inbound {
                    Some(Ok(ClientMessage::Text(text))) => {
                        if upstream_tx
                            .send(UpstreamMessage::text(text.as_str()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(ClientMessage::Binary(data))) => {
                        if upstream_tx
                            .send(UpstreamMessage::binary(data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outbound = upstream_rx.next() => {
                match outbound {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        scan_usage(text.as_str(), &mut usage);
                        if client_tx
                            .send(ClientMessage::Text(text.as_str().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Binary(data))) => {
                        if client_tx
                            .send(ClientMessage::Binary(data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    info!(
        event = "realtime_closed",
        trace_id = %trace_id,
        prompt_tokens = usage.map(|u| u.prompt_tokens).unwrap_or(0),
        completion_tokens = usage.map(|u| u.completion_tokens).unwrap_or(0)
    );
    engine.finish_realtime(session, usage);
}

async fn connect_upstream(
    session: &RealtimeSession,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    RelayError,
> {
    let mut request = session
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| RelayError::Upstream {
            status: 502,
            message: err.to_string(),
        })?;
    let headers = request.headers_mut();
    let auth_value = match session.descriptor.api_type {
        ApiType::Claude => session.descriptor.api_key.clone(),
        _ => format!("Bearer {}", session.descriptor.api_key),
    };
    let auth_name = match session.descriptor.api_type {
        ApiType::Claude => "x-api-key",
        _ => "authorization",
    };
    headers.insert(
        auth_name,
        auth_value.parse().map_err(|_| RelayError::Upstream {
            status: 502,
            message: "invalid upstream credential header".to_string(),
        })?,
    );
    if session.descriptor.api_type == ApiType::OpenAi
        && let Ok(value) = "realtime=v1".parse()
    {
        headers.insert("openai-beta", value);
    }
    let (socket, _response) = connect_async(request).await.map_err(|err| {
        RelayError::Upstream {
            status: 502,
            message: err.to_string(),
        }
    })?;
    Ok(socket)
}

/// Realtime usage arrives on `response.done` server events; later events
/// supersede earlier totals.
fn scan_usage(text: &str, usage: &mut Option<Usage>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    if value.get("type").and_then(|t| t.as_str()) != Some("response.done") {
        return;
    }
    if let Some(response) = value.get("response")
        && let Some(found) = usage_from_json(response)
    {
        let merged = match usage {
            Some(existing) => Usage::new(
                existing.prompt_tokens + found.prompt_tokens,
                existing.completion_tokens + found.completion_tokens,
            ),
            None => found,
        };
        *usage = Some(merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates_across_done_events() {
        let mut usage = None;
        scan_usage(
            r#"{"type":"response.done","response":{"usage":{"input_tokens":10,"output_tokens":5}}}"#,
            &mut usage,
        );
        scan_usage(r#"{"type":"response.created"}"#, &mut usage);
        scan_usage(
            r#"{"type":"response.done","response":{"usage":{"input_tokens":7,"output_tokens":3}}}"#,
            &mut usage,
        );
        let total = usage.unwrap();
        assert_eq!(total.prompt_tokens, 17);
        assert_eq!(total.completion_tokens, 8);
    }
}
