use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use tollgate_adapter::{
    Adapter, ExecuteError, RelayDescriptor, RelayPayload, StreamScan, TransportErrorKind,
    UpstreamBody, adapter_for, header_get, is_account_failure, upstream_error_message,
};
use tollgate_common::{RelayError, RelayResult};
use tollgate_protocol::sse::SseParser;
use tollgate_protocol::{RelayMode, Usage};

use crate::billing::{PricePlan, Reservation};
use crate::descriptor::build_descriptor;
use crate::distributor::select_channel;
use crate::estimate::{count_text_tokens, estimate_prompt_tokens, max_completion_tokens};
use crate::events::OpsEvent;
use crate::settlement::SettlementJob;
use crate::state::AppState;
use crate::token::TokenGrant;

const RATE_LIMIT_COOLDOWN_SECS: u64 = 30;
const LOG_CONTENT_LIMIT: usize = 4096;
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// What the router writes back to the client.
pub enum RelayResponse {
    Buffered {
        status: u16,
        content_type: String,
        body: Bytes,
    },
    Stream {
        status: u16,
        content_type: String,
        body: mpsc::Receiver<Bytes>,
    },
}

/// The relay driver: validate → select → reserve → dispatch → settle/refund.
#[derive(Clone)]
pub struct RelayEngine {
    state: Arc<AppState>,
}

impl RelayEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn relay(
        &self,
        auth_header: Option<&str>,
        mode: RelayMode,
        payload: RelayPayload,
        trace_id: &str,
    ) -> RelayResult<RelayResponse> {
        let state = &self.state;
        let requested_model = Some(payload.model()).filter(|m| !m.is_empty());
        let grant = state
            .validator
            .validate(auth_header, mode, requested_model)
            .await?;
        let is_stream = payload.is_stream();

        let channel = select_channel(
            &state.channels,
            &grant.group,
            &grant.model,
            grant.channel_pin,
        )?;
        let descriptor = build_descriptor(&channel, &grant, mode, is_stream)?;

        let options = state.options.load();
        let ratios = state.ratios.load();
        let plan = PricePlan::select(
            &ratios,
            &options,
            &grant.model,
            &grant.group,
            grant.billing_by_request,
        );

        let (prompt_estimate, reserve_amount) = match estimate_prompt_tokens(&payload) {
            Ok(prompt) => (
                prompt,
                plan.reserve_quota(prompt, max_completion_tokens(&payload)),
            ),
            Err(err) => {
                // Estimation failure never blocks the request; fall back to
                // the configured floor.
                warn!(event = "estimate_failed", trace_id = %trace_id, error = %err);
                (0, options.pre_consume_floor)
            }
        };

        let reservation = state.billing.reserve(&grant, reserve_amount).await?;
        info!(
            event = "dispatching",
            trace_id = %trace_id,
            channel_id = descriptor.channel_id,
            mode = %mode.as_str(),
            model = %descriptor.actual_model,
            reserved = reservation.amount(),
            is_stream
        );

        let adapter = adapter_for(descriptor.api_type);
        let started = Instant::now();
        let response = match adapter
            .execute(state.client.as_ref(), &descriptor, &payload)
            .await
        {
            Ok(response) => response,
            Err(ExecuteError::Build(err)) => {
                reservation.refund().await;
                return Err(match err {
                    tollgate_adapter::AdapterError::NilRequest => {
                        RelayError::MalformedRequestBody("empty request".to_string())
                    }
                    // A channel whose family cannot serve this mode is an
                    // operator misconfiguration, not an internal fault.
                    err @ tollgate_adapter::AdapterError::Unsupported(_) => {
                        RelayError::Upstream {
                            status: 400,
                            message: err.to_string(),
                        }
                    }
                    other => RelayError::InternalFault(other.to_string()),
                });
            }
            Err(ExecuteError::Transport(failure)) => {
                reservation.refund().await;
                let status = match failure.kind {
                    TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => 504,
                    _ => 502,
                };
                return Err(RelayError::Upstream {
                    status,
                    message: failure.message,
                });
            }
        };

        if !response.is_success() {
            let body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                // The client never streams non-2xx responses.
                UpstreamBody::Stream(_) => Bytes::new(),
            };
            let message = upstream_error_message(&body);
            self.handle_dispatch_failure(&descriptor, response.status, &message)
                .await;
            reservation.refund().await;
            return Err(RelayError::Upstream {
                status: response.status,
                message,
            });
        }

        let content_type = header_get(&response.headers, "content-type")
            .unwrap_or("application/json")
            .to_string();

        match response.body {
            UpstreamBody::Bytes(body) => {
                let parsed = match adapter.parse_response(&descriptor, &body) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        // A 2xx body we cannot decode still goes to the
                        // client; with nothing billable decoded, text modes
                        // settle at zero and the rest at the estimate.
                        warn!(event = "parse_failed", trace_id = %trace_id, error = %err);
                        tollgate_adapter::ParsedResponse {
                            body: body.clone(),
                            usage: None,
                            text: None,
                        }
                    }
                };
                self.settle_buffered(
                    &descriptor,
                    &grant,
                    &plan,
                    &payload,
                    reservation,
                    prompt_estimate,
                    reserve_amount,
                    &parsed,
                    started,
                    trace_id,
                );
                Ok(RelayResponse::Buffered {
                    status: response.status,
                    content_type,
                    body: parsed.body,
                })
            }
            UpstreamBody::Stream(upstream) => {
                let body = self.pump_stream(
                    descriptor,
                    grant,
                    plan,
                    &payload,
                    reservation,
                    prompt_estimate,
                    reserve_amount,
                    upstream,
                    started,
                    trace_id.to_string(),
                );
                Ok(RelayResponse::Stream {
                    status: response.status,
                    content_type,
                    body,
                })
            }
        }
    }

    /// Quota-exempt model listing scoped to the caller's group.
    pub async fn list_models(&self, auth_header: Option<&str>) -> RelayResult<Bytes> {
        let grant = self
            .state
            .validator
            .validate(auth_header, RelayMode::ModelsList, None)
            .await?;
        let models = self.state.channels.models_for_group(&grant.group);
        let data: Vec<_> = models
            .iter()
            .map(|model| {
                json!({
                    "id": model,
                    "object": "model",
                    "created": 0,
                    "owned_by": "tollgate",
                })
            })
            .collect();
        let body = serde_json::to_vec(&json!({"object": "list", "data": data}))
            .map_err(|err| RelayError::InternalFault(err.to_string()))?;
        Ok(Bytes::from(body))
    }

    /// Failure-disable policy: auth/billing-shaped failures durably disable
    /// the channel (when allowed); rate limits park it in memory.
    async fn handle_dispatch_failure(&self, desc: &RelayDescriptor, status: u16, message: &str) {
        let state = &self.state;
        let options = state.options.load();
        if desc.auto_ban && options.auto_disable_enabled && is_account_failure(status, message) {
            warn!(
                event = "channel_auto_disabled",
                channel_id = desc.channel_id,
                status,
                message = %message
            );
            state.channels.mark_disabled(desc.channel_id);
            if let Err(err) = state.store.set_channel_enabled(desc.channel_id, false).await {
                warn!(
                    event = "channel_disable_write_failed",
                    channel_id = desc.channel_id,
                    error = %err
                );
            }
            state.events.emit(OpsEvent::ChannelAutoDisabled {
                at: SystemTime::now(),
                channel_id: desc.channel_id,
                status,
                reason: message.to_string(),
            });
        } else if status == 429 {
            state.channels.set_cooldown(
                desc.channel_id,
                std::time::Duration::from_secs(RATE_LIMIT_COOLDOWN_SECS),
            );
            state.events.emit(OpsEvent::ChannelCooldown {
                at: SystemTime::now(),
                channel_id: desc.channel_id,
                seconds: RATE_LIMIT_COOLDOWN_SECS,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_buffered(
        &self,
        desc: &RelayDescriptor,
        grant: &TokenGrant,
        plan: &PricePlan,
        payload: &RelayPayload,
        reservation: Reservation,
        prompt_estimate: i64,
        estimated_quota: i64,
        parsed: &tollgate_adapter::ParsedResponse,
        started: Instant,
        trace_id: &str,
    ) {
        if !grant.meter {
            reservation.disarm();
            return;
        }
        let reserved = reservation.disarm();
        let usage = parsed.usage.or_else(|| {
            parsed.text.as_ref().map(|text| {
                Usage::new(
                    prompt_estimate,
                    completion_tokens_of(&desc.origin_model, text),
                )
            })
        });
        let (usage, quota, detail) = finalize_cost(
            plan,
            usage,
            prompt_estimate,
            estimated_quota,
            desc.mode,
            trace_id,
        );
        let content = self.capture_content(payload, parsed.text.as_deref());
        self.state.settlement.submit(SettlementJob {
            user_id: grant.user_id,
            token_id: grant.token_id,
            channel_id: desc.channel_id,
            model: desc.origin_model.clone(),
            usage,
            quota,
            reserved,
            ratio_detail: detail,
            elapsed_ms: started.elapsed().as_millis() as i64,
            is_stream: false,
            content,
        });
    }

    /// Relay the upstream stream to the client while scanning events for
    /// usage; settlement (or refund, on a fruitless errored stream) runs when
    /// the stream closes. A client disconnect cancels the upstream read and
    /// settles whatever partial usage was observed.
    #[allow(clippy::too_many_arguments)]
    fn pump_stream(
        &self,
        desc: RelayDescriptor,
        grant: TokenGrant,
        plan: PricePlan,
        payload: &RelayPayload,
        reservation: Reservation,
        prompt_estimate: i64,
        estimated_quota: i64,
        mut upstream: mpsc::Receiver<Bytes>,
        started: Instant,
        trace_id: String,
    ) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let engine = self.clone();
        let prompt_text = self.capture_content(payload, None);
        tokio::spawn(async move {
            let adapter = adapter_for(desc.api_type);
            let mut parser = SseParser::new();
            let mut scan = StreamScan::new();
            let mut client_gone = false;
            while let Some(chunk) = upstream.recv().await {
                for event in parser.feed(&chunk) {
                    adapter.scan_stream_event(&desc, &mut scan, &event);
                }
                if !client_gone && tx.send(chunk).await.is_err() {
                    // Client disconnected: stop forwarding and cancel the
                    // upstream read promptly, then bill partial usage.
                    client_gone = true;
                    break;
                }
            }
            drop(upstream);
            for event in parser.flush() {
                adapter.scan_stream_event(&desc, &mut scan, &event);
            }

            if !grant.meter {
                reservation.disarm();
                return;
            }

            let observed_usage = scan.usage.or_else(|| {
                (!scan.text.is_empty()).then(|| {
                    Usage::new(
                        prompt_estimate,
                        completion_tokens_of(&desc.origin_model, &scan.text),
                    )
                })
            });

            if let Some(error) = &scan.upstream_error
                && observed_usage.is_none()
            {
                // Errored mid-body without producing anything billable.
                warn!(
                    event = "stream_errored",
                    trace_id = %trace_id,
                    channel_id = desc.channel_id,
                    error = %error
                );
                reservation.refund().await;
                return;
            }

            let reserved = reservation.disarm();
            let (usage, quota, detail) = finalize_cost(
                &plan,
                observed_usage,
                prompt_estimate,
                estimated_quota,
                desc.mode,
                &trace_id,
            );
            let content = engine.stream_content(prompt_text, &scan, client_gone);
            engine.state.settlement.submit(SettlementJob {
                user_id: grant.user_id,
                token_id: grant.token_id,
                channel_id: desc.channel_id,
                model: desc.origin_model.clone(),
                usage,
                quota,
                reserved,
                ratio_detail: detail,
                elapsed_ms: started.elapsed().as_millis() as i64,
                is_stream: true,
                content,
            });
        });
        rx
    }

    fn capture_content(&self, payload: &RelayPayload, completion: Option<&str>) -> Option<String> {
        if !self.state.options.load().log_content_enabled {
            return None;
        }
        let mut out = prompt_text(payload);
        if let Some(completion) = completion {
            out.push_str("\n---\n");
            out.push_str(completion);
        }
        truncate_on_char_boundary(&mut out, LOG_CONTENT_LIMIT);
        Some(out)
    }

    fn stream_content(
        &self,
        prompt: Option<String>,
        scan: &StreamScan,
        client_gone: bool,
    ) -> Option<String> {
        let mut out = prompt?;
        out.push_str("\n---\n");
        out.push_str(&scan.text);
        if client_gone {
            out.push_str("\n[client disconnected]");
        }
        truncate_on_char_boundary(&mut out, LOG_CONTENT_LIMIT);
        Some(out)
    }
}

fn truncate_on_char_boundary(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Text-shaped modes report usage (or at least text) when they produce
/// anything; a missing usage there means nothing billable happened. The
/// remaining modes never report token accounting and are billed at the
/// computed estimate instead.
fn mode_charges_estimate(mode: RelayMode) -> bool {
    !matches!(
        mode,
        RelayMode::Chat
            | RelayMode::Completions
            | RelayMode::ClaudeMessages
            | RelayMode::Responses
            | RelayMode::Realtime
    )
}

/// Final quota and log detail for a completed call.
///
/// Reported-but-zero usage is an anomaly: it charges nothing and is flagged
/// in the log. No usage at all splits by mode: a text mode that produced
/// nothing takes the zero-charge path (the settlement delta returns the
/// whole reservation); a mode with no upstream accounting is billed at the
/// estimate computed before dispatch.
fn finalize_cost(
    plan: &PricePlan,
    usage: Option<Usage>,
    prompt_estimate: i64,
    estimated_quota: i64,
    mode: RelayMode,
    trace_id: &str,
) -> (Usage, i64, String) {
    match usage {
        Some(usage) if usage.is_zero() => {
            warn!(event = "zero_usage_reported", trace_id = %trace_id);
            (usage, 0, format!("{}; zero usage reported upstream", plan.describe()))
        }
        Some(usage) => (usage, plan.settle_quota(&usage), plan.describe()),
        None if mode_charges_estimate(mode) => (
            Usage::new(prompt_estimate, 0),
            estimated_quota,
            format!("{}; billed at estimate", plan.describe()),
        ),
        None => {
            warn!(event = "no_billable_usage", trace_id = %trace_id);
            (
                Usage::default(),
                0,
                format!("{}; no billable usage, zero charge", plan.describe()),
            )
        }
    }
}

fn completion_tokens_of(model: &str, text: &str) -> i64 {
    count_text_tokens(model, text).unwrap_or_else(|_| (text.chars().count() as i64 / 4).max(1))
}

fn prompt_text(payload: &RelayPayload) -> String {
    use tollgate_protocol::chat::MessageContent;
    match payload {
        RelayPayload::Chat(req) => req
            .messages
            .iter()
            .filter_map(|message| message.content.as_ref().map(MessageContent::flat_text))
            .collect::<Vec<_>>()
            .join("\n"),
        RelayPayload::Completions(req) => req.prompt.flat_text(),
        RelayPayload::Embeddings(req) => req.input.flat_text(),
        RelayPayload::Moderation(req) => req.input.flat_text(),
        RelayPayload::ImagesGenerations(req) => req.prompt.clone(),
        RelayPayload::ImagesEdits { request, .. } => request.prompt.clone(),
        RelayPayload::AudioSpeech(req) => req.input.clone(),
        RelayPayload::AudioTranscription { .. } | RelayPayload::AudioTranslation { .. } => {
            String::new()
        }
        RelayPayload::ClaudeMessages(req) => req
            .messages
            .iter()
            .map(|message| message.content.flat_text())
            .collect::<Vec<_>>()
            .join("\n"),
        RelayPayload::Responses(req) => req
            .input
            .as_ref()
            .map(|input| input.to_string())
            .unwrap_or_default(),
    }
}

/// An accepted realtime session: the WebSocket bridge lives in the router;
/// the engine holds the money side.
pub struct RealtimeSession {
    pub descriptor: RelayDescriptor,
    pub url: String,
    reservation: Reservation,
    plan: PricePlan,
    grant: TokenGrant,
    started: Instant,
}

impl RelayEngine {
    /// Validate, select, and reserve for a realtime upgrade. Estimation is
    /// unavailable before the socket opens, so the configured floor is
    /// reserved.
    pub async fn begin_realtime(
        &self,
        auth_header: Option<&str>,
        model: Option<&str>,
    ) -> RelayResult<RealtimeSession> {
        let state = &self.state;
        let model =
            model.ok_or_else(|| RelayError::MalformedRequestBody("missing model".to_string()))?;
        let grant = state
            .validator
            .validate(auth_header, RelayMode::Realtime, Some(model))
            .await?;
        let channel = select_channel(
            &state.channels,
            &grant.group,
            &grant.model,
            grant.channel_pin,
        )?;
        let descriptor = build_descriptor(&channel, &grant, RelayMode::Realtime, true)?;
        let url = adapter_for(descriptor.api_type)
            .realtime_url(&descriptor)
            .map_err(|err| RelayError::Upstream {
                status: 400,
                message: err.to_string(),
            })?;

        let options = state.options.load();
        let ratios = state.ratios.load();
        let plan = PricePlan::select(
            &ratios,
            &options,
            &grant.model,
            &grant.group,
            grant.billing_by_request,
        );
        let reservation = state.billing.reserve(&grant, options.pre_consume_floor).await?;
        Ok(RealtimeSession {
            descriptor,
            url,
            reservation,
            plan,
            grant,
            started: Instant::now(),
        })
    }

    /// Settle a closed realtime session with the usage scanned from
    /// `response.done` events; no usage takes the zero-charge path.
    pub fn finish_realtime(&self, session: RealtimeSession, usage: Option<Usage>) {
        let RealtimeSession {
            descriptor,
            url: _,
            reservation,
            plan,
            grant,
            started,
        } = session;
        if !grant.meter {
            reservation.disarm();
            return;
        }
        let reserved = reservation.disarm();
        let usage = usage.unwrap_or_default();
        let quota = plan.settle_quota(&usage);
        self.state.settlement.submit(SettlementJob {
            user_id: grant.user_id,
            token_id: grant.token_id,
            channel_id: descriptor.channel_id,
            model: descriptor.origin_model.clone(),
            usage,
            quota,
            reserved,
            ratio_detail: plan.describe(),
            elapsed_ms: started.elapsed().as_millis() as i64,
            is_stream: true,
            content: None,
        });
    }
}
