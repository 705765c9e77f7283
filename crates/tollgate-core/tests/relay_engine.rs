use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tollgate_adapter::{
    OutboundRequest, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamResponse,
};
use tollgate_common::{GlobalConfig, OptionFlags, RatioTables, RelayError};
use tollgate_core::engine::{RelayEngine, RelayResponse};
use tollgate_core::state::AppState;
use tollgate_protocol::RelayMode;
use tollgate_store::{ChannelRow, MemStore, Role, TokenRow, UserRow};

/// Scripted transport: returns the queued response and records the request.
struct ScriptedClient {
    responses: Mutex<Vec<ScriptedResponse>>,
    seen: Mutex<Vec<OutboundRequest>>,
}

enum ScriptedResponse {
    Buffered { status: u16, body: Bytes },
    Stream { status: u16, chunks: Vec<Bytes> },
}

impl ScriptedClient {
    fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn last_request_url(&self) -> Option<String> {
        self.seen.lock().unwrap().last().map(|req| req.url.clone())
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(req);
            let next = self.responses.lock().unwrap().remove(0);
            Ok(match next {
                ScriptedResponse::Buffered { status, body } => UpstreamResponse {
                    status,
                    headers: vec![("content-type".into(), "application/json".into())],
                    body: UpstreamBody::Bytes(body),
                },
                ScriptedResponse::Stream { status, chunks } => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                    });
                    UpstreamResponse {
                        status,
                        headers: vec![("content-type".into(), "text/event-stream".into())],
                        body: UpstreamBody::Stream(rx),
                    }
                }
            })
        })
    }
}

fn channel(id: i64, enabled: bool) -> ChannelRow {
    ChannelRow {
        id,
        name: format!("ch{id}"),
        kind: "openai".into(),
        enabled,
        groups: "default".into(),
        models: "gpt-4o".into(),
        base_url: None,
        api_key: "upstream-key".into(),
        weight: 0,
        model_remap: None,
        config: None,
        auto_ban: None,
        used_quota: 0,
    }
}

fn rig(
    client: Arc<ScriptedClient>,
    channels: Vec<ChannelRow>,
    balance: i64,
) -> (Arc<MemStore>, RelayEngine) {
    let mem = Arc::new(MemStore::new());
    mem.put_user(UserRow {
        id: 1,
        username: "alice".into(),
        role: Role::Admin,
        enabled: true,
        group: "default".into(),
        access_token: None,
        quota: balance,
        used_quota: 0,
        request_count: 0,
    });
    mem.put_token(TokenRow {
        id: 7,
        user_id: 1,
        name: "t".into(),
        key: "abc123".into(),
        group: None,
        remaining_quota: balance,
        unlimited_quota: false,
        models: None,
        enabled: true,
        billing_by_request: false,
    });
    for row in &channels {
        mem.put_channel(row.clone());
    }
    let config = GlobalConfig {
        host: "127.0.0.1".into(),
        port: 0,
        dsn: "memory://".into(),
        proxy: None,
        cache_ttl_secs: 30,
        upstream_timeout_secs: 30,
    };
    let state = AppState::new(
        &config,
        mem.clone(),
        client,
        OptionFlags::default(),
        RatioTables::default(),
        channels,
    );
    (mem, RelayEngine::new(state))
}

fn chat_payload(max_tokens: i64) -> tollgate_adapter::RelayPayload {
    tollgate_adapter::RelayPayload::Chat(
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "say hello"}],
            "max_tokens": max_tokens,
        }))
        .unwrap(),
    )
}

async fn wait_for_log(mem: &MemStore) -> tollgate_store::ConsumeLogEntry {
    for _ in 0..100 {
        if let Some(entry) = mem.logs().into_iter().next() {
            return entry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("settlement log never appeared");
}

#[tokio::test]
async fn buffered_chat_relays_and_settles() {
    let upstream_body = serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 50, "completion_tokens": 40, "total_tokens": 90}
    });
    let client = ScriptedClient::new(vec![ScriptedResponse::Buffered {
        status: 200,
        body: Bytes::from(serde_json::to_vec(&upstream_body).unwrap()),
    }]);
    let (mem, engine) = rig(client.clone(), vec![channel(1, true)], 100_000);

    let response = engine
        .relay(
            Some("Bearer sk-abc123"),
            RelayMode::Chat,
            chat_payload(100),
            "trace-1",
        )
        .await
        .unwrap();

    let RelayResponse::Buffered { status, body, .. } = response else {
        panic!("expected buffered response");
    };
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["choices"][0]["message"]["content"], "hello");
    assert_eq!(
        client.last_request_url().unwrap(),
        "https://api.openai.com/v1/chat/completions"
    );

    let entry = wait_for_log(&mem).await;
    assert_eq!(entry.prompt_tokens, 50);
    assert_eq!(entry.completion_tokens, 40);
    assert!(!entry.is_stream);
    // Unit ratios: quota = 50 + 40×1 = 90.
    assert_eq!(entry.quota, 90);
    assert_eq!(mem.user(1).unwrap().quota, 100_000 - 90);
}

#[tokio::test]
async fn pinned_disabled_channel_takes_no_reservation() {
    let client = ScriptedClient::new(vec![]);
    let (mem, engine) = rig(client, vec![channel(4, false)], 10_000);

    let err = engine
        .relay(
            Some("Bearer sk-abc123-4"),
            RelayMode::Chat,
            chat_payload(100),
            "trace-2",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ChannelDisabled(4)));
    assert_eq!(err.status().as_u16(), 403);
    // Cheap failure: nothing was withheld anywhere.
    assert_eq!(mem.user(1).unwrap().quota, 10_000);
    assert_eq!(mem.token(7).unwrap().remaining_quota, 10_000);
    assert!(mem.logs().is_empty());
}

#[tokio::test]
async fn no_available_channel_names_group_and_model() {
    let client = ScriptedClient::new(vec![]);
    let (_mem, engine) = rig(client, vec![], 10_000);

    let err = engine
        .relay(
            Some("Bearer sk-abc123"),
            RelayMode::Chat,
            chat_payload(100),
            "trace-3",
        )
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 503);
    let message = err.to_string();
    assert!(message.contains("default"));
    assert!(message.contains("gpt-4o"));
}

#[tokio::test]
async fn upstream_auth_failure_refunds_and_disables_channel() {
    let client = ScriptedClient::new(vec![ScriptedResponse::Buffered {
        status: 401,
        body: Bytes::from_static(b"{\"error\":{\"message\":\"Incorrect API key provided\"}}"),
    }]);
    let (mem, engine) = rig(client, vec![channel(1, true)], 10_000);

    let err = engine
        .relay(
            Some("Bearer sk-abc123"),
            RelayMode::Chat,
            chat_payload(100),
            "trace-4",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Upstream { status: 401, .. }));

    // Refund restored both ledgers.
    assert_eq!(mem.token(7).unwrap().remaining_quota, 10_000);
    // Failure-disable flipped the durable flag.
    for _ in 0..100 {
        if !mem.channel(1).unwrap().enabled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!mem.channel(1).unwrap().enabled);
    assert!(mem.logs().is_empty());
}

#[tokio::test]
async fn usage_free_mode_bills_estimate_even_when_trusted() {
    // High balance triggers the trust shortcut (nothing withheld), but an
    // image generation still settles at the computed estimate, not free.
    let client = ScriptedClient::new(vec![ScriptedResponse::Buffered {
        status: 200,
        body: Bytes::from_static(b"{\"created\":1,\"data\":[{\"url\":\"https://img\"}]}"),
    }]);
    let mut image_channel = channel(1, true);
    image_channel.models = "dall-e-3".into();
    let (mem, engine) = rig(client, vec![image_channel], 200_000);

    let payload = tollgate_adapter::RelayPayload::ImagesGenerations(
        serde_json::from_value(serde_json::json!({
            "model": "dall-e-3",
            "prompt": "a lighthouse",
        }))
        .unwrap(),
    );
    let response = engine
        .relay(
            Some("Bearer sk-abc123"),
            RelayMode::ImagesGenerations,
            payload,
            "trace-6",
        )
        .await
        .unwrap();
    assert!(matches!(response, RelayResponse::Buffered { status: 200, .. }));

    let entry = wait_for_log(&mem).await;
    // One image at unit ratios estimates to 1000 quota units.
    assert_eq!(entry.quota, 1_000);
    assert_eq!(mem.user(1).unwrap().quota, 200_000 - 1_000);
}

#[tokio::test]
async fn empty_text_stream_charges_nothing() {
    let client = ScriptedClient::new(vec![ScriptedResponse::Stream {
        status: 200,
        chunks: vec![Bytes::from_static(b"data: [DONE]\n\n")],
    }]);
    let (mem, engine) = rig(client, vec![channel(1, true)], 10_000);

    let payload = tollgate_adapter::RelayPayload::Chat(
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "say hello"}],
            "stream": true,
        }))
        .unwrap(),
    );
    let response = engine
        .relay(Some("Bearer sk-abc123"), RelayMode::Chat, payload, "trace-7")
        .await
        .unwrap();
    let RelayResponse::Stream { mut body, .. } = response else {
        panic!("expected stream response");
    };
    while body.recv().await.is_some() {}

    // A stream that produced no usage and no text is the zero-charge path.
    let entry = wait_for_log(&mem).await;
    assert_eq!(entry.quota, 0);
    assert_eq!(entry.prompt_tokens, 0);
    assert_eq!(entry.completion_tokens, 0);
    assert_eq!(mem.user(1).unwrap().quota, 10_000);
    assert_eq!(mem.token(7).unwrap().remaining_quota, 10_000);
}

#[tokio::test]
async fn stream_relays_chunks_and_settles_scanned_usage() {
    let chunks = vec![
        Bytes::from_static(
            b"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":0,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hel\"}}]}\n\n",
        ),
        Bytes::from_static(
            b"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":0,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2,\"total_tokens\":11}}\n\n",
        ),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ];
    let client = ScriptedClient::new(vec![ScriptedResponse::Stream {
        status: 200,
        chunks,
    }]);
    let (mem, engine) = rig(client, vec![channel(1, true)], 100_000);

    let payload = tollgate_adapter::RelayPayload::Chat(
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "say hello"}],
            "stream": true,
        }))
        .unwrap(),
    );
    let response = engine
        .relay(Some("Bearer sk-abc123"), RelayMode::Chat, payload, "trace-5")
        .await
        .unwrap();

    let RelayResponse::Stream {
        status,
        content_type,
        mut body,
    } = response
    else {
        panic!("expected stream response");
    };
    assert_eq!(status, 200);
    assert_eq!(content_type, "text/event-stream");

    let mut relayed = Vec::new();
    while let Some(chunk) = body.recv().await {
        relayed.extend_from_slice(&chunk);
    }
    let text = String::from_utf8(relayed).unwrap();
    assert!(text.contains("hel"));
    assert!(text.ends_with("data: [DONE]\n\n"));

    let entry = wait_for_log(&mem).await;
    assert!(entry.is_stream);
    assert_eq!(entry.prompt_tokens, 9);
    assert_eq!(entry.completion_tokens, 2);
    assert_eq!(entry.quota, 11);
}
