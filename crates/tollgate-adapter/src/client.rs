use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Proxy};

use crate::error::{TransportErrorKind, UpstreamFailure};
use crate::headers::{Headers, header_get};
use crate::request::{MultipartField, OutboundBody, OutboundRequest};
use crate::response::{UpstreamBody, UpstreamResponse};

/// Transport abstraction over the shared outbound HTTP client. Billing and
/// adapter tests swap in a scripted implementation.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// wreq-backed transport. The egress configuration is fixed for the life of
/// the process, so a single pooled `Client` is built up front and shared by
/// every relay.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: Client,
    stream_idle_timeout: Duration,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        let proxy = config
            .proxy
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(proxy) = proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self.client.post(&req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            let has_content_type = header_get(&req.headers, "content-type").is_some();
            builder = match req.body {
                OutboundBody::Empty => builder,
                OutboundBody::Json(bytes) => {
                    if !has_content_type {
                        builder = builder.header("content-type", "application/json");
                    }
                    builder.body(bytes)
                }
                OutboundBody::Multipart(form) => {
                    let mut multipart = wreq::multipart::Form::new();
                    for field in form.fields {
                        multipart = match field {
                            MultipartField::Text { name, value } => multipart.text(name, value),
                            MultipartField::File {
                                name,
                                file_name,
                                data,
                            } => multipart
                                .part(name, wreq::multipart::Part::stream(data).file_name(file_name)),
                        };
                    }
                    builder.multipart(multipart)
                }
            };

            let resp = builder.send().await.map_err(transport_failure)?;
            let status = resp.status().as_u16();
            let headers: Headers = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|text| (name.as_str().to_string(), text.to_string()))
                })
                .collect();

            // Buffer everything except a successful stream; error bodies are
            // needed whole for refund/disable decisions.
            if !(200..300).contains(&status) || !req.is_stream {
                let body = resp.bytes().await.map_err(transport_failure)?;
                return Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(spawn_body_reader(resp, self.stream_idle_timeout)),
            })
        })
    }
}

/// Drain the response body onto a channel, giving up when the upstream goes
/// idle past the configured window or the receiver is dropped.
fn spawn_body_reader(
    resp: wreq::Response,
    idle_timeout: Duration,
) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let Ok(item) = tokio::time::timeout(idle_timeout, stream.next()).await else {
                return;
            };
            let Some(Ok(chunk)) = item else {
                return;
            };
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    });
    rx
}

fn transport_failure(err: wreq::Error) -> UpstreamFailure {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let mentions = |needle: &str| lowered.contains(needle);
    let kind = if err.is_timeout() {
        if mentions("read") || mentions("idle") {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if err.is_connect() {
        if mentions("dns") || mentions("resolve") {
            TransportErrorKind::Dns
        } else if mentions("tls") || mentions("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if mentions("tls") || mentions("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    UpstreamFailure { kind, message }
}
