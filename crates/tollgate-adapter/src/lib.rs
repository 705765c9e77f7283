//! Upstream adapter contract for tollgate.
//!
//! One [`Adapter`] implementation exists per upstream protocol family; the
//! mapping from a channel's type tag to its adapter is the single static
//! table in [`registry`]. Adapters build URLs, headers, and translated
//! bodies — a higher layer performs quota accounting and IO sequencing,
//! and the shared [`client::UpstreamClient`] performs the transport call.

pub mod adapter;
pub mod api_type;
pub mod claude;
pub mod client;
pub mod descriptor;
pub mod error;
pub mod gemini;
pub mod headers;
pub mod openai;
pub mod registry;
pub mod request;
pub mod response;
pub mod transform;

pub use adapter::{Adapter, ExecuteError, StreamScan};
pub use api_type::ApiType;
pub use client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
pub use descriptor::RelayDescriptor;
pub use error::{
    AdapterError, AdapterResult, TransportErrorKind, UpstreamFailure, is_account_failure,
    upstream_error_message,
};
pub use headers::{Headers, header_get, header_set};
pub use registry::adapter_for;
pub use request::{MultipartField, MultipartForm, OutboundBody, OutboundRequest, RelayPayload};
pub use response::{ByteStream, ParsedResponse, UpstreamBody, UpstreamResponse, usage_from_json};
