use http::StatusCode;

pub type RelayResult<T> = Result<T, RelayError>;

/// The error taxonomy spoken across the relay pipeline.
///
/// Validation and selection errors are cheap and returned before any upstream
/// call or quota debit; dispatch errors trigger the refund side effect in the
/// billing engine before propagating.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    // Entitlement
    #[error("no credential supplied")]
    Unauthenticated,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("account is disabled")]
    AccountDisabled,
    #[error("insufficient role for this endpoint")]
    InsufficientRole,

    // Token validation
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("model {model} is not allowed for this token")]
    ModelNotAllowedForToken { model: String },
    #[error("channel pinning requires admin privilege")]
    ChannelPinForbidden,
    #[error("token owner is disabled")]
    UserDisabled,

    // Channel selection
    #[error("channel {0} does not exist")]
    InvalidChannel(i64),
    #[error("group {group} may not use channel {channel_id}")]
    ChannelForbidden { channel_id: i64, group: String },
    #[error("channel {channel_id} does not serve model {model}")]
    ModelNotSupported { channel_id: i64, model: String },
    #[error("channel {0} is disabled")]
    ChannelDisabled(i64),
    #[error("no available channel for group {group} and model {model}")]
    NoAvailableChannel { group: String, model: String },
    #[error("channel data integrity fault: {0}")]
    DataIntegrityFault(String),

    // Billing
    #[error("insufficient quota: need {need} more")]
    InsufficientQuota { need: i64 },
    #[error("quota store failure: {0}")]
    QuotaStoreFailure(String),

    // Dispatch
    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    // Parsing / boundary
    #[error("malformed request body: {0}")]
    MalformedRequestBody(String),
    #[error("internal fault: {0}")]
    InternalFault(String),
}

impl RelayError {
    /// HTTP status this error maps to at the edge. Upstream errors relay the
    /// upstream's own status when it is a valid code.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthenticated | RelayError::InvalidCredential => {
                StatusCode::UNAUTHORIZED
            }
            RelayError::AccountDisabled
            | RelayError::InsufficientRole
            | RelayError::ChannelPinForbidden
            | RelayError::UserDisabled
            | RelayError::ChannelForbidden { .. }
            | RelayError::ChannelDisabled(_)
            | RelayError::InsufficientQuota { .. } => StatusCode::FORBIDDEN,
            RelayError::InvalidToken(_)
            | RelayError::ModelNotAllowedForToken { .. }
            | RelayError::InvalidChannel(_)
            | RelayError::ModelNotSupported { .. }
            | RelayError::MalformedRequestBody(_) => StatusCode::BAD_REQUEST,
            RelayError::NoAvailableChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::DataIntegrityFault(_)
            | RelayError::QuotaStoreFailure(_)
            | RelayError::InternalFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthenticated => "unauthenticated",
            RelayError::InvalidCredential => "invalid_credential",
            RelayError::AccountDisabled => "account_disabled",
            RelayError::InsufficientRole => "insufficient_role",
            RelayError::InvalidToken(_) => "invalid_token",
            RelayError::ModelNotAllowedForToken { .. } => "model_not_allowed",
            RelayError::ChannelPinForbidden => "channel_pin_forbidden",
            RelayError::UserDisabled => "user_disabled",
            RelayError::InvalidChannel(_) => "invalid_channel",
            RelayError::ChannelForbidden { .. } => "channel_forbidden",
            RelayError::ModelNotSupported { .. } => "model_not_supported",
            RelayError::ChannelDisabled(_) => "channel_disabled",
            RelayError::NoAvailableChannel { .. } => "no_available_channel",
            RelayError::DataIntegrityFault(_) => "data_integrity_fault",
            RelayError::InsufficientQuota { .. } => "insufficient_quota",
            RelayError::QuotaStoreFailure(_) => "quota_store_failure",
            RelayError::Upstream { .. } => "upstream_error",
            RelayError::MalformedRequestBody(_) => "malformed_request_body",
            RelayError::InternalFault(_) => "internal_fault",
        }
    }

    /// Whether the client-visible message should be replaced with a generic
    /// one. Store and internal detail is not echoed verbatim.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            RelayError::QuotaStoreFailure(_)
                | RelayError::DataIntegrityFault(_)
                | RelayError::InternalFault(_)
        )
    }
}
