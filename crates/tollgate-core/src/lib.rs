//! The tollgate relay pipeline.
//!
//! An inbound request flows entitlement/token validation → channel
//! selection → descriptor build → billing reserve → adapter dispatch →
//! settle/refund. The billing engine owns the money state machine; the
//! recovery boundary guarantees faults become structured errors and
//! reservations are returned.

pub mod auth;
pub mod billing;
pub mod descriptor;
pub mod distributor;
pub mod engine;
pub mod estimate;
pub mod events;
pub mod recover;
pub mod settlement;
pub mod state;
pub mod token;

pub use auth::{EntitlementResolver, Identity, SessionClaims};
pub use billing::{BillingEngine, PricePlan, Reservation};
pub use descriptor::build_descriptor;
pub use distributor::{ChannelDirectory, select_channel};
pub use engine::{RealtimeSession, RelayEngine, RelayResponse};
pub use events::{EventHub, OpsEvent};
pub use recover::run_protected;
pub use settlement::{SettlementJob, SettlementQueue};
pub use state::AppState;
pub use token::{TokenGrant, TokenValidator};
