use std::sync::Arc;
use std::time::SystemTime;

use tracing::{error, warn};

use tollgate_common::{OptionFlags, RatioTables, RelayError, RelayResult};
use tollgate_protocol::Usage;
use tollgate_store::cache::{DebitOutcome, QuotaCache};
use tollgate_store::{SharedStore, StoreError};

use crate::events::{EventHub, OpsEvent};
use crate::token::TokenGrant;

/// Balances this many times larger than the reservation skip the ledger
/// round-trip entirely.
const TRUST_MULTIPLIER: i64 = 100;

/// Ratio selection resolved once per request and reused verbatim by reserve
/// and settle, so the two phases can never disagree on pricing.
#[derive(Debug, Clone, Copy)]
pub struct PricePlan {
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    /// Flat per-call price; set when request billing is enabled and the
    /// token opted in, and the model has a per-call entry.
    pub per_call: Option<f64>,
}

impl PricePlan {
    pub fn select(
        tables: &RatioTables,
        flags: &OptionFlags,
        model: &str,
        group: &str,
        token_billing_eligible: bool,
    ) -> Self {
        let model_ratio = if flags.model_ratio_enabled {
            tables.model_ratio(model)
        } else {
            1.0
        };
        let per_call = (flags.billing_by_request_enabled && token_billing_eligible)
            .then(|| tables.per_call_ratio(model))
            .flatten();
        Self {
            model_ratio,
            group_ratio: tables.group_ratio(group),
            completion_ratio: tables.completion_ratio(model),
            per_call,
        }
    }

    /// Reservation amount for a prompt estimate plus the declared completion
    /// bound.
    pub fn reserve_quota(&self, prompt_tokens: i64, max_completion_tokens: i64) -> i64 {
        if let Some(per_call) = self.per_call {
            return ceil_quota(per_call * self.group_ratio);
        }
        let tokens = (prompt_tokens + max_completion_tokens).max(0) as f64;
        ceil_quota(tokens * self.model_ratio * self.group_ratio)
    }

    /// True cost from reported usage. Zero reported usage is an upstream
    /// anomaly and always costs zero; a nonzero ratio never rounds below one.
    pub fn settle_quota(&self, usage: &Usage) -> i64 {
        if usage.is_zero() {
            return 0;
        }
        if let Some(per_call) = self.per_call {
            return ceil_quota(per_call * self.group_ratio);
        }
        let tokens =
            usage.prompt_tokens as f64 + usage.completion_tokens as f64 * self.completion_ratio;
        let quota = ceil_quota(tokens * self.model_ratio * self.group_ratio);
        if self.model_ratio != 0.0 && quota <= 0 {
            1
        } else {
            quota
        }
    }

    /// Human-readable multiplier breakdown for the consumption log.
    pub fn describe(&self) -> String {
        match self.per_call {
            Some(per_call) => format!(
                "per-call {per_call} × group ratio {}",
                self.group_ratio
            ),
            None => format!(
                "model ratio {} × group ratio {}, completion ratio {}",
                self.model_ratio, self.group_ratio, self.completion_ratio
            ),
        }
    }
}

fn ceil_quota(value: f64) -> i64 {
    value.max(0.0).ceil() as i64
}

pub(crate) struct BillingShared {
    pub store: SharedStore,
    pub quota_cache: Arc<QuotaCache>,
    pub events: EventHub,
}

/// Reserve/refund side of the billing state machine. Settlement lives in
/// [`crate::settlement`], fed through the queue after the response is out.
#[derive(Clone)]
pub struct BillingEngine {
    shared: Arc<BillingShared>,
}

impl BillingEngine {
    pub fn new(store: SharedStore, quota_cache: Arc<QuotaCache>, events: EventHub) -> Self {
        Self {
            shared: Arc::new(BillingShared {
                store,
                quota_cache,
                events,
            }),
        }
    }

    /// Withhold `amount` from the cached user balance and the token's
    /// durable ledger.
    ///
    /// Fails with `InsufficientQuota` before any upstream call when the
    /// balance cannot cover the reservation; fails closed on store errors.
    /// High-balance accounts skip the withhold entirely (trust shortcut) —
    /// the returned reservation is then zero and its refund is a no-op.
    pub async fn reserve(&self, grant: &TokenGrant, amount: i64) -> RelayResult<Reservation> {
        if !grant.meter || amount <= 0 {
            return Ok(Reservation::empty(self.shared.clone(), grant));
        }

        let cache = &self.shared.quota_cache;
        let store = self.shared.store.as_ref();

        let balance = cache
            .balance(store, grant.user_id)
            .await
            .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?;

        let token_trusted = grant.unlimited_quota
            || grant.remaining_quota > TRUST_MULTIPLIER.saturating_mul(amount);
        if balance > TRUST_MULTIPLIER.saturating_mul(amount) && token_trusted {
            return Ok(Reservation::empty(self.shared.clone(), grant));
        }

        match cache
            .try_debit(store, grant.user_id, amount)
            .await
            .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?
        {
            DebitOutcome::Debited { .. } => {}
            DebitOutcome::Insufficient { balance } => {
                return Err(RelayError::InsufficientQuota {
                    need: amount - balance,
                });
            }
        }

        if let Err(err) = self
            .shared
            .store
            .pre_consume_token_quota(grant.token_id, amount)
            .await
        {
            // Undo the cache debit before reporting; the ledger never moved.
            if let Err(undo_err) = cache.apply_delta(store, grant.user_id, amount).await {
                error!(
                    event = "reserve_undo_failed",
                    user_id = grant.user_id,
                    amount,
                    error = %undo_err
                );
            }
            return Err(match err {
                StoreError::InsufficientTokenQuota => {
                    RelayError::InsufficientQuota { need: amount }
                }
                other => RelayError::QuotaStoreFailure(other.to_string()),
            });
        }

        Ok(Reservation {
            shared: self.shared.clone(),
            ticket: Some(Ticket {
                user_id: grant.user_id,
                token_id: grant.token_id,
                amount,
            }),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    user_id: i64,
    token_id: i64,
    amount: i64,
}

/// A taken (or trusted-empty) reservation.
///
/// Exactly one of three things happens to it: `disarm` (settlement will
/// reconcile), `refund` (dispatch failed), or Drop (fault path — a detached
/// refund is issued). The ticket is consumed on first use, so the refund is
/// at-most-once by construction.
pub struct Reservation {
    shared: Arc<BillingShared>,
    ticket: Option<Ticket>,
}

impl Reservation {
    fn empty(shared: Arc<BillingShared>, _grant: &TokenGrant) -> Self {
        Self {
            shared,
            ticket: None,
        }
    }

    /// Amount withheld; zero when the trust shortcut applied.
    pub fn amount(&self) -> i64 {
        self.ticket.map(|t| t.amount).unwrap_or(0)
    }

    /// Hand the reserved amount to settlement and cancel the Drop refund.
    pub fn disarm(mut self) -> i64 {
        self.ticket.take().map(|t| t.amount).unwrap_or(0)
    }

    /// Return the exact reservation to the token ledger and cached balance.
    /// No-op when nothing was withheld.
    pub async fn refund(mut self) {
        if let Some(ticket) = self.ticket.take() {
            refund_ticket(&self.shared, ticket).await;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Fault path: neither disarm nor refund ran. Return the funds on a
        // detached task and leave a trace.
        if let Some(ticket) = self.ticket.take() {
            warn!(
                event = "reservation_leak_refund",
                user_id = ticket.user_id,
                token_id = ticket.token_id,
                amount = ticket.amount
            );
            let shared = self.shared.clone();
            tokio::spawn(async move {
                refund_ticket(&shared, ticket).await;
            });
        }
    }
}

async fn refund_ticket(shared: &BillingShared, ticket: Ticket) {
    if ticket.amount <= 0 {
        return;
    }
    if let Err(err) = shared
        .quota_cache
        .apply_delta(shared.store.as_ref(), ticket.user_id, ticket.amount)
        .await
    {
        error!(
            event = "refund_cache_failed",
            user_id = ticket.user_id,
            amount = ticket.amount,
            error = %err
        );
    }
    if let Err(err) = shared
        .store
        .post_consume_token_quota(ticket.token_id, ticket.amount)
        .await
    {
        error!(
            event = "refund_ledger_failed",
            token_id = ticket.token_id,
            amount = ticket.amount,
            error = %err
        );
    }
    shared.events.emit(OpsEvent::RefundIssued {
        at: SystemTime::now(),
        user_id: ticket.user_id,
        token_id: ticket.token_id,
        amount: ticket.amount,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_quota_matches_token_math() {
        let plan = PricePlan {
            model_ratio: 0.002,
            group_ratio: 1.0,
            completion_ratio: 2.0,
            per_call: None,
        };
        // (50 + 100) × 0.002 = 0.3 → ceil to 1 quota unit.
        assert_eq!(plan.reserve_quota(50, 100), 1);
    }

    #[test]
    fn settle_quota_floors_and_zeroes() {
        let plan = PricePlan {
            model_ratio: 0.002,
            group_ratio: 1.0,
            completion_ratio: 2.0,
            per_call: None,
        };
        // 50 + 40×2 = 130 tokens × 0.002 = 0.26 → nonzero ratio floors at 1.
        assert_eq!(plan.settle_quota(&Usage::new(50, 40)), 1);
        // Zero reported usage is an anomaly and never charges.
        assert_eq!(plan.settle_quota(&Usage::new(0, 0)), 0);
    }

    #[test]
    fn per_call_plan_ignores_token_counts() {
        let plan = PricePlan {
            model_ratio: 0.002,
            group_ratio: 2.0,
            completion_ratio: 2.0,
            per_call: Some(10.0),
        };
        assert_eq!(plan.reserve_quota(50_000, 100_000), 20);
        assert_eq!(plan.settle_quota(&Usage::new(50_000, 100_000)), 20);
        assert_eq!(plan.settle_quota(&Usage::new(0, 0)), 0);
    }

    #[test]
    fn zero_ratio_model_charges_nothing() {
        let plan = PricePlan {
            model_ratio: 0.0,
            group_ratio: 1.0,
            completion_ratio: 1.0,
            per_call: None,
        };
        assert_eq!(plan.settle_quota(&Usage::new(100, 100)), 0);
    }
}
