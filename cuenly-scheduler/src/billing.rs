//! C12: the daily billing and AI-quota-reset sweep. Runs once per
//! calendar day at a fixed local time, guarded by a short-lived
//! distributed lock so only one pod executes it even if several are
//! awake at the scheduled moment.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use redis::AsyncCommands;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, instrument, warn};

const LOCK_KEY: &str = "cuenly:billing:lock";
const LOCK_TTL_SECONDS: u64 = 600;

/// Retry ladder (in days) indexed by `retry_count` (0-based). A 4th
/// failure (index 3, i.e. `retry_count == 3` at the time of a new
/// failure) cancels the subscription outright.
const RETRY_LADDER_DAYS: [i64; 3] = [1, 3, 7];

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct DueSubscription {
    pub tenant_id: String,
    pub owner_email: String,
    pub plan_ai_invoice_limit: u32,
    pub billing_day_of_month: u8,
    pub retry_count: u8,
    /// The resolved Pagopar user id, already deduplicated across the
    /// three sources (payment method, user record, subscription).
    pub pagopar_user_id: Option<String>,
    pub amount: Decimal,
}

#[derive(Clone, Debug)]
pub struct PaymentOutcome {
    pub success: bool,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
}

/// The storage/gateway boundary the billing sweep drives. Implemented
/// against Mongo + the Pagopar gateway in the binary; an in-memory fake
/// backs the unit tests below.
#[async_trait]
pub trait BillingBackend: Send + Sync {
    async fn due_subscriptions(&self, today: NaiveDate) -> anyhow::Result<Vec<DueSubscription>>;

    /// Subscriptions whose `next_billing_date`'s day-of-month anniversary
    /// falls on `today`, used for the AI-quota-reset fallback that runs
    /// regardless of billing outcome.
    async fn anniversary_subscriptions(
        &self,
        today: NaiveDate,
    ) -> anyhow::Result<Vec<DueSubscription>>;

    async fn create_order_and_charge(
        &self,
        sub: &DueSubscription,
    ) -> anyhow::Result<PaymentOutcome>;

    async fn on_payment_success(
        &self,
        sub: &DueSubscription,
        next_billing_date: NaiveDate,
        outcome: &PaymentOutcome,
    ) -> anyhow::Result<()>;

    async fn on_payment_failure(
        &self,
        sub: &DueSubscription,
        new_status: SubscriptionStatus,
        next_billing_date: Option<NaiveDate>,
        outcome: &PaymentOutcome,
    ) -> anyhow::Result<()>;

    async fn reset_ai_quota(&self, sub: &DueSubscription) -> anyhow::Result<()>;
}

pub struct BillingSweep<B> {
    client: redis::Client,
    backend: B,
}

impl<B: BillingBackend> BillingSweep<B> {
    pub fn new(client: redis::Client, backend: B) -> Self {
        Self { client, backend }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self, today: NaiveDate) -> Result<(), BillingError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let acquired: bool = redis::cmd("SET")
            .arg(LOCK_KEY)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECONDS)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if !acquired {
            info!("billing sweep already running elsewhere, skipping");
            return Ok(());
        }

        let due = self.backend.due_subscriptions(today).await?;
        for sub in &due {
            if let Err(e) = self.bill_one(sub, today).await {
                warn!(tenant = %sub.tenant_id, error = %e, "billing attempt errored");
            }
        }

        // AI-quota reset runs daily as a fallback, independent of billing
        // outcome, for every subscription whose anniversary is today.
        let anniversaries = self.backend.anniversary_subscriptions(today).await?;
        for sub in &anniversaries {
            if let Err(e) = self.backend.reset_ai_quota(sub).await {
                warn!(tenant = %sub.tenant_id, error = %e, "ai quota reset failed");
            }
        }

        Ok(())
    }

    async fn bill_one(&self, sub: &DueSubscription, today: NaiveDate) -> anyhow::Result<()> {
        let outcome = self.backend.create_order_and_charge(sub).await?;

        if outcome.success {
            let next_billing_date = anniversary(sub.billing_day_of_month, today);
            self.backend
                .on_payment_success(sub, next_billing_date, &outcome)
                .await?;
        } else {
            let retry_index = sub.retry_count as usize;
            if retry_index >= RETRY_LADDER_DAYS.len() {
                self.backend
                    .on_payment_failure(sub, SubscriptionStatus::Cancelled, None, &outcome)
                    .await?;
            } else {
                let retry_days = RETRY_LADDER_DAYS[retry_index];
                let next_billing_date = today + chrono::Duration::days(retry_days);
                self.backend
                    .on_payment_failure(
                        sub,
                        SubscriptionStatus::PastDue,
                        Some(next_billing_date),
                        &outcome,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// The next occurrence of `day_of_month` strictly after `from`'s month,
/// clamped to the length of the following month (e.g. anniversary day 31
/// for a billing month with only 30 days becomes the 30th).
pub fn anniversary(day_of_month: u8, from: NaiveDate) -> NaiveDate {
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };

    let days_in_month = days_in_month(year, month);
    let day = u32::from(day_of_month).min(days_in_month);
    NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is always valid")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid calendar month");
    let first_of_this =
        NaiveDate::from_ymd_opt(year, month, 1).expect("valid calendar month");
    (first_of_next - first_of_this).num_days() as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anniversary_clamps_to_shorter_month() {
        let from = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        assert_eq!(anniversary(31, from), NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
    }

    #[test]
    fn anniversary_wraps_december_into_next_year() {
        let from = NaiveDate::from_ymd_opt(2026, 12, 15).unwrap();
        assert_eq!(anniversary(15, from), NaiveDate::from_ymd_opt(2027, 1, 15).unwrap());
    }

    #[test]
    fn anniversary_keeps_exact_day_when_month_long_enough() {
        let from = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        assert_eq!(anniversary(20, from), NaiveDate::from_ymd_opt(2026, 4, 20).unwrap());
    }

    #[test]
    fn retry_ladder_has_three_steps_before_cancellation() {
        assert_eq!(RETRY_LADDER_DAYS, [1, 3, 7]);
    }
}
