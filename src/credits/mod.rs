//! Credit gate: metered usage checks in front of every generation.
//!
//! All balance mutations go through the single atomic check-and-decrement in
//! `PrefabDb::consume_credits`; this layer adds the typed failure signals and
//! the per-plan project cap, which is only checked for creation requests.

use anyhow::Result;

use crate::db::DbHandle;
use crate::errors::GenerateError;
use crate::models::{CreditType, UsageRecord, UsageType};

/// Project cap for the free plan. Paid plans are uncapped here; their limits
/// live with the billing collaborator.
pub const FREE_PLAN_PROJECT_LIMIT: i64 = 3;

#[derive(Clone)]
pub struct CreditGate {
    db: DbHandle,
}

impl CreditGate {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Non-consuming balance check.
    pub async fn has_credits(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
    ) -> Result<bool> {
        let user_id = user_id.to_string();
        let balance = self
            .db
            .call(move |db| db.get_balance(&user_id, credit_type))
            .await?;
        Ok(balance >= amount)
    }

    /// Atomically consume credits and record the usage. Two racing requests
    /// at the floor cannot both succeed.
    pub async fn track_and_consume(
        &self,
        user_id: &str,
        usage_type: UsageType,
        credit_type: CreditType,
        amount: i64,
        details: Option<String>,
    ) -> Result<UsageRecord, GenerateError> {
        let user = user_id.to_string();
        let consumed = self
            .db
            .call(move |db| {
                db.consume_credits(&user, usage_type, credit_type, amount, details.as_deref())
            })
            .await
            .map_err(GenerateError::Database)?;

        match consumed {
            Some(record) => Ok(record),
            None => {
                let user = user_id.to_string();
                let available = self
                    .db
                    .call(move |db| db.get_balance(&user, credit_type))
                    .await
                    .map_err(GenerateError::Database)?;
                Err(GenerateError::InsufficientCredits {
                    credit_type: credit_type.as_str().to_string(),
                    needed: amount,
                    available,
                })
            }
        }
    }

    /// Roll back a ledger entry after a downstream failure. Idempotent.
    pub async fn refund(&self, usage_id: &str) -> Result<bool> {
        let usage_id = usage_id.to_string();
        self.db.call(move |db| db.refund_usage(&usage_id)).await
    }

    /// Per-plan project cap, checked only for creation requests. Distinct
    /// from credit exhaustion: a user can hold project credits and still be
    /// over the plan cap.
    pub async fn check_project_limit(&self, user_id: &str) -> Result<(), GenerateError> {
        let user = user_id.to_string();
        let count = self
            .db
            .call(move |db| db.count_projects(&user))
            .await
            .map_err(GenerateError::Database)?;
        if count >= FREE_PLAN_PROJECT_LIMIT {
            return Err(GenerateError::ProjectLimitReached {
                plan: "free".to_string(),
                limit: FREE_PLAN_PROJECT_LIMIT,
            });
        }
        Ok(())
    }
}
