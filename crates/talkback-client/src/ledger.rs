//! Metered billing against the backend token ledger
//!
//! The remote ledger is authoritative. A session may start only while the
//! balance is above the start threshold, and every response is paid for
//! before the session continues. When a debit leaves the balance at or below
//! the continue threshold the remainder is swept in one final charge and the
//! session must end.

use std::sync::Arc;
use talkback_protocol::{DeductTokensRequest, TokenUsage, UserId};

use crate::error::SessionError;
use crate::network::{ApiError, Backend};

/// Result of a balance probe. Never an error: failures read as "cannot proceed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceCheck {
    pub balance: i64,
    pub can_proceed: bool,
    pub error: Option<String>,
}

pub struct TokenLedger {
    backend: Arc<dyn Backend>,
    min_to_start: i64,
    min_to_continue: i64,
}

impl TokenLedger {
    pub fn new(backend: Arc<dyn Backend>, min_to_start: i64, min_to_continue: i64) -> Self {
        Self {
            backend,
            min_to_start,
            min_to_continue,
        }
    }

    pub fn min_to_start(&self) -> i64 {
        self.min_to_start
    }

    pub async fn check_balance(&self, user_id: UserId) -> BalanceCheck {
        match self.backend.token_balance(user_id).await {
            Ok(balance) => BalanceCheck {
                balance,
                can_proceed: balance > self.min_to_start,
                error: None,
            },
            Err(e) => {
                tracing::warn!("Balance check failed for user {}: {}", user_id, e);
                BalanceCheck {
                    balance: 0,
                    can_proceed: false,
                    error: Some(e.reason()),
                }
            }
        }
    }

    /// Charge `usage` and return the new balance
    pub async fn debit(
        &self,
        user_id: UserId,
        session_id: &str,
        usage: TokenUsage,
    ) -> Result<i64, ApiError> {
        let request = DeductTokensRequest {
            user_id,
            session_id: session_id.to_string(),
            usage,
            check_only: false,
        };
        let result = self.backend.deduct_tokens(&request).await?;
        tracing::debug!(
            "Debited {} tokens for {}, balance now {}",
            result.tokens_used,
            session_id,
            result.new_balance
        );
        Ok(result.new_balance)
    }

    /// Charge whatever balance is left. Failures are logged and dropped.
    ///
    /// Returns true when the remainder was actually charged.
    pub async fn sweep(&self, user_id: UserId, balance: i64) -> bool {
        if balance <= 0 {
            return false;
        }
        let session_id = format!("cleanup_{}", chrono::Utc::now().timestamp_millis());
        match self.debit(user_id, &session_id, TokenUsage::sweep(balance)).await {
            Ok(_) => {
                tracing::info!("Swept remaining {} tokens for user {}", balance, user_id);
                true
            }
            Err(e) => {
                tracing::warn!("Sweep of {} tokens failed: {}", balance, e);
                false
            }
        }
    }

    /// Pay for one response.
    ///
    /// The balance is checked first. An ineligible balance is swept without
    /// charging the response. Otherwise the response is debited, and a debit
    /// that lands at or below the continue threshold sweeps what is left.
    ///
    /// # Arguments
    /// * `user_id` - Account the response is charged to
    /// * `response_id` - Provider response id, recorded as the ledger session id
    /// * `usage` - Token usage reported with `response.done`
    ///
    /// # Returns
    /// The new balance when the session may continue, otherwise the error that
    /// terminates it: `InsufficientBalance`, `TokensExhausted` or
    /// `LedgerUnavailable`.
    pub async fn settle_response(
        &self,
        user_id: UserId,
        response_id: &str,
        usage: TokenUsage,
    ) -> Result<i64, SessionError> {
        let check = self.check_balance(user_id).await;
        if let Some(error) = check.error {
            return Err(SessionError::LedgerUnavailable(error));
        }
        if !check.can_proceed {
            self.sweep(user_id, check.balance).await;
            return Err(SessionError::InsufficientBalance {
                balance: check.balance,
            });
        }

        let new_balance = match self.debit(user_id, response_id, usage).await {
            Ok(balance) => balance,
            Err(e) if e.is_insufficient_tokens() => {
                return Err(SessionError::InsufficientBalance {
                    balance: check.balance,
                });
            }
            Err(e) => return Err(SessionError::LedgerUnavailable(e.reason())),
        };

        if new_balance <= self.min_to_continue {
            tracing::info!(
                "Balance {} at or below {}, ending session",
                new_balance,
                self.min_to_continue
            );
            self.sweep(user_id, new_balance).await;
            return Err(SessionError::TokensExhausted);
        }

        Ok(new_balance)
    }
}
