//! In-memory payment ledger.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::UserId;
use crate::error::{Error, PaymentError, Result};
use crate::port::PaymentService;

#[derive(Default)]
struct Accounts {
    owners: HashMap<UserId, String>,
    balances: HashMap<String, Decimal>,
    /// Successful moves left before one injected failure.
    fail_after: Option<usize>,
}

/// Account balances keyed by account id. Balances never go negative.
#[derive(Default)]
pub struct MemoryLedger {
    accounts: Mutex<Accounts>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or top up) the account of `user`. Returns its id.
    pub fn open_account(&self, user: &UserId, deposit: Decimal) -> String {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .owners
            .entry(user.clone())
            .or_insert_with(|| format!("acct-{user}"))
            .clone();
        *accounts.balances.entry(account.clone()).or_default() += deposit;
        account
    }

    #[must_use]
    pub fn balance(&self, user: &UserId) -> Option<Decimal> {
        let accounts = self.accounts.lock();
        let account = accounts.owners.get(user)?;
        accounts.balances.get(account).copied()
    }

    /// Let `successes` more balance moves through, then fail the next one.
    pub fn fail_after(&self, successes: usize) {
        self.accounts.lock().fail_after = Some(successes);
    }

    fn apply_move(&self, account: &str, delta: Decimal) -> Result<()> {
        if delta == Decimal::ZERO {
            return Err(PaymentError::NonPositiveAmount(delta).into());
        }
        let mut accounts = self.accounts.lock();
        if let Some(left) = accounts.fail_after {
            if left == 0 {
                accounts.fail_after = None;
                return Err(Error::upstream("payments", "injected failure"));
            }
            accounts.fail_after = Some(left - 1);
        }
        let balance = accounts
            .balances
            .get_mut(account)
            .ok_or_else(|| PaymentError::UnknownAccount(account.to_string()))?;
        let next = balance
            .checked_add(delta)
            .ok_or(Error::Overflow("account balance"))?;
        if next < Decimal::ZERO {
            return Err(PaymentError::InsufficientFunds {
                account: account.to_string(),
                balance: *balance,
                requested: -delta,
            }
            .into());
        }
        *balance = next;
        debug!(account, %delta, balance = %*balance, "Balance moved");
        Ok(())
    }
}

#[async_trait]
impl PaymentService for MemoryLedger {
    async fn account_id(&self, user: &UserId) -> Result<String> {
        self.accounts
            .lock()
            .owners
            .get(user)
            .cloned()
            .ok_or_else(|| PaymentError::UnknownUser(user.to_string()).into())
    }

    async fn increase(&self, account: &str, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(PaymentError::NonPositiveAmount(amount).into());
        }
        self.apply_move(account, amount)
    }

    async fn decrease(&self, account: &str, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(PaymentError::NonPositiveAmount(amount).into());
        }
        self.apply_move(account, -amount)
    }
}
