//! Payment service port.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{Leg, UserId};
use crate::error::Result;

/// Account balances held by the payment microservice.
#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn account_id(&self, user: &UserId) -> Result<String>;

    async fn increase(&self, account: &str, amount: Decimal) -> Result<()>;

    async fn decrease(&self, account: &str, amount: Decimal) -> Result<()>;

    /// Issue one settlement leg.
    async fn apply(&self, account: &str, leg: Leg) -> Result<()> {
        match leg {
            Leg::Credit(amount) => self.increase(account, amount).await,
            Leg::Debit(amount) => self.decrease(account, amount).await,
        }
    }
}
