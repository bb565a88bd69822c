//! Price service port.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Instrument, PriceTick};
use crate::error::Result;

/// Live and point-in-time prices.
#[async_trait]
pub trait PriceService: Send + Sync {
    /// Block until the next batch of ticks for subscribed instruments.
    ///
    /// Returns `Error::Canceled` once `cancel` fires.
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<PriceTick>>;

    /// Replace the set of instruments the stream delivers.
    async fn update_subscription(&self, instruments: &[Instrument]) -> Result<()>;

    /// Latest quote for each requested instrument. Unknown names are absent
    /// from the result.
    async fn current_prices(
        &self,
        instruments: &[Instrument],
    ) -> Result<HashMap<Instrument, PriceTick>>;
}
