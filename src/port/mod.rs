//! Trait definitions (hexagonal ports). Depend only on domain.
//!
//! The core consumes four collaborators through these narrow interfaces:
//!
//! - [`PositionStore`] - position rows and the ordered change feed
//! - [`PriceService`] - tick stream, subscription, point-in-time quotes
//! - [`PaymentService`] - account lookup and balance moves
//! - [`Transactor`] - storage transaction boundary used by settlement

mod payment;
mod price;
mod store;
mod transaction;

pub use payment::PaymentService;
pub use price::PriceService;
pub use store::PositionStore;
pub use transaction::{within_transaction, StoreTransaction, Transactor};
