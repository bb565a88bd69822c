//! Exchange-agnostic domain types: positions, ticks, change and closure
//! events, the threshold predicate, margin math and settlement transfers.
//!
//! Nothing here performs I/O or spawns tasks.

pub mod event;
pub mod id;
pub mod margin;
pub mod position;
pub mod price;
pub mod settlement;
pub mod watch;

pub use event::{ChangeEvent, ChangeKind, CloseReason, ClosureEvent};
pub use id::{Instrument, PositionId, UserId};
pub use margin::{Liquidation, ShortBook};
pub use position::{Direction, Position};
pub use price::PriceTick;
pub use settlement::{Leg, Transfer};
pub use watch::WatchKind;
