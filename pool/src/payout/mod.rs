pub mod block;
pub mod payments;
pub mod rewards;
pub mod unlocker;

pub use block::{BlockRecord, BlockStatus};
pub use payments::{PaymentProcessor, PaymentSettings};
pub use unlocker::{BlockUnlocker, UnlockerConfig};
