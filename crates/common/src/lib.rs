//! Shared types used across the webhook reliability workspace.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{DeadLetterId, JobId, SagaId};
