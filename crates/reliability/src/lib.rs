//! Reliability primitives shared by the job pipeline and the checkout saga.
//!
//! - [`ProcessError`] / [`ErrorKind`]: typed failure taxonomy driving retry decisions
//! - [`CircuitBreaker`] and [`CircuitBreakerRegistry`]: per-service failure isolation
//! - [`RetryPolicy`]: capped exponential backoff
//! - [`EventBus`]: named in-process events with registered handlers

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod event_bus;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitState,
};
pub use error::{ErrorKind, ProcessError, Result, TransientKind};
pub use event_bus::{EventBus, EventBusBuilder, EventHandler, RecordedEvent, RecordingHandler};
