pub mod events;
pub mod idempotency;
pub mod persistence;
pub mod processor;

pub use events::{EventHandler, HandlerRegistry};
pub use idempotency::IdempotencyService;
pub use persistence::BatchPersistService;
pub use processor::MessageProcessor;
