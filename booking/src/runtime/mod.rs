//! Background runtime of the booking service.
//!
//! - **`consumer`**: subscription consumer with reconnection, deadlines and dead-lettering
//! - **`handlers`**: the handler trait and the snapshot handlers
//! - **`lifecycle`**: application lifecycle and graceful shutdown

pub mod consumer;
pub mod handlers;
pub mod lifecycle;

pub use consumer::ChangeConsumer;
pub use handlers::{
    ChangeHandler, EventSnapshotHandler, HandleOutcome, HandlerError, UserSnapshotHandler,
};
pub use lifecycle::Application;
