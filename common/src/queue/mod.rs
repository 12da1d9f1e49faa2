// Hand-off to the external execution engine over NATS JetStream

pub mod enqueue;
pub mod nats;

pub use enqueue::{DispatchRequest, JobEnqueuer, NatsJobEnqueuer};
pub use nats::{NatsClient, NatsConfig};
