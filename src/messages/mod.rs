pub mod types;

pub use types::{CorrelationId, Normalized, ResponseEvent, ToolNotification, TransportEvent};
