mod hub;
mod terminal_sink;
mod types;

pub use hub::{EventHub, EventSink};
pub use terminal_sink::TerminalEventSink;
pub use types::{
    CircuitBreakerAlertEvent, DownstreamEvent, Event, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, QuotaAlertEvent, UnavailableEndEvent,
    UnavailableStartEvent, UpstreamEvent,
};
