//! Event layer: state transitions are published to observers instead of a
//! windowing toolkit. The GUI (or any other consumer) subscribes through
//! `EventSink` without the core depending on it.
mod store;
mod types;

pub use store::{EventBus, EventSink, InMemoryEventLog, TracingEventSink};
pub use types::{SearchEvent, SearchEventKind};
