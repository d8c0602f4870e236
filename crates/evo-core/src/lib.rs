//! evo-core: job-lifecycle scheduler and the contracts it drives.
//!
//! The scheduler advances each tracked structure through its job state
//! machine, one pass at a time, against a `QueueInterface` (job submission)
//! and an `Optimizer` (input generation and output interpretation). All
//! cross-structure shared state lives behind the queue implementation; the
//! scheduler itself only shares the tracker and the event bus.
pub mod errors;
pub mod event;
pub mod optimizer;
pub mod queue;
pub mod scheduler;
pub mod tracker;

pub use errors::{OptimizerError, QueueError, SchedulerError};
pub use event::{EventBus, EventSink, InMemoryEventLog, SearchEvent, SearchEventKind, TracingEventSink};
pub use optimizer::{LocalRunSpec, Optimizer, OutputVerdict};
pub use queue::{CompletionProbe, QueueInterface, QueueStatus};
pub use scheduler::{FailAction, Scheduler, SchedulerBuilder, SchedulerOptions};
pub use tracker::{StructureHandle, Tracker};
