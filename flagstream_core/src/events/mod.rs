//! The insight pipeline: evaluation, identify and metric events are
//! accumulated by a single dispatcher, flushed in batches to a bounded pool
//! of workers, and shipped with retry to the control plane.
mod event;
mod processor;
mod sender;

pub use event::{
    EventUser, FlagEvent, FlagVariation, InsightEvent, Metric, MetricEvent, UserAttribute,
    UserEvent,
};
pub use processor::{EventProcessor, EventProcessorConfig, InsightProcessor, NullEventProcessor};
pub use sender::{EventSender, InsightSender};
