pub use self::queue::QueueMetrics;

#[macro_use]
mod macros;

mod queue;

load_metric_type!(IntGauge as single);
load_metric_type!(IntCounter as single);
load_metric_type!(IntCounterVec as vec);
