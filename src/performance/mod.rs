mod collector;
mod header;
mod stats;

pub use collector::{
    FrameTiming, FrameTimingRecord, PerformanceCollector, SharedCollector, StatsMessage,
};
pub use header::{build_frame_header, encode_frame, parse_frame_header, FrameHeader};
pub use stats::{percentile, AggregatedStats, Bottleneck, BottleneckKind, Percentiles};
