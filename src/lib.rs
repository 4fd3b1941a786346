pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod performance;
pub mod rate_controller;
pub mod source;
pub mod strategy;

pub use config::{
    CollectorConfig, ConnectionConfig, PagecastConfig, StrategyPreference, StreamSettings,
};
pub use connection::{ConnectionManager, ConnectionPhase, Connector, Outbound, WebSocketConnector};
pub use error::{PagecastError, Result};
pub use orchestrator::{SessionHandle, SessionSettings, SettingsUpdate, StreamingOrchestrator};
pub use performance::{
    build_frame_header, parse_frame_header, AggregatedStats, Bottleneck, BottleneckKind,
    FrameHeader, PerformanceCollector,
};
pub use rate_controller::{
    ControllerConfig, ControllerOverrides, ControllerState, FrameDecision, RateController,
};
pub use source::{CaptureSource, FixedSourceProvider, SourceId, SourceProvider};
pub use strategy::{CaptureStrategy, StrategyHandle, SubscriptionRegistry};

#[cfg(feature = "synthetic")]
pub use source::{SyntheticProvider, SyntheticSource};
