//! Statistics and metrics

pub mod metrics;

pub use metrics::{
    LinkStats, PipelineSnapshot, PipelineStats, RelaySnapshot, RelayStats,
};
