use std::time::Duration;

use thiserror::Error;

pub const MAX_ASYNC_DEPTH: usize = 64;

pub mod accel;
pub mod data;
pub mod driver;
pub mod invoker;
pub mod pool;
pub mod settings;
pub mod strategy;
pub mod stream;

use accel::{Accelerator, DeviceStatus, Stage};
use driver::{Pipeline, RunSummary};
use settings::PipelineSettings;
use stream::{ChunkSink, ChunkSource};

// Run `source` through decode -> transform -> encode on `device` and write the encoded
// frames to `sink`, keeping at most `async_depth` encode operations outstanding.
//
// On failure everything flushed before the failure stays in the sink.
pub fn run_pipeline<A, S, K>(
    device: &mut A,
    source: S,
    sink: K,
    async_depth: usize,
) -> Result<RunSummary, PipelineError>
where
    A: Accelerator,
    S: ChunkSource,
    K: ChunkSink,
{
    let settings = PipelineSettings::default().with_async_depth(async_depth)?;
    Pipeline::new(device, settings).run(source, sink)
}

// Installs the fmt subscriber on stderr, leaving stdout for encoded output. `RUST_LOG`
// wins over `debug`.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_filter = if debug {
        "asyncvpp_transcode=debug"
    } else {
        "asyncvpp_transcode=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// One erring to rule them all...
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Accelerator {stage} failed with status {status}")]
    Accelerator { stage: Stage, status: DeviceStatus },
    #[error("Accelerator {stage} asked for more output surfaces; one-to-many frames unsupported")]
    NeedMoreOutput { stage: Stage },
    #[error("Timed out after {timeout:?} waiting on frame {frame}")]
    SyncTimeout { frame: u64, timeout: Duration },
    #[error("Waiting on encode completion failed with status {status}")]
    SyncFailed { status: DeviceStatus },
    #[error("No free {stage} surface after {waited:?}")]
    SurfacesExhausted { stage: Stage, waited: Duration },
    #[error("Encoded frame of {needed} bytes exceeds task buffer of {capacity}")]
    NotEnoughBuffer { needed: usize, capacity: usize },
    #[error("Input bitstream buffer of {capacity} bytes is full")]
    BitstreamOverflow { capacity: usize },
    #[error("Task {index} out of FIFO order, expected {expected}")]
    TaskOutOfOrder { index: usize, expected: usize },
    #[error("Invalid async depth {0}")]
    InvalidAsyncDepth(usize),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error("Problem reading from source")]
    SourceRead(#[source] std::io::Error),
    #[error("Problem writing to sink")]
    SinkWrite(#[source] std::io::Error),
    #[error("Unexpected IO error")]
    IoErr(#[from] std::io::Error),
    #[error("Unexpected Json error")]
    JsonErr(#[from] serde_json::Error),
    #[error("Device lost: {0}")]
    DeviceLost(String),
    #[error("Tokio error")]
    TokioErr,
}

impl PipelineError {
    // Stage a failure is attributed to, if any
    pub fn stage(&self) -> Option<Stage> {
        use PipelineError::*;
        match self {
            Accelerator { stage, .. } | NeedMoreOutput { stage } | SurfacesExhausted { stage, .. } => {
                Some(*stage)
            }
            SyncTimeout { .. } | SyncFailed { .. } | NotEnoughBuffer { .. } => Some(Stage::Encode),
            BitstreamOverflow { .. } => Some(Stage::Decode),
            _ => None,
        }
    }
}
