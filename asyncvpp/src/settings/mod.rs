use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;

use crate::accel::loopback::LoopbackConfig;
use crate::strategy::BusyStrategy;
use crate::{PipelineError, MAX_ASYNC_DEPTH};

pub const DEFAULT_ASYNC_DEPTH: usize = 4;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_BITSTREAM_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100;

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BusyJson {
    Yield,
    Sleep { sleep_us: u64 },
    Backoff { initial_us: u64, max_us: u64 },
}

impl Default for BusyJson {
    fn default() -> Self {
        BusyJson::Sleep { sleep_us: 1000 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SettingsJson {
    pub async_depth: usize,
    pub sync_timeout_ms: u64,
    // size of the decoder's compressed input buffer
    pub bitstream_buffer_size: usize,
    // 0 -- no progress lines
    pub progress_interval: u64,
    pub busy: BusyJson,
}

impl Default for SettingsJson {
    fn default() -> Self {
        Self {
            async_depth: DEFAULT_ASYNC_DEPTH,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            bitstream_buffer_size: DEFAULT_BITSTREAM_BUFFER_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            busy: BusyJson::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub async_depth: usize,
    pub sync_timeout: Duration,
    pub bitstream_buffer_size: usize,
    pub progress_interval: u64,
    pub busy: BusyStrategy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            async_depth: DEFAULT_ASYNC_DEPTH,
            sync_timeout: Duration::from_millis(DEFAULT_SYNC_TIMEOUT_MS),
            bitstream_buffer_size: DEFAULT_BITSTREAM_BUFFER_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            busy: BusyStrategy::default(),
        }
    }
}

impl TryFrom<SettingsJson> for PipelineSettings {
    type Error = PipelineError;

    fn try_from(value: SettingsJson) -> Result<Self, Self::Error> {
        let busy = match value.busy {
            BusyJson::Yield => BusyStrategy::Yield,
            BusyJson::Sleep { sleep_us } => {
                BusyStrategy::new_sleep(Duration::from_micros(sleep_us))?
            }
            BusyJson::Backoff { initial_us, max_us } => BusyStrategy::new_backoff(
                Duration::from_micros(initial_us),
                Duration::from_micros(max_us),
            )?,
        };
        if value.sync_timeout_ms == 0 {
            return Err(PipelineError::InvalidSettings(
                "sync_timeout_ms must be positive".into(),
            ));
        }
        if value.bitstream_buffer_size == 0 {
            return Err(PipelineError::InvalidSettings(
                "bitstream_buffer_size must be positive".into(),
            ));
        }
        let settings = Self {
            async_depth: DEFAULT_ASYNC_DEPTH,
            sync_timeout: Duration::from_millis(value.sync_timeout_ms),
            bitstream_buffer_size: value.bitstream_buffer_size,
            progress_interval: value.progress_interval,
            busy,
        };
        settings.with_async_depth(value.async_depth)
    }
}

impl PipelineSettings {
    pub fn with_async_depth(mut self, async_depth: usize) -> Result<Self, PipelineError> {
        if async_depth == 0 || async_depth > MAX_ASYNC_DEPTH {
            return Err(PipelineError::InvalidAsyncDepth(async_depth));
        }
        self.async_depth = async_depth;
        Ok(self)
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_busy(mut self, busy: BusyStrategy) -> Self {
        self.busy = busy;
        self
    }

    pub fn from_json_slice(buf: &[u8]) -> Result<Self, PipelineError> {
        let json: SettingsJson = serde_json::from_slice(buf)?;
        json.try_into()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunConfigJson {
    pub pipeline: SettingsJson,
    pub loopback: LoopbackConfig,
}

// Everything a binary needs to run: pipeline settings plus the software device's formats
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub pipeline: PipelineSettings,
    pub loopback: LoopbackConfig,
}

impl TryFrom<RunConfigJson> for RunConfig {
    type Error = PipelineError;

    fn try_from(value: RunConfigJson) -> Result<Self, Self::Error> {
        let pipeline: PipelineSettings = value.pipeline.try_into()?;
        let frame = value.loopback.decode.frame_size();
        if pipeline.bitstream_buffer_size < frame {
            return Err(PipelineError::InvalidSettings(format!(
                "bitstream_buffer_size {} cannot hold one {frame} byte input frame",
                pipeline.bitstream_buffer_size
            )));
        }
        Ok(Self {
            pipeline,
            loopback: value.loopback,
        })
    }
}

impl RunConfig {
    pub fn from_json_slice(buf: &[u8]) -> Result<Self, PipelineError> {
        let json: RunConfigJson = serde_json::from_slice(buf)?;
        json.try_into()
    }

    pub fn from_json_file_sync(file: &str) -> Result<Self, PipelineError> {
        let mut fh = std::fs::File::open(file)?;
        let mut buf = Vec::new();
        let _sz = fh.read_to_end(&mut buf)?;
        Self::from_json_slice(buf.as_slice())
    }

    pub async fn from_json_file_async(file: &str) -> Result<Self, PipelineError> {
        let mut fh = tokio::fs::File::open(file).await?;
        let mut buf = Vec::new();
        let _sz = fh.read_to_end(&mut buf).await?;
        Self::from_json_slice(buf.as_slice())
    }
}
