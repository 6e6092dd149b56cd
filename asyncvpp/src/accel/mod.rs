//! The accelerator collaborator.
//!
//! Every stage is an asynchronous submit: the call returns as soon as the device has
//! either accepted or rejected the work, and completion is observed later by waiting on
//! the returned [`SyncPoint`]. Only the waits on encode tokens are ever performed by the
//! driver; decode and transform completion is observed transitively.

use std::fmt;
use std::time::Duration;

use crate::data::{Bitstream, FrameInfo};
use crate::pool::{Surface, SurfacePool};
use crate::PipelineError;

pub mod loopback;
#[cfg(test)]
pub(crate) mod scripted;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Transform,
    Encode,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Decode, Stage::Transform, Stage::Encode];

    pub(crate) const fn index(&self) -> usize {
        match self {
            Stage::Decode => 0,
            Stage::Transform => 1,
            Stage::Encode => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Transform => "transform",
            Stage::Encode => "encode",
        };
        f.write_str(name)
    }
}

// Raw negative status reported by the device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceStatus(pub i32);

impl DeviceStatus {
    pub const UNKNOWN: DeviceStatus = DeviceStatus(-1);
    pub const NOT_ENOUGH_BUFFER: DeviceStatus = DeviceStatus(-5);
    pub const INVALID_HANDLE: DeviceStatus = DeviceStatus(-6);
    pub const UNDEFINED_BEHAVIOR: DeviceStatus = DeviceStatus(-16);
    pub const DEVICE_FAILED: DeviceStatus = DeviceStatus(-17);
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            DeviceStatus::UNKNOWN => "unknown",
            DeviceStatus::NOT_ENOUGH_BUFFER => "not enough buffer",
            DeviceStatus::INVALID_HANDLE => "invalid handle",
            DeviceStatus::UNDEFINED_BEHAVIOR => "undefined behavior",
            DeviceStatus::DEVICE_FAILED => "device failed",
            _ => return write!(f, "{}", self.0),
        };
        write!(f, "{} ({name})", self.0)
    }
}

// Opaque completion token
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SyncPoint(pub u64);

// What a single submit call produced
#[derive(Debug)]
pub enum Submit<T> {
    // accepted; T carries the completion token (and output, for decode)
    Ready(T),
    // transient, nothing was accepted; repeat the same call
    Busy,
    // consumed everything it was given without producing output. With a `None`
    // input this means the stage is fully drained.
    NeedMoreInput,
    // could emit more outputs from input it already holds
    NeedMoreOutput,
    Fatal(DeviceStatus),
}

#[derive(Debug)]
pub enum SyncStatus {
    Ready,
    TimedOut,
    Fatal(DeviceStatus),
}

// A frame the decoder has made available. With reordering this need not be the work
// surface passed to the same call.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub surface: Surface,
    pub sync: SyncPoint,
}

#[derive(Debug, Copy, Clone)]
pub struct AllocRequest {
    pub info: FrameInfo,
    pub num_suggested: u16,
}

// Answer to the one-time surface sizing query
#[derive(Debug, Copy, Clone)]
pub struct SurfaceRequirements {
    pub decode_out: AllocRequest,
    pub transform_in: AllocRequest,
    pub transform_out: AllocRequest,
    pub encode_in: AllocRequest,
}

impl SurfaceRequirements {
    // (info, count) of the pool between decode and transform
    pub fn decoded_pool(&self, async_depth: u16) -> (FrameInfo, usize) {
        let count = self.decode_out.num_suggested as usize
            + self.transform_in.num_suggested as usize
            + async_depth as usize;
        (self.decode_out.info, count)
    }

    // (info, count) of the pool between transform and encode
    pub fn transformed_pool(&self, async_depth: u16) -> (FrameInfo, usize) {
        let count = self.encode_in.num_suggested as usize
            + self.transform_out.num_suggested as usize
            + async_depth as usize;
        (self.encode_in.info, count)
    }
}

pub trait Accelerator {
    fn query_surfaces(&self) -> SurfaceRequirements;

    // Largest encoded frame the encoder may emit; sizes the task buffers
    fn max_bitstream_size(&self) -> usize;

    // Hands the device the pools it will be given surfaces from
    fn attach(
        &mut self,
        decoded: &SurfacePool,
        transformed: &SurfacePool,
    ) -> Result<(), PipelineError>;

    // `None` input asks the decoder to emit whatever it still buffers
    fn decode(&mut self, input: Option<&mut Bitstream>, work: &Surface) -> Submit<Decoded>;

    fn transform(&mut self, input: Option<&Surface>, output: &Surface) -> Submit<SyncPoint>;

    // The encoded bytes are delivered into the task bitstream by `sync`
    fn encode(&mut self, input: Option<&Surface>) -> Submit<SyncPoint>;

    fn sync(&mut self, point: SyncPoint, timeout: Duration, output: &mut Bitstream)
        -> SyncStatus;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::FourCc;

    #[test]
    fn pool_sizing_adds_async_depth() {
        let info_in = FrameInfo::new(FourCc::P010, 64, 64);
        let info_out = FrameInfo::new(FourCc::Nv12, 32, 32);
        let req = SurfaceRequirements {
            decode_out: AllocRequest {
                info: info_in,
                num_suggested: 3,
            },
            transform_in: AllocRequest {
                info: info_in,
                num_suggested: 1,
            },
            transform_out: AllocRequest {
                info: info_out,
                num_suggested: 1,
            },
            encode_in: AllocRequest {
                info: info_out,
                num_suggested: 2,
            },
        };
        assert_eq!(req.decoded_pool(4), (info_in, 8));
        assert_eq!(req.transformed_pool(4), (info_out, 7));
    }

    #[test]
    fn status_display() {
        assert_eq!(DeviceStatus::DEVICE_FAILED.to_string(), "-17 (device failed)");
        assert_eq!(DeviceStatus(-42).to_string(), "-42");
        assert_eq!(Stage::Transform.to_string(), "transform");
    }
}
