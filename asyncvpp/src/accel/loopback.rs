// A software stand-in for the accelerator.
//
// Each stage is an engine thread fed by a bounded queue, so decode, transform and encode
// really do run concurrently with each other and with the driver. A full queue answers
// Busy. Cross-stage dependencies are fences: a zero-capacity channel whose sender the
// producing job drops when it is done writing, which the consuming job waits on before
// reading.
//
// The "compressed" input is simply a run of raw frames in the decode format. Transform
// converts each frame to the encode format size (truncating or zero padding) and runs it
// through an optional 256 entry lookup table. Encode emits the transformed bytes as-is.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::accel::{
    Accelerator, AllocRequest, Decoded, DeviceStatus, Stage, Submit, SurfaceRequirements,
    SyncPoint, SyncStatus,
};
use crate::data::{Bitstream, FourCc, FrameInfo};
use crate::pool::{Surface, SurfacePool};
use crate::PipelineError;

const LUT_LEN: usize = 256;

fn default_queue_depth() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopbackConfig {
    pub decode: FrameInfo,
    pub encode: FrameInfo,
    // frames the decoder holds back before emitting
    #[serde(default)]
    pub decode_delay: usize,
    #[serde(default)]
    pub transform_delay: usize,
    #[serde(default)]
    pub encode_lookahead: usize,
    // capacity of each engine's submission queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    // simulated time the encoder spends per frame
    #[serde(default)]
    pub encode_latency_us: u64,
    #[serde(default)]
    pub lut: Option<Vec<u8>>,
}

// CIF NV12 straight through
impl Default for LoopbackConfig {
    fn default() -> Self {
        Self::identity(FrameInfo::new(FourCc::Nv12, 352, 288))
    }
}

impl LoopbackConfig {
    // Same format in and out, no buffering, no lookup table
    pub fn identity(info: FrameInfo) -> Self {
        Self {
            decode: info,
            encode: info,
            decode_delay: 0,
            transform_delay: 0,
            encode_lookahead: 0,
            queue_depth: default_queue_depth(),
            encode_latency_us: 0,
            lut: None,
        }
    }
}

type Frames = Arc<Vec<Mutex<Vec<u8>>>>;
type Fence = Receiver<()>;
type Encoded = Result<Vec<u8>, DeviceStatus>;

struct DecodeJob {
    data: Vec<u8>,
    dst: Surface,
    done: Sender<()>,
}

struct TransformJob {
    src: Surface,
    src_fence: Option<Fence>,
    dst: Surface,
    done: Sender<()>,
}

struct EncodeJob {
    src: Surface,
    src_fence: Option<Fence>,
    done: Sender<Encoded>,
}

struct Engines {
    decode_tx: Sender<DecodeJob>,
    transform_tx: Sender<TransformJob>,
    encode_tx: Sender<EncodeJob>,
    handles: Vec<(Stage, JoinHandle<()>)>,
}

pub struct LoopbackDevice {
    config: LoopbackConfig,
    lut: Option<Arc<[u8]>>,
    engines: Option<Engines>,
    // complete compressed frames taken from the input, not yet decoded
    compressed: VecDeque<Vec<u8>>,
    decoded_fences: Vec<Option<Fence>>,
    transformed_fences: Vec<Option<Fence>>,
    transform_queue: VecDeque<(Surface, Option<Fence>)>,
    encode_queue: VecDeque<(Surface, Option<Fence>)>,
    completions: HashMap<SyncPoint, Receiver<Encoded>>,
    next_sync: u64,
}

impl LoopbackDevice {
    pub fn new(config: LoopbackConfig) -> Result<Self, PipelineError> {
        if config.decode.frame_size() == 0 || config.encode.frame_size() == 0 {
            return Err(PipelineError::InvalidSettings(
                "loopback frame dimensions must be non-zero".into(),
            ));
        }
        if config.queue_depth == 0 {
            return Err(PipelineError::InvalidSettings(
                "loopback queue_depth must be positive".into(),
            ));
        }
        let lut = match &config.lut {
            Some(lut) if lut.len() != LUT_LEN => {
                return Err(PipelineError::InvalidSettings(format!(
                    "lookup table has {} entries, expected {LUT_LEN}",
                    lut.len()
                )))
            }
            Some(lut) => Some(Arc::from(lut.as_slice())),
            None => None,
        };
        Ok(Self {
            config,
            lut,
            engines: None,
            compressed: VecDeque::new(),
            decoded_fences: vec![],
            transformed_fences: vec![],
            transform_queue: VecDeque::new(),
            encode_queue: VecDeque::new(),
            completions: HashMap::new(),
            next_sync: 0,
        })
    }

    // Stop the engines once their queues are empty
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.stop_engines()
    }

    fn stop_engines(&mut self) -> Result<(), PipelineError> {
        let Some(engines) = self.engines.take() else {
            return Ok(());
        };
        let Engines {
            decode_tx,
            transform_tx,
            encode_tx,
            handles,
        } = engines;
        // closing the queues ends each engine's receive loop
        drop(decode_tx);
        drop(transform_tx);
        drop(encode_tx);
        let mut res = Ok(());
        for (stage, handle) in handles {
            if handle.join().is_err() {
                res = Err(PipelineError::DeviceLost(format!("{stage} engine panicked")));
            }
        }
        res
    }

    fn token(&mut self) -> SyncPoint {
        self.next_sync += 1;
        SyncPoint(self.next_sync)
    }

    fn spawn_engines(&self, decoded: Frames, transformed: Frames) -> Result<Engines, PipelineError> {
        let depth = self.config.queue_depth;
        let (decode_tx, decode_rx) = bounded::<DecodeJob>(depth);
        let (transform_tx, transform_rx) = bounded::<TransformJob>(depth);
        let (encode_tx, encode_rx) = bounded::<EncodeJob>(depth);
        let mut handles = Vec::with_capacity(3);

        let frames = decoded.clone();
        handles.push((
            Stage::Decode,
            spawn_engine(Stage::Decode, move || {
                for job in decode_rx.iter() {
                    if let Some(slot) = frames.get(job.dst.index()) {
                        let mut dst = slot.lock().unwrap_or_else(PoisonError::into_inner);
                        let n = job.data.len().min(dst.len());
                        dst[..n].copy_from_slice(&job.data[..n]);
                    }
                    trace!(surface = job.dst.index(), "decoded");
                    drop(job.done);
                }
            })?,
        ));

        let lut = self.lut.clone();
        let (src_frames, dst_frames) = (decoded, transformed.clone());
        handles.push((
            Stage::Transform,
            spawn_engine(Stage::Transform, move || {
                for job in transform_rx.iter() {
                    wait_fence(job.src_fence);
                    if let (Some(src), Some(dst)) =
                        (src_frames.get(job.src.index()), dst_frames.get(job.dst.index()))
                    {
                        let src = src.lock().unwrap_or_else(PoisonError::into_inner);
                        let mut dst = dst.lock().unwrap_or_else(PoisonError::into_inner);
                        convert(&src, &mut dst, lut.as_deref());
                    }
                    job.src.unlock();
                    trace!(src = job.src.index(), dst = job.dst.index(), "transformed");
                    drop(job.done);
                }
            })?,
        ));

        let latency = Duration::from_micros(self.config.encode_latency_us);
        handles.push((
            Stage::Encode,
            spawn_engine(Stage::Encode, move || {
                for job in encode_rx.iter() {
                    wait_fence(job.src_fence);
                    let encoded = match transformed.get(job.src.index()) {
                        Some(src) => Ok(src.lock().unwrap_or_else(PoisonError::into_inner).clone()),
                        None => Err(DeviceStatus::INVALID_HANDLE),
                    };
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    job.src.unlock();
                    trace!(src = job.src.index(), "encoded");
                    // nobody waiting any more is fine
                    let _ = job.done.send(encoded);
                }
            })?,
        ));

        Ok(Engines {
            decode_tx,
            transform_tx,
            encode_tx,
            handles,
        })
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        let _ = self.stop_engines();
    }
}

fn spawn_engine<F>(stage: Stage, body: F) -> Result<JoinHandle<()>, PipelineError>
where
    F: FnOnce() + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(format!("loopback-{stage}"))
        .spawn(move || {
            debug!(%stage, "engine up");
            body();
            debug!(%stage, "engine down");
        })?;
    Ok(handle)
}

// Returns once the producing job has dropped its end
fn wait_fence(fence: Option<Fence>) {
    if let Some(fence) = fence {
        let _ = fence.recv();
    }
}

fn convert(src: &[u8], dst: &mut [u8], lut: Option<&[u8]>) {
    let n = src.len().min(dst.len());
    match lut {
        Some(lut) => dst[..n]
            .iter_mut()
            .zip(&src[..n])
            .for_each(|(d, s)| *d = lut[*s as usize]),
        None => dst[..n].copy_from_slice(&src[..n]),
    }
    dst[n..].iter_mut().for_each(|d| *d = 0);
}

fn submit<T>(tx: &Sender<T>, job: T) -> Result<(), DeviceStatus> {
    match tx.try_send(job) {
        Ok(()) => Ok(()),
        // is_full was checked before anything was consumed; nobody else sends
        Err(TrySendError::Full(_)) => Err(DeviceStatus::UNDEFINED_BEHAVIOR),
        Err(TrySendError::Disconnected(_)) => Err(DeviceStatus::DEVICE_FAILED),
    }
}

impl Accelerator for LoopbackDevice {
    fn query_surfaces(&self) -> SurfaceRequirements {
        let cfg = &self.config;
        let req = |info: FrameInfo, n: usize| AllocRequest {
            info,
            num_suggested: u16::try_from(n).unwrap_or(u16::MAX),
        };
        SurfaceRequirements {
            decode_out: req(cfg.decode, 1),
            transform_in: req(cfg.decode, cfg.transform_delay + 1),
            transform_out: req(cfg.encode, 1),
            encode_in: req(cfg.encode, cfg.encode_lookahead + 1),
        }
    }

    fn max_bitstream_size(&self) -> usize {
        self.config.encode.frame_size()
    }

    fn attach(&mut self, decoded: &SurfacePool, transformed: &SurfacePool) -> Result<(), PipelineError> {
        if decoded.info() != self.config.decode || transformed.info() != self.config.encode {
            return Err(PipelineError::InvalidSettings(
                "surface pools do not match the loopback formats".into(),
            ));
        }
        self.stop_engines()?;
        let alloc = |pool: &SurfacePool| -> Frames {
            let size = pool.info().frame_size();
            Arc::new((0..pool.len()).map(|_| Mutex::new(vec![0u8; size])).collect())
        };
        let engines = self.spawn_engines(alloc(decoded), alloc(transformed))?;
        self.engines = Some(engines);
        self.decoded_fences = (0..decoded.len()).map(|_| None).collect();
        self.transformed_fences = (0..transformed.len()).map(|_| None).collect();
        self.compressed.clear();
        self.transform_queue.clear();
        self.encode_queue.clear();
        self.completions.clear();
        Ok(())
    }

    fn decode(&mut self, input: Option<&mut Bitstream>, work: &Surface) -> Submit<Decoded> {
        let Some(engines) = &self.engines else {
            return Submit::Fatal(DeviceStatus::INVALID_HANDLE);
        };
        if engines.decode_tx.is_full() {
            return Submit::Busy;
        }
        let draining = input.is_none();
        if let Some(input) = input {
            let frame = self.config.decode.frame_size();
            while input.len() >= frame {
                self.compressed.push_back(input.data()[..frame].to_vec());
                input.consume(frame);
            }
        }
        let ready = if draining {
            !self.compressed.is_empty()
        } else {
            self.compressed.len() > self.config.decode_delay
        };
        if !ready {
            return Submit::NeedMoreInput;
        }
        let Some(data) = self.compressed.pop_front() else {
            return Submit::NeedMoreInput;
        };
        let (done, fence) = bounded(0);
        work.lock();
        if let Err(status) = submit(
            &engines.decode_tx,
            DecodeJob {
                data,
                dst: work.clone(),
                done,
            },
        ) {
            work.unlock();
            return Submit::Fatal(status);
        }
        if let Some(slot) = self.decoded_fences.get_mut(work.index()) {
            *slot = Some(fence);
        }
        Submit::Ready(Decoded {
            surface: work.clone(),
            sync: self.token(),
        })
    }

    fn transform(&mut self, input: Option<&Surface>, output: &Surface) -> Submit<SyncPoint> {
        let Some(engines) = &self.engines else {
            return Submit::Fatal(DeviceStatus::INVALID_HANDLE);
        };
        if engines.transform_tx.is_full() {
            return Submit::Busy;
        }
        let draining = input.is_none();
        if let Some(input) = input {
            let fence = self
                .decoded_fences
                .get_mut(input.index())
                .and_then(Option::take);
            self.transform_queue.push_back((input.clone(), fence));
        }
        let ready = if draining {
            !self.transform_queue.is_empty()
        } else {
            self.transform_queue.len() > self.config.transform_delay
        };
        if !ready {
            return Submit::NeedMoreInput;
        }
        let Some((src, src_fence)) = self.transform_queue.pop_front() else {
            return Submit::NeedMoreInput;
        };
        let (done, fence) = bounded(0);
        output.lock();
        if let Err(status) = submit(
            &engines.transform_tx,
            TransformJob {
                src,
                src_fence,
                dst: output.clone(),
                done,
            },
        ) {
            output.unlock();
            return Submit::Fatal(status);
        }
        if let Some(slot) = self.transformed_fences.get_mut(output.index()) {
            *slot = Some(fence);
        }
        Submit::Ready(self.token())
    }

    fn encode(&mut self, input: Option<&Surface>) -> Submit<SyncPoint> {
        let Some(engines) = &self.engines else {
            return Submit::Fatal(DeviceStatus::INVALID_HANDLE);
        };
        if engines.encode_tx.is_full() {
            return Submit::Busy;
        }
        let draining = input.is_none();
        if let Some(input) = input {
            let fence = self
                .transformed_fences
                .get_mut(input.index())
                .and_then(Option::take);
            self.encode_queue.push_back((input.clone(), fence));
        }
        let ready = if draining {
            !self.encode_queue.is_empty()
        } else {
            self.encode_queue.len() > self.config.encode_lookahead
        };
        if !ready {
            return Submit::NeedMoreInput;
        }
        let Some((src, src_fence)) = self.encode_queue.pop_front() else {
            return Submit::NeedMoreInput;
        };
        let (done, completion) = bounded(1);
        if let Err(status) = submit(
            &engines.encode_tx,
            EncodeJob {
                src,
                src_fence,
                done,
            },
        ) {
            return Submit::Fatal(status);
        }
        let sync = self.token();
        self.completions.insert(sync, completion);
        Submit::Ready(sync)
    }

    fn sync(&mut self, point: SyncPoint, timeout: Duration, output: &mut Bitstream) -> SyncStatus {
        let Some(completion) = self.completions.remove(&point) else {
            return SyncStatus::Fatal(DeviceStatus::INVALID_HANDLE);
        };
        match completion.recv_timeout(timeout) {
            Ok(Ok(encoded)) => match output.fill(&encoded) {
                Ok(()) => SyncStatus::Ready,
                Err(_) => SyncStatus::Fatal(DeviceStatus::NOT_ENOUGH_BUFFER),
            },
            Ok(Err(status)) => SyncStatus::Fatal(status),
            Err(RecvTimeoutError::Timeout) => SyncStatus::TimedOut,
            Err(RecvTimeoutError::Disconnected) => SyncStatus::Fatal(DeviceStatus::DEVICE_FAILED),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::run_pipeline;
    use crate::stream::{ReaderSource, WriterSink};

    fn frames(info: FrameInfo, n: usize) -> Vec<u8> {
        (0..info.frame_size() * n).map(|b| (b * 7 % 251) as u8).collect()
    }

    fn run(config: LoopbackConfig, depth: usize, input: &[u8]) -> (u64, Vec<u8>) {
        let mut device = LoopbackDevice::new(config).unwrap();
        let mut out = Vec::new();
        let summary = run_pipeline(
            &mut device,
            ReaderSource::new(input),
            WriterSink::new(&mut out),
            depth,
        )
        .unwrap();
        device.shutdown().unwrap();
        (summary.frames_processed, out)
    }

    #[test]
    fn identity_round_trip() {
        let info = FrameInfo::new(FourCc::Nv12, 8, 4);
        let input = frames(info, 10);
        let (n, out) = run(LoopbackConfig::identity(info), 3, &input);
        assert_eq!(n, 10);
        assert_eq!(out, input);
    }

    #[test]
    fn buffering_and_backpressure_keep_order() {
        let info = FrameInfo::new(FourCc::Nv12, 4, 4);
        let input = frames(info, 30);
        let config = LoopbackConfig {
            decode_delay: 2,
            transform_delay: 1,
            encode_lookahead: 3,
            queue_depth: 1,
            encode_latency_us: 200,
            ..LoopbackConfig::identity(info)
        };
        let (n, out) = run(config, 2, &input);
        assert_eq!(n, 30);
        assert_eq!(out, input);
    }

    #[test]
    fn lut_and_resize() {
        let decode = FrameInfo::new(FourCc::Nv12, 2, 2);
        let encode = FrameInfo::new(FourCc::Rgb4, 2, 2);
        let invert: Vec<u8> = (0..=255u8).map(|v| 255 - v).collect();
        let config = LoopbackConfig {
            decode,
            encode,
            lut: Some(invert),
            ..LoopbackConfig::identity(decode)
        };
        let input: Vec<u8> = (0..12).collect();
        let (n, out) = run(config, 1, &input);
        assert_eq!(n, 2);
        // 6 byte frames grow to 16; padding is zero
        let mut expected = vec![];
        for frame in input.chunks(6) {
            expected.extend(frame.iter().map(|v| 255 - v));
            expected.extend([0u8; 10]);
        }
        assert_eq!(out, expected);

        let config = LoopbackConfig {
            decode: encode,
            encode: decode,
            ..LoopbackConfig::identity(encode)
        };
        let input: Vec<u8> = (0..16).collect();
        let (_, out) = run(config, 1, &input);
        assert_eq!(out, (0..6).collect::<Vec<u8>>());
    }

    #[test]
    fn trailing_partial_frame_is_dropped() {
        let info = FrameInfo::new(FourCc::Nv12, 2, 2);
        let mut input = frames(info, 3);
        input.extend([1, 2, 3]);
        let (n, out) = run(LoopbackConfig::identity(info), 2, &input);
        assert_eq!(n, 3);
        assert_eq!(out, &input[..18]);
    }

    #[test]
    fn slow_encoder_times_out() {
        let info = FrameInfo::new(FourCc::Nv12, 2, 2);
        let config = LoopbackConfig {
            encode_latency_us: 500_000,
            ..LoopbackConfig::identity(info)
        };
        let mut device = LoopbackDevice::new(config).unwrap();
        let settings = crate::settings::PipelineSettings::default()
            .with_async_depth(1)
            .unwrap()
            .with_sync_timeout(Duration::from_millis(10));
        let input = frames(info, 2);
        let res = crate::driver::Pipeline::new(&mut device, settings)
            .run(ReaderSource::new(&input[..]), crate::stream::NullSink);
        assert!(matches!(res, Err(PipelineError::SyncTimeout { frame: 0, .. })));
    }

    #[test]
    fn config_is_validated() {
        let info = FrameInfo::new(FourCc::Nv12, 2, 2);
        let bad_lut = LoopbackConfig {
            lut: Some(vec![0; 10]),
            ..LoopbackConfig::identity(info)
        };
        assert!(matches!(
            LoopbackDevice::new(bad_lut),
            Err(PipelineError::InvalidSettings(_))
        ));
        assert!(LoopbackDevice::new(LoopbackConfig::identity(FrameInfo::new(FourCc::Nv12, 0, 2))).is_err());
    }

    #[test]
    fn config_json() {
        let config: LoopbackConfig = serde_json::from_str(
            r#"{
                "decode": {"fourcc": "P010", "width": 16, "height": 8},
                "encode": {"fourcc": "NV12", "width": 8, "height": 8},
                "encode_lookahead": 2
            }"#,
        )
        .unwrap();
        assert_eq!(config.queue_depth, 4);
        assert_eq!(config.encode_lookahead, 2);
        let device = LoopbackDevice::new(config).unwrap();
        let req = device.query_surfaces();
        assert_eq!(req.encode_in.num_suggested, 3);
        assert_eq!(device.max_bitstream_size(), 96);
    }

    #[test]
    fn not_attached_is_fatal() {
        let info = FrameInfo::new(FourCc::Nv12, 2, 2);
        let mut device = LoopbackDevice::new(LoopbackConfig::identity(info)).unwrap();
        let pool = SurfacePool::new(info, 1);
        let work = pool.acquire_free().unwrap();
        assert!(matches!(
            device.decode(None, &work),
            Submit::Fatal(DeviceStatus::INVALID_HANDLE)
        ));
        let mut out = Bitstream::with_capacity(8);
        assert!(matches!(
            device.sync(SyncPoint(1), Duration::from_millis(1), &mut out),
            SyncStatus::Fatal(DeviceStatus::INVALID_HANDLE)
        ));
    }
}
