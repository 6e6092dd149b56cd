//! The pipeline driver.
//!
//! A single control thread sequences decode -> transform -> encode submissions and
//! decides when to block. All parallelism lives in the device: submits never wait, and
//! the only blocking call is the bounded wait on the oldest outstanding encode task.
//!
//! The driver moves through its phases strictly forward:
//!
//! ```text
//! Feeding -> DrainingDecode -> DrainingTransform -> DrainingEncode -> FlushingTasks -> Done
//! ```
//!
//! Each transition is triggered by the stage being drained reporting `NeedMoreInput` for
//! a `None` input, except the first, which is triggered by the source running dry.

use std::fs::File;
use std::io::{stdin, stdout, BufReader, BufWriter};
use std::time::Instant;

use tracing::{debug, info, info_span, warn};
use ulid::Ulid;

use crate::accel::{Accelerator, Decoded, Stage, SyncStatus};
use crate::data::{Bitstream, InHandle, OutHandle};
use crate::invoker::{Invoked, StageInvoker};
use crate::pool::{Surface, SurfacePool, TaskPool};
use crate::settings::PipelineSettings;
use crate::stream::{ChunkSink, ChunkSource, NullSink, ReaderSource, WriterSink};
use crate::PipelineError;

mod stats;
pub mod tokio;

pub use stats::{PipelineStats, RunSummary};

const IO_BUF_SIZE: usize = 1 << 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Feeding,
    DrainingDecode,
    DrainingTransform,
    DrainingEncode,
    FlushingTasks,
    Done,
}

// Mutable run state, owned by the driver for the duration of one run
#[derive(Debug)]
pub struct PipelineState {
    phase: Phase,
    frames: u64,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            phase: Phase::Feeding,
            frames: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    // Frames written to the sink so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    // Whether the input feeding `stage` has run dry
    pub fn is_exhausted(&self, stage: Stage) -> bool {
        match stage {
            Stage::Decode => self.phase >= Phase::DrainingDecode,
            Stage::Transform => self.phase >= Phase::DrainingTransform,
            Stage::Encode => self.phase >= Phase::DrainingEncode,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(next > self.phase);
        debug!(from = ?self.phase, to = ?next, frames = self.frames, "phase");
        self.phase = next;
    }
}

pub struct Pipeline<'d, A> {
    device: &'d mut A,
    settings: PipelineSettings,
}

impl<'d, A: Accelerator> Pipeline<'d, A> {
    pub fn new(device: &'d mut A, settings: PipelineSettings) -> Self {
        Self { device, settings }
    }

    pub fn run_handles(
        self,
        channel_in: InHandle,
        channel_out: OutHandle,
    ) -> Result<RunSummary, PipelineError> {
        match (channel_in, channel_out) {
            (InHandle::File(file_in), OutHandle::File(file_out)) => {
                let in_f = BufReader::with_capacity(IO_BUF_SIZE, File::open(&file_in)?);
                let out_f = BufWriter::with_capacity(IO_BUF_SIZE, File::create(&file_out)?);
                self.run(ReaderSource::new(in_f), WriterSink::new(out_f))
            }
            (InHandle::Stdin, OutHandle::File(file_out)) => {
                let in_f = stdin().lock();
                let out_f = BufWriter::with_capacity(IO_BUF_SIZE, File::create(&file_out)?);
                self.run(ReaderSource::new(in_f), WriterSink::new(out_f))
            }
            (InHandle::File(file_in), OutHandle::Stdout) => {
                let in_f = BufReader::with_capacity(IO_BUF_SIZE, File::open(&file_in)?);
                let out_f = stdout().lock();
                self.run(ReaderSource::new(in_f), WriterSink::new(out_f))
            }
            (InHandle::Stdin, OutHandle::Stdout) => {
                let in_f = stdin().lock();
                let out_f = stdout().lock();
                self.run(ReaderSource::new(in_f), WriterSink::new(out_f))
            }
            (InHandle::File(file_in), OutHandle::Null) => {
                let in_f = BufReader::with_capacity(IO_BUF_SIZE, File::open(&file_in)?);
                self.run(ReaderSource::new(in_f), NullSink)
            }
            (InHandle::Stdin, OutHandle::Null) => {
                let in_f = stdin().lock();
                self.run(ReaderSource::new(in_f), NullSink)
            }
        }
    }

    pub fn run<S, K>(self, source: S, sink: K) -> Result<RunSummary, PipelineError>
    where
        S: ChunkSource,
        K: ChunkSink,
    {
        let span = info_span!("pipeline", run = %Ulid::new());
        let _enter = span.enter();
        let st = Instant::now();

        let depth = self.settings.async_depth;
        let req = self.device.query_surfaces();
        let (info, count) = req.decoded_pool(depth as u16);
        let decoded = SurfacePool::new(info, count);
        let (info, count) = req.transformed_pool(depth as u16);
        let transformed = SurfacePool::new(info, count);
        self.device.attach(&decoded, &transformed)?;
        let tasks = TaskPool::new(depth, self.device.max_bitstream_size())?;
        info!(
            async_depth = depth,
            decoded_surfaces = decoded.len(),
            transformed_surfaces = transformed.len(),
            "pipeline start"
        );

        let mut run = Run {
            invoker: StageInvoker::new(self.settings.busy.clone()),
            input: Bitstream::with_capacity(self.settings.bitstream_buffer_size),
            settings: self.settings,
            device: self.device,
            decoded,
            transformed,
            tasks,
            state: PipelineState::new(),
            stats: PipelineStats::default(),
            source,
            sink,
        };

        let res = run.drive();
        // whatever was flushed before a failure stays flushed
        let finished = run.sink.finish();
        res?;
        finished?;

        run.stats.record_invoker(&run.invoker);
        let summary = RunSummary {
            frames_processed: run.state.frames,
            elapsed: st.elapsed(),
            stats: run.stats,
        };
        info!(
            frames = summary.frames_processed,
            took_ms = summary.elapsed.as_millis() as u64,
            fps = summary.fps(),
            "pipeline done"
        );
        Ok(summary)
    }
}

struct Run<'d, A, S, K> {
    device: &'d mut A,
    settings: PipelineSettings,
    invoker: StageInvoker,
    decoded: SurfacePool,
    transformed: SurfacePool,
    tasks: TaskPool,
    // compressed input not yet consumed by the decoder
    input: Bitstream,
    state: PipelineState,
    stats: PipelineStats,
    source: S,
    sink: K,
}

impl<'d, A, S, K> Run<'d, A, S, K>
where
    A: Accelerator,
    S: ChunkSource,
    K: ChunkSink,
{
    fn drive(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.state.phase {
                Phase::Done => return Ok(()),
                Phase::FlushingTasks => {
                    while self.tasks.oldest_outstanding().is_some() {
                        self.sync_oldest()?;
                    }
                    self.state.advance(Phase::Done);
                }
                _ => match self.tasks.acquire_free() {
                    // out of task slots: the oldest must complete before anything else
                    None => self.sync_oldest()?,
                    Some(task) => self.tick(task)?,
                },
            }
        }
    }

    // One pass through the stages, starting at the innermost one not yet drained
    fn tick(&mut self, task: usize) -> Result<(), PipelineError> {
        match self.state.phase {
            Phase::Feeding | Phase::DrainingDecode => {
                if let Some(frame) = self.decode()? {
                    if let Some(out) = self.transform(Some(&frame.surface))? {
                        self.encode(Some(&out), task)?;
                    }
                }
            }
            Phase::DrainingTransform => {
                if let Some(out) = self.transform(None)? {
                    self.encode(Some(&out), task)?;
                }
            }
            Phase::DrainingEncode => self.encode(None, task)?,
            Phase::FlushingTasks | Phase::Done => {}
        }
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<Decoded>, PipelineError> {
        let work = self.acquire_surface(Stage::Decode)?;
        let draining = self.state.is_exhausted(Stage::Decode);
        let res = if draining {
            self.invoker
                .invoke(Stage::Decode, || self.device.decode(None, &work))?
        } else {
            self.invoker.invoke(Stage::Decode, || {
                self.device.decode(Some(&mut self.input), &work)
            })?
        };
        match res {
            Invoked::Ready(frame) => Ok(Some(frame)),
            Invoked::NeedMoreInput if draining => {
                self.state.advance(Phase::DrainingTransform);
                Ok(None)
            }
            Invoked::NeedMoreInput => {
                self.feed()?;
                Ok(None)
            }
        }
    }

    // Top up the decoder's input; switches to draining once the source runs dry
    fn feed(&mut self) -> Result<(), PipelineError> {
        let room = self.input.free_space();
        if room == 0 {
            return Err(PipelineError::BitstreamOverflow {
                capacity: self.input.capacity(),
            });
        }
        match self.source.read_chunk(room)? {
            Some(chunk) => {
                self.stats.bytes_in += chunk.len() as u64;
                self.input.append(&chunk)
            }
            None => {
                if !self.input.is_empty() {
                    warn!(bytes = self.input.len(), "discarding incomplete trailing input");
                    self.input.reset();
                }
                self.state.advance(Phase::DrainingDecode);
                Ok(())
            }
        }
    }

    fn transform(&mut self, input: Option<&Surface>) -> Result<Option<Surface>, PipelineError> {
        let out = self.acquire_surface(Stage::Transform)?;
        let res = self
            .invoker
            .invoke(Stage::Transform, || self.device.transform(input, &out))?;
        match res {
            Invoked::Ready(_) => Ok(Some(out)),
            // consumed without output yet; feed another frame
            Invoked::NeedMoreInput if input.is_some() => Ok(None),
            Invoked::NeedMoreInput => {
                self.state.advance(Phase::DrainingEncode);
                Ok(None)
            }
        }
    }

    fn encode(&mut self, input: Option<&Surface>, task: usize) -> Result<(), PipelineError> {
        let res = self
            .invoker
            .invoke(Stage::Encode, || self.device.encode(input))?;
        match res {
            Invoked::Ready(sync) => {
                self.tasks.claim(task, sync)?;
                self.stats.max_outstanding = self.stats.max_outstanding.max(self.tasks.outstanding());
            }
            // the encoder buffers for lookahead; nothing to flush yet
            Invoked::NeedMoreInput if input.is_some() => {}
            Invoked::NeedMoreInput => self.state.advance(Phase::FlushingTasks),
        }
        Ok(())
    }

    // A surface no stage currently owns. While none is free, completing the oldest task
    // is the only way forward the driver has; with nothing outstanding it can only wait
    // for the device to finish with one, up to the sync timeout.
    fn acquire_surface(&mut self, stage: Stage) -> Result<Surface, PipelineError> {
        let st = Instant::now();
        let mut attempt = 0u32;
        loop {
            let pool = match stage {
                Stage::Decode => &self.decoded,
                Stage::Transform | Stage::Encode => &self.transformed,
            };
            if let Some(surface) = pool.acquire_free() {
                return Ok(surface);
            }
            if self.tasks.oldest_outstanding().is_some() {
                self.sync_oldest()?;
                continue;
            }
            let waited = st.elapsed();
            if waited >= self.settings.sync_timeout {
                return Err(PipelineError::SurfacesExhausted { stage, waited });
            }
            self.invoker.strategy().pause(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    // Wait on the FIFO head, write its bytes out and recycle it
    fn sync_oldest(&mut self) -> Result<(), PipelineError> {
        let Some(index) = self.tasks.oldest_outstanding() else {
            return Ok(());
        };
        let Some(point) = self.tasks.task(index).sync_point() else {
            return Err(PipelineError::TaskOutOfOrder {
                index,
                expected: index,
            });
        };
        let timeout = self.settings.sync_timeout;
        let st = Instant::now();
        let status = self
            .device
            .sync(point, timeout, self.tasks.bitstream_mut(index));
        self.stats.record_sync(st.elapsed());
        match status {
            SyncStatus::Ready => {}
            SyncStatus::TimedOut => {
                return Err(PipelineError::SyncTimeout {
                    frame: self.state.frames,
                    timeout,
                })
            }
            SyncStatus::Fatal(status) => return Err(PipelineError::SyncFailed { status }),
        }

        let encoded = self.tasks.task(index).bitstream().data();
        self.sink.write_chunk(encoded)?;
        self.stats.bytes_out += encoded.len() as u64;
        self.tasks.recycle(index)?;
        self.state.frames += 1;

        let frames = self.state.frames;
        debug!(frame = frames, task = index, "flushed");
        let interval = self.settings.progress_interval;
        if interval > 0 && frames % interval == 0 {
            info!(frames, "progress");
        }
        Ok(())
    }
}
