// Deterministic in-process device for driver tests.
//
// Every frame is a single byte and every stage completes immediately. Individual calls
// can be scripted to fail, and the device records the ordering and ownership rules the
// driver has to respect so tests can assert on them afterwards.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::accel::{
    Accelerator, AllocRequest, Decoded, DeviceStatus, Stage, Submit, SurfaceRequirements,
    SyncPoint, SyncStatus,
};
use crate::data::{Bitstream, FourCc, FrameInfo};
use crate::pool::{Surface, SurfacePool};
use crate::PipelineError;

#[derive(Debug, Copy, Clone)]
pub(crate) enum Fault {
    Busy,
    NeedMoreOutput,
    Fatal(DeviceStatus),
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum SyncFault {
    TimedOut,
    Fatal(DeviceStatus),
}

#[derive(Default)]
pub(crate) struct ScriptedDevice {
    decode_delay: usize,
    transform_delay: usize,
    encode_lookahead: usize,
    suggested: u16,
    release_on_sync: bool,
    faults: HashMap<(Stage, u64), Fault>,
    sync_faults: HashMap<u64, SyncFault>,

    calls: [u64; 3],
    syncs: u64,
    compressed: VecDeque<u8>,
    decoded: HashMap<usize, u8>,
    transform_queue: VecDeque<u8>,
    transformed: HashMap<usize, u8>,
    encode_queue: VecDeque<(u8, Surface)>,
    pending: HashMap<SyncPoint, (u8, Option<Surface>)>,
    next_sync: u64,

    pub(crate) max_outstanding: usize,
    pub(crate) violations: Vec<String>,
}

pub(crate) const INFO: FrameInfo = FrameInfo::new(FourCc::Nv12, 2, 2);

impl ScriptedDevice {
    pub(crate) fn new() -> Self {
        Self {
            suggested: 1,
            ..Default::default()
        }
    }

    pub(crate) fn decode_delay(mut self, n: usize) -> Self {
        self.decode_delay = n;
        self
    }

    pub(crate) fn transform_delay(mut self, n: usize) -> Self {
        self.transform_delay = n;
        self
    }

    pub(crate) fn encode_lookahead(mut self, n: usize) -> Self {
        self.encode_lookahead = n;
        self
    }

    pub(crate) fn suggested(mut self, n: u16) -> Self {
        self.suggested = n;
        self
    }

    // The encoder keeps reading its input surface until the task is synced
    pub(crate) fn release_on_sync(mut self) -> Self {
        self.release_on_sync = true;
        self
    }

    // Make call number `call` (0 based, retries included) of `stage` fail
    pub(crate) fn fault(mut self, stage: Stage, call: u64, fault: Fault) -> Self {
        self.faults.insert((stage, call), fault);
        self
    }

    pub(crate) fn sync_fault(mut self, sync: u64, fault: SyncFault) -> Self {
        self.sync_faults.insert(sync, fault);
        self
    }

    pub(crate) fn calls(&self, stage: Stage) -> u64 {
        self.calls[stage.index()]
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn next_fault(&mut self, stage: Stage) -> Option<Fault> {
        let call = self.calls[stage.index()];
        self.calls[stage.index()] += 1;
        self.faults.get(&(stage, call)).copied()
    }

    fn check_free(&mut self, stage: Stage, surface: &Surface) {
        if surface.is_locked() {
            self.violations
                .push(format!("{stage} given owned surface {}", surface.index()));
        }
    }

    fn check_produced(&mut self, stage: Stage, surface: &Surface) {
        if !surface.is_locked() {
            self.violations.push(format!(
                "{stage} given surface {} nobody produced",
                surface.index()
            ));
        }
    }

    fn token(&mut self) -> SyncPoint {
        self.next_sync += 1;
        SyncPoint(self.next_sync)
    }
}

fn apply<T>(fault: Fault) -> Submit<T> {
    match fault {
        Fault::Busy => Submit::Busy,
        Fault::NeedMoreOutput => Submit::NeedMoreOutput,
        Fault::Fatal(status) => Submit::Fatal(status),
    }
}

impl Accelerator for ScriptedDevice {
    fn query_surfaces(&self) -> SurfaceRequirements {
        let req = AllocRequest {
            info: INFO,
            num_suggested: self.suggested,
        };
        SurfaceRequirements {
            decode_out: req,
            transform_in: req,
            transform_out: req,
            encode_in: req,
        }
    }

    fn max_bitstream_size(&self) -> usize {
        4
    }

    fn attach(
        &mut self,
        _decoded: &SurfacePool,
        _transformed: &SurfacePool,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    fn decode(&mut self, input: Option<&mut Bitstream>, work: &Surface) -> Submit<Decoded> {
        if let Some(fault) = self.next_fault(Stage::Decode) {
            return apply(fault);
        }
        self.check_free(Stage::Decode, work);
        let draining = input.is_none();
        if let Some(input) = input {
            self.compressed.extend(input.data());
            let n = input.len();
            input.consume(n);
        }
        let ready = if draining {
            !self.compressed.is_empty()
        } else {
            self.compressed.len() > self.decode_delay
        };
        match self.compressed.pop_front() {
            Some(frame) if ready => {
                work.lock();
                self.decoded.insert(work.index(), frame);
                let sync = self.token();
                Submit::Ready(Decoded {
                    surface: work.clone(),
                    sync,
                })
            }
            Some(frame) => {
                self.compressed.push_front(frame);
                Submit::NeedMoreInput
            }
            None => Submit::NeedMoreInput,
        }
    }

    fn transform(&mut self, input: Option<&Surface>, output: &Surface) -> Submit<SyncPoint> {
        if let Some(fault) = self.next_fault(Stage::Transform) {
            return apply(fault);
        }
        self.check_free(Stage::Transform, output);
        let draining = input.is_none();
        if let Some(input) = input {
            self.check_produced(Stage::Transform, input);
            let frame = self.decoded.remove(&input.index()).unwrap_or_default();
            input.unlock();
            self.transform_queue.push_back(frame);
        }
        let ready = if draining {
            !self.transform_queue.is_empty()
        } else {
            self.transform_queue.len() > self.transform_delay
        };
        if !ready {
            return Submit::NeedMoreInput;
        }
        match self.transform_queue.pop_front() {
            Some(frame) => {
                output.lock();
                self.transformed.insert(output.index(), frame);
                Submit::Ready(self.token())
            }
            None => Submit::NeedMoreInput,
        }
    }

    fn encode(&mut self, input: Option<&Surface>) -> Submit<SyncPoint> {
        if let Some(fault) = self.next_fault(Stage::Encode) {
            return apply(fault);
        }
        let draining = input.is_none();
        if let Some(input) = input {
            self.check_produced(Stage::Encode, input);
            let frame = self.transformed.remove(&input.index()).unwrap_or_default();
            self.encode_queue.push_back((frame, input.clone()));
        }
        let ready = if draining {
            !self.encode_queue.is_empty()
        } else {
            self.encode_queue.len() > self.encode_lookahead
        };
        if !ready {
            return Submit::NeedMoreInput;
        }
        match self.encode_queue.pop_front() {
            Some((frame, surface)) => {
                let held = if self.release_on_sync {
                    Some(surface)
                } else {
                    surface.unlock();
                    None
                };
                let sync = self.token();
                self.pending.insert(sync, (frame, held));
                self.max_outstanding = self.max_outstanding.max(self.pending.len());
                Submit::Ready(sync)
            }
            None => Submit::NeedMoreInput,
        }
    }

    fn sync(
        &mut self,
        point: SyncPoint,
        _timeout: Duration,
        output: &mut Bitstream,
    ) -> SyncStatus {
        let n = self.syncs;
        self.syncs += 1;
        match self.sync_faults.get(&n) {
            Some(SyncFault::TimedOut) => return SyncStatus::TimedOut,
            Some(SyncFault::Fatal(status)) => return SyncStatus::Fatal(*status),
            None => {}
        }
        match self.pending.remove(&point) {
            Some((frame, held)) => {
                if let Some(surface) = held {
                    surface.unlock();
                }
                if output.fill(&[frame]).is_err() {
                    return SyncStatus::Fatal(DeviceStatus::UNDEFINED_BEHAVIOR);
                }
                SyncStatus::Ready
            }
            None => {
                self.violations.push(format!("sync on unknown token {point:?}"));
                SyncStatus::Fatal(DeviceStatus::INVALID_HANDLE)
            }
        }
    }
}
