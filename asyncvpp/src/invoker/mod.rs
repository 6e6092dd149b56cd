use tracing::{error, trace};

use crate::accel::{Stage, Submit};
use crate::strategy::BusyStrategy;
use crate::PipelineError;

// Definitive outcome of one stage submission, as seen by the driver
#[derive(Debug)]
pub enum Invoked<T> {
    Ready(T),
    NeedMoreInput,
}

// Retry wrapper shared by all three stages.
//
// Busy is retried for as long as it takes, pausing per the busy strategy between
// attempts. Ready and NeedMoreInput go back to the caller. NeedMoreOutput and Fatal are
// never retried.
pub struct StageInvoker {
    strategy: BusyStrategy,
    busy_retries: [u64; 3],
    submissions: [u64; 3],
}

impl StageInvoker {
    pub fn new(strategy: BusyStrategy) -> Self {
        Self {
            strategy,
            busy_retries: [0; 3],
            submissions: [0; 3],
        }
    }

    pub fn strategy(&self) -> &BusyStrategy {
        &self.strategy
    }

    pub fn invoke<T, F>(&mut self, stage: Stage, mut call: F) -> Result<Invoked<T>, PipelineError>
    where
        F: FnMut() -> Submit<T>,
    {
        let mut attempt = 0u32;
        loop {
            self.submissions[stage.index()] += 1;
            match call() {
                Submit::Ready(v) => return Ok(Invoked::Ready(v)),
                Submit::NeedMoreInput => return Ok(Invoked::NeedMoreInput),
                Submit::Busy => {
                    self.busy_retries[stage.index()] += 1;
                    trace!(%stage, attempt, "device busy");
                    self.strategy.pause(attempt);
                    attempt = attempt.saturating_add(1);
                }
                Submit::NeedMoreOutput => {
                    error!(%stage, "stage has more output than this pipeline can take");
                    return Err(PipelineError::NeedMoreOutput { stage });
                }
                Submit::Fatal(status) => {
                    return Err(PipelineError::Accelerator { stage, status });
                }
            }
        }
    }

    pub fn busy_retries(&self, stage: Stage) -> u64 {
        self.busy_retries[stage.index()]
    }

    // Calls made into the device, retries included
    pub fn submissions(&self, stage: Stage) -> u64 {
        self.submissions[stage.index()]
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::*;
    use crate::accel::DeviceStatus;

    fn scripted<T>(outcomes: Vec<Submit<T>>) -> impl FnMut() -> Submit<T> {
        let mut q: VecDeque<Submit<T>> = outcomes.into();
        move || q.pop_front().unwrap_or(Submit::Fatal(DeviceStatus::UNKNOWN))
    }

    #[test]
    fn busy_is_retried_until_ready() {
        let mut inv = StageInvoker::new(BusyStrategy::Yield);
        let res = inv
            .invoke(
                Stage::Encode,
                scripted(vec![Submit::Busy, Submit::Busy, Submit::Ready(7)]),
            )
            .unwrap();
        assert!(matches!(res, Invoked::Ready(7)));
        assert_eq!(inv.busy_retries(Stage::Encode), 2);
        assert_eq!(inv.submissions(Stage::Encode), 3);
        assert_eq!(inv.busy_retries(Stage::Decode), 0);
    }

    #[test]
    fn need_more_input_is_returned() {
        let mut inv = StageInvoker::new(BusyStrategy::Yield);
        let res = inv
            .invoke::<u8, _>(
                Stage::Transform,
                scripted(vec![Submit::Busy, Submit::NeedMoreInput]),
            )
            .unwrap();
        assert!(matches!(res, Invoked::NeedMoreInput));
        assert_eq!(inv.busy_retries(Stage::Transform), 1);
    }

    #[test]
    fn need_more_output_is_not_retried() {
        let mut inv = StageInvoker::new(BusyStrategy::Yield);
        let res = inv.invoke::<u8, _>(
            Stage::Decode,
            scripted(vec![Submit::NeedMoreOutput, Submit::Ready(1)]),
        );
        assert!(matches!(
            res,
            Err(PipelineError::NeedMoreOutput {
                stage: Stage::Decode
            })
        ));
        assert_eq!(inv.submissions(Stage::Decode), 1);
    }

    #[test]
    fn fatal_carries_stage_and_status() {
        let mut inv = StageInvoker::new(BusyStrategy::Yield);
        let res = inv.invoke::<u8, _>(
            Stage::Transform,
            scripted(vec![Submit::Fatal(DeviceStatus::DEVICE_FAILED)]),
        );
        match res {
            Err(PipelineError::Accelerator { stage, status }) => {
                assert_eq!(stage, Stage::Transform);
                assert_eq!(status, DeviceStatus::DEVICE_FAILED);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
