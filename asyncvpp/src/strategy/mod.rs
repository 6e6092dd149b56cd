use std::time::Duration;

use crate::PipelineError;

// What to do between attempts when a stage answers Busy.
//
// Busy never turns into an error; the strategy only decides how politely to wait.
#[derive(Debug, Clone)]
pub enum BusyStrategy {
    Yield,
    Sleep(Duration),
    Backoff { initial: Duration, max: Duration },
}

impl Default for BusyStrategy {
    fn default() -> Self {
        BusyStrategy::Sleep(Duration::from_millis(1))
    }
}

impl BusyStrategy {
    pub fn new_sleep(period: Duration) -> Result<Self, PipelineError> {
        if period.is_zero() {
            Err(PipelineError::InvalidSettings(
                "busy sleep must be positive; use yield instead".into(),
            ))
        } else {
            Ok(BusyStrategy::Sleep(period))
        }
    }

    pub fn new_backoff(initial: Duration, max: Duration) -> Result<Self, PipelineError> {
        if initial.is_zero() {
            Err(PipelineError::InvalidSettings(
                "backoff initial delay must be positive".into(),
            ))
        } else if initial > max {
            Err(PipelineError::InvalidSettings(format!(
                "backoff initial {initial:?} exceeds max {max:?}"
            )))
        } else {
            Ok(BusyStrategy::Backoff { initial, max })
        }
    }

    // Delay before retry number `attempt` (0 based); zero means yield
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BusyStrategy::Yield => Duration::ZERO,
            BusyStrategy::Sleep(d) => *d,
            BusyStrategy::Backoff { initial, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }

    pub fn pause(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(delay);
        }
    }
}
