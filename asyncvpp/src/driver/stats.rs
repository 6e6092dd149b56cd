use std::fmt;
use std::time::Duration;

use crate::accel::Stage;
use crate::invoker::StageInvoker;

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    busy_retries: [u64; 3],
    submissions: [u64; 3],
    pub syncs: u64,
    pub sync_wait_min: Duration,
    pub sync_wait_max: Duration,
    pub sync_wait_total: Duration,
    // most encode tasks ever outstanding at once
    pub max_outstanding: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl PipelineStats {
    pub(crate) fn record_sync(&mut self, took: Duration) {
        if self.syncs == 0 {
            self.sync_wait_min = took;
        } else {
            self.sync_wait_min = self.sync_wait_min.min(took);
        }
        self.sync_wait_max = self.sync_wait_max.max(took);
        self.sync_wait_total += took;
        self.syncs += 1;
    }

    pub(crate) fn record_invoker(&mut self, invoker: &StageInvoker) {
        for stage in Stage::ALL {
            self.busy_retries[stage.index()] = invoker.busy_retries(stage);
            self.submissions[stage.index()] = invoker.submissions(stage);
        }
    }

    pub fn busy_retries(&self, stage: Stage) -> u64 {
        self.busy_retries[stage.index()]
    }

    pub fn submissions(&self, stage: Stage) -> u64 {
        self.submissions[stage.index()]
    }

    pub fn sync_wait_avg(&self) -> Duration {
        match u32::try_from(self.syncs) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.sync_wait_total / n,
            Err(_) => Duration::from_secs_f64(self.sync_wait_total.as_secs_f64() / self.syncs as f64),
        }
    }
}

// What a completed run reports back
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub elapsed: Duration,
    pub stats: PipelineStats,
}

impl RunSummary {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_processed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frames: {} took: {}ms fps: {:.2}",
            self.frames_processed,
            self.elapsed.as_millis(),
            self.fps()
        )?;
        for stage in Stage::ALL {
            writeln!(
                f,
                "{stage}: submissions:{} busy:{}",
                self.stats.submissions(stage),
                self.stats.busy_retries(stage)
            )?;
        }
        write!(
            f,
            "sync: count:{} min:{}us max:{}us avg:{}us max-outstanding:{}",
            self.stats.syncs,
            self.stats.sync_wait_min.as_micros(),
            self.stats.sync_wait_max.as_micros(),
            self.stats.sync_wait_avg().as_micros(),
            self.stats.max_outstanding
        )
    }
}
