use crate::accel::Accelerator;
use crate::data::{InHandle, OutHandle};
use crate::driver::{Pipeline, RunSummary};
use crate::settings::PipelineSettings;
use crate::PipelineError;

// The driver blocks on device completions, so from async code it runs on the blocking
// pool. The device is moved in and handed back alongside the summary.
pub async fn run_handles_async<A>(
    mut device: A,
    settings: PipelineSettings,
    channel_in: InHandle,
    channel_out: OutHandle,
) -> Result<(RunSummary, A), PipelineError>
where
    A: Accelerator + Send + 'static,
{
    let t = tokio::task::spawn_blocking(move || {
        let res = Pipeline::new(&mut device, settings).run_handles(channel_in, channel_out);
        res.map(|summary| (summary, device))
    });
    t.await.map_err(|_| PipelineError::TokioErr)?
}
