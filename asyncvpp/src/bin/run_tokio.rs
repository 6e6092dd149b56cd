use structopt::StructOpt;
use tracing::info;

use asyncvpp_transcode::accel::loopback::LoopbackDevice;
use asyncvpp_transcode::data::{InHandle, OutHandle};
use asyncvpp_transcode::driver::tokio::run_handles_async;
use asyncvpp_transcode::settings::RunConfig;
use asyncvpp_transcode::PipelineError;

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "run-tokio", about = "Async pipeline driven from a tokio runtime")]
struct Opt {
    // Source file-name; `-` for stdin
    #[structopt(short = "i", long)]
    src: String,

    // Target file-name; `-` for stdout, omit to discard
    #[structopt(short = "o", long)]
    tgt: Option<String>,

    #[structopt(short = "c", long)]
    config: Option<String>,

    #[structopt(long = "async-depth")]
    async_depth: Option<usize>,

    #[structopt(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let opt = Opt::from_args();
    asyncvpp_transcode::init_tracing(opt.debug);

    let config = match &opt.config {
        Some(file) => RunConfig::from_json_file_async(file).await?,
        None => RunConfig::default(),
    };
    let settings = match opt.async_depth {
        Some(depth) => config.pipeline.with_async_depth(depth)?,
        None => config.pipeline,
    };
    let device = LoopbackDevice::new(config.loopback)?;
    let out_handle = match opt.tgt {
        None => OutHandle::Null,
        Some(name) => OutHandle::from_str(name),
    };

    let (summary, device) =
        run_handles_async(device, settings, InHandle::from_str(opt.src), out_handle).await?;
    device.shutdown()?;
    info!(
        frames = summary.frames_processed,
        fps = summary.fps(),
        busy_encode = summary.stats.busy_retries(asyncvpp_transcode::accel::Stage::Encode),
        "finished"
    );
    Ok(())
}
