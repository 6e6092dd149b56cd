use std::time::Instant;

use structopt::StructOpt;
use tracing::debug;

use asyncvpp_transcode::accel::loopback::LoopbackDevice;
use asyncvpp_transcode::data::{InHandle, OutHandle};
use asyncvpp_transcode::driver::Pipeline;
use asyncvpp_transcode::settings::RunConfig;
use asyncvpp_transcode::PipelineError;

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "asyncvpp", about = "Async decode -> transform -> encode pipeline")]
struct Opt {
    // Source file-name; `-` for stdin
    #[structopt(short = "i", long)]
    src: String,

    // Target file-name; `-` for stdout. Omit to sync and discard every frame
    #[structopt(short = "o", long)]
    tgt: Option<String>,

    // JSON file with `pipeline` and `loopback` sections
    #[structopt(short = "c", long)]
    config: Option<String>,

    // Overrides the configured number of outstanding encode tasks
    #[structopt(long = "async-depth")]
    async_depth: Option<usize>,

    // Display diagnostic info
    #[structopt(short, long)]
    debug: bool,

    // Display Timing info
    #[structopt(long)]
    timing: bool,
}

fn main() -> Result<(), PipelineError> {
    let opt = Opt::from_args();
    asyncvpp_transcode::init_tracing(opt.debug);
    debug!(?opt, "options");

    let (mut device, settings) = {
        let st = Instant::now();
        let config = match &opt.config {
            Some(file) => RunConfig::from_json_file_sync(file)?,
            None => RunConfig::default(),
        };
        let settings = match opt.async_depth {
            Some(depth) => config.pipeline.with_async_depth(depth)?,
            None => config.pipeline,
        };
        let device = LoopbackDevice::new(config.loopback)?;
        log_timing(&opt, st, "Load config");
        (device, settings)
    };
    let in_handle = InHandle::from_str(opt.src.clone());
    let out_handle = get_out_handle(&opt.tgt);

    // Do the main thing...
    let st = Instant::now();
    let summary = Pipeline::new(&mut device, settings).run_handles(in_handle, out_handle)?;
    device.shutdown()?;
    log_timing(&opt, st, "Pipeline");
    if opt.timing {
        eprintln!("{summary}");
    }

    Ok(())
}

// stdout may be carrying the encoded stream, so timing goes to stderr
fn log_timing(opt: &Opt, st: Instant, msg: &str) {
    if opt.timing {
        let took = Instant::now().duration_since(st);
        eprintln!("{msg} took: {}ms", took.as_millis());
    }
}

fn get_out_handle(name: &Option<String>) -> OutHandle {
    match name {
        None => OutHandle::Null,
        Some(name) => OutHandle::from_str(name.clone()),
    }
}
