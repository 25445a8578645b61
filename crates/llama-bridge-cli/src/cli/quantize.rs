use std::time::Instant;

use llama_bridge::{ModelManager, QuantizeParams};
use tracing::info;

use crate::cli::{GlobalArgs, QuantizeArgs};

pub async fn execute(global: GlobalArgs, args: QuantizeArgs) -> anyhow::Result<()> {
    let backend = global.open_backend()?;
    let params = QuantizeParams {
        ftype: args.ftype,
        n_threads: args.threads,
        allow_requantize: args.allow_requantize,
        quantize_output_tensor: !args.leave_output_tensor,
        only_copy: args.only_copy,
    };

    let started = Instant::now();
    let manager = ModelManager::new(&backend);
    let (input, output) = (args.input, args.output);
    tokio::task::spawn_blocking(move || manager.quantize(&input, &output, &params)).await??;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Done");

    backend.cleanup();
    Ok(())
}
