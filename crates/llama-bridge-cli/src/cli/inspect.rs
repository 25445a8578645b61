use anyhow::Context as _;
use llama_bridge::{ModelManager, ModelParams};

use crate::cli::{GlobalArgs, InspectArgs};

pub async fn execute(global: GlobalArgs, args: InspectArgs) -> anyhow::Result<()> {
    let backend = global.open_backend()?;
    let params = ModelParams {
        vocab_only: args.vocab_only,
        ..Default::default()
    };
    let mut model = ModelManager::new(&backend)
        .load(&args.model, &params)
        .with_context(|| format!("loading {}", args.model.display()))?;

    println!("{}", serde_json::to_string_pretty(model.info()?)?);

    model.release();
    backend.cleanup();
    Ok(())
}
