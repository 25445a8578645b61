use serde::Serialize;

use crate::cli::GlobalArgs;

#[derive(Serialize)]
struct InfoOutput {
    system_info: String,
    capabilities: llama_bridge::Capabilities,
}

pub async fn execute(global: GlobalArgs) -> anyhow::Result<()> {
    let backend = global.open_backend()?;
    let out = InfoOutput {
        system_info: backend.system_info(),
        capabilities: backend.capabilities(),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    backend.cleanup();
    Ok(())
}
