use std::path::Path;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::config::AppConfig;

pub async fn execute(path: &Path, args: ConfigArgs) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show => {
            let cfg = AppConfig::load_from(path)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = AppConfig::load_from(path)?;
            cfg.set(&key, &value)?;
            cfg.save_to(path)?;
            println!("Configuration updated ({}).", path.display());
        }
    }
    Ok(())
}
