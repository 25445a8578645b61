use std::io::{self, Write};
use std::path::Path;

use anyhow::Context as _;
use llama_bridge::{
    ContextParams, GenerateEvent, GenerateRequest, ModelManager, ModelParams, SamplerParams,
};
use tracing::{info, warn};

use crate::cli::{GenerateArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, config: &Path, args: GenerateArgs) -> anyhow::Result<()> {
    let cfg = AppConfig::load_from(config)?;
    let model_path = args
        .model
        .clone()
        .or_else(|| cfg.model.clone())
        .context("no model given and none set in the config (`config set model <path>`)")?;

    let backend = global.open_backend()?;
    let manager = ModelManager::new(&backend);
    let (model_params, ctx_params, sampler_params) = resolve(&cfg, &args);

    info!(model = %model_path.display(), "Loading model");
    let model = manager
        .load(&model_path, &model_params)
        .with_context(|| format!("loading {}", model_path.display()))?;

    let prompt = args.prompt;
    let stop_words = args.stop_words;
    let add_bos = !args.no_bos;

    let completion = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let tokenizer = model.tokenizer()?;
        let mut ctx = model.create_context(&ctx_params)?;
        let mut sampler = ctx.create_sampler(&sampler_params)?;
        let request = GenerateRequest {
            prompt: tokenizer.tokenize_with(&prompt, add_bos, false)?,
            max_tokens: None,
            stop_words,
        };

        let mut stdout = io::stdout();
        let completion = llama_bridge::generate(
            &mut ctx,
            &mut sampler,
            &tokenizer,
            &request,
            |event| match event {
                GenerateEvent::Token(piece) => {
                    print!("{piece}");
                    stdout.flush().is_ok()
                }
                GenerateEvent::Error(msg) => {
                    warn!("{msg}");
                    true
                }
                GenerateEvent::Done { .. } => true,
            },
        )?;
        println!();
        Ok(completion)
    })
    .await??;

    info!(
        finish_reason = %completion.finish_reason,
        prompt_tokens = completion.prompt_tokens,
        completion_tokens = completion.completion_tokens,
        "Generation complete"
    );
    backend.cleanup();
    Ok(())
}

/// Command-line flags layered over the config defaults.
fn resolve(cfg: &AppConfig, args: &GenerateArgs) -> (ModelParams, ContextParams, SamplerParams) {
    let mut model = cfg.model_params();
    if let Some(n) = args.n_gpu_layers {
        model.n_gpu_layers = n;
    }

    let mut ctx = cfg.context_params();
    if let Some(n) = args.ctx_size {
        ctx.n_ctx = n;
    }
    if let Some(n) = args.threads {
        ctx.n_threads = n;
    }

    let mut sampler = cfg.sampler.clone();
    if let Some(v) = args.temp {
        sampler.temperature = v;
    }
    if let Some(v) = args.top_p {
        sampler.top_p = v;
    }
    if let Some(v) = args.top_k {
        sampler.top_k = v;
    }
    if let Some(v) = args.repeat_penalty {
        sampler.repetition_penalty = v;
    }
    if let Some(v) = args.repeat_last_n {
        sampler.repeat_last_n = v;
    }
    if let Some(v) = args.max_tokens {
        sampler.max_tokens = v;
    }
    if args.seed.is_some() {
        sampler.seed = args.seed;
    }
    (model, ctx, sampler)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn parse(extra: &[&str]) -> GenerateArgs {
        let argv = ["llama-bridge", "generate", "-p", "hi"].iter().chain(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Generate(args) => args,
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn test_config_supplies_defaults() {
        let mut cfg = AppConfig::default();
        cfg.set("ctx_size", "1024").unwrap();
        cfg.set("temperature", "0.3").unwrap();

        let (model, ctx, sampler) = resolve(&cfg, &parse(&[]));
        assert_eq!(model.n_gpu_layers, 0);
        assert_eq!(ctx.n_ctx, 1024);
        assert_eq!(sampler.temperature, 0.3);
        assert_eq!(sampler.seed, None);
    }

    #[test]
    fn test_flags_override_config() {
        let mut cfg = AppConfig::default();
        cfg.set("seed", "1").unwrap();

        let args = parse(&["-c", "256", "--temp", "0", "--seed", "9", "--n-gpu-layers", "12"]);
        let (model, ctx, sampler) = resolve(&cfg, &args);
        assert_eq!(model.n_gpu_layers, 12);
        assert_eq!(ctx.n_ctx, 256);
        assert_eq!(sampler.temperature, 0.0);
        assert_eq!(sampler.seed, Some(9));
    }
}
