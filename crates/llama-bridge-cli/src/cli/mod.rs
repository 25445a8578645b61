pub mod config_cmd;
pub mod generate;
pub mod info;
pub mod inspect;
pub mod quantize;
pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use llama_bridge::{Backend, NumaStrategy, QuantType};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "llama-bridge",
    version,
    about = "Inspect, run, quantize and serve GGUF models through llama-bridge"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// Configuration file (default: platform config dir).
    #[arg(long, global = true, env = "LLAMA_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// NUMA strategy: disabled, distribute, isolate, numactl, mirror.
    #[arg(long, global = true, env = "LLAMA_BRIDGE_NUMA")]
    pub numa: Option<NumaStrategy>,
}

impl GlobalArgs {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(AppConfig::default_path)
    }

    /// Create and initialize the backend every command works through.
    pub fn open_backend(&self) -> anyhow::Result<Backend> {
        let backend = Backend::new(crate::engine::native_engine()?);
        backend.route_logs_to_tracing();
        backend.initialize()?;
        if let Some(strategy) = self.numa {
            backend.initialize_numa(strategy);
        }
        Ok(backend)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print backend system info and capabilities.
    Info,

    /// Print model metadata as JSON.
    Inspect(InspectArgs),

    /// Generate text from a prompt.
    Generate(GenerateArgs),

    /// Quantize a GGUF model.
    Quantize(QuantizeArgs),

    /// Start the tokenization HTTP service.
    Serve(ServeArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct InspectArgs {
    /// Path to a GGUF model file.
    pub model: PathBuf,

    /// Load only the vocabulary.
    #[arg(long)]
    pub vocab_only: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GenerateArgs {
    /// Path to a GGUF model file (default: `model` from the config).
    pub model: Option<PathBuf>,

    /// Prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Temperature (0 = greedy).
    #[arg(long)]
    pub temp: Option<f32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    /// Top-k (0 = disabled).
    #[arg(long)]
    pub top_k: Option<i32>,

    /// Repetition penalty (1.0 = disabled).
    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    #[arg(long)]
    pub repeat_last_n: Option<usize>,

    #[arg(short = 'n', long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Stop generation at this string (can be repeated).
    #[arg(long = "stop")]
    pub stop_words: Vec<String>,

    /// Context size.
    #[arg(short = 'c', long)]
    pub ctx_size: Option<u32>,

    /// Threads.
    #[arg(short, long)]
    pub threads: Option<i32>,

    /// GPU layers.
    #[arg(long)]
    pub n_gpu_layers: Option<i32>,

    /// Do not prepend the BOS token to the prompt.
    #[arg(long)]
    pub no_bos: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct QuantizeArgs {
    /// Source GGUF file.
    pub input: PathBuf,

    /// Destination file.
    pub output: PathBuf,

    /// Target type, e.g. q4_0, q8_0, q4_k_m.
    #[arg(long = "type", default_value = "q4_0")]
    pub ftype: QuantType,

    #[arg(long, default_value_t = 4)]
    pub threads: u32,

    #[arg(long)]
    pub allow_requantize: bool,

    /// Keep the output tensor unquantized.
    #[arg(long)]
    pub leave_output_tensor: bool,

    /// Copy tensors as-is.
    #[arg(long)]
    pub only_copy: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct ServeArgs {
    /// Model to serve (default: `model` from the config).
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Listen address.
    #[arg(long, env = "LLAMA_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Listen port.
    #[arg(short, long, env = "LLAMA_BRIDGE_PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
}
