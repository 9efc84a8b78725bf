//! lorarl CLI
//!
//! Operator tooling for adapters and saved training state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use lorarl::checkpoint::{StateLayout, TrainingStepRecord};
use lorarl::model::{
    AdapterSource, BaseModel, DevicePlacement, GenerationOptions, LoraConfig, LoraLanguageModel,
    PolicyModel, Precision, RoleDict, ADAPTER_CONFIG_FILE,
};
use lorarl::session::{ChatHistoryItem, Role};
use lorarl::utils::{abbreviate, format_elapsed};

#[derive(Parser)]
#[command(name = "lorarl")]
#[command(version, about = "lorarl - REINFORCE training of LoRA adapters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Base model directory (config.json, model.safetensors, tokenizer.json)
    #[arg(long)]
    base: PathBuf,

    /// Precision of the base weights (float32, float16, bfloat16)
    #[arg(long, default_value = "float32")]
    precision: Precision,

    /// Device placement (auto, cpu, cuda, cuda:N)
    #[arg(long, default_value = "auto")]
    device: DevicePlacement,
}

impl ModelArgs {
    fn load(&self) -> Result<BaseModel> {
        BaseModel::from_pretrained(&self.base, self.precision, self.device)
            .with_context(|| format!("loading base model from {}", self.base.display()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a fresh adapter to a base model and save it
    Init {
        #[command(flatten)]
        model: ModelArgs,

        /// Output directory for the adapter
        #[arg(long)]
        output: PathBuf,

        /// Adapter rank
        #[arg(long, default_value = "16")]
        rank: i64,

        /// Scaling numerator
        #[arg(long, default_value = "32.0")]
        alpha: f64,

        /// Adapter dropout
        #[arg(long, default_value = "0.1")]
        dropout: f64,

        /// Projections to adapt
        #[arg(long, value_delimiter = ',', default_value = "q_proj,v_proj,k_proj,o_proj")]
        targets: Vec<String>,
    },

    /// Answer one prompt and print the response with its summed logprob
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        /// Adapter directory written by `init` or a training run
        #[arg(long)]
        adapter: Option<PathBuf>,

        /// User message
        #[arg(long)]
        prompt: String,

        /// System prompt
        #[arg(long, default_value = "")]
        system: String,

        /// Token budget for the response
        #[arg(long, default_value = "256")]
        max_new_tokens: usize,

        /// Sample instead of greedy decoding
        #[arg(long)]
        sample: bool,

        /// Sampling temperature
        #[arg(long, default_value = "1.0")]
        temperature: f64,

        /// Keep only the k most likely tokens when sampling
        #[arg(long)]
        top_k: Option<i64>,

        /// Sampling seed
        #[arg(long)]
        seed: Option<i64>,
    },

    /// Show what a saved training state contains
    Inspect {
        /// State directory written by the training engine
        state_dir: PathBuf,
    },

    /// Write a tiny randomly initialized base model for smoke runs
    TinyBase {
        /// Output model directory
        #[arg(long)]
        output: PathBuf,

        /// Initialization seed
        #[arg(long, default_value = "0")]
        seed: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            model,
            output,
            rank,
            alpha,
            dropout,
            targets,
        } => {
            let config = LoraConfig::default()
                .with_rank(rank)
                .with_alpha(alpha)
                .with_dropout(dropout)
                .with_target_modules(targets);
            init(&model, &output, config)?;
        }
        Commands::Generate {
            model,
            adapter,
            prompt,
            system,
            max_new_tokens,
            sample,
            temperature,
            top_k,
            seed,
        } => {
            let mut options = GenerationOptions::default().with_max_new_tokens(max_new_tokens);
            if sample {
                options = options.with_sampling(temperature, top_k);
            }
            if let Some(seed) = seed {
                options = options.with_seed(seed);
            }
            options.validate()?;
            generate(&model, adapter, &prompt, &system, &options)?;
        }
        Commands::Inspect { state_dir } => {
            inspect(&state_dir)?;
        }
        Commands::TinyBase { output, seed } => {
            lorarl::testing::tiny_base_model(seed)?.save(&output)?;
            println!("Wrote tiny base model to {}", output.display());
        }
    }

    Ok(())
}

fn init(args: &ModelArgs, output: &Path, config: LoraConfig) -> Result<()> {
    let base = args.load()?;
    let model = LoraLanguageModel::new(base, RoleDict::default(), AdapterSource::Config(config))?;
    model.save_adapter(output)?;

    println!("Adapter saved to {}", output.display());
    println!(
        "  rank {}, alpha {}, targets {}",
        model.lora_config().r,
        model.lora_config().lora_alpha,
        model.lora_config().target_modules.join(",")
    );
    println!(
        "  trainable parameters: {}",
        abbreviate(model.num_trainable_parameters())
    );
    Ok(())
}

fn generate(
    args: &ModelArgs,
    adapter: Option<PathBuf>,
    prompt: &str,
    system: &str,
    options: &GenerationOptions,
) -> Result<()> {
    let base = args.load()?;
    let mut model =
        LoraLanguageModel::new(base, RoleDict::default(), AdapterSource::resolve(adapter, None))?;

    let history = vec![ChatHistoryItem::new(Role::User, prompt)];
    let start = Instant::now();
    let output = model.generate_with_logprob(std::slice::from_ref(&history), options, system)?;
    let elapsed = start.elapsed();

    let response = output
        .responses
        .first()
        .context("model returned no response")?;
    let logprob = output
        .logprobs
        .first()
        .context("model returned no logprob")?
        .f_double_value(&[])?;

    tracing::info!(elapsed = %format_elapsed(elapsed), "Generation finished");
    println!("{}", response.content);
    println!("logprob: {:.4}", logprob);
    Ok(())
}

fn inspect(state_dir: &Path) -> Result<()> {
    let layout = StateLayout::new(state_dir);
    anyhow::ensure!(
        layout.root().is_dir(),
        "{} is not a directory",
        layout.root().display()
    );
    println!("State directory: {}", layout.root().display());

    match TrainingStepRecord::load(layout.training_step()) {
        Ok(record) => println!("Training step: {}", record.training_step),
        Err(e) => println!("Training step: unavailable ({})", e),
    }

    let optimizer_path = layout.optimizer_state();
    if optimizer_path.exists() {
        let tensors = tch::Tensor::read_safetensors(&optimizer_path)
            .with_context(|| format!("reading {}", optimizer_path.display()))?;
        let mut params: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut step = None;
        for (name, tensor) in &tensors {
            if name == "step" {
                step = Some(tensor.f_int64_value(&[0])?);
            } else if let Some(param) = name.strip_prefix("exp_avg.") {
                params.insert(param.to_string(), tensor.size());
            }
        }
        let total: i64 = params.values().map(|shape| shape.iter().product::<i64>()).sum();

        println!(
            "Optimizer: step {}, {} tensors, {} parameters",
            step.map_or_else(|| "?".to_string(), |s| s.to_string()),
            params.len(),
            abbreviate(total)
        );
        for (name, shape) in &params {
            println!("  {} {:?}", name, shape);
        }
    } else {
        println!("Optimizer: none");
    }

    let adapter_config = layout.lora_weights().join(ADAPTER_CONFIG_FILE);
    if adapter_config.exists() {
        let config = LoraConfig::from_file(&adapter_config)?;
        println!("Adapter config:");
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("Adapter: none");
    }

    Ok(())
}
