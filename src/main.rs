// transdg binary
//
// Commands:
//   transdg params [--config TIER] [--config-file PATH]   Build a model, print trainable parameters
//   transdg smoke  [--config TIER] [--steps N]            Train/eval/decode on a synthetic batch
//
// Config tiers: test (default, CPU), default (paper sizes, auto-GPU)
// --config-file without --config selects the default tier's device.
// GPU: auto-detected when compiled with --features cuda and tier is not "test"

use anyhow::{bail, Context, Result};
use candle_core::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use transdg::synthetic;
use transdg::{ModelConfig, TransDgModel};

const SEED: u64 = 1234;

// ---------------------------------------------------------------------------
// Config Tier Selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn model_config(&self) -> ModelConfig {
        match self {
            Self::Test => ModelConfig::tiny(),
            Self::Default => ModelConfig::default(),
        }
    }
}

/// CUDA if available and not test tier, else CPU.
fn select_device(tier: ConfigTier) -> Device {
    if tier == ConfigTier::Test {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    info!("using CUDA device 0");
                    return dev;
                }
                Err(e) => warn!("CUDA init failed, falling back to CPU: {e}"),
            }
        } else {
            info!("CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    warn!("built without the cuda feature, using CPU");

    Device::Cpu
}

struct Options {
    /// Explicit `--config` tier, if given.
    tier: Option<ConfigTier>,
    config_file: Option<String>,
    steps: usize,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut opts = Options {
            tier: None,
            config_file: None,
            steps: 20,
        };
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--config" => {
                    let v = it.next().context("--config needs a tier")?;
                    opts.tier = Some(match ConfigTier::parse(v) {
                        Some(t) => t,
                        None => {
                            warn!("unknown config tier '{v}', using test");
                            ConfigTier::Test
                        }
                    });
                }
                "--config-file" => {
                    opts.config_file = Some(it.next().context("--config-file needs a path")?.clone());
                }
                "--steps" => {
                    let v = it.next().context("--steps needs a number")?;
                    opts.steps = v.parse().with_context(|| format!("bad --steps value '{v}'"))?;
                }
                other => bail!("unknown argument '{other}'"),
            }
        }
        Ok(opts)
    }

    /// Tier used for device selection. A config file without an explicit
    /// `--config` runs as the default tier, so it may use the GPU.
    fn device_tier(&self) -> ConfigTier {
        match (self.tier, &self.config_file) {
            (Some(t), _) => t,
            (None, Some(_)) => ConfigTier::Default,
            (None, None) => ConfigTier::Test,
        }
    }

    fn model_config(&self) -> Result<ModelConfig> {
        match &self.config_file {
            Some(path) => ModelConfig::from_json_file(path),
            None => Ok(self.device_tier().model_config()),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = Options::parse(&args[2..]).and_then(|opts| match args[1].as_str() {
        "params" => cmd_params(&opts),
        "smoke" => cmd_smoke(&opts),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    });

    if let Err(e) = result {
        eprintln!("[transdg] error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: transdg <command> [--config test|default] [--config-file PATH]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  params           Build a model and list its trainable parameters");
    eprintln!("  smoke [--steps N]  Train, evaluate and decode on a synthetic batch");
    eprintln!();
    eprintln!("Config tiers:");
    eprintln!("  test     emb=8, units=16, 2 layers, CPU only");
    eprintln!("  default  emb=300, units=512, 2 layers, auto-GPU");
    eprintln!();
    eprintln!("Logging follows RUST_LOG (default: info).");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn build_model(opts: &Options) -> Result<TransDgModel> {
    let config = opts.model_config()?;
    let device = select_device(opts.device_tier());
    let embed = synthetic::embedding(config.vocab_size, config.dim_emb, SEED, &device)?;
    let params = synthetic::bilinear_params(&config, SEED + 1, &device)?;
    let mut model = TransDgModel::new(config, embed, &params, &device)?;
    let words = synthetic::vocabulary(model.config().vocab_size);
    model.set_vocabs(&words, &synthetic::kd_types())?;
    Ok(model)
}

fn cmd_params(opts: &Options) -> Result<()> {
    let model = build_model(opts)?;
    let params = model.show_parameters()?;
    let total: usize = params.iter().map(|p| p.shape.iter().product::<usize>()).sum();
    for p in &params {
        println!("{:<60} {:?}", p.name, p.shape);
    }
    println!("{} tensors, {} parameters", params.len(), total);
    Ok(())
}

fn cmd_smoke(opts: &Options) -> Result<()> {
    let mut model = build_model(opts)?;
    let words = synthetic::vocabulary(model.config().vocab_size);
    let batch = synthetic::batch(&words, 4, SEED + 2);
    let trans = if model.config().use_trans_repr {
        Some(synthetic::trans_reprs(model.config(), batch.len(), 3, SEED + 3, model.device())?)
    } else {
        None
    };

    let before = model.eval_batch(&batch, trans.as_ref())?;
    info!(loss = before.loss, "initial eval");
    for _ in 0..opts.steps {
        let out = model.train_batch(&batch, trans.as_ref())?;
        info!(step = model.global_step(), loss = out.loss, "train");
    }
    let after = model.eval_batch(&batch, trans.as_ref())?;
    let decoded = model.decode_batch(&batch, trans.as_ref())?;

    println!("loss: {:.4} -> {:.4}", before.loss, after.loss);
    println!("ppx:  {:?}", after.ppx);
    for (post, gen) in batch.posts.iter().zip(&decoded.generation) {
        println!("  {} => {}", post.join(" "), gen.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tier_defaults_to_test() -> Result<()> {
        let opts = Options::parse(&args(&["--steps", "3"]))?;
        assert_eq!(opts.device_tier(), ConfigTier::Test);
        assert_eq!(opts.steps, 3);
        Ok(())
    }

    #[test]
    fn test_config_file_implies_default_tier() -> Result<()> {
        let opts = Options::parse(&args(&["--config-file", "model.json"]))?;
        assert_eq!(opts.device_tier(), ConfigTier::Default);

        let opts = Options::parse(&args(&["--config-file", "model.json", "--config", "test"]))?;
        assert_eq!(opts.device_tier(), ConfigTier::Test);
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_argument() {
        assert!(Options::parse(&args(&["--beam", "4"])).is_err());
    }
}
