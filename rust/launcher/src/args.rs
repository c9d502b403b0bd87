//! Command-line job arguments and their cross-field validation.

use std::path::PathBuf;

use finetune_config::{
    ComputeDtype, FinetuneScheme, GpuType, LayoutKey, LayoutOverrides, LayoutTable, ModelFamily,
    ModelPreset, ModelSize,
};

/// Selects the model, scheme and layout. Shared by `run` and `layout`.
#[derive(Clone, Debug, clap::Args)]
pub struct SelectArgs {
    /// Target GPU type
    #[arg(short, long, default_value = "h100", ignore_case = true)]
    pub gpu: GpuType,
    /// Fine-tuning scheme
    #[arg(short, long, default_value = "lora")]
    pub finetuning: FinetuneScheme,
    /// Model family
    #[arg(long, default_value = "llama31")]
    pub model_family: ModelFamily,
    /// Model size
    #[arg(long, default_value = "405b")]
    pub model_size: ModelSize,
    /// GPUs per node
    #[arg(long, default_value = "8", value_parser = clap::value_parser!(u32).range(1..))]
    pub gpus_per_node: u32,
    /// Compute dtype
    #[arg(short = 'c', long, default_value = "bf16", ignore_case = true)]
    pub compute_dtype: ComputeDtype,
    /// Maximum number of training steps
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_steps: u32,
    /// Extra layout table merged over the built-in one
    #[arg(long)]
    pub layouts: Option<PathBuf>,
    #[command(flatten)]
    pub overrides: LayoutOverrides,
}

impl SelectArgs {
    pub fn layout_key(&self) -> LayoutKey {
        LayoutKey {
            gpu: self.gpu,
            scheme: self.finetuning,
            family: self.model_family,
            size: self.model_size,
        }
    }

    pub fn preset(&self) -> Result<ModelPreset, ArgsError> {
        ModelPreset::lookup(self.model_family, self.model_size).ok_or(ArgsError::UnknownModel(
            self.model_family.to_string(),
            self.model_size.to_string(),
        ))
    }

    /// Built-in layout table, with `--layouts` merged on top if given.
    pub fn layout_table(&self) -> Result<LayoutTable, finetune_config::LayoutError> {
        match &self.layouts {
            Some(path) => LayoutTable::with_overlay(path),
            None => LayoutTable::builtin(),
        }
    }
}

/// Everything needed to build and submit a fine-tuning experiment.
#[derive(Clone, Debug, clap::Args)]
pub struct JobArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Slurm account
    #[arg(short, long, env = "SLURM_ACCOUNT")]
    pub account: String,
    /// Slurm partition
    #[arg(short, long, env = "SLURM_PARTITION")]
    pub partition: String,
    /// Slurm time limit, [D-]HH:MM:SS
    #[arg(short, long, default_value = "00:30:00")]
    pub time_limit: String,
    /// Container image
    #[arg(short = 'i', long, default_value = "nvcr.io/nvidia/nemo:dev")]
    pub container_image: String,
    /// Extra container mounts, comma separated src:dst[:opts]
    #[arg(long, value_delimiter = ',')]
    pub custom_mounts: Vec<String>,
    /// Extra environment variables for the jobs
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub custom_env: Vec<String>,
    /// Experiment and log directory on the shared filesystem
    #[arg(short, long, env = "NEMORUN_HOME")]
    pub log_dir: PathBuf,
    /// NeMo home holding checkpoints and dataset caches [default: ~/.cache/nemo]
    #[arg(long, env = "NEMO_HOME")]
    pub nemo_home: Option<PathBuf>,

    /// HuggingFace token, needed to import the checkpoint
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
    /// Skip the checkpoint import job (checkpoint already in NeMo home)
    #[arg(long)]
    pub skip_import: bool,

    /// Enable TensorBoard logging
    #[arg(long)]
    pub tensorboard: bool,
    /// Enable Weights & Biases logging
    #[arg(long)]
    pub wandb: bool,
    /// Weights & Biases API key
    #[arg(long, env = "WANDB_API_KEY", hide_env_values = true)]
    pub wandb_key: Option<String>,
    /// Weights & Biases project name
    #[arg(long)]
    pub wandb_prj_name: Option<String>,
    /// Weights & Biases job name
    #[arg(long)]
    pub wandb_job_name: Option<String>,

    /// Profile steps 5-6 with nsys
    #[arg(long)]
    pub enable_nsys: bool,
    /// Print the plan without submitting anything
    #[arg(short, long)]
    pub dryrun: bool,
}

/// `~/.cache/nemo`, the cache home the training container uses when `NEMO_HOME` is unset.
pub fn default_nemo_home() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/root"), PathBuf::from)
        .join(".cache")
        .join("nemo")
}

impl JobArgs {
    /// Whether a checkpoint import job will be scheduled ahead of training.
    pub fn import_needed(&self) -> bool {
        !self.skip_import
    }

    pub fn nemo_home(&self) -> PathBuf {
        self.nemo_home.clone().unwrap_or_else(default_nemo_home)
    }

    /// Check cross-field constraints before anything is built or submitted.
    pub fn validate(&self) -> Result<(), ArgsError> {
        self.select.preset()?;

        if self.wandb {
            if is_blank(self.wandb_key.as_deref()) {
                return Err(ArgsError::Missing("wandb logging needs --wandb-key"));
            }
            if is_blank(self.wandb_prj_name.as_deref()) {
                return Err(ArgsError::Missing("wandb logging needs --wandb-prj-name"));
            }
            if is_blank(self.wandb_job_name.as_deref()) {
                return Err(ArgsError::Missing("wandb logging needs --wandb-job-name"));
            }
        }

        if self.import_needed() && is_blank(self.hf_token.as_deref()) {
            return Err(ArgsError::Missing(
                "HF token is required for importing the checkpoint from HuggingFace \
                 (pass --hf-token or --skip-import)",
            ));
        }

        if self.account.trim().is_empty() {
            return Err(ArgsError::Missing("--account must not be empty"));
        }
        if self.partition.trim().is_empty() {
            return Err(ArgsError::Missing("--partition must not be empty"));
        }

        parse_time_limit(&self.time_limit)?;
        for mount in &self.custom_mounts {
            parse_mount(mount)?;
        }
        self.env_overrides()?;
        Ok(())
    }

    /// Parsed `--env` pairs.
    pub fn env_overrides(&self) -> Result<Vec<(String, String)>, ArgsError> {
        self.custom_env.iter().map(|s| parse_env(s)).collect()
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Validate a Slurm `[D-]HH:MM:SS` time limit and return it in seconds.
pub fn parse_time_limit(s: &str) -> Result<u64, ArgsError> {
    let invalid = || ArgsError::TimeLimit(s.to_string());

    let (days, clock) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| invalid())?, rest),
        None => (0, s),
    };
    let parts: Vec<&str> = clock.split(':').collect();
    let [h, m, sec] = parts[..] else {
        return Err(invalid());
    };
    let field = |v: &str| -> Result<u64, ArgsError> {
        if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        v.parse().map_err(|_| invalid())
    };
    let (h, m, sec) = (field(h)?, field(m)?, field(sec)?);
    if m >= 60 || sec >= 60 {
        return Err(invalid());
    }
    let total = days
        .checked_mul(86_400)
        .zip(h.checked_mul(3_600))
        .and_then(|(d, h)| d.checked_add(h))
        .and_then(|t| t.checked_add(m * 60 + sec))
        .ok_or_else(invalid)?;
    if total == 0 {
        return Err(invalid());
    }
    Ok(total)
}

/// Validate a `src:dst[:opts]` container mount.
pub fn parse_mount(s: &str) -> Result<(), ArgsError> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [src, dst] | [src, dst, _] if !src.is_empty() && !dst.is_empty() => Ok(()),
        _ => Err(ArgsError::Mount(s.to_string())),
    }
}

/// Parse a `KEY=VALUE` pair.
pub fn parse_env(s: &str) -> Result<(String, String), ArgsError> {
    match s.split_once('=') {
        Some((k, v))
            if !k.is_empty() && k.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') =>
        {
            Ok((k.to_string(), v.to_string()))
        }
        _ => Err(ArgsError::Env(s.to_string())),
    }
}

/// Argument validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("{0}")]
    Missing(&'static str),
    #[error("no model preset for {0} {1}")]
    UnknownModel(String, String),
    #[error("invalid time limit '{0}', expected [D-]HH:MM:SS")]
    TimeLimit(String),
    #[error("invalid mount '{0}', expected src:dst[:opts]")]
    Mount(String),
    #[error("invalid environment variable '{0}', expected KEY=VALUE")]
    Env(String),
}
