//! GPU, scheme, precision and model preset enums.

use serde::{Deserialize, Serialize};

/// GPU generation the job is tuned for.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum GpuType {
    #[default]
    H100,
    B200,
    Gb200,
}

impl GpuType {
    /// Key used in the layout defaults table.
    pub fn key(self) -> &'static str {
        match self {
            Self::H100 => "h100",
            Self::B200 => "b200",
            Self::Gb200 => "gb200",
        }
    }
}

impl std::fmt::Display for GpuType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for GpuType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h100" => Ok(Self::H100),
            "b200" => Ok(Self::B200),
            "gb200" => Ok(Self::Gb200),
            _ => Err(format!("unknown gpu type '{s}'. Use: h100, b200, gb200")),
        }
    }
}

/// Fine-tuning scheme.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum FinetuneScheme {
    /// Full-parameter supervised fine-tuning.
    Sft,
    /// Low-rank adapters.
    #[default]
    Lora,
}

impl FinetuneScheme {
    /// Key used in the layout defaults table and the experiment name.
    pub fn key(self) -> &'static str {
        match self {
            Self::Sft => "sft",
            Self::Lora => "lora",
        }
    }

    /// PEFT scheme name handed to the recipe factory. Full fine-tuning is `none`.
    pub fn peft_scheme(self) -> &'static str {
        match self {
            Self::Sft => "none",
            Self::Lora => "lora",
        }
    }

    pub fn is_peft(self) -> bool {
        matches!(self, Self::Lora)
    }
}

impl std::fmt::Display for FinetuneScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for FinetuneScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sft" | "none" => Ok(Self::Sft),
            "lora" => Ok(Self::Lora),
            _ => Err(format!("unknown fine-tuning scheme '{s}'. Use: sft, lora")),
        }
    }
}

/// Compute precision for the training step.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    #[default]
    Bf16,
    Fp8,
}

impl std::fmt::Display for ComputeDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bf16 => write!(f, "bf16"),
            Self::Fp8 => write!(f, "fp8"),
        }
    }
}

impl std::str::FromStr for ComputeDtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bf16" => Ok(Self::Bf16),
            "fp8" => Ok(Self::Fp8),
            _ => Err(format!("unknown compute dtype '{s}'. Use: bf16, fp8")),
        }
    }
}

/// Model family.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Llama3,
    #[default]
    Llama31,
}

impl ModelFamily {
    pub fn key(self) -> &'static str {
        match self {
            Self::Llama3 => "llama3",
            Self::Llama31 => "llama31",
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Model size presets.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ModelSize {
    #[cfg_attr(feature = "clap", value(name = "8b"))]
    #[serde(rename = "8b")]
    B8,
    #[cfg_attr(feature = "clap", value(name = "70b"))]
    #[serde(rename = "70b")]
    B70,
    #[default]
    #[cfg_attr(feature = "clap", value(name = "405b"))]
    #[serde(rename = "405b")]
    B405,
}

impl ModelSize {
    pub fn key(self) -> &'static str {
        match self {
            Self::B8 => "8b",
            Self::B70 => "70b",
            Self::B405 => "405b",
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// A model the launcher knows how to fine-tune.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelPreset {
    pub family: ModelFamily,
    pub size: ModelSize,
    /// HuggingFace model id, also used as the tokenizer identifier.
    pub hf_model_id: String,
    pub seq_length: u32,
}

impl ModelPreset {
    /// Look up a shipped preset.
    pub fn lookup(family: ModelFamily, size: ModelSize) -> Option<Self> {
        let hf_model_id = match (family, size) {
            (ModelFamily::Llama3, ModelSize::B8) => "meta-llama/Meta-Llama-3-8B",
            (ModelFamily::Llama3, ModelSize::B70) => "meta-llama/Meta-Llama-3-70B",
            (ModelFamily::Llama31, ModelSize::B405) => "meta-llama/Llama-3.1-405B",
            _ => return None,
        };
        Some(Self {
            family,
            size,
            hf_model_id: hf_model_id.to_string(),
            seq_length: 2048,
        })
    }

    /// Script identity used in experiment names, e.g. `finetune_llama31_405b`.
    pub fn script_name(&self) -> String {
        format!("finetune_{}_{}", self.family, self.size)
    }

    /// Checkpoint import source URI.
    pub fn hf_source(&self) -> String {
        format!("hf://{}", self.hf_model_id)
    }
}
