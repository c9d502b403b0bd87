//! Training recipe description and the builder stages that shape it.
//!
//! Every stage takes a [`Recipe`] by value and returns the new one, so the
//! order of stages is visible at the call site and nothing is mutated behind
//! a shared reference.

use serde::{Deserialize, Serialize};

use finetune_config::{
    ComputeDtype, FinetuneScheme, ModelFamily, ModelPreset, ModelSize, ParallelLayout,
};

use crate::{args::JobArgs, cache::PackedCache};

/// Where TensorBoard events land inside the container (the log dir is mounted at `/nemo_run`).
pub const TENSORBOARD_DIR: &str = "/nemo_run/lightning_logs";

/// Steps between Python garbage collection passes in performance runs.
const GC_INTERVAL_STEPS: u32 = 100;

/// Reference to the model being fine-tuned.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRef {
    pub family: ModelFamily,
    pub size: ModelSize,
    pub hf_model_id: String,
}

/// Parameter-efficient fine-tuning settings. Absent for full fine-tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeftConfig {
    pub scheme: String,
    pub target_modules: Vec<String>,
    pub dim: u32,
    pub alpha: u32,
}

/// Numeric precision plugin of the trainer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrecisionPlugin {
    pub kind: PrecisionKind,
    pub params_dtype: String,
    pub grad_reduce_in_fp32: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp8: Option<Fp8Settings>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionKind {
    Bf16Mixed,
    Bf16WithFp8Mixed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fp8Settings {
    pub recipe: String,
    pub margin: u32,
    pub amax_history_len: u32,
    pub amax_compute_algo: String,
}

impl PrecisionPlugin {
    pub fn bf16_mixed() -> Self {
        Self {
            kind: PrecisionKind::Bf16Mixed,
            params_dtype: "bf16".to_string(),
            grad_reduce_in_fp32: true,
            fp8: None,
        }
    }

    /// Mixed bf16 parameters with fp8 matmuls (delayed scaling).
    pub fn bf16_with_fp8_mixed() -> Self {
        Self {
            kind: PrecisionKind::Bf16WithFp8Mixed,
            params_dtype: "bf16".to_string(),
            grad_reduce_in_fp32: true,
            fp8: Some(Fp8Settings {
                recipe: "delayed".to_string(),
                margin: 0,
                amax_history_len: 1024,
                amax_compute_algo: "max".to_string(),
            }),
        }
    }
}

/// Trainer callbacks attached by recipe stages and plugins.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Callback {
    GarbageCollection { interval_train: u32, interval_val: u32 },
    Nsys { start_step: u32, end_step: u32, ranks: Vec<u32> },
}

/// Distributed strategy of the trainer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyConfig {
    pub tensor_model_parallel_size: u32,
    pub pipeline_model_parallel_size: u32,
    pub context_parallel_size: u32,
    pub virtual_pipeline_model_parallel_size: Option<u32>,
    pub expert_model_parallel_size: u32,
    pub sequence_parallel: bool,
    pub use_te_rng_tracker: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            tensor_model_parallel_size: 1,
            pipeline_model_parallel_size: 1,
            context_parallel_size: 1,
            virtual_pipeline_model_parallel_size: None,
            expert_model_parallel_size: 1,
            sequence_parallel: false,
            use_te_rng_tracker: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrainerConfig {
    pub num_nodes: u32,
    pub devices: u32,
    pub max_steps: u32,
    pub val_check_interval: u32,
    pub limit_val_batches: u32,
    pub enable_checkpointing: bool,
    pub log_every_n_steps: u32,
    pub enable_cuda_graph: bool,
    pub strategy: StrategyConfig,
    pub precision: PrecisionPlugin,
    #[serde(default)]
    pub callbacks: Vec<Callback>,
}

/// Fine-tuning dataset module.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataModule {
    /// Dataset name, e.g. `squad`.
    pub dataset: String,
    pub seq_length: u32,
    pub micro_batch_size: u32,
    pub global_batch_size: u32,
    pub tokenizer: Option<String>,
    pub packed_sequence: bool,
    pub force_redownload: bool,
    /// The module packs sequences into an on-disk cache that can be reused
    /// across runs. Only such modules honour `force_redownload`.
    pub supports_packed_cache: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorBoardLogger {
    pub save_dir: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WandbLogger {
    pub project: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_dir: Option<String>,
    pub tensorboard: Option<TensorBoardLogger>,
    pub wandb: Option<WandbLogger>,
    pub checkpoint: bool,
}

/// Full description of a fine-tuning run, consumed by the training runtime.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipe {
    pub model: ModelRef,
    pub peft: Option<PeftConfig>,
    pub performance_mode: bool,
    pub trainer: TrainerConfig,
    pub data: DataModule,
    pub log: LogConfig,
}

/// Source of base recipes for a model.
pub trait RecipeFactory {
    /// Base fine-tuning recipe for `scheme`.
    fn finetune_recipe(&self, scheme: FinetuneScheme, performance_mode: bool) -> Recipe;

    /// The model description, as used by the checkpoint importer.
    fn model(&self) -> ModelRef;
}

/// Recipes derived from a shipped [`ModelPreset`], fine-tuning on SQuAD.
#[derive(Clone, Debug)]
pub struct PresetRecipes {
    preset: ModelPreset,
}

impl PresetRecipes {
    pub fn new(preset: ModelPreset) -> Self {
        Self { preset }
    }
}

impl RecipeFactory for PresetRecipes {
    fn finetune_recipe(&self, scheme: FinetuneScheme, performance_mode: bool) -> Recipe {
        let peft = scheme.is_peft().then(|| PeftConfig {
            scheme: scheme.peft_scheme().to_string(),
            // Performance runs only adapt the fused QKV projection.
            target_modules: if performance_mode {
                vec!["linear_qkv".to_string()]
            } else {
                ["linear_qkv", "linear_proj", "linear_fc1", "linear_fc2"]
                    .map(String::from)
                    .to_vec()
            },
            dim: 16,
            alpha: 32,
        });

        let mut callbacks = Vec::new();
        if performance_mode {
            callbacks.push(Callback::GarbageCollection {
                interval_train: GC_INTERVAL_STEPS,
                interval_val: GC_INTERVAL_STEPS,
            });
        }

        Recipe {
            model: self.model(),
            peft,
            performance_mode,
            trainer: TrainerConfig {
                num_nodes: 1,
                devices: 8,
                max_steps: 1000,
                val_check_interval: 100,
                limit_val_batches: 32,
                enable_checkpointing: true,
                log_every_n_steps: 10,
                enable_cuda_graph: false,
                strategy: StrategyConfig::default(),
                precision: PrecisionPlugin::bf16_mixed(),
                callbacks,
            },
            data: DataModule {
                dataset: "squad".to_string(),
                seq_length: self.preset.seq_length,
                micro_batch_size: 1,
                global_batch_size: 128,
                tokenizer: None,
                packed_sequence: performance_mode,
                force_redownload: false,
                supports_packed_cache: true,
            },
            log: LogConfig {
                log_dir: None,
                tensorboard: Some(TensorBoardLogger {
                    save_dir: "tb_logs".to_string(),
                    name: "default".to_string(),
                }),
                wandb: None,
                checkpoint: true,
            },
        }
    }

    fn model(&self) -> ModelRef {
        ModelRef {
            family: self.preset.family,
            size: self.preset.size,
            hf_model_id: self.preset.hf_model_id.clone(),
        }
    }
}

/// Base recipe for `scheme` in performance mode, with the layout and logging applied.
pub fn build_recipe(
    factory: &impl RecipeFactory,
    scheme: FinetuneScheme,
    layout: &ParallelLayout,
    args: &JobArgs,
) -> Recipe {
    let recipe = factory.finetune_recipe(scheme, true);
    let recipe = apply_layout(recipe, layout, args.select.gpus_per_node, args.select.max_steps);
    apply_logging(
        recipe,
        args.tensorboard,
        args.wandb
            .then(|| (args.wandb_prj_name.clone(), args.wandb_job_name.clone())),
    )
}

/// Parallel degrees, batch sizes, step budget and CUDA graphs.
pub fn apply_layout(
    mut recipe: Recipe,
    layout: &ParallelLayout,
    gpus_per_node: u32,
    max_steps: u32,
) -> Recipe {
    recipe.trainer.num_nodes = layout.num_nodes;
    recipe.trainer.devices = gpus_per_node;
    recipe.trainer.max_steps = max_steps;
    // Performance runs skip validation and checkpoints.
    recipe.trainer.val_check_interval = max_steps;
    recipe.trainer.limit_val_batches = 0;
    recipe.trainer.enable_checkpointing = false;

    recipe.trainer.strategy = StrategyConfig {
        tensor_model_parallel_size: layout.tp,
        pipeline_model_parallel_size: layout.pp,
        context_parallel_size: layout.cp,
        virtual_pipeline_model_parallel_size: layout.virtual_pipeline(),
        expert_model_parallel_size: layout.ep,
        sequence_parallel: layout.tp > 1,
        use_te_rng_tracker: layout.enable_cuda_graphs,
    };
    recipe.trainer.enable_cuda_graph = layout.enable_cuda_graphs;

    recipe.data.micro_batch_size = layout.mbs;
    recipe.data.global_batch_size = layout.gbs;
    recipe
}

/// Console, TensorBoard and W&B logging. `wandb` carries `(project, job name)` when enabled.
pub fn apply_logging(
    mut recipe: Recipe,
    tensorboard: bool,
    wandb: Option<(Option<String>, Option<String>)>,
) -> Recipe {
    recipe.trainer.log_every_n_steps = 1;
    recipe.log.checkpoint = false;

    if tensorboard {
        recipe.log.log_dir = Some(TENSORBOARD_DIR.to_string());
        recipe.log.tensorboard = Some(TensorBoardLogger {
            save_dir: "tb_logs".to_string(),
            name: "default".to_string(),
        });
    } else {
        // TensorBoard adds step overhead
        recipe.log.tensorboard = None;
    }

    recipe.log.wandb = wandb.map(|(project, name)| WandbLogger {
        project: project.unwrap_or_default(),
        name: name.unwrap_or_default(),
    });
    recipe
}

/// Tokenizer, dataset cache and precision overrides, applied in that order.
pub fn apply_data_and_precision_overrides(
    mut recipe: Recipe,
    preset: &ModelPreset,
    dtype: ComputeDtype,
    cache: &impl PackedCache,
) -> Recipe {
    recipe.data.tokenizer = Some(preset.hf_model_id.clone());

    if recipe.data.supports_packed_cache && !cache.is_valid(&preset.hf_model_id, &recipe.data) {
        tracing::info!(
            "No valid packed {} cache for {}, forcing dataset re-download",
            recipe.data.dataset,
            preset.hf_model_id
        );
        recipe.data.force_redownload = true;
    }

    if dtype == ComputeDtype::Fp8 {
        tracing::warn!(
            "fp8 training is experimental and may not give desirable results; \
             gradients are still reduced in fp32"
        );
        recipe.trainer.precision = PrecisionPlugin {
            grad_reduce_in_fp32: true,
            ..PrecisionPlugin::bf16_with_fp8_mixed()
        };
    }
    recipe
}
