//! Run plugins: environment tuning and profiling attached to the training job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use finetune_config::ParallelLayout;

use crate::{
    args::JobArgs,
    recipe::{Callback, Recipe},
};

/// NCCL chunk size for pipeline-parallel point-to-point traffic (2 MiB).
pub const NCCL_PP_COMM_CHUNKSIZE: u64 = 2 * 1024 * 1024;

/// Profiled step window.
pub const NSYS_START_STEP: u32 = 5;
pub const NSYS_END_STEP: u32 = 6;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Plugin {
    /// Performance environment: GPU voltage boost and NCCL tuning.
    PerfEnv {
        enable_vboost: bool,
        nccl_pp_comm_chunksize: Option<u64>,
    },
    /// Nsight Systems capture of a step window.
    Nsys { start_step: u32, end_step: u32 },
}

/// Command line and environment of one job, as plugins see it before rendering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Shell lines run once per allocation before the main `srun`.
    pub setup: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Wrapper placed in front of the task command, e.g. a profiler.
    pub prefix: Vec<String>,
    pub argv: Vec<String>,
}

impl LaunchCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    /// Full argv with the prefix applied.
    pub fn command(&self) -> Vec<String> {
        self.prefix.iter().chain(&self.argv).cloned().collect()
    }
}

impl Plugin {
    /// Attach the plugin's trainer-side hooks to the recipe.
    #[must_use]
    pub fn apply_to_recipe(&self, mut recipe: Recipe) -> Recipe {
        if let Self::Nsys {
            start_step,
            end_step,
        } = *self
        {
            recipe.trainer.callbacks.push(Callback::Nsys {
                start_step,
                end_step,
                ranks: vec![0],
            });
        }
        recipe
    }

    /// Adjust the job's launch command.
    pub fn setup(&self, cmd: &mut LaunchCommand, profile_dir: &str) {
        match *self {
            Self::PerfEnv {
                enable_vboost,
                nccl_pp_comm_chunksize,
            } => {
                if let Some(chunk) = nccl_pp_comm_chunksize {
                    cmd.env
                        .insert("NCCL_P2P_NET_CHUNKSIZE".to_string(), chunk.to_string());
                }
                if enable_vboost {
                    cmd.setup.push(
                        "srun --ntasks-per-node=1 --output=/dev/null -- \
                         sudo nvidia-smi boost-slider --vboost 1"
                            .to_string(),
                    );
                }
            }
            Self::Nsys { .. } => {
                cmd.prefix = [
                    "nsys",
                    "profile",
                    "-s",
                    "none",
                    "-t",
                    "nvtx,cuda",
                    "--capture-range=cudaProfilerApi",
                    "--capture-range-end=stop",
                    "--force-overwrite",
                    "true",
                    "-o",
                ]
                .into_iter()
                .map(String::from)
                .chain(std::iter::once(format!(
                    "{profile_dir}/profile_%q{{SLURM_JOB_ID}}_node%q{{SLURM_NODEID}}_rank%q{{SLURM_PROCID}}"
                )))
                .collect();
            }
        }
    }
}

/// Plugins for the training job.
pub fn build_plugins(args: &JobArgs, layout: &ParallelLayout) -> Vec<Plugin> {
    let mut plugins = vec![Plugin::PerfEnv {
        enable_vboost: true,
        nccl_pp_comm_chunksize: (layout.pp > 1).then_some(NCCL_PP_COMM_CHUNKSIZE),
    }];
    if args.enable_nsys {
        plugins.push(Plugin::Nsys {
            start_step: NSYS_START_STEP,
            end_step: NSYS_END_STEP,
        });
    }
    plugins
}

#[cfg(test)]
mod tests {
    use finetune_config::{FinetuneScheme, ModelFamily, ModelPreset, ModelSize};

    use super::*;
    use crate::{
        args::tests::job_args,
        recipe::{PresetRecipes, RecipeFactory},
    };

    fn layout(pp: u32) -> ParallelLayout {
        ParallelLayout {
            num_nodes: 1,
            mbs: 1,
            gbs: 8,
            tp: 1,
            pp,
            cp: 1,
            vp: 1,
            ep: 1,
            enable_cuda_graphs: false,
        }
    }

    #[test]
    fn test_chunksize_iff_pipeline_parallel() {
        let args = job_args();
        for pp in [1, 2, 6] {
            let plugins = build_plugins(&args, &layout(pp));
            assert_eq!(plugins.len(), 1);
            let Plugin::PerfEnv {
                enable_vboost,
                nccl_pp_comm_chunksize,
            } = plugins[0]
            else {
                panic!("expected PerfEnv first");
            };
            assert!(enable_vboost);
            assert_eq!(
                nccl_pp_comm_chunksize,
                (pp > 1).then_some(2_097_152),
                "pp = {pp}"
            );
        }
    }

    #[test]
    fn test_nsys_appended_when_requested() {
        let mut args = job_args();
        args.enable_nsys = true;
        let plugins = build_plugins(&args, &layout(1));
        assert_eq!(
            plugins[1],
            Plugin::Nsys {
                start_step: 5,
                end_step: 6
            }
        );
    }

    #[test]
    fn test_setup_shapes_command() {
        let mut cmd = LaunchCommand::new(vec!["runtime".to_string(), "train".to_string()]);
        for plugin in build_plugins(
            &JobArgs {
                enable_nsys: true,
                ..job_args()
            },
            &layout(4),
        ) {
            plugin.setup(&mut cmd, "/exp/job");
        }
        assert_eq!(cmd.env["NCCL_P2P_NET_CHUNKSIZE"], "2097152");
        assert_eq!(cmd.setup.len(), 1);
        assert!(cmd.setup[0].contains("--vboost 1"));
        let full = cmd.command();
        assert_eq!(full[0], "nsys");
        assert!(full.ends_with(&["runtime".to_string(), "train".to_string()]));
    }

    #[test]
    fn test_nsys_adds_callback() {
        let preset = ModelPreset::lookup(ModelFamily::Llama31, ModelSize::B405).unwrap();
        let recipe = PresetRecipes::new(preset).finetune_recipe(FinetuneScheme::Lora, true);
        let before = recipe.trainer.callbacks.len();
        let recipe = Plugin::Nsys {
            start_step: 5,
            end_step: 6,
        }
        .apply_to_recipe(recipe);
        assert_eq!(recipe.trainer.callbacks.len(), before + 1);
        assert!(matches!(
            recipe.trainer.callbacks.last(),
            Some(Callback::Nsys { start_step: 5, end_step: 6, .. })
        ));
    }
}
