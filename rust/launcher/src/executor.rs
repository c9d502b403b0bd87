//! Slurm executor description.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Serialize, Serializer, ser::SerializeMap};

use finetune_config::ParallelLayout;

use crate::args::{ArgsError, JobArgs, default_nemo_home};

pub const HF_TOKEN: &str = "HF_TOKEN";
pub const WANDB_API_KEY: &str = "WANDB_API_KEY";

/// Environment values that must never be printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// True if `key` is present with a non-blank value.
    pub fn has(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|v| !v.trim().is_empty())
    }

    /// Plain values, for writing the job script only.
    pub fn expose(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.0.keys().map(|k| (k, "***"))).finish()
    }
}

impl Serialize for Secrets {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for key in self.0.keys() {
            map.serialize_entry(key, "***")?;
        }
        map.end()
    }
}

/// Where and how a job runs on the cluster.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ExecutorDescription {
    pub account: String,
    pub partition: String,
    pub nodes: u32,
    pub ntasks_per_node: u32,
    pub gpus_per_node: u32,
    pub time_limit: String,
    pub container_image: String,
    pub container_mounts: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub secrets: Secrets,
    pub srun_args: Vec<String>,
    /// Experiments root on the shared filesystem.
    pub log_dir: PathBuf,
    pub exclusive: bool,
    pub mem: String,
    pub retries: u32,
}

impl ExecutorDescription {
    /// Single-node, single-task copy used for checkpoint import.
    #[must_use]
    pub fn for_import(&self) -> Self {
        Self {
            nodes: 1,
            ntasks_per_node: 1,
            ..self.clone()
        }
    }
}

/// Map scheduler-facing arguments and the resolved node count to an executor.
pub fn build_executor(
    args: &JobArgs,
    layout: &ParallelLayout,
) -> Result<ExecutorDescription, ArgsError> {
    let log_dir = args.log_dir.display().to_string();
    let mut env_vars: BTreeMap<String, String> = [
        ("TRANSFORMERS_OFFLINE", "1"),
        ("TOKENIZERS_PARALLELISM", "False"),
        ("NCCL_NVLS_ENABLE", "0"),
        ("NVTE_DP_AMAX_REDUCE_INTERVAL", "0"),
        ("NVTE_ASYNC_AMAX_REDUCTION", "1"),
        ("NVTE_FUSED_ATTN", "1"),
        ("NVTE_FLASH_ATTN", "0"),
        ("NEMO_LOG_MEMORY_USAGE", "1"),
        ("NEMORUN_HOME", log_dir.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let mut mounts = Vec::new();
    let nemo_home = args.nemo_home();
    if nemo_home != default_nemo_home() {
        let home = nemo_home.display().to_string();
        env_vars.insert("NEMO_HOME".to_string(), home.clone());
        mounts.push(format!("{home}:{home}"));
    }

    let mut secrets = Secrets::default();
    if let Some(token) = args.hf_token.as_deref().filter(|t| !t.trim().is_empty()) {
        secrets.insert(HF_TOKEN, token);
        env_vars.insert("TRANSFORMERS_OFFLINE".to_string(), "0".to_string());
    }
    if let Some(key) = args.wandb_key.as_deref().filter(|k| !k.trim().is_empty()) {
        secrets.insert(WANDB_API_KEY, key);
    }

    env_vars.extend(args.env_overrides()?);
    mounts.extend(args.custom_mounts.iter().cloned());

    Ok(ExecutorDescription {
        account: args.account.clone(),
        partition: args.partition.clone(),
        nodes: layout.num_nodes,
        ntasks_per_node: args.select.gpus_per_node,
        gpus_per_node: args.select.gpus_per_node,
        time_limit: args.time_limit.clone(),
        container_image: args.container_image.clone(),
        container_mounts: mounts,
        env_vars,
        secrets,
        srun_args: vec!["--mpi=pmix".to_string()],
        log_dir: args.log_dir.clone(),
        exclusive: true,
        mem: "0".to_string(),
        retries: 0,
    })
}
