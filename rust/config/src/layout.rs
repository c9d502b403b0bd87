//! Parallel layout resolution.
//!
//! A layout is looked up in the defaults table by
//! `(gpu, scheme, family, size)`, then explicit overrides are laid on top.
//! Explicit values always win; anything still unset after the overlay is an
//! error, never a silent default.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FinetuneScheme, GpuType, ModelFamily, ModelSize};

/// Built-in recommended layouts.
const BUILTIN_LAYOUTS: &str = include_str!("../layouts.toml");

/// Fully resolved parallelism and batch layout. Every size is positive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParallelLayout {
    pub num_nodes: u32,
    pub mbs: u32,
    pub gbs: u32,
    pub tp: u32,
    pub pp: u32,
    pub cp: u32,
    pub vp: u32,
    pub ep: u32,
    pub enable_cuda_graphs: bool,
}

impl ParallelLayout {
    /// Short config tag used in experiment names.
    pub fn tag(&self) -> String {
        format!(
            "{}nodes_tp{}_pp{}_cp{}_vp{}_{}mbs_{}gbs",
            self.num_nodes, self.tp, self.pp, self.cp, self.vp, self.mbs, self.gbs
        )
    }

    /// Virtual pipeline size as the training runtime expects it (`None` when disabled).
    pub fn virtual_pipeline(&self) -> Option<u32> {
        (self.vp > 1).then_some(self.vp)
    }
}

/// User overrides for the table defaults.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct LayoutOverrides {
    /// Total number of GPUs (converted to nodes with ceiling division)
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, value_parser = clap::value_parser!(u32).range(1..)))]
    pub num_gpus: Option<u32>,
    /// Number of nodes (takes precedence over --num-gpus)
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, value_parser = clap::value_parser!(u32).range(1..)))]
    pub num_nodes: Option<u32>,
    /// Micro batch size
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "mbs", value_parser = clap::value_parser!(u32).range(1..)))]
    pub micro_batch_size: Option<u32>,
    /// Global batch size
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "gbs", value_parser = clap::value_parser!(u32).range(1..)))]
    pub global_batch_size: Option<u32>,
    /// Tensor parallel size
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "tp", value_parser = clap::value_parser!(u32).range(1..)))]
    pub tensor_parallel_size: Option<u32>,
    /// Pipeline parallel size
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "pp", value_parser = clap::value_parser!(u32).range(1..)))]
    pub pipeline_parallel_size: Option<u32>,
    /// Context parallel size
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "cp", value_parser = clap::value_parser!(u32).range(1..)))]
    pub context_parallel_size: Option<u32>,
    /// Virtual pipeline parallel size (1 disables interleaving)
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "vp", value_parser = clap::value_parser!(u32).range(1..)))]
    pub virtual_pipeline_parallel_size: Option<u32>,
    /// Expert parallel size
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, visible_alias = "ep", value_parser = clap::value_parser!(u32).range(1..)))]
    pub expert_parallel_size: Option<u32>,
    /// Enable CUDA graph capture
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, value_name = "BOOL"))]
    pub cuda_graphs: Option<bool>,
}

/// One row of the defaults table. Fields may be absent in user-supplied tables.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutDefaults {
    pub num_gpus: Option<u32>,
    pub mbs: Option<u32>,
    pub gbs: Option<u32>,
    pub tp: Option<u32>,
    pub pp: Option<u32>,
    pub cp: Option<u32>,
    pub vp: Option<u32>,
    pub ep: Option<u32>,
    pub cuda_graphs: Option<bool>,
}

/// Lookup key into the defaults table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutKey {
    pub gpu: GpuType,
    pub scheme: FinetuneScheme,
    pub family: ModelFamily,
    pub size: ModelSize,
}

impl std::fmt::Display for LayoutKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.gpu, self.scheme, self.family, self.size)
    }
}

/// Recommended layouts keyed `[gpu.scheme.family.size]`.
#[derive(Clone, Debug)]
pub struct LayoutTable {
    root: toml::Value,
}

impl LayoutTable {
    /// The table shipped with the launcher.
    pub fn builtin() -> Result<Self, LayoutError> {
        Self::parse(BUILTIN_LAYOUTS)
    }

    /// Parse a table from TOML text.
    pub fn parse(content: &str) -> Result<Self, LayoutError> {
        let root: toml::Value =
            toml::from_str(content).map_err(|e| LayoutError::Parse(e.to_string()))?;
        Ok(Self { root })
    }

    /// Built-in table with a user file merged on top (user values win).
    ///
    /// A non-table value in the user file, e.g. `8b = false`, hides every row beneath it.
    pub fn with_overlay(path: impl AsRef<Path>) -> Result<Self, LayoutError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LayoutError::Io(path.as_ref().display().to_string(), e))?;
        let overlay = Self::parse(&content)?;
        Ok(Self::builtin()?.merged(&overlay))
    }

    /// Merge `overlay` into this table, with `overlay` values taking precedence.
    #[must_use]
    pub fn merged(&self, overlay: &Self) -> Self {
        Self {
            root: merge_toml(&self.root, &overlay.root),
        }
    }

    /// Get the defaults row for a key, if the table has one.
    pub fn get(&self, key: &LayoutKey) -> Result<Option<LayoutDefaults>, LayoutError> {
        let row = self
            .root
            .get(key.gpu.key())
            .and_then(|v| v.get(key.scheme.key()))
            .and_then(|v| v.get(key.family.key()))
            .and_then(|v| v.get(key.size.key()))
            .filter(|v| v.is_table());
        match row {
            None => Ok(None),
            Some(value) => value
                .clone()
                .try_into()
                .map(Some)
                .map_err(|e: toml::de::Error| LayoutError::Parse(format!("[{key}]: {e}"))),
        }
    }

    /// All keys present in the table, in table order.
    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_keys(&self.root, String::new(), 0, &mut out);
        out
    }
}

fn collect_keys(value: &toml::Value, prefix: String, depth: usize, out: &mut Vec<String>) {
    let toml::Value::Table(table) = value else {
        return;
    };
    for (k, v) in table {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        if depth == 3 {
            if v.is_table() {
                out.push(path);
            }
        } else {
            collect_keys(v, path, depth + 1, out);
        }
    }
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn pick(
    field: &'static str,
    explicit: Option<u32>,
    default: Option<u32>,
) -> Result<u32, LayoutError> {
    match explicit.or(default) {
        None => Err(LayoutError::Incomplete(field)),
        Some(0) => Err(LayoutError::NotPositive(field)),
        Some(v) => Ok(v),
    }
}

/// Resolve the layout for `key`, laying `overrides` over the table defaults.
pub fn resolve_layout(
    table: &LayoutTable,
    key: &LayoutKey,
    overrides: &LayoutOverrides,
    gpus_per_node: u32,
) -> Result<ParallelLayout, LayoutError> {
    let defaults = table
        .get(key)?
        .ok_or_else(|| LayoutError::MissingDefault(key.to_string()))?;

    let num_nodes = if let Some(nodes) = overrides.num_nodes {
        pick("num_nodes", Some(nodes), None)?
    } else {
        if gpus_per_node == 0 {
            return Err(LayoutError::NotPositive("gpus_per_node"));
        }
        let gpus = pick("num_gpus", overrides.num_gpus, defaults.num_gpus)?;
        gpus.div_ceil(gpus_per_node)
    };

    Ok(ParallelLayout {
        num_nodes,
        mbs: pick("mbs", overrides.micro_batch_size, defaults.mbs)?,
        gbs: pick("gbs", overrides.global_batch_size, defaults.gbs)?,
        tp: pick("tp", overrides.tensor_parallel_size, defaults.tp)?,
        pp: pick("pp", overrides.pipeline_parallel_size, defaults.pp)?,
        cp: pick("cp", overrides.context_parallel_size, defaults.cp)?,
        vp: pick("vp", overrides.virtual_pipeline_parallel_size, defaults.vp)?,
        ep: pick("ep", overrides.expert_parallel_size, defaults.ep)?,
        enable_cuda_graphs: overrides
            .cuda_graphs
            .or(defaults.cuda_graphs)
            .ok_or(LayoutError::Incomplete("cuda_graphs"))?,
    })
}

/// Errors that can occur when resolving a layout.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("no recommended layout for {0}; add one with --layouts")]
    MissingDefault(String),
    #[error("layout field '{0}' is unset after applying defaults and overrides")]
    Incomplete(&'static str),
    #[error("layout field '{0}' must be positive")]
    NotPositive(&'static str),
    #[error("failed to read layout table {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse layout table: {0}")]
    Parse(String),
}
