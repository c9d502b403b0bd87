#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::too_many_lines
)]

//! Fine-tuning job launcher
//!
//! Resolves a parallel layout for a model and GPU type, builds the training
//! recipe and Slurm executor, and submits checkpoint import and training as
//! one experiment.

pub mod args;
pub mod cache;
pub mod executor;
pub mod experiment;
pub mod launch;
pub mod plugins;
pub mod recipe;
pub mod records;
pub mod slurm;

pub use args::{JobArgs, SelectArgs};
pub use cache::{Manifest, ManifestCache, PackedCache};
pub use executor::ExecutorDescription;
pub use experiment::{Experiment, JobBackend, JobSpec};
pub use launch::{LaunchError, Outcome, ResolvedJob, resolve, submit};
pub use recipe::{Recipe, RecipeFactory};
pub use records::{ExperimentRecord, ExperimentStatus, RecordStore};
pub use slurm::SlurmBackend;
