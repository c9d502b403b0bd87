//! End-to-end job resolution and submission.

use finetune_config::{
    ComputeDtype, FinetuneScheme, LayoutError, ModelPreset, ParallelLayout, resolve_layout,
};

use crate::{
    args::{ArgsError, JobArgs},
    cache::PackedCache,
    executor::{ExecutorDescription, HF_TOKEN, build_executor},
    experiment::{DryRunPlan, Experiment, ExperimentError, JobBackend, JobSpec},
    plugins::{Plugin, build_plugins},
    recipe::{
        PresetRecipes, Recipe, RecipeFactory, apply_data_and_precision_overrides, build_recipe,
    },
    records::ExperimentRecord,
};

/// `{scheme}_{script}_{dtype}_{layout tag}`, e.g.
/// `lora_finetune_llama31_405b_bf16_3nodes_tp4_pp6_cp1_vp7_1mbs_24gbs`.
pub fn experiment_name(
    scheme: FinetuneScheme,
    preset: &ModelPreset,
    dtype: ComputeDtype,
    layout: &ParallelLayout,
) -> String {
    format!(
        "{scheme}_{}_{dtype}_{}",
        preset.script_name(),
        layout.tag()
    )
}

/// A fully described job, ready to submit.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub name: String,
    pub preset: ModelPreset,
    pub layout: ParallelLayout,
    pub recipe: Recipe,
    pub executor: ExecutorDescription,
    pub plugins: Vec<Plugin>,
    pub import_needed: bool,
    pub dryrun: bool,
}

/// Validate arguments and build every description the job needs.
pub fn resolve(args: &JobArgs, cache: &impl PackedCache) -> Result<ResolvedJob, LaunchError> {
    args.validate()?;
    let select = &args.select;
    let preset = select.preset()?;

    let table = select.layout_table()?;
    let layout = resolve_layout(
        &table,
        &select.layout_key(),
        &select.overrides,
        select.gpus_per_node,
    )?;
    tracing::info!("Resolved layout for {}: {}", select.layout_key(), layout.tag());

    let recipe = build_recipe(
        &PresetRecipes::new(preset.clone()),
        select.finetuning,
        &layout,
        args,
    );
    let recipe =
        apply_data_and_precision_overrides(recipe, &preset, select.compute_dtype, cache);

    let executor = build_executor(args, &layout)?;
    let plugins = build_plugins(args, &layout);

    Ok(ResolvedJob {
        name: experiment_name(select.finetuning, &preset, select.compute_dtype, &layout),
        preset,
        layout,
        recipe,
        executor,
        plugins,
        import_needed: args.import_needed(),
        dryrun: args.dryrun,
    })
}

/// What [`submit`] did.
#[derive(Debug)]
pub enum Outcome {
    DryRun(DryRunPlan),
    Submitted(ExperimentRecord),
}

/// Enqueue the import job (when needed) and the training job, then either
/// print the plan or submit them sequentially and detached.
pub async fn submit<B: JobBackend>(
    job: ResolvedJob,
    backend: B,
    entrypoint: &str,
) -> Result<Outcome, LaunchError> {
    let mut exp = Experiment::new(&job.name, &job.executor.log_dir, backend, entrypoint);

    if job.import_needed {
        if !job.executor.secrets.has(HF_TOKEN) {
            return Err(ExperimentError::Precondition(
                "HF token is required for importing checkpoint from HuggingFace".to_string(),
            )
            .into());
        }
        let model = PresetRecipes::new(job.preset.clone()).model();
        exp.add(JobSpec::import(model, job.preset.hf_source(), &job.executor))?;
    }
    exp.add(JobSpec::train(&job.name, job.executor, job.recipe, job.plugins))?;

    if job.dryrun {
        return Ok(Outcome::DryRun(exp.dryrun(true)?));
    }
    let record = exp.run(true).await?;
    tracing::info!(
        "Experiment {} submitted, records in {}",
        record.id,
        exp.dir().display()
    );
    Ok(Outcome::Submitted(record))
}

/// Errors that abort a launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Experiment(#[from] ExperimentError),
}
