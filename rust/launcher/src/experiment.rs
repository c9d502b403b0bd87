//! Experiment context: an ordered set of jobs submitted together.
//!
//! An [`Experiment`] owns its jobs until [`Experiment::run`] writes their
//! task files and scripts under `<log_dir>/experiments/<name>/<id>/` and hands
//! them to a [`JobBackend`]. If the experiment is dropped after its record was
//! written but before every job was accepted, the record is marked aborted.

use std::{
    future::Future,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    executor::ExecutorDescription,
    plugins::Plugin,
    recipe::{ModelRef, Recipe},
    records::{
        ExperimentRecord, ExperimentStatus, JobRecord, RecordError, RecordStore,
        experiments_root, now_timestamp,
    },
    slurm::{Secrecy, render_sbatch},
};

/// Name of the checkpoint import job.
pub const IMPORT_JOB_NAME: &str = "import_ckpt_exp";

/// What a job does once it is running inside the container.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Run the fine-tuning recipe.
    Train { recipe: Box<Recipe> },
    /// Convert a HuggingFace checkpoint into the training format.
    ImportCheckpoint {
        model: ModelRef,
        source: String,
        overwrite: bool,
    },
}

impl Task {
    /// Runtime subcommand executing this task.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Train { .. } => "train",
            Self::ImportCheckpoint { .. } => "import-ckpt",
        }
    }
}

/// One job of an experiment.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub name: String,
    pub executor: ExecutorDescription,
    pub task: Task,
    pub plugins: Vec<Plugin>,
}

impl JobSpec {
    /// Training job. Plugins' recipe hooks are applied here.
    pub fn train(
        name: impl Into<String>,
        executor: ExecutorDescription,
        recipe: Recipe,
        plugins: Vec<Plugin>,
    ) -> Self {
        let recipe = plugins.iter().fold(recipe, |r, p| p.apply_to_recipe(r));
        Self {
            name: name.into(),
            executor,
            task: Task::Train {
                recipe: Box::new(recipe),
            },
            plugins,
        }
    }

    /// Checkpoint import on a single node and task. Never overwrites.
    pub fn import(
        model: ModelRef,
        source: impl Into<String>,
        executor: &ExecutorDescription,
    ) -> Self {
        Self {
            name: IMPORT_JOB_NAME.to_string(),
            executor: executor.for_import(),
            task: Task::ImportCheckpoint {
                model,
                source: source.into(),
                overwrite: false,
            },
            plugins: Vec::new(),
        }
    }
}

/// Accepts rendered job scripts.
pub trait JobBackend {
    /// Submit `script`, to start only after job `dependency` succeeds if given.
    /// Returns the scheduler's job id.
    fn submit(
        &self,
        script: &Path,
        dependency: Option<&str>,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    /// Cancel a previously accepted job.
    fn cancel(&self, job_id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// A job as it would be submitted, with secrets redacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub name: String,
    /// Job this one waits for.
    pub after: Option<String>,
    pub script: String,
    pub task: String,
}

/// Everything a dry run would have submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunPlan {
    pub experiment: String,
    pub dir: PathBuf,
    pub jobs: Vec<PlannedJob>,
}

impl std::fmt::Display for DryRunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Dry Run: {} ===", self.experiment)?;
        writeln!(f, "Experiment dir: {}", self.dir.display())?;
        for (i, job) in self.jobs.iter().enumerate() {
            writeln!(f)?;
            write!(f, "[{}] {}", i + 1, job.name)?;
            if let Some(after) = &job.after {
                write!(f, " (after {after})")?;
            }
            writeln!(f)?;
            writeln!(f, "--- {}_sbatch.sh ---", job.name)?;
            writeln!(f, "{}", job.script)?;
            writeln!(f, "--- {}.json ---", job.name)?;
            writeln!(f, "{}", job.task)?;
        }
        Ok(())
    }
}

/// A named set of jobs submitted to one backend.
pub struct Experiment<B: JobBackend> {
    name: String,
    id: String,
    dir: PathBuf,
    entrypoint: String,
    backend: B,
    jobs: Vec<JobSpec>,
    store: RecordStore,
    record_written: bool,
    finalised: bool,
}

impl<B: JobBackend> Experiment<B> {
    /// Nothing touches the filesystem until [`Self::run`].
    pub fn new(
        name: impl Into<String>,
        log_dir: &Path,
        backend: B,
        entrypoint: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let id = format!("{name}_{}", chrono::Utc::now().timestamp());
        let dir = experiments_root(log_dir).join(&name).join(&id);
        Self {
            store: RecordStore::new(&dir),
            name,
            id,
            dir,
            entrypoint: entrypoint.into(),
            backend,
            jobs: Vec::new(),
            record_written: false,
            finalised: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    /// Enqueue a job. Job names must be unique within the experiment.
    pub fn add(&mut self, job: JobSpec) -> Result<(), ExperimentError> {
        if self.jobs.iter().any(|j| j.name == job.name) {
            return Err(ExperimentError::DuplicateJob(job.name));
        }
        tracing::debug!("Added job {} to {}", job.name, self.id);
        self.jobs.push(job);
        Ok(())
    }

    fn task_json(job: &JobSpec) -> Result<String, ExperimentError> {
        serde_json::to_string_pretty(&job.task)
            .map_err(|e| ExperimentError::Serialize(job.name.clone(), e.to_string()))
    }

    /// Render every job without writing files or calling the backend.
    pub fn dryrun(&mut self, sequential: bool) -> Result<DryRunPlan, ExperimentError> {
        let mut jobs = Vec::with_capacity(self.jobs.len());
        let mut previous: Option<&str> = None;
        for job in &self.jobs {
            jobs.push(PlannedJob {
                name: job.name.clone(),
                after: previous.filter(|_| sequential).map(String::from),
                script: render_sbatch(job, &self.dir, &self.entrypoint, Secrecy::Redact),
                task: Self::task_json(job)?,
            });
            previous = Some(job.name.as_str());
        }
        self.finalised = true;
        Ok(DryRunPlan {
            experiment: self.id.clone(),
            dir: self.dir.clone(),
            jobs,
        })
    }

    /// Write job files and submit every job. When `sequential`, each job
    /// starts only after the previous one succeeded. Jobs are detached: this
    /// returns once the scheduler accepted them.
    pub async fn run(&mut self, sequential: bool) -> Result<ExperimentRecord, ExperimentError> {
        if self.jobs.is_empty() {
            return Err(ExperimentError::Precondition(format!(
                "experiment {} has no jobs",
                self.id
            )));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| ExperimentError::Io(self.dir.clone(), e))?;

        let mut record = ExperimentRecord::new(&self.name, &self.id);
        for job in &self.jobs {
            let task_file = self.dir.join(format!("{}.json", job.name));
            write_private(&task_file, Self::task_json(job)?.as_bytes())?;

            let script = self.dir.join(format!("{}_sbatch.sh", job.name));
            let rendered = render_sbatch(job, &self.dir, &self.entrypoint, Secrecy::Expose);
            write_private(&script, rendered.as_bytes())?;

            record.jobs.push(JobRecord {
                name: job.name.clone(),
                script,
                task_file,
                slurm_job_id: None,
                dependency: None,
            });
        }
        self.store.save(&record)?;
        self.record_written = true;

        let mut previous: Option<String> = None;
        for i in 0..record.jobs.len() {
            let dependency = if sequential { previous.clone() } else { None };
            let submitted = self
                .backend
                .submit(&record.jobs[i].script, dependency.as_deref())
                .await;
            let job_id = match submitted {
                Ok(id) => id,
                Err(e) => {
                    record.errors.push(format!("{}: {e}", record.jobs[i].name));
                    self.cancel_accepted(&mut record.jobs[..i], &mut record.errors)
                        .await;
                    if let Err(save_err) = self.store.save(&record) {
                        tracing::error!("Failed to record submission error: {save_err}");
                    }
                    return Err(e.into());
                }
            };

            tracing::info!("Submitted {} as job {job_id}", record.jobs[i].name);
            record.jobs[i].slurm_job_id = Some(job_id.clone());
            record.jobs[i].dependency = dependency;
            self.store.save(&record)?;
            previous = Some(job_id);
        }

        record.status = ExperimentStatus::Submitted;
        record.submitted_at = Some(now_timestamp());
        self.store.save(&record)?;
        self.finalised = true;
        Ok(record)
    }

    /// Withdraw jobs already accepted in a failed run, newest first.
    async fn cancel_accepted(&self, jobs: &mut [JobRecord], errors: &mut Vec<String>) {
        for job in jobs.iter_mut().rev() {
            let Some(job_id) = job.slurm_job_id.take() else {
                continue;
            };
            match self.backend.cancel(&job_id).await {
                Ok(()) => {
                    tracing::warn!("Cancelled {} (job {job_id})", job.name);
                    errors.push(format!("{}: cancelled job {job_id}", job.name));
                }
                Err(e) => {
                    tracing::error!("Failed to cancel {} (job {job_id}): {e}", job.name);
                    errors.push(format!("{}: failed to cancel job {job_id}: {e}", job.name));
                    job.slurm_job_id = Some(job_id);
                }
            }
        }
    }
}

impl<B: JobBackend> Drop for Experiment<B> {
    fn drop(&mut self) {
        if !self.record_written || self.finalised {
            return;
        }
        tracing::warn!("Experiment {} ended before submission completed", self.id);
        if let Err(e) = self
            .store
            .update(|r| r.status = ExperimentStatus::Aborted)
        {
            tracing::error!("Failed to mark {} aborted: {e}", self.id);
        }
    }
}

/// Job files carry credentials, so only the owner may read them.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), ExperimentError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| ExperimentError::Io(path.to_path_buf(), e))?;
    file.write_all(contents)
        .map_err(|e| ExperimentError::Io(path.to_path_buf(), e))
}

/// Errors raised by a job backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("submission rejected ({status}): {stderr}")]
    Rejected { status: String, stderr: String },
    #[error("no job id in scheduler output: {0:?}")]
    NoJobId(String),
}

/// Errors that can occur while preparing or running an experiment.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("duplicate job name '{0}'")]
    DuplicateJob(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to serialize task for {0}: {1}")]
    Serialize(String, String),
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[cfg(test)]
mod tests {
    use std::{
        os::unix::fs::PermissionsExt,
        sync::{Arc, Mutex},
    };

    use finetune_config::{FinetuneScheme, ModelFamily, ModelPreset, ModelSize, ParallelLayout};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        args::tests::job_args,
        executor::build_executor,
        recipe::{Callback, PresetRecipes, RecipeFactory},
    };

    /// Records submissions; fails when the script name contains `fail_on`.
    #[derive(Clone, Default)]
    struct MockBackend {
        calls: Arc<Mutex<Vec<(PathBuf, Option<String>)>>>,
        cancelled: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    impl JobBackend for MockBackend {
        async fn submit(
            &self,
            script: &Path,
            dependency: Option<&str>,
        ) -> Result<String, BackendError> {
            if let Some(pat) = &self.fail_on
                && script.display().to_string().contains(pat.as_str())
            {
                return Err(BackendError::Rejected {
                    status: "exit status: 1".to_string(),
                    stderr: "QOSMaxNodePerJobLimit".to_string(),
                });
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push((script.to_path_buf(), dependency.map(String::from)));
            Ok((1000 + calls.len()).to_string())
        }

        async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
            self.cancelled.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    fn layout() -> ParallelLayout {
        ParallelLayout {
            num_nodes: 3,
            mbs: 1,
            gbs: 24,
            tp: 4,
            pp: 6,
            cp: 1,
            vp: 7,
            ep: 1,
            enable_cuda_graphs: false,
        }
    }

    fn jobs() -> (JobSpec, JobSpec) {
        let preset = ModelPreset::lookup(ModelFamily::Llama31, ModelSize::B405).unwrap();
        let factory = PresetRecipes::new(preset.clone());
        let executor = build_executor(&job_args(), &layout()).unwrap();
        let import = JobSpec::import(factory.model(), preset.hf_source(), &executor);
        let train = JobSpec::train(
            "lora_finetune_llama31_405b",
            executor,
            factory.finetune_recipe(FinetuneScheme::Lora, true),
            vec![Plugin::Nsys {
                start_step: 5,
                end_step: 6,
            }],
        );
        (import, train)
    }

    #[test]
    fn test_job_constructors() {
        let (import, train) = jobs();
        assert_eq!(import.name, IMPORT_JOB_NAME);
        assert_eq!(import.executor.nodes, 1);
        assert_eq!(import.executor.ntasks_per_node, 1);
        assert!(import.plugins.is_empty());
        assert!(matches!(
            &import.task,
            Task::ImportCheckpoint { source, overwrite: false, .. }
                if source == "hf://meta-llama/Llama-3.1-405B"
        ));

        let Task::Train { recipe } = &train.task else {
            panic!("expected a training task");
        };
        assert!(
            recipe
                .trainer
                .callbacks
                .iter()
                .any(|c| matches!(c, Callback::Nsys { .. }))
        );
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let dir = tempdir().unwrap();
        let mut exp = Experiment::new("exp", dir.path(), MockBackend::default(), "rt");
        let (import, _) = jobs();
        exp.add(import.clone()).unwrap();
        assert!(matches!(
            exp.add(import),
            Err(ExperimentError::DuplicateJob(_))
        ));
        assert_eq!(exp.jobs().len(), 1);
    }

    #[test]
    fn test_dryrun_touches_nothing() {
        let dir = tempdir().unwrap();
        let backend = MockBackend::default();
        let mut exp = Experiment::new("exp", dir.path(), backend.clone(), "rt");
        let (import, train) = jobs();
        exp.add(import).unwrap();
        exp.add(train).unwrap();

        let plan = exp.dryrun(true).unwrap();
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.jobs[0].after, None);
        assert_eq!(plan.jobs[1].after.as_deref(), Some(IMPORT_JOB_NAME));
        let shown = plan.to_string();
        assert!(!shown.contains("hf_secret"));
        assert!(shown.contains("import_ckpt_exp_sbatch.sh"));

        drop(exp);
        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(!experiments_root(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_run_chains_dependencies() {
        let dir = tempdir().unwrap();
        let backend = MockBackend::default();
        let mut exp = Experiment::new("exp", dir.path(), backend.clone(), "rt");
        let (import, train) = jobs();
        exp.add(import).unwrap();
        exp.add(train).unwrap();

        let record = exp.run(true).await.unwrap();
        assert_eq!(record.status, ExperimentStatus::Submitted);
        assert_eq!(record.jobs[0].slurm_job_id.as_deref(), Some("1001"));
        assert_eq!(record.jobs[1].dependency.as_deref(), Some("1001"));

        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].0.ends_with("import_ckpt_exp_sbatch.sh"));
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[1].1.as_deref(), Some("1001"));

        let script = std::fs::read_to_string(&calls[0].0).unwrap();
        assert!(script.contains("export HF_TOKEN=hf_secret"));
        let mode = std::fs::metadata(&calls[0].0).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let stored = RecordStore::new(exp.dir()).load().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Submitted);
    }

    #[tokio::test]
    async fn test_parallel_run_has_no_dependencies() {
        let dir = tempdir().unwrap();
        let backend = MockBackend::default();
        let mut exp = Experiment::new("exp", dir.path(), backend.clone(), "rt");
        let (import, train) = jobs();
        exp.add(import).unwrap();
        exp.add(train).unwrap();

        exp.run(false).await.unwrap();
        let calls = backend.calls.lock().unwrap().clone();
        assert!(calls.iter().all(|(_, dep)| dep.is_none()));
    }

    #[tokio::test]
    async fn test_backend_failure_marks_aborted() {
        let dir = tempdir().unwrap();
        let backend = MockBackend {
            fail_on: Some("lora_finetune".to_string()),
            ..MockBackend::default()
        };
        let mut exp = Experiment::new("exp", dir.path(), backend.clone(), "rt");
        let (import, train) = jobs();
        exp.add(import).unwrap();
        exp.add(train).unwrap();

        let err = exp.run(true).await.unwrap_err();
        assert!(matches!(err, ExperimentError::Backend(_)));
        let exp_dir = exp.dir().to_path_buf();
        drop(exp);

        // The import job was accepted before training was rejected, so it is withdrawn.
        assert_eq!(*backend.cancelled.lock().unwrap(), vec!["1001".to_string()]);

        let stored = RecordStore::new(&exp_dir).load().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Aborted);
        assert_eq!(stored.jobs[0].slurm_job_id, None);
        assert_eq!(stored.errors.len(), 2);
        assert!(stored.errors[0].contains("QOSMaxNodePerJobLimit"));
        assert!(stored.errors[1].contains("cancelled job 1001"));
    }

    #[tokio::test]
    async fn test_first_job_rejected_cancels_nothing() {
        let dir = tempdir().unwrap();
        let backend = MockBackend {
            fail_on: Some(IMPORT_JOB_NAME.to_string()),
            ..MockBackend::default()
        };
        let mut exp = Experiment::new("exp", dir.path(), backend.clone(), "rt");
        let (import, train) = jobs();
        exp.add(import).unwrap();
        exp.add(train).unwrap();

        assert!(exp.run(true).await.is_err());
        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(backend.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_experiment_is_rejected() {
        let dir = tempdir().unwrap();
        let mut exp = Experiment::new("exp", dir.path(), MockBackend::default(), "rt");
        assert!(matches!(
            exp.run(true).await,
            Err(ExperimentError::Precondition(_))
        ));
    }
}
