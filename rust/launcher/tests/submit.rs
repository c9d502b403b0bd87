//! Integration tests for resolving and submitting experiments.
//!
//! These tests verify that the launcher:
//! 1. Resolves layouts from the table with explicit overrides winning
//! 2. Never calls the backend on a dry run
//! 3. Enqueues the checkpoint import ahead of training
//! 4. Checks the HF token before any job is enqueued
//! 5. Withdraws accepted jobs when a later submission is rejected

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::Parser;
use finetune_config::LayoutError;
use finetune_launcher::{
    ExperimentStatus, JobArgs, JobBackend, LaunchError, ManifestCache, Outcome, RecordStore,
    SlurmBackend,
    experiment::{BackendError, ExperimentError, IMPORT_JOB_NAME},
    resolve, submit,
};
use tempfile::tempdir;

#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    job: JobArgs,
}

fn parse(log_dir: &Path, extra: &[&str]) -> JobArgs {
    let log_dir = log_dir.display().to_string();
    let mut argv = vec![
        "finetune-launcher",
        "--account",
        "acct",
        "--partition",
        "batch",
        "--log-dir",
        &log_dir,
        "--nemo-home",
        "/lustre/nemo",
    ];
    argv.extend_from_slice(extra);
    Cli::try_parse_from(argv).unwrap().job
}

/// Backend that records submissions and hands out increasing ids.
#[derive(Clone, Default)]
struct RecordingBackend {
    calls: Arc<Mutex<Vec<(PathBuf, Option<String>)>>>,
    cancelled: Arc<Mutex<Vec<String>>>,
    /// Reject the script whose file name starts with this job name.
    reject: Option<String>,
}

impl JobBackend for RecordingBackend {
    async fn submit(
        &self,
        script: &Path,
        dependency: Option<&str>,
    ) -> Result<String, BackendError> {
        let file_name = script.file_name().unwrap().to_string_lossy();
        if let Some(reject) = &self.reject
            && file_name.starts_with(reject.as_str())
        {
            return Err(BackendError::Rejected {
                status: "exit status: 1".to_string(),
                stderr: "sbatch: error: Batch job submission failed: Invalid account".to_string(),
            });
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push((script.to_path_buf(), dependency.map(String::from)));
        Ok((500 + calls.len()).to_string())
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_dryrun_h100_sft_four_nodes() {
    let dir = tempdir().unwrap();
    let args = parse(
        dir.path(),
        &[
            "--gpu", "h100", "--finetuning", "sft", "--num-nodes", "4", "--tp", "8",
            "--hf-token", "hf_secret", "--dryrun",
        ],
    );
    let cache = ManifestCache::new(dir.path().join("datasets"));
    let resolved = resolve(&args, &cache).unwrap();

    assert_eq!(resolved.layout.num_nodes, 4);
    assert_eq!(resolved.layout.tp, 8);
    assert_eq!(resolved.recipe.trainer.num_nodes, 4);
    assert_eq!(resolved.executor.nodes, 4);
    assert!(resolved.recipe.peft.is_none());
    // No sealed cache under the datasets dir.
    assert!(resolved.recipe.data.force_redownload);
    assert!(resolved.name.starts_with("sft_finetune_llama31_405b_bf16_4nodes_tp8_"));

    let backend = RecordingBackend::default();
    let outcome = submit(resolved, backend.clone(), "finetune-runtime")
        .await
        .unwrap();

    let Outcome::DryRun(plan) = outcome else {
        panic!("expected a dry run");
    };
    assert_eq!(plan.jobs.len(), 2);
    assert_eq!(plan.jobs[0].name, IMPORT_JOB_NAME);
    assert!(plan.jobs[0].script.contains("#SBATCH --nodes=1\n"));
    assert!(plan.jobs[1].script.contains("#SBATCH --nodes=4\n"));
    assert_eq!(plan.jobs[1].after.as_deref(), Some(IMPORT_JOB_NAME));
    assert!(!plan.to_string().contains("hf_secret"));

    assert!(backend.calls.lock().unwrap().is_empty());
    assert!(!dir.path().join("experiments").exists());
}

#[tokio::test]
async fn test_skip_import_submits_training_only() {
    let dir = tempdir().unwrap();
    let args = parse(dir.path(), &["--skip-import", "--enable-nsys"]);
    let resolved = resolve(&args, &ManifestCache::new(dir.path())).unwrap();
    assert!(!resolved.import_needed);

    let backend = RecordingBackend::default();
    let Outcome::Submitted(record) = submit(resolved, backend.clone(), "rt").await.unwrap() else {
        panic!("expected a submission");
    };
    assert_eq!(record.status, ExperimentStatus::Submitted);
    assert_eq!(record.jobs.len(), 1);
    assert_eq!(record.jobs[0].slurm_job_id.as_deref(), Some("501"));

    let script = std::fs::read_to_string(&record.jobs[0].script).unwrap();
    assert!(script.contains("nsys"));
    assert_eq!(backend.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_import_runs_before_training() {
    let dir = tempdir().unwrap();
    let args = parse(dir.path(), &["--hf-token", "hf_secret"]);
    let resolved = resolve(&args, &ManifestCache::new(dir.path())).unwrap();
    let name = resolved.name.clone();

    let backend = RecordingBackend::default();
    let Outcome::Submitted(record) = submit(resolved, backend.clone(), "rt").await.unwrap() else {
        panic!("expected a submission");
    };

    let calls = backend.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].0.ends_with(format!("{IMPORT_JOB_NAME}_sbatch.sh")));
    assert_eq!(calls[0].1, None);
    assert_eq!(calls[1].1.as_deref(), Some("501"));

    let records = RecordStore::list(dir.path(), &name).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record.id);
    assert_eq!(records[0].jobs[1].dependency.as_deref(), Some("501"));
}

#[tokio::test]
async fn test_missing_token_enqueues_nothing() {
    let dir = tempdir().unwrap();
    // Validation passes with --skip-import; flip it afterwards to reach the submit check.
    let args = parse(dir.path(), &["--skip-import"]);
    let mut resolved = resolve(&args, &ManifestCache::new(dir.path())).unwrap();
    resolved.import_needed = true;

    let backend = RecordingBackend::default();
    let err = submit(resolved, backend.clone(), "rt").await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::Experiment(ExperimentError::Precondition(_))
    ));
    assert!(backend.calls.lock().unwrap().is_empty());
    assert!(!dir.path().join("experiments").exists());
}

#[test]
fn test_validation_errors_surface() {
    let dir = tempdir().unwrap();
    let args = parse(dir.path(), &["--wandb", "--skip-import"]);
    let err = resolve(&args, &ManifestCache::new(dir.path())).unwrap_err();
    assert!(matches!(err, LaunchError::Args(_)));

    let args = parse(
        dir.path(),
        &["--gpu", "b200", "--model-family", "llama3", "--model-size", "405b"],
    );
    let err = resolve(&args, &ManifestCache::new(dir.path())).unwrap_err();
    assert!(matches!(err, LaunchError::Args(_)));
}

#[test]
fn test_missing_layout_row_surfaces() {
    let dir = tempdir().unwrap();
    let layouts = dir.path().join("layouts.toml");
    std::fs::write(&layouts, "[gb200.sft.llama3]\n8b = false\n").unwrap();
    let layouts = layouts.display().to_string();

    // The preset exists; only the table row is gone. Overrides do not stand in for it.
    let args = parse(
        dir.path(),
        &[
            "--gpu", "gb200", "--finetuning", "sft", "--model-family", "llama3",
            "--model-size", "8b", "--num-nodes", "1", "--skip-import", "--layouts", &layouts,
        ],
    );
    let err = resolve(&args, &ManifestCache::new(dir.path())).unwrap_err();
    assert!(
        matches!(err, LaunchError::Layout(LayoutError::MissingDefault(ref key)) if key == "gb200.sft.llama3.8b"),
        "{err}"
    );
}

#[tokio::test]
async fn test_rejected_training_cancels_import() {
    let dir = tempdir().unwrap();
    let args = parse(dir.path(), &["--hf-token", "hf_secret"]);
    let resolved = resolve(&args, &ManifestCache::new(dir.path())).unwrap();
    let name = resolved.name.clone();

    let backend = RecordingBackend {
        reject: Some(name.clone()),
        ..Default::default()
    };
    let err = submit(resolved, backend.clone(), "rt").await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::Experiment(ExperimentError::Backend(BackendError::Rejected { .. }))
    ));

    // Only the import was accepted, and it is withdrawn.
    assert_eq!(backend.calls.lock().unwrap().len(), 1);
    assert_eq!(*backend.cancelled.lock().unwrap(), vec!["501".to_string()]);

    let records = RecordStore::list(dir.path(), &name).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, ExperimentStatus::Aborted);
    assert!(record.jobs.iter().all(|j| j.slurm_job_id.is_none()));
    assert!(record.errors.iter().any(|e| e.contains("Invalid account")));
    assert!(record.errors.iter().any(|e| e.contains("cancelled job 501")));
}

#[tokio::test]
async fn test_end_to_end_with_mock_sbatch() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("sbatch.log");
    let sbatch = dir.path().join("sbatch");
    std::fs::write(
        &sbatch,
        format!(
            "#!/bin/bash\necho \"$@\" >> {}\necho $(( $(wc -l < {}) + 7000 ))\n",
            log.display(),
            log.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&sbatch, std::fs::Permissions::from_mode(0o755)).unwrap();

    let args = parse(dir.path(), &["--hf-token", "hf_secret"]);
    let resolved = resolve(&args, &ManifestCache::new(dir.path())).unwrap();
    let Outcome::Submitted(record) = submit(resolved, SlurmBackend::new(&sbatch), "rt")
        .await
        .unwrap()
    else {
        panic!("expected a submission");
    };

    assert_eq!(record.jobs[0].slurm_job_id.as_deref(), Some("7001"));
    assert_eq!(record.jobs[1].slurm_job_id.as_deref(), Some("7002"));

    let log = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<_> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(!lines[0].contains("--dependency"));
    assert!(lines[1].starts_with("--parsable --dependency=afterok:7001 "));
}
