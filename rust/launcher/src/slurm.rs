//! Slurm job scripts and the `sbatch` backend.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::process::Command;

use crate::{
    experiment::{BackendError, JobBackend, JobSpec},
    plugins::LaunchCommand,
};

/// Mount point of the experiment directory inside the container.
pub const CONTAINER_EXPERIMENT_DIR: &str = "/nemo_run";

/// Whether secret values are written into a rendered script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Secrecy {
    /// Replace every secret with `***`, for anything shown to a user.
    Redact,
    /// Write real values, for the script handed to `sbatch`.
    Expose,
}

/// Quote `s` for a POSIX shell unless it only holds safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-+=:,./@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Path of a job's task file inside the container.
pub fn container_task_path(job_name: &str) -> String {
    format!("{CONTAINER_EXPERIMENT_DIR}/{job_name}.json")
}

/// Render the batch script for `job`, whose files live in `experiment_dir`.
pub fn render_sbatch(
    job: &JobSpec,
    experiment_dir: &Path,
    entrypoint: &str,
    secrecy: Secrecy,
) -> String {
    let exec = &job.executor;

    let mut cmd = LaunchCommand::new(vec![
        entrypoint.to_string(),
        job.task.subcommand().to_string(),
        "--task".to_string(),
        container_task_path(&job.name),
    ]);
    let profile_dir = format!("{CONTAINER_EXPERIMENT_DIR}/nsys_profile");
    for plugin in &job.plugins {
        plugin.setup(&mut cmd, &profile_dir);
    }

    let dir = experiment_dir.display();
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH --job-name={}", job.name),
        format!("#SBATCH --account={}", exec.account),
        format!("#SBATCH --partition={}", exec.partition),
        format!("#SBATCH --nodes={}", exec.nodes),
        format!("#SBATCH --ntasks-per-node={}", exec.ntasks_per_node),
        format!("#SBATCH --gpus-per-node={}", exec.gpus_per_node),
        format!("#SBATCH --time={}", exec.time_limit),
        format!("#SBATCH --mem={}", exec.mem),
        format!("#SBATCH --output={dir}/{}_%j.log", job.name),
    ];
    if exec.exclusive {
        lines.push("#SBATCH --exclusive".to_string());
    }
    if exec.retries == 0 {
        lines.push("#SBATCH --no-requeue".to_string());
    }
    lines.push(String::new());
    lines.push("set -euo pipefail".to_string());
    lines.push(String::new());

    // Plugin variables override executor ones.
    let mut env: BTreeMap<&str, &str> = exec
        .env_vars
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    env.extend(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in env {
        lines.push(format!("export {key}={}", shell_quote(value)));
    }
    for (key, value) in exec.secrets.expose() {
        let value = match secrecy {
            Secrecy::Redact => "***",
            Secrecy::Expose => value,
        };
        lines.push(format!("export {key}={}", shell_quote(value)));
    }
    lines.push(String::new());

    lines.extend(cmd.setup.iter().cloned());

    let mut mounts = exec.container_mounts.clone();
    mounts.push(format!("{dir}:{CONTAINER_EXPERIMENT_DIR}"));

    let mut srun: Vec<String> = vec!["srun".to_string()];
    srun.extend(exec.srun_args.iter().cloned());
    srun.push(format!("--container-image={}", exec.container_image));
    srun.push(format!("--container-mounts={}", mounts.join(",")));
    srun.push(format!("--container-workdir={CONTAINER_EXPERIMENT_DIR}"));
    srun.push("--no-container-mount-home".to_string());
    srun.extend(cmd.command());

    let srun: Vec<String> = srun.iter().map(|a| shell_quote(a)).collect();
    lines.push(srun.join(" \\\n    "));
    lines.push(String::new());
    lines.join("\n")
}

/// Extract the job id from `sbatch --parsable` output (`<id>[;<cluster>]`).
pub fn parse_job_id(stdout: &str) -> Result<String, BackendError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| BackendError::NoJobId(stdout.to_string()))?;
    let id = line.split_once(';').map_or(line, |(id, _)| id).trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return Err(BackendError::NoJobId(stdout.to_string()));
    }
    Ok(id.to_string())
}

/// Submits jobs with `sbatch` and withdraws them with `scancel`.
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    sbatch: PathBuf,
    scancel: PathBuf,
}

impl SlurmBackend {
    pub fn new(sbatch: impl Into<PathBuf>) -> Self {
        Self {
            sbatch: sbatch.into(),
            scancel: PathBuf::from("scancel"),
        }
    }

    #[must_use]
    pub fn with_scancel(mut self, scancel: impl Into<PathBuf>) -> Self {
        self.scancel = scancel.into();
        self
    }
}

impl JobBackend for SlurmBackend {
    async fn submit(
        &self,
        script: &Path,
        dependency: Option<&str>,
    ) -> Result<String, BackendError> {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("sbatch {}", script.display()));
        pb.enable_steady_tick(Duration::from_millis(100));

        let mut cmd = Command::new(&self.sbatch);
        cmd.arg("--parsable");
        if let Some(dep) = dependency {
            cmd.arg(format!("--dependency=afterok:{dep}"));
        }
        cmd.arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!("Running {:?}", cmd.as_std());
        let output = cmd.output().await;
        pb.finish_and_clear();

        let output =
            output.map_err(|e| BackendError::Spawn(self.sbatch.display().to_string(), e))?;
        if !output.status.success() {
            return Err(BackendError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        let output = Command::new(&self.scancel)
            .arg(job_id)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Spawn(self.scancel.display().to_string(), e))?;
        if !output.status.success() {
            return Err(BackendError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
