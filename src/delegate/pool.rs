//! Local Execution Pool
//!
//! Runs shell payloads with bash on background threads of this process.
//! At most `max_parallel` scripts run at once; later submissions wait in
//! the pool's own queue. Handles:
//! - Capability matching against the pool's own capability list
//! - Script generation
//! - Output variable capture
//! - Result reporting through the callback channel

use std::collections::BTreeMap;
use std::error::Error;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, error, warn};
use once_cell::sync::OnceCell;

use super::{
    CallbackChannel, DelegateTaskRequest, ExecutionPool, ShellTask, SubmitAck, TaskParameters,
    TaskResult,
};
use crate::error::DispatchError;

/// Prefix of the lines the generated script prints for output variables.
const OUTPUT_MARKER: &str = "__PLANRUNNER_OUTPUT__";

/// A submitted shell task waiting for a free worker.
struct Job {
    task_id: String,
    shell: ShellTask,
    callback: CallbackChannel,
}

/// Executes shell tasks on a bounded set of local threads.
pub struct LocalExecutionPool {
    capabilities: Vec<String>,
    working_dir: Option<PathBuf>,
    max_parallel: usize,
    jobs: OnceCell<Mutex<Sender<Job>>>,
}

impl Default for LocalExecutionPool {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            working_dir: None,
            max_parallel: num_cpus::get().max(1),
            jobs: OnceCell::new(),
        }
    }
}

impl LocalExecutionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities this pool offers to delegate selectors.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Maximum number of scripts running at the same time.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Starts the workers on first use. They stop once the pool is dropped.
    fn jobs(&self) -> &Mutex<Sender<Job>> {
        self.jobs.get_or_init(|| {
            let (tx, rx) = channel::<Job>();
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..self.max_parallel {
                let rx = Arc::clone(&rx);
                let working_dir = self.working_dir.clone();
                thread::spawn(move || run_jobs(&rx, &working_dir));
            }
            debug!("Local pool started {} worker(s)", self.max_parallel);
            Mutex::new(tx)
        })
    }

    fn missing_capabilities(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.capabilities.contains(c))
            .cloned()
            .collect()
    }
}

impl ExecutionPool for LocalExecutionPool {
    fn submit(
        &self,
        request: DelegateTaskRequest,
        callback: CallbackChannel,
    ) -> Result<SubmitAck, DispatchError> {
        let missing = self.missing_capabilities(&request.capabilities);
        if !missing.is_empty() {
            return Err(DispatchError::NoEligibleExecutor(missing.join(", ")));
        }

        let shell = match request.payload.decode()? {
            TaskParameters::Shell(shell) => shell,
            TaskParameters::Json(_) => {
                return Err(DispatchError::NoEligibleExecutor(
                    "local pool only runs shell payloads".to_string(),
                ))
            }
        };

        let job = Job {
            task_id: request.task_id,
            shell,
            callback,
        };
        self.jobs()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .map_err(|_| DispatchError::Transport("local pool workers are gone".to_string()))?;

        Ok(SubmitAck::Submitted)
    }
}

fn run_jobs(jobs: &Mutex<Receiver<Job>>, working_dir: &Option<PathBuf>) {
    loop {
        let next = jobs.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(job) = next else {
            return;
        };
        let result = run_shell_task(&job.task_id, &job.shell, working_dir);
        job.callback.complete(&job.task_id, result);
    }
}

/// Runs one shell task to completion and converts the process result.
pub fn run_shell_task(task_id: &str, shell: &ShellTask, working_dir: &Option<PathBuf>) -> TaskResult {
    let script_path = match create_execution_script(task_id, shell) {
        Ok(path) => path,
        Err(e) => return TaskResult::failure(None, format!("cannot create script: {}", e)),
    };

    let output = execute_with_bash(&script_path, &shell.env, working_dir);

    if let Err(e) = fs::remove_file(&script_path) {
        warn!("Failed to clean up script {}: {}", script_path.display(), e);
    }

    let output = match output {
        Ok(output) => output,
        Err(e) => return TaskResult::failure(None, format!("cannot run bash: {}", e)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let code = output.status.code().unwrap_or(-1);

    if output.status.success() {
        debug!("Task '{}' completed successfully", task_id);
        TaskResult::success(code, parse_outputs(&stdout))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Task '{}' failed with exit code: {}", task_id, code);
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        let tail = stderr.lines().last().unwrap_or_default().trim().to_string();
        let message = if tail.is_empty() {
            format!("script exited with code {}", code)
        } else {
            format!("script exited with code {}: {}", code, tail)
        };
        TaskResult::failure(Some(code), message)
    }
}

/// Collects `NAME=value` pairs printed after the output marker.
fn parse_outputs(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix(OUTPUT_MARKER))
        .filter_map(|rest| rest.trim_start().split_once('='))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Writes the task's script, followed by one echo per output variable.
fn create_execution_script(
    task_id: &str,
    shell: &ShellTask,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let script_dir = std::env::temp_dir().join("planrunner_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("task_{}.sh", task_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", shell.script)?;
    for name in &shell.output_variables {
        writeln!(file, "echo \"{} {}=${{{}}}\"", OUTPUT_MARKER, name, name)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn execute_with_bash(
    script_path: &Path,
    env: &BTreeMap<String, String>,
    working_dir: &Option<PathBuf>,
) -> std::io::Result<Output> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path).envs(env);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    cmd.output()
}
