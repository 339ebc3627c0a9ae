use std::{path::PathBuf, process::Stdio};

use tgs_core::config::ServiceConfig;
use tokio::process::Command;

/// Everything needed to launch one worker process.
///
/// The config travels both as flags and as environment variables so the worker
/// picks it up whichever way it reads configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerInvocation {
    pub fn new(program: impl Into<PathBuf>, cfg: &ServiceConfig) -> Self {
        Self {
            program: program.into(),
            args: cfg.worker_args(),
            env: cfg.worker_env(),
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
