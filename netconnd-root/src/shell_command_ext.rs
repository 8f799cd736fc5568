use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command exited with status {0:?}")]
    CommandFailed(Option<i32>),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Runs external helpers such as `ip` for operations netlink has no message for.
pub trait ShellCommandExt {
    fn run(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

impl ShellCommandExt for Command {
    async fn run(&mut self) -> Result<(), Error> {
        let output = self.output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            tracing::error!(cmd = ?self, status = ?output.status.code(), %stderr, "helper command failed");
            return Err(Error::CommandFailed(output.status.code()));
        }
        if !stderr.trim().is_empty() {
            tracing::warn!(cmd = ?self, %stderr, "helper command succeeded with output on stderr");
        }
        Ok(())
    }
}
