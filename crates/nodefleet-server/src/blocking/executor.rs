//! Executes [`BlockingRequest`]s on the offload worker thread.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nodefleet_config::{BlockingConfig, ImagesConfig};
use nodefleet_workqueue::{BlockingHandler, TaskFailure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{BlockingRequest, CommandOutput};

/// Runs external commands and file writes for the blocking process.
#[derive(Debug, Clone)]
pub struct BlockingExecutor {
    images: ImagesConfig,
    command_timeout: Option<Duration>,
}

impl BlockingExecutor {
    pub fn new(images: ImagesConfig, blocking: &BlockingConfig) -> Self {
        Self {
            images,
            command_timeout: blocking.command_timeout(),
        }
    }

    async fn pull(&self, image: &str) -> Result<CommandOutput, TaskFailure> {
        let mut argv = self.images.pull_command.clone();
        argv.push(image.to_string());
        checked(&argv, self.run_argv(&argv, self.command_timeout).await?)
    }

    async fn mount(&self, source: &Path, target: &Path) -> Result<CommandOutput, TaskFailure> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| TaskFailure::failed(format!("cannot create {}: {}", target.display(), e)))?;
        let mut argv = self.images.mount_command.clone();
        argv.push(source.display().to_string());
        argv.push(target.display().to_string());
        checked(&argv, self.run_argv(&argv, self.command_timeout).await?)
    }

    async fn umount(&self, target: &Path) -> Result<CommandOutput, TaskFailure> {
        let mut argv = self.images.umount_command.clone();
        argv.push(target.display().to_string());
        checked(&argv, self.run_argv(&argv, self.command_timeout).await?)
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<CommandOutput, TaskFailure> {
        let fail = |e: std::io::Error| TaskFailure::failed(format!("cannot write {}: {}", path.display(), e));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, content).await.map_err(fail)?;
        tokio::fs::rename(&tmp, path).await.map_err(fail)?;
        info!("Wrote {} ({} bytes)", path.display(), content.len());
        Ok(CommandOutput::default())
    }

    /// Run a command, logging its output line by line as it arrives.
    async fn run_argv(&self, argv: &[String], limit: Option<Duration>) -> Result<CommandOutput, TaskFailure> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TaskFailure::failed("empty command line"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskFailure::failed(format!("failed to start {}: {}", program, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (stdout, stderr) = tokio::join!(
                stream_lines(stdout, program, "stdout"),
                stream_lines(stderr, program, "stderr")
            );
            (stdout, stderr, child.wait().await)
        };
        let (stdout, stderr, status) = match limit {
            Some(limit) => tokio::time::timeout(limit, collect)
                .await
                .map_err(|_| TaskFailure::TimedOut {
                    after_ms: limit.as_millis() as u64,
                })?,
            None => collect.await,
        };
        let status = status.map_err(|e| TaskFailure::failed(format!("failed to wait for {}: {}", program, e)))?;

        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl BlockingHandler<BlockingRequest> for BlockingExecutor {
    async fn handle(&self, req: BlockingRequest) -> Result<CommandOutput, TaskFailure> {
        match req {
            BlockingRequest::PullImage { image } => self.pull(&image).await,
            BlockingRequest::Mount { source, target } => self.mount(&source, &target).await,
            BlockingRequest::Umount { target } => self.umount(&target).await,
            BlockingRequest::RunCommand { argv, timeout_secs } => {
                let limit = timeout_secs.map(Duration::from_secs).or(self.command_timeout);
                self.run_argv(&argv, limit).await
            }
            BlockingRequest::WriteFile { path, content } => self.write_file(&path, &content).await,
        }
    }
}

/// Turn a non-zero exit into a task failure.
fn checked(argv: &[String], output: CommandOutput) -> Result<CommandOutput, TaskFailure> {
    if output.success() {
        return Ok(output);
    }
    Err(TaskFailure::failed_with(
        format!("{} exited with status {}", argv.join(" "), output.status),
        output.stderr.trim_end().to_string(),
    ))
}

async fn stream_lines<R>(reader: Option<R>, program: &str, stream: &str) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let Some(reader) = reader else {
        return collected;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(command = %program, stream, "{}", line);
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
