use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::{
    fs,
    io::AsyncReadExt,
    process::Command,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    constants::{SCRATCH_DIR_PREFIX, SOLUTION_FILE_NAME},
    core::{
        analysis::policy::SourcePolicy,
        domain::{ExecutionLimits, ExecutionResult, Termination},
        traits::executor::{ExecuteError, Executor},
    },
    native::sandbox::{Confinement, Isolation, OutputCapture, ProcessGroup, ResourceLimits, Stream},
};

const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const READ_CHUNK_BYTES: usize = 8 * 1024;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs learner code with a local Python interpreter in a fresh scratch
/// directory, a cleared environment and its own process group. Under
/// isolation the scratch directory is the only writable place.
#[derive(Clone, Debug)]
pub struct NativeExecutor {
    python_path: PathBuf,
    scratch_root: PathBuf,
    isolation: Isolation,
    policy: SourcePolicy,
}

enum Outcome {
    Exited,
    TimedOut,
    OutputTooLarge,
    Cancelled,
}

impl NativeExecutor {
    pub fn new<T, U>(python_path: T, scratch_root: U, isolation: Isolation) -> Self
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
    {
        let python_path = python_path.as_ref();
        NativeExecutor {
            python_path: resolve_program(python_path).unwrap_or_else(|| python_path.into()),
            scratch_root: scratch_root.as_ref().into(),
            isolation,
            policy: SourcePolicy::default(),
        }
    }

    pub fn with_policy(self, policy: SourcePolicy) -> Self {
        Self { policy, ..self }
    }

    /// Asks the interpreter for its version, proving that it can be started,
    /// then checks that it can be started inside the sandbox. Under
    /// `Isolation::Required` a host without namespace support is an error.
    pub async fn preflight(&self) -> Result<String, ExecuteError> {
        let output = Command::new(&self.python_path)
            .arg("-I")
            .arg("-V")
            .env_clear()
            .env("PATH", CHILD_PATH)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ExecuteError::Unavailable {
                msg: format!(
                    "{} -V exited with {}",
                    self.python_path.display(),
                    output.status
                ),
            });
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if self.isolation == Isolation::Disabled {
            tracing::warn!("Sandbox isolation is disabled, learner code can write anywhere");
            return Ok(version);
        }
        match self.check_isolation().await {
            Ok(()) => tracing::info!("Sandbox isolation is available"),
            Err(e) if self.isolation == Isolation::Required => {
                return Err(ExecuteError::Unavailable {
                    msg: format!("sandbox isolation is unavailable: {}", e),
                });
            }
            Err(e) => tracing::warn!(
                "Sandbox isolation is unavailable, learner code runs unconfined: {}",
                e
            ),
        }
        Ok(version)
    }

    /// Starts the interpreter fully confined in a throwaway scratch directory.
    async fn check_isolation(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_DIR_PREFIX)
            .tempdir_in(&self.scratch_root)?;

        let output = self
            .command(scratch.path(), &ExecutionLimits::default(), Isolation::Required)?
            .arg("-c")
            .arg("pass")
            .output()
            .await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "confined interpreter exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// The interpreter command with its arguments still open.
    fn command(
        &self,
        scratch: &Path,
        limits: &ExecutionLimits,
        isolation: Isolation,
    ) -> std::io::Result<Command> {
        let confinement =
            Confinement::new(ResourceLimits::from_execution(limits), isolation, scratch)?;

        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-I")
            .arg("-B")
            .current_dir(scratch)
            .env_clear()
            .env("PATH", CHILD_PATH)
            .env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        // SAFETY: the hook only makes async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || confinement.apply());
        }

        Ok(cmd)
    }
}

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    #[tracing::instrument(skip(self, code, cancel))]
    async fn execute(
        &self,
        code: &str,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        if let Err(violation) = self.policy.check(code) {
            tracing::debug!("Source rejected: {}", violation);
            return Ok(ExecutionResult::rejected(violation.to_string()));
        }

        fs::create_dir_all(&self.scratch_root).await?;
        // Removed on drop, after the process group below is gone.
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_DIR_PREFIX)
            .tempdir_in(&self.scratch_root)?;
        fs::write(scratch.path().join(SOLUTION_FILE_NAME), code).await?;

        let started = Instant::now();
        let mut child = self
            .command(scratch.path(), limits, self.isolation)?
            .arg(SOLUTION_FILE_NAME)
            .spawn()
            .map_err(|e| ExecuteError::Unavailable {
                msg: format!("failed to start {}: {}", self.python_path.display(), e),
            })?;
        let mut group = ProcessGroup::new(child.id());

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecuteError::Unavailable {
                msg: "child pipes are missing".to_string(),
            });
        };

        let mut capture = OutputCapture::new(limits.output_limit_bytes);
        let mut out_buf = vec![0u8; READ_CHUNK_BYTES];
        let mut err_buf = vec![0u8; READ_CHUNK_BYTES];
        let (mut out_open, mut err_open) = (true, true);
        let mut exited = false;

        let deadline = tokio::time::sleep(Duration::from_millis(limits.time_ms));
        tokio::pin!(deadline);
        let mut exit_poll = tokio::time::interval(EXIT_POLL_INTERVAL);
        exit_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                _ = &mut deadline => break Outcome::TimedOut,
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => {
                        if !capture.push(Stream::Stdout, &out_buf[..n]) {
                            break Outcome::OutputTooLarge;
                        }
                    }
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => {
                        if !capture.push(Stream::Stderr, &err_buf[..n]) {
                            break Outcome::OutputTooLarge;
                        }
                    }
                },
                _ = exit_poll.tick(), if !exited => {
                    if group.leader_exited()? {
                        exited = true;
                        // Leftover grandchildren would keep the pipes open.
                        group.kill();
                    }
                }
            }

            if exited && !out_open && !err_open {
                break Outcome::Exited;
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        // The leader is still unreaped, so the group id is still ours.
        group.kill();
        let status = child.wait().await?;
        group.release();

        let truncated = capture.is_truncated();
        let (stdout, stderr) = capture.into_strings();
        let stderr = hide_scratch_path(&stderr, scratch.path());

        let (termination, exit_code) = match outcome {
            Outcome::Cancelled => {
                tracing::debug!("Execution cancelled after {} ms", duration_ms);
                return Err(ExecuteError::Cancelled);
            }
            Outcome::TimedOut => (Termination::TimedOut, None),
            Outcome::OutputTooLarge => (Termination::OutputTooLarge, None),
            Outcome::Exited => classify_exit(status),
        };
        tracing::debug!(
            "Execution finished: termination={:?}, exit_code={:?}, duration_ms={}",
            termination,
            exit_code,
            duration_ms
        );

        Ok(ExecutionResult::new(
            termination,
            exit_code,
            stdout,
            stderr,
            truncated,
            duration_ms,
        ))
    }
}

fn classify_exit(status: ExitStatus) -> (Termination, Option<i32>) {
    if status.success() {
        return (Termination::Completed, Some(0));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGXCPU) {
            return (Termination::TimedOut, None);
        }
    }
    (Termination::RuntimeError, status.code())
}

/// Tracebacks name the script by its absolute scratch path; learners only
/// need the file name.
fn hide_scratch_path(text: &str, scratch: &Path) -> String {
    let prefix = format!("{}/", scratch.display());
    text.replace(&prefix, "")
}

/// Looks a bare program name up on this process's `PATH`, since the child
/// environment only carries a minimal one.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() != 1 {
        return None;
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
