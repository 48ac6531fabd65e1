//! Blocking execution of external tools with cooperative cancellation.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use derive_more::{Display, Error};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of stderr lines attached to a [ToolError::Failed].
const STDERR_TAIL: usize = 20;

/// Shared flag raised by the signal handler.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise this token on SIGINT and SIGTERM.
    pub fn install_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            log::warn!(target: "process", "Received termination signal, stopping external processes...");
            token.cancel();
        })
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token was raised while sleeping.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
        !self.is_cancelled()
    }
}

/// Failure of an external tool invocation.
#[derive(Debug, Display, Error)]
pub enum ToolError {
    /// The process could not be spawned or waited on.
    #[display("{program} could not be run: {source}")]
    NotRun { program: String, source: io::Error },
    /// The process exited unsuccessfully.
    #[display("{program} failed ({status}): {stderr}")]
    Failed {
        #[error(ignore)]
        program: String,
        #[error(ignore)]
        status: ExitStatus,
        #[error(ignore)]
        stderr: String,
    },
    /// The process was killed because of a termination signal.
    #[display("{program} was interrupted")]
    Interrupted {
        #[error(ignore)]
        program: String,
    },
}

impl ToolError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Default)]
pub struct Output {
    /// Full stdout if capturing was requested, empty otherwise.
    pub stdout: String,
}

/// How the stdout of the child is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdout {
    /// Forward each line to the logger.
    Relay,
    /// Keep the full output for the caller.
    Capture,
}

/// Runs `command` to completion.
///
/// stderr is always relayed to the logger at debug level and its tail is
/// attached to the error on failure. The child is killed as soon as `cancel`
/// is raised.
pub fn run(command: &mut Command, stdout: Stdout, cancel: &CancelToken) -> Result<Output, ToolError> {
    let program = command.get_program().to_string_lossy().into_owned();
    log::trace!(target: "process", "Running: {command:?}");

    if cancel.is_cancelled() {
        return Err(ToolError::Interrupted { program });
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolError::NotRun {
            program: program.clone(),
            source,
        })?;

    let stdout_reader = child.stdout.take().map(|out| match stdout {
        Stdout::Capture => capture(out),
        Stdout::Relay => relay(out, program.clone(), log::Level::Info, 0),
    });
    let stderr_reader = child
        .stderr
        .take()
        .map(|err| relay(err, program.clone(), log::Level::Debug, STDERR_TAIL));

    let status = loop {
        if cancel.is_cancelled() {
            log::warn!(target: "process", "Terminating {program} (pid {})", child.id());
            let _ = child.kill();
            let _ = child.wait();
            // readers are detached, grandchildren may still hold the pipes
            return Err(ToolError::Interrupted { program });
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                return Err(ToolError::NotRun { program, source });
            }
        }
    };

    let stdout = join(stdout_reader);
    let stderr = join(stderr_reader);

    if !status.success() {
        return Err(ToolError::Failed {
            program,
            status,
            stderr,
        });
    }

    Ok(Output { stdout })
}

fn capture(mut stream: impl Read + Send + 'static) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn relay(
    stream: impl Read + Send + 'static,
    program: String,
    level: log::Level,
    keep: usize,
) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(keep);
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            log::log!(target: "process", level, "[{program}] {line}");
            if keep > 0 {
                if tail.len() == keep {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        Vec::from(tail).join("\n")
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
