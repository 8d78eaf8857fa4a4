//! Process execution with timeout support, behind the `ToolRunner`
//! capability interface.
//!
//! Every external invocation in the forge — the build worker, ruff,
//! mypy, pytest, the python harness — goes through `ToolRunner`. The
//! production implementation supervises a real subprocess with a
//! wall-clock deadline (terminate, then kill after a grace period);
//! the stub implementation replays scripted outputs so the
//! verification battery and the runtime loader are fully deterministic
//! under test.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// One command to run: program, arguments, working directory, optional
/// standard input, optional wall-clock bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }
    }

    /// Combined stdout and stderr, the way logs are captured to
    /// artifacts.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str(&self.stderr);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Capability interface for external invocations.
pub trait ToolRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Grace period between kill and reap after a timeout.
const KILL_GRACE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Real subprocess runner used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessRunner;

impl ToolRunner for SubprocessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", spec.program))?;

        // Feed stdin and drain stdout/stderr on their own threads so a
        // chatty child can never wedge the supervisor on a full pipe.
        let stdin_thread = spec.stdin.clone().and_then(|text| {
            child.stdin.take().map(|mut pipe| {
                std::thread::spawn(move || {
                    let _ = pipe.write_all(text.as_bytes());
                })
            })
        });
        let stdout_thread = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_thread = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let deadline = spec.timeout.map(|t| Instant::now() + t);
        let (exit_code, timed_out) = loop {
            match child.try_wait().context("failed to poll child process")? {
                Some(status) => break (status.code().unwrap_or(-1), false),
                None => {
                    if let Some(deadline) = deadline
                        && Instant::now() >= deadline
                    {
                        let _ = child.kill();
                        std::thread::sleep(KILL_GRACE);
                        let _ = child.wait();
                        break (-1, true);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };

        if let Some(t) = stdin_thread {
            let _ = t.join();
        }
        let stdout = stdout_thread
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_thread
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default();

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            timed_out,
        })
    }
}

/// Scripted runner for tests. Outputs are queued per program name and
/// replayed in order; a program with no script returns a clean exit.
/// Every invocation is recorded for assertion.
#[derive(Debug, Default)]
pub struct StubRunner {
    scripts: Mutex<HashMap<String, Vec<CommandOutput>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl StubRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next output for `program`.
    pub fn script(&self, program: &str, output: CommandOutput) {
        self.scripts
            .lock()
            .expect("stub scripts lock")
            .entry(program.to_string())
            .or_default()
            .push(output);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("stub calls lock").clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }
}

impl ToolRunner for StubRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().expect("stub calls lock").push(spec.clone());
        let mut scripts = self.scripts.lock().expect("stub scripts lock");
        let output = match scripts.get_mut(&spec.program) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => CommandOutput::success(""),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Option<Duration>) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            stdin: None,
            timeout,
        }
    }

    #[test]
    fn captures_exit_code_and_output() {
        let out = SubprocessRunner
            .run(&sh("echo out; echo err >&2; exit 3", None))
            .expect("run");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
        assert!(!out.ok());
    }

    #[test]
    fn stdin_reaches_the_child() {
        let mut spec = sh("cat", None);
        spec.stdin = Some("packet body\n".to_string());
        let out = SubprocessRunner.run(&spec).expect("run");
        assert_eq!(out.stdout, "packet body\n");
        assert!(out.ok());
    }

    #[test]
    fn timeout_kills_the_child() {
        let start = Instant::now();
        let out = SubprocessRunner
            .run(&sh("sleep 30", Some(Duration::from_millis(300))))
            .expect("run");
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn large_output_does_not_deadlock() {
        // Well past the 64 KiB pipe buffer.
        let out = SubprocessRunner
            .run(&sh("yes x | head -c 200000", Some(Duration::from_secs(30))))
            .expect("run");
        assert!(out.ok());
        assert!(out.stdout.len() >= 200_000);
    }

    #[test]
    fn missing_program_is_an_error() {
        let spec = CommandSpec {
            program: "definitely-not-a-real-program-kavi".to_string(),
            args: vec![],
            cwd: std::env::temp_dir(),
            stdin: None,
            timeout: None,
        };
        assert!(SubprocessRunner.run(&spec).is_err());
    }

    #[test]
    fn combined_joins_streams_with_newlines() {
        let out = CommandOutput {
            exit_code: 0,
            stdout: "a".to_string(),
            stderr: "b".to_string(),
            timed_out: false,
        };
        assert_eq!(out.combined(), "a\nb\n");
    }

    #[test]
    fn stub_replays_scripts_in_order_and_records_calls() {
        let stub = StubRunner::new();
        stub.script("ruff", CommandOutput::failure(1, "E501 line too long"));
        stub.script("ruff", CommandOutput::success(""));

        let spec = CommandSpec {
            program: "ruff".to_string(),
            args: vec!["check".to_string()],
            cwd: PathBuf::from("."),
            stdin: None,
            timeout: None,
        };
        let first = stub.run(&spec).expect("run");
        assert_eq!(first.exit_code, 1);
        let second = stub.run(&spec).expect("run");
        assert!(second.ok());

        // Unscripted programs succeed quietly.
        let other = stub
            .run(&CommandSpec {
                program: "mypy".to_string(),
                ..spec.clone()
            })
            .expect("run");
        assert!(other.ok());

        assert_eq!(stub.calls().len(), 3);
        assert_eq!(stub.calls_to("ruff").len(), 2);
    }
}
