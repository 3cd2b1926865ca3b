use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::types::Usage;

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Trailing bytes of stderr quoted in failure messages.
const STDERR_TAIL_BYTES: usize = 400;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Number of child process groups currently running.
pub fn active_children() -> usize {
    process_registry().lock().map_or(0, |registry| registry.len())
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to all registered PGIDs, waits for the grace period,
/// then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Subprocess execution ---

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Short failure description with the tail of stderr.
    pub fn failure_summary(&self) -> String {
        let stderr = self.stderr.trim();
        let start = stderr
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| stderr.len() - i <= STDERR_TAIL_BYTES)
            .unwrap_or(stderr.len());
        let tail = &stderr[start..];
        match (self.code, tail.is_empty()) {
            (Some(code), true) => format!("exit code {}", code),
            (Some(code), false) => format!("exit code {}: {}", code, tail),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {}", tail),
        }
    }
}

/// Build a command from an argv list (`argv[0]` is the program).
pub fn command_from_argv(argv: &[String]) -> Result<tokio::process::Command, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "Command is empty".to_string())?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Spawn a subprocess in its own process group, feed `input` on stdin,
/// and collect its output, killing the whole group on timeout.
///
/// Note: checks the global `shutdown_flag()` after subprocess completion.
pub async fn run_command(
    mut cmd: tokio::process::Command,
    input: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, String> {
    // stdin is a pipe or null, never the terminal: the child sits in a
    // background process group and a terminal read would stop it with SIGTTIN.
    cmd.stdin(if input.is_some() {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    });
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
    // functions are permitted. setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn subprocess: {}", e))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    debug!(pid = child_pid, "Subprocess spawned");

    register_child(pgid);

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        let input = input.to_string();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("Subprocess closed stdin early: {}", e);
            }
        });
    }

    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    match wait_result {
        Err(_) => {
            debug!(
                pid = child_pid,
                "Subprocess timed out after {}s, killing process group",
                timeout.as_secs()
            );
            kill_process_group(child_pid).await;
            unregister_child(pgid);
            Err(format!(
                "Subprocess timed out after {} seconds",
                timeout.as_secs()
            ))
        }
        Ok(wait_result) => {
            unregister_child(pgid);
            let output = wait_result.map_err(|e| format!("Error waiting for subprocess: {}", e))?;
            debug!(pid = child_pid, code = ?output.status.code(), "Subprocess exited");

            if is_shutdown_requested() {
                kill_process_group(child_pid).await;
                return Err("Shutdown requested".to_string());
            }

            Ok(CommandOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending a signal
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| warn!("kill_process_group task panicked: {}", e));
}

// --- Content generation ---

/// Text produced by one generation call, with its token usage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Trait for content generation. Enables mocking in pipeline tests.
pub trait ContentGenerator: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Generation, String>> + Send;
}

#[derive(Deserialize)]
struct GenerationPayload {
    text: String,
    #[serde(default)]
    usage: Usage,
}

/// Parse generator stdout: a `{text, usage}` JSON object, or plain text
/// with zero usage.
pub fn parse_generation(stdout: &str, model: Option<&str>) -> Result<Generation, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err("Generator produced no output".to_string());
    }
    let mut generation = match serde_json::from_str::<GenerationPayload>(trimmed) {
        Ok(payload) => Generation {
            text: payload.text,
            usage: payload.usage,
        },
        Err(_) => Generation {
            text: trimmed.to_string(),
            usage: Usage::default(),
        },
    };
    if generation.usage.total_tokens == 0 {
        generation.usage.total_tokens =
            generation.usage.prompt_tokens + generation.usage.completion_tokens;
    }
    if generation.usage.model.is_empty() {
        if let Some(model) = model {
            generation.usage.model = model.to_string();
        }
    }
    Ok(generation)
}

/// Real implementation that pipes the prompt into a configured command.
#[derive(Debug, Clone)]
pub struct CliGenerator {
    pub command: Vec<String>,
    pub model: Option<String>,
}

impl CliGenerator {
    pub fn new(command: Vec<String>, model: Option<String>) -> Self {
        Self { command, model }
    }
}

impl ContentGenerator for CliGenerator {
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<Generation, String> {
        let mut cmd = command_from_argv(&self.command)?;
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        let output = run_command(cmd, Some(prompt), timeout).await?;
        if !output.success {
            return Err(format!("Generator failed ({})", output.failure_summary()));
        }
        parse_generation(&output.stdout, self.model.as_deref())
    }
}

/// Mock generator for pipeline tests.
///
/// Returns predefined results from a configurable sequence and records
/// every prompt it receives.
pub struct MockGenerator {
    results: tokio::sync::Mutex<Vec<Result<Generation, String>>>,
    prompts: std::sync::Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockGenerator {
    /// Results are returned in order (first call gets first result, etc.).
    pub fn new(results: Vec<Result<Generation, String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
            prompts: std::sync::Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep this long inside every call before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map_or(0, |prompts| prompts.len())
    }
}

impl ContentGenerator for MockGenerator {
    async fn generate(&self, prompt: &str, _timeout: Duration) -> Result<Generation, String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut results = self.results.lock().await;
        results
            .pop()
            .unwrap_or_else(|| Err("MockGenerator: no more results in sequence".to_string()))
    }
}

/// Set the shutdown flag for testing. Only available in test builds.
#[cfg(test)]
fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}
