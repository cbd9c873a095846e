//! External command execution.
//!
//! Everything FunnelDeck knows about the host comes from shelling out to the
//! mesh client and the container runtime. This module is the single boundary
//! where subprocess failure is converted into data: [`run`] never returns an
//! error, and callers decide what a failed [`CommandResult`] means.

use funneldeck_common::CommandResult;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default wall-clock bound for status and control operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Short bound for login-flow probes, which block forever after printing an
/// interactive URL.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound for draining the pipes once the child has exited or been killed.
/// A forked grandchild that inherited the pipes can hold them open long
/// after the child is gone; past this bound its output is forfeited so the
/// command timeout stays meaningful.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

async fn drain(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

/// Run an external command under a wall-clock timeout.
///
/// On timeout the child is force-killed and reaped, and whatever stdout and
/// stderr it produced up to that point is still surfaced: some tools print a
/// login URL and then block, and that partial output is the whole point of
/// the call. Spawn failures and non-zero exits are encoded in the result.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> CommandResult {
    debug!("exec: {} {}", program, args.join(" "));

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to spawn {}: {}", program, e);
            return CommandResult {
                success: false,
                output: None,
                error: Some(format!("failed to spawn {}: {}", program, e)),
                exit_code: -1,
            };
        }
    };

    // Drain the pipes on separate tasks so a timeout still yields whatever
    // the child wrote before being killed. Killing closes the pipes, which
    // unblocks the reads.
    let stdout_task = child.stdout.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr_task = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });

    let mut timed_out = false;
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            let _ = child.start_kill();
            // Reap the killed child so it does not linger as a zombie.
            child.wait().await.ok()
        }
    };

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&stderr).trim().to_string();

    if timed_out {
        warn!(
            "{} timed out after {}s (captured {} bytes of stdout)",
            program,
            timeout.as_secs(),
            stdout.len()
        );
        let mut error = format!("command timed out after {}s", timeout.as_secs());
        if !stderr.is_empty() {
            error.push_str(": ");
            error.push_str(&stderr);
        }
        return CommandResult {
            success: false,
            output: (!stdout.is_empty()).then_some(stdout),
            error: Some(error),
            exit_code: -1,
        };
    }

    match status {
        Some(status) if status.success() => CommandResult {
            success: true,
            output: Some(stdout),
            error: (!stderr.is_empty()).then_some(stderr),
            exit_code: 0,
        },
        Some(status) => {
            let code = status.code().unwrap_or(-1);
            debug!("{} exited with code {}", program, code);
            CommandResult {
                success: false,
                output: (!stdout.is_empty()).then_some(stdout),
                error: Some(if stderr.is_empty() {
                    format!("{} exited with code {}", program, code)
                } else {
                    stderr
                }),
                exit_code: code,
            }
        }
        None => CommandResult {
            success: false,
            output: (!stdout.is_empty()).then_some(stdout),
            error: Some(format!("failed to wait on {}", program)),
            exit_code: -1,
        },
    }
}

/// Extract the mesh provider's interactive login URL from captured output.
///
/// Login commands print the URL and then block until the browser flow
/// completes, so the URL usually arrives in the partial output of a timed-out
/// command, mixed with progress noise on either stream.
pub fn extract_login_url(text: &str) -> Option<String> {
    let re = regex_lite::Regex::new(r"https://login\.tailscale\.com/[A-Za-z0-9/_\-]+").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_on_success() {
        let result = run("echo", &["hello"], DEFAULT_TIMEOUT).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn run_encodes_spawn_failure_as_data() {
        let result = run("definitely-not-a-real-binary-9f2c", &[], DEFAULT_TIMEOUT).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn run_encodes_nonzero_exit_as_data() {
        let result = run("sh", &["-c", "echo before; exit 3"], DEFAULT_TIMEOUT).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        // stdout from before the failure is still surfaced
        assert_eq!(result.output.as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn run_kills_on_timeout_and_keeps_partial_output() {
        let result = run(
            "sh",
            &["-c", "echo partial; exec sleep 30"],
            Duration::from_millis(300),
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.output.as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn run_is_not_stalled_by_a_grandchild_holding_the_pipes() {
        let started = std::time::Instant::now();
        // sh exits immediately; the backgrounded sleep inherits stdout and
        // keeps the pipe open long past the drain bound.
        let result = run("sh", &["-c", "sleep 30 & exit 0"], DEFAULT_TIMEOUT).await;
        assert!(result.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn login_url_extracted_from_noisy_output() {
        let text = "To authenticate, visit:\n\n\thttps://login.tailscale.com/a/0123abcDEF\n\nSuccess.";
        assert_eq!(
            extract_login_url(text).as_deref(),
            Some("https://login.tailscale.com/a/0123abcDEF")
        );
    }

    #[test]
    fn login_url_absent_yields_none() {
        assert_eq!(extract_login_url("no url here"), None);
        assert_eq!(extract_login_url(""), None);
    }
}
