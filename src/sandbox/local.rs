//! Process-based sandbox backend.
//!
//! Each run gets a fresh ephemeral directory: the seed workspace is copied
//! (never mounted), patches are staged on top, and the command runs via
//! `/bin/sh -c` with a cleared environment and POSIX resource limits
//! (RLIMIT_CPU, RLIMIT_AS, RLIMIT_NPROC). Wall-clock enforcement drops the
//! child future, which kills the process group via `kill_on_drop`. Network
//! isolation is attempted with an unshared network namespace and silently
//! skipped where the process lacks the privilege.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use uuid::Uuid;

use super::{ExecutionRequest, SandboxBackend, SandboxError};
use crate::task::{ExecutionResult, ExitStatus, Patch, TestSummary};

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

pub struct LocalSandbox;

impl LocalSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for LocalSandbox {
    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let exec_dir = request
            .limits
            .exec_root
            .join(format!("exec-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&exec_dir)
            .map_err(|e| SandboxError::Infrastructure(format!("create {:?}: {}", exec_dir, e)))?;

        let result = self.run_in_dir(request, &exec_dir).await;

        // The directory is ephemeral by contract; leftovers are only a
        // disk-space concern, so cleanup failure is not an error.
        if let Err(e) = std::fs::remove_dir_all(&exec_dir) {
            tracing::debug!("Could not remove execution dir {:?}: {}", exec_dir, e);
        }

        result
    }
}

impl LocalSandbox {
    async fn run_in_dir(
        &self,
        request: &ExecutionRequest,
        exec_dir: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        if let Some(workspace) = &request.workspace {
            copy_tree(workspace, exec_dir).map_err(|e| {
                SandboxError::Infrastructure(format!("copy workspace {:?}: {}", workspace, e))
            })?;
        }
        stage_patches(exec_dir, &request.patches)?;

        let limits = &request.limits;
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(exec_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", exec_dir)
            .env("LANG", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let cpu = limits.cpu_limit_secs;
            let mem_bytes = limits.memory_limit_mb << 20;
            let nproc = u64::from(limits.max_processes);
            unsafe {
                cmd.pre_exec(move || {
                    // Best-effort network isolation; needs CAP_SYS_ADMIN.
                    libc::unshare(libc::CLONE_NEWNET);
                    apply_rlimit(libc::RLIMIT_CPU as libc::c_int, cpu)?;
                    apply_rlimit(libc::RLIMIT_AS as libc::c_int, mem_bytes)?;
                    apply_rlimit(libc::RLIMIT_NPROC as libc::c_int, nproc)?;
                    Ok(())
                });
            }
        }

        let started = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Infrastructure(format!("spawn /bin/sh: {}", e)))?;

        let output = match tokio::time::timeout(limits.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::Infrastructure(format!(
                    "wait for child: {}",
                    e
                )))
            }
            Err(_) => {
                // Dropping the child future killed the process.
                tracing::warn!(
                    "Execution exceeded wall-clock limit of {:?}",
                    limits.timeout()
                );
                return Ok(ExecutionResult {
                    exit: ExitStatus::Killed,
                    stdout: String::new(),
                    stderr: format!(
                        "execution killed after exceeding wall-clock limit of {}s",
                        limits.timeout_secs
                    ),
                    duration_ms: started.elapsed().as_millis() as u64,
                    resource_limit_violation: true,
                    tests: None,
                });
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = cap_output(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            limits.output_cap_bytes,
        );
        let stderr = cap_output(
            String::from_utf8_lossy(&output.stderr).into_owned(),
            limits.output_cap_bytes,
        );

        // SIGXCPU and SIGKILL are how the limits fire; any other signal
        // (e.g. SIGSEGV) is the candidate's own crash.
        let (exit, violation) = match output.status.code() {
            Some(code) => (ExitStatus::Exited { code }, false),
            None => (ExitStatus::Killed, killed_by_limit(&output.status)),
        };
        let tests = parse_test_summary(&stdout, &stderr);

        Ok(ExecutionResult {
            exit,
            stdout,
            stderr,
            duration_ms,
            resource_limit_violation: violation,
            tests,
        })
    }
}

fn killed_by_limit(status: &std::process::ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        matches!(status.signal(), Some(libc::SIGKILL) | Some(libc::SIGXCPU))
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        true
    }
}

#[cfg(unix)]
fn apply_rlimit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: called between fork and exec with a valid rlimit struct.
    if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks are skipped; they could point outside the copy.
    }
    Ok(())
}

fn stage_patches(exec_dir: &Path, patches: &[Patch]) -> Result<(), SandboxError> {
    for patch in patches {
        let target = resolve_patch_target(exec_dir, patch.path())?;
        let base = std::fs::read_to_string(&target).ok();
        let patched = patch
            .apply(base.as_deref())
            .map_err(|e| SandboxError::MalformedPatch(format!("{}: {}", patch.path(), e)))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Infrastructure(format!("create {:?}: {}", parent, e))
            })?;
        }
        std::fs::write(&target, patched)
            .map_err(|e| SandboxError::Infrastructure(format!("write {:?}: {}", target, e)))?;
    }
    Ok(())
}

fn resolve_patch_target(exec_dir: &Path, path: &str) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(path);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
    if escapes {
        return Err(SandboxError::MalformedPatch(format!(
            "patch path escapes the workspace: {}",
            path
        )));
    }
    Ok(exec_dir.join(rel))
}

fn cap_output(mut text: String, cap: usize) -> String {
    if text.len() <= cap {
        return text;
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    text
}

/// Extract pass/fail counts from common test runner summary lines
/// (pytest, cargo test, jest). Returns `None` when no summary is found.
fn parse_test_summary(stdout: &str, stderr: &str) -> Option<TestSummary> {
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    let passed_re = PASSED.get_or_init(|| Regex::new(r"(\d+) passed").unwrap());
    let failed_re = FAILED.get_or_init(|| Regex::new(r"(\d+) failed").unwrap());

    let scan = |text: &str| -> Option<TestSummary> {
        let passed = passed_re.captures(text)?[1].parse().ok()?;
        let failed = failed_re
            .captures(text)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0);
        Some(TestSummary { passed, failed })
    };
    scan(stdout).or_else(|| scan(stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::task::PatchChange;

    fn limits() -> SandboxConfig {
        SandboxConfig {
            // High enough that per-user process counts in CI do not trip it.
            max_processes: 4096,
            exec_root: std::env::temp_dir().join(format!("autodebug-test-{}", Uuid::new_v4())),
            ..SandboxConfig::default()
        }
    }

    fn request(command: &str, limits: SandboxConfig) -> ExecutionRequest {
        ExecutionRequest {
            workspace: None,
            patches: vec![],
            command: command.to_string(),
            limits,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let sandbox = LocalSandbox::new();
        let result = sandbox.run(&request("echo hello", limits())).await.unwrap();
        assert_eq!(result.exit, ExitStatus::Exited { code: 0 });
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.resource_limit_violation);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_errored() {
        let sandbox = LocalSandbox::new();
        let result = sandbox.run(&request("exit 3", limits())).await.unwrap();
        assert_eq!(result.exit, ExitStatus::Exited { code: 3 });
    }

    #[tokio::test]
    async fn patches_are_staged_before_the_command() {
        let sandbox = LocalSandbox::new();
        let mut req = request("cat greeting.txt", limits());
        req.patches = vec![Patch {
            change: PatchChange::Replace {
                path: "greeting.txt".to_string(),
                contents: "patched\n".to_string(),
            },
            iteration: 1,
        }];
        let result = sandbox.run(&req).await.unwrap();
        assert_eq!(result.stdout, "patched\n");
    }

    #[tokio::test]
    async fn wall_clock_limit_kills_the_command() {
        let sandbox = LocalSandbox::new();
        let mut limits = limits();
        limits.timeout_secs = 1;
        let result = sandbox.run(&request("sleep 30", limits)).await.unwrap();
        assert_eq!(result.exit, ExitStatus::Killed);
        assert!(result.resource_limit_violation);
        assert!(result.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn segfault_is_not_a_limit_violation() {
        let sandbox = LocalSandbox::new();
        let result = sandbox
            .run(&request("kill -s SEGV $$", limits()))
            .await
            .unwrap();
        assert_eq!(result.exit, ExitStatus::Killed);
        assert!(!result.resource_limit_violation);
    }

    #[tokio::test]
    async fn sigkill_counts_as_a_limit_violation() {
        let sandbox = LocalSandbox::new();
        let result = sandbox
            .run(&request("kill -s KILL $$", limits()))
            .await
            .unwrap();
        assert_eq!(result.exit, ExitStatus::Killed);
        assert!(result.resource_limit_violation);
    }

    #[tokio::test]
    async fn unapplicable_diff_is_a_malformed_patch() {
        let sandbox = LocalSandbox::new();
        let mut req = request("true", limits());
        req.patches = vec![Patch {
            change: PatchChange::Diff {
                path: "missing.py".to_string(),
                diff: "@@ -1,1 +1,1 @@\n-does not exist\n+replacement\n".to_string(),
            },
            iteration: 1,
        }];
        assert!(matches!(
            sandbox.run(&req).await,
            Err(SandboxError::MalformedPatch(_))
        ));
    }

    #[tokio::test]
    async fn patch_paths_cannot_escape_the_workspace() {
        let sandbox = LocalSandbox::new();
        let mut req = request("true", limits());
        req.patches = vec![Patch {
            change: PatchChange::Replace {
                path: "../outside.txt".to_string(),
                contents: "nope\n".to_string(),
            },
            iteration: 1,
        }];
        assert!(matches!(
            sandbox.run(&req).await,
            Err(SandboxError::MalformedPatch(_))
        ));
    }

    #[tokio::test]
    async fn workspace_is_copied_not_shared() {
        let seed = std::env::temp_dir().join(format!("autodebug-seed-{}", Uuid::new_v4()));
        std::fs::create_dir_all(seed.join("src")).unwrap();
        std::fs::write(seed.join("src/lib.py"), "original\n").unwrap();

        let sandbox = LocalSandbox::new();
        let mut req = request("echo changed > src/lib.py && cat src/lib.py", limits());
        req.workspace = Some(seed.clone());
        let result = sandbox.run(&req).await.unwrap();

        assert_eq!(result.stdout, "changed\n");
        // The seed tree is untouched.
        assert_eq!(
            std::fs::read_to_string(seed.join("src/lib.py")).unwrap(),
            "original\n"
        );
        std::fs::remove_dir_all(seed).unwrap();
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let sandbox = LocalSandbox::new();
        let mut limits = limits();
        limits.output_cap_bytes = 100;
        let result = sandbox
            .run(&request("head -c 10000 /dev/zero | tr '\\0' 'a'", limits))
            .await
            .unwrap();
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert!(result.stdout.len() < 200);
    }

    #[test]
    fn parses_pytest_summary() {
        let summary =
            parse_test_summary("===== 1 failed, 2 passed in 0.12s =====", "").unwrap();
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn parses_cargo_summary() {
        let summary = parse_test_summary(
            "test result: ok. 5 passed; 0 failed; 0 ignored",
            "",
        )
        .unwrap();
        assert_eq!(summary.passed, 5);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn no_summary_yields_none() {
        assert!(parse_test_summary("hello world", "").is_none());
    }
}
