//! Helper functions for relaunch integration tests

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use nix::unistd::Pid;
use relaunch::{policy::RestartPolicy, supervisor::ProcessState, AppConfig, Supervisor};
use tempfile::TempDir;

/// How long any single wait in a test may take before the test fails.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Test-specific temporary directory holding the results file and the
/// test scripts.
#[allow(dead_code)]
pub struct TestDir {
    dir: TempDir,

    /// File that test processes append their output to; read with
    /// [`TestDir::results`].
    pub results_path: PathBuf,

    /// Path to `test-daemon.sh`, which takes two arguments: the name of
    /// the daemon, which is written to the results file when the daemon
    /// starts, is asked to shut down, and stops; and the path to the
    /// results file.
    pub test_daemon_path: PathBuf,
}

/// Creates the temp directory and writes the test scripts into it.
pub async fn setup() -> TestDir {
    let dir = TempDir::new().unwrap();
    let results_path = dir.path().join("results.txt");

    let test_daemon_path = dir.path().join("test-daemon.sh");
    tokio::fs::write(&test_daemon_path, include_bytes!("test-daemon.sh"))
        .await
        .unwrap();

    TestDir {
        dir,
        results_path,
        test_daemon_path,
    }
}

#[allow(dead_code)]
impl TestDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// App that runs `script` through `/bin/sh -c` in the temp
    /// directory. `{result_path}` and `{temp_path}` in the script are
    /// replaced with the results file and temp directory paths.
    pub fn shell_app(&self, name: &str, script: &str) -> AppConfig {
        let script = script
            .replace("{result_path}", self.results_path.to_str().unwrap())
            .replace("{temp_path}", self.path().to_str().unwrap());

        AppConfig {
            args: vec![String::from("-c"), script],
            policy: fast_policy(),
            ..AppConfig::new(name, "/bin/sh", self.path())
        }
    }

    /// App that runs `test-daemon.sh` under the given name.
    pub fn daemon_app(&self, name: &str) -> AppConfig {
        AppConfig {
            args: vec![
                self.test_daemon_path.to_str().unwrap().to_owned(),
                name.to_owned(),
                self.results_path.to_str().unwrap().to_owned(),
            ],
            policy: fast_policy(),
            ..AppConfig::new(name, "/bin/sh", self.path())
        }
    }

    /// Contents of the results file (empty if nothing has been written
    /// yet).
    pub async fn results(&self) -> String {
        match tokio::fs::read_to_string(&self.results_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => panic!("Unable to read result file: {err}"),
        }
    }

    /// Waits until the results file contains `line` at least `count`
    /// times.
    pub async fn wait_for_lines(&self, line: &str, count: usize) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                if self.results().await.lines().filter(|l| *l == line).count() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {count}x {line:?}"));
    }

    pub async fn wait_for_line(&self, line: &str) {
        self.wait_for_lines(line, 1).await
    }

    /// Waits until the results file has at least `count` lines, then
    /// returns them parsed as PIDs.
    pub async fn wait_for_pids(&self, count: usize) -> Vec<Pid> {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let results = self.results().await;
                if results.lines().count() >= count {
                    return results
                        .lines()
                        .map(|line| Pid::from_raw(line.trim().parse().unwrap()))
                        .collect();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {count} PIDs"))
    }
}

/// True if `pid` is a live process. Zombies count as gone: they have
/// exited and are only waiting to be reaped by their (new) parent.
#[allow(dead_code)]
pub fn is_running(pid: Pid) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state follows the parenthesized command name.
        Ok(stat) => !matches!(
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next()),
            Some('Z' | 'X') | None
        ),
        Err(_) => false,
    }
}

/// Waits for `pid` to stop running.
#[allow(dead_code)]
pub async fn wait_for_exit(pid: Pid) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while is_running(pid) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for process {pid} to exit"));
}

/// Restart policy with short delays, so that tests run quickly.
#[allow(dead_code)]
pub fn fast_policy() -> RestartPolicy {
    RestartPolicy {
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        reset_after: Duration::from_secs(10),
        failure_window: Duration::from_secs(60),
        max_failures: 3,
        history_len: 16,
        ..Default::default()
    }
}

/// Waits for the supervisor to reach `state`.
#[allow(dead_code)]
pub async fn wait_for_state(supervisor: &Supervisor, state: ProcessState) {
    let mut receiver = supervisor.subscribe();
    tokio::time::timeout(TEST_TIMEOUT, receiver.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "Timed out waiting for {state}; app is {}",
                supervisor.status()
            )
        })
        .map(|_| ())
        .unwrap();
}
