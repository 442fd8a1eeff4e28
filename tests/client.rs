//! JSON-RPC test client for integration tests
//!
//! Spawns the server binary, speaks the framed protocol over its stdio and
//! collects every message it sends back for verification.

use std::{
    fs,
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use lsp_types::Url;
use serde_json::{Value, json};
use tempfile::TempDir;

fn framed(content: &str) -> String {
    format!("Content-Length: {}\r\n\r\n{}", content.len(), content)
}

/// Everything the server sent during one session.
pub struct SessionResult {
    pub messages: Vec<Value>,
    pub status: ExitStatus,
}

impl SessionResult {
    /// Params of every notification with `method`.
    #[must_use]
    pub fn notifications(&self, method: &str) -> Vec<&Value> {
        self.messages
            .iter()
            .filter(|m| m.get("id").is_none() && m["method"] == method)
            .map(|m| &m["params"])
            .collect()
    }

    /// Node snapshots from `$/testTree` upserts, in order.
    #[must_use]
    pub fn upserted_nodes(&self) -> Vec<&Value> {
        self.notifications("$/testTree")
            .into_iter()
            .filter(|p| p["type"] == "upsert")
            .map(|p| &p["node"])
            .collect()
    }

    #[must_use]
    pub fn upserted_labels(&self) -> Vec<&str> {
        self.upserted_nodes()
            .into_iter()
            .filter_map(|n| n["label"].as_str())
            .collect()
    }

    /// `$/testRun` updates of one type.
    #[must_use]
    pub fn run_updates(&self, kind: &str) -> Vec<&Value> {
        self.notifications("$/testRun")
            .into_iter()
            .filter(|p| p["type"] == kind)
            .collect()
    }

    /// Commands sent to the test process, as `(command, params)`.
    #[must_use]
    pub fn runner_commands(&self) -> Vec<(&str, &Value)> {
        self.messages
            .iter()
            .filter(|m| m.get("id").is_none())
            .filter_map(|m| {
                let command = m["method"].as_str()?.strip_prefix("$/runner/")?;
                Some((command, &m["params"]))
            })
            .collect()
    }

    #[must_use]
    pub fn response(&self, id: u64) -> Option<&Value> {
        self.messages.iter().find(|m| m["id"] == id)
    }

    /// Print a summary of the session for debugging
    pub fn print_summary(&self) {
        println!("\n=== Session Summary ===");
        println!("Exit status: {:?}", self.status);
        println!("Messages: {}", self.messages.len());
        println!("Tree nodes: {:?}", self.upserted_labels());
        for (command, params) in self.runner_commands() {
            println!("  runner {command}: {params}");
        }
    }

    // ========== Assertions ==========

    pub fn assert_initialized(&self) {
        let response = self.response(0).expect("no initialize response");
        assert!(
            response["result"]["serverInfo"]["name"] == "vitest-explorer",
            "unexpected initialize response: {response}"
        );
    }

    /// The shutdown request was answered, so the loop survived the session.
    pub fn assert_shut_down(&self) {
        assert!(
            self.response(99).is_some_and(|r| r.get("error").is_none()),
            "expected a shutdown response"
        );
    }

    pub fn assert_tree_has(&self, label: &str) {
        let labels = self.upserted_labels();
        assert!(
            labels.contains(&label),
            "expected node '{label}' in tree, found: {labels:?}"
        );
    }

    pub fn assert_tree_lacks(&self, label: &str) {
        let labels = self.upserted_labels();
        assert!(
            !labels.contains(&label),
            "did not expect node '{label}' in tree, found: {labels:?}"
        );
    }

    #[allow(dead_code)]
    pub fn assert_runner_command(&self, command: &str) {
        let commands = self.runner_commands();
        assert!(
            commands.iter().any(|(c, _)| *c == command),
            "expected runner command '{command}', found: {:?}",
            commands.iter().map(|(c, _)| c).collect::<Vec<_>>()
        );
    }
}

/// Client driving one spawned server
pub struct ServerClient {
    child: Child,
    stdin: ChildStdin,
    stdout_handle: JoinHandle<Vec<Value>>,
}

impl ServerClient {
    /// Spawn the server binary, logging into `log_dir`
    #[must_use]
    pub fn new(log_dir: &Path) -> Self {
        let mut child = Command::new(server_path())
            .arg("--log-dir")
            .arg(log_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env("VITEST_EXPLORER_LOG", "debug")
            .spawn()
            .expect("Failed to start server");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let stdout_handle = thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut messages = Vec::new();
            let mut buf = String::new();

            loop {
                buf.clear();
                match reader.read_line(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let Some(len) = buf.trim().strip_prefix("Content-Length: ") else {
                            continue;
                        };
                        let len: usize = len.parse().unwrap();

                        // Skip empty line
                        reader.read_line(&mut String::new()).ok();

                        let mut content = vec![0u8; len];
                        if reader.read_exact(&mut content).is_err() {
                            break;
                        }
                        let message: Value = serde_json::from_slice(&content).unwrap();
                        println!("[SERVER] {message}");
                        messages.push(message);
                    }
                }
            }
            messages
        });

        Self {
            child,
            stdin,
            stdout_handle,
        }
    }

    pub fn send(&mut self, message: &Value) {
        self.stdin
            .write_all(framed(&message.to_string()).as_bytes())
            .unwrap();
        self.stdin.flush().unwrap();
    }

    pub fn notify(&mut self, method: &str, params: Value) {
        self.send(&json!({ "jsonrpc": "2.0", "method": method, "params": params }));
    }

    /// Send initialize and initialized
    pub fn initialize(&mut self, root_uri: &str, options: Option<Value>) {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "processId": std::process::id(),
                "capabilities": {},
                "workspaceFolders": [{ "uri": root_uri, "name": "test-project" }],
                "initializationOptions": options,
            },
        }));
        self.notify("initialized", json!({}));
    }

    pub fn shutdown_and_exit(&mut self) {
        self.send(&json!({ "jsonrpc": "2.0", "id": 99, "method": "shutdown", "params": null }));
        self.notify("exit", Value::Null);
    }

    /// Wait for the server to exit and collect all output
    #[must_use]
    pub fn wait_for_completion(mut self) -> SessionResult {
        drop(self.stdin);

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = self.child.try_wait().expect("Failed to poll child") {
                break status;
            }
            if Instant::now() > deadline {
                let _ = self.child.kill();
                break self.child.wait().expect("Failed to wait for child");
            }
            thread::sleep(Duration::from_millis(20));
        };
        let messages = self.stdout_handle.join().expect("stdout thread panicked");

        SessionResult { messages, status }
    }
}

/// Path to the server binary built for this test run
#[must_use]
pub fn server_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vitest-explorer"))
}

/// Builder for throwaway workspaces
pub struct TestProject {
    root: TempDir,
    logs: TempDir,
}

impl TestProject {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("Failed to create temp dir"),
            logs: tempfile::tempdir().expect("Failed to create log dir"),
        }
    }

    /// Add a file at `relative`, creating parent folders
    #[must_use]
    pub fn with_file(self, relative: &str, content: &str) -> Self {
        let path = self.root.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create dirs");
        fs::write(path, content).expect("Failed to write file");
        self
    }

    /// Add a vitest test file with one suite and one test
    #[must_use]
    pub fn with_test_file(self, relative: &str) -> Self {
        self.with_file(
            relative,
            r#"import { describe, expect, it } from 'vitest'

describe('math', () => {
  it('adds', () => {
    expect(1 + 2).toBe(4)
  })
})
"#,
        )
    }

    /// Add a .vitest-explorer.toml config file
    #[must_use]
    #[allow(dead_code)]
    pub fn with_config(self, config: &str) -> Self {
        self.with_file(".vitest-explorer.toml", config)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    #[must_use]
    pub fn uri(&self) -> String {
        Url::from_file_path(self.path()).unwrap().to_string()
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        self.logs.path()
    }
}

/// Run a session: initialize, send `messages` as notifications, shut down
pub fn run_session(
    project: &TestProject,
    options: Option<Value>,
    messages: &[(&str, Value)],
) -> SessionResult {
    let mut client = ServerClient::new(project.log_dir());
    client.initialize(&project.uri(), options);
    for (method, params) in messages {
        client.notify(method, params.clone());
    }
    client.shutdown_and_exit();
    client.wait_for_completion()
}
