//! The test process as seen from the explorer: commands going out, events
//! coming back.

use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use lsp_server::Message;
use serde::{Deserialize, Serialize};

use crate::{
    error::ExplorerError,
    node::ApiHandle,
    protocol::{self, RUNNER_PREFIX},
    task::{TaskId, TaskResult, TestFile},
};

/// Commands understood by the test process bound to one workspace folder.
///
/// Calls only dispatch; outcomes arrive later as [`RunnerEvent`]s.
pub trait TestApi {
    fn handle(&self) -> &ApiHandle;

    fn collect_tests(&mut self, file: &Path) -> Result<(), ExplorerError>;

    /// `None` runs every file; `name_pattern` filters tests by full name.
    fn run_files(
        &mut self,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError>;

    fn update_snapshots(
        &mut self,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError>;

    fn watch_tests(
        &mut self,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError>;

    fn unwatch_tests(&mut self) -> Result<(), ExplorerError>;

    fn cancel_run(&mut self) -> Result<(), ExplorerError>;

    fn enable_coverage(&mut self) -> Result<(), ExplorerError>;

    fn disable_coverage(&mut self) -> Result<(), ExplorerError>;

    /// Directory holding the coverage report of the last run, if coverage
    /// was on.
    fn wait_for_coverage_report(&mut self) -> Result<Option<PathBuf>, ExplorerError>;
}

/// Events emitted by the test process, in emission order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RunnerEvent {
    #[serde(rename_all = "camelCase")]
    WatcherRerun {
        files: Vec<PathBuf>,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default)]
        collecting: bool,
    },
    #[serde(rename_all = "camelCase")]
    TaskUpdate {
        packs: Vec<(TaskId, Option<TaskResult>)>,
    },
    #[serde(rename_all = "camelCase")]
    Collected {
        files: Vec<TestFile>,
        #[serde(default)]
        collecting: bool,
    },
    #[serde(rename_all = "camelCase")]
    Finished {
        files: Vec<TestFile>,
        #[serde(default)]
        unhandled_error: Option<String>,
        #[serde(default)]
        collecting: bool,
    },
    #[serde(rename_all = "camelCase")]
    ConsoleLog {
        content: String,
        #[serde(default)]
        task_id: Option<TaskId>,
    },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CommandParams<'a> {
    folder: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [PathBuf]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_name_pattern: Option<&'a str>,
}

/// Forwards commands as `$/runner/<command>` notifications to the host,
/// which owns the actual test process.
pub struct JsonRpcApi {
    handle: ApiHandle,
    sender: Sender<Message>,
    coverage_report: Option<PathBuf>,
}

impl JsonRpcApi {
    #[must_use]
    pub fn new(handle: ApiHandle, sender: Sender<Message>) -> Self {
        Self {
            handle,
            sender,
            coverage_report: None,
        }
    }

    /// Record the report directory announced by the host.
    pub fn set_coverage_report(&mut self, dir: PathBuf) {
        self.coverage_report = Some(dir);
    }

    fn command(
        &self,
        name: &str,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError> {
        let params = CommandParams {
            folder: &self.handle.workspace_folder,
            files,
            test_name_pattern: name_pattern,
        };
        protocol::notify(&self.sender, &format!("{RUNNER_PREFIX}{name}"), &params).map_err(|err| {
            ExplorerError::Api {
                command: name.to_string(),
                message: err.to_string(),
            }
        })
    }
}

impl TestApi for JsonRpcApi {
    fn handle(&self) -> &ApiHandle {
        &self.handle
    }

    fn collect_tests(&mut self, file: &Path) -> Result<(), ExplorerError> {
        self.command("collectTests", Some(&[file.to_path_buf()]), None)
    }

    fn run_files(
        &mut self,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError> {
        self.command("runFiles", files, name_pattern)
    }

    fn update_snapshots(
        &mut self,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError> {
        self.command("updateSnapshots", files, name_pattern)
    }

    fn watch_tests(
        &mut self,
        files: Option<&[PathBuf]>,
        name_pattern: Option<&str>,
    ) -> Result<(), ExplorerError> {
        self.command("watchTests", files, name_pattern)
    }

    fn unwatch_tests(&mut self) -> Result<(), ExplorerError> {
        self.command("unwatchTests", None, None)
    }

    fn cancel_run(&mut self) -> Result<(), ExplorerError> {
        self.command("cancelRun", None, None)
    }

    fn enable_coverage(&mut self) -> Result<(), ExplorerError> {
        self.coverage_report = None;
        self.command("enableCoverage", None, None)
    }

    fn disable_coverage(&mut self) -> Result<(), ExplorerError> {
        self.command("disableCoverage", None, None)
    }

    fn wait_for_coverage_report(&mut self) -> Result<Option<PathBuf>, ExplorerError> {
        Ok(self.coverage_report.take())
    }
}
