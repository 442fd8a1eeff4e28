//! Task reports as emitted by the test process.
//!
//! Field names follow the runner's camelCase JSON.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type TaskId = String;

/// A collected test file: the root task of one file for one project.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestFile {
    pub id: TaskId,
    pub name: String,
    pub filepath: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// A suite or test inside a file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub location: Option<TaskLocation>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Suite,
    Test,
    Custom,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Run,
    Skip,
    Only,
    Todo,
}

/// 1-based source location of a task declaration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLocation {
    pub line: u32,
    pub column: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Raw state string, parsed lazily with [`TaskResult::state`] so an
    /// unexpected value is reported instead of rejecting the whole event.
    pub state: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub errors: Vec<ErrorWithDiff>,
}

/// Execution state reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Pass,
    Fail,
    Skip,
    Todo,
    Only,
    Run,
}

impl TaskResult {
    pub fn state(&self) -> Result<TaskState, strum::ParseError> {
        self.state.parse()
    }

    #[must_use]
    pub fn is_fail(&self) -> bool {
        matches!(self.state(), Ok(TaskState::Fail))
    }
}

/// An error serialized by the runner, possibly carrying an assertion diff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorWithDiff {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub stacks: Vec<ParsedStack>,
}

/// One parsed stack frame. Line and column are 1-based.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ParsedStack {
    #[serde(default)]
    pub method: String,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
}

/// Anything the runner reports with a task id.
pub trait ReportedTask {
    fn id(&self) -> &str;

    /// `(filepath, project)` when the task stands for a whole file.
    fn file_key(&self) -> Option<(&str, &str)> {
        None
    }
}

impl ReportedTask for Task {
    fn id(&self) -> &str {
        &self.id
    }
}

impl ReportedTask for TestFile {
    fn id(&self) -> &str {
        &self.id
    }

    fn file_key(&self) -> Option<(&str, &str)> {
        Some((&self.filepath, &self.project_name))
    }
}

impl Task {
    /// Tests and custom tasks, the leaves that carry execution results.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        matches!(self.kind, TaskKind::Test | TaskKind::Custom)
    }
}

/// Depth-first iterator over every task below `tasks`.
pub fn walk_tasks(tasks: &[Task]) -> Vec<&Task> {
    let mut out = Vec::new();
    let mut stack: Vec<&Task> = tasks.iter().rev().collect();
    while let Some(task) = stack.pop() {
        out.push(task);
        stack.extend(task.tasks.iter().rev());
    }
    out
}
