//! Run coordination for one workspace folder.
//!
//! A [`TestRunner`] is a small state machine: idle, or running exactly one
//! [`ActiveRun`] with later runs waiting in a queue. Requests dispatch
//! commands to the [`TestApi`]; [`RunnerEvent`]s coming back from the test
//! process are mapped onto the tree and onto run updates for the host.

use std::{
    collections::VecDeque,
    path::{MAIN_SEPARATOR, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    api::{RunnerEvent, TestApi},
    coverage::{self, CoverageReport},
    error::ExplorerError,
    logging::to_crlf,
    message::{TestMessage, format_errors, test_message_for_error},
    node::{ApiId, NodeData, NodeId},
    task::{TaskId, TaskMode, TaskResult, TaskState, TestFile, walk_tasks},
    tree::TestTree,
};

pub type RequestId = String;
pub type RunId = u64;

/// Id of the request synthesized from all continuous requests.
pub const CONTINUOUS_REQUEST_ID: &str = "continuous";

/// A user or watch triggered intent to execute tests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub id: RequestId,
    /// Nodes to run; `None` runs everything.
    #[serde(default)]
    pub include: Option<Vec<NodeId>>,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub coverage: bool,
    #[serde(default)]
    pub update_snapshots: bool,
}

/// What the host's run object should do.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunUpdate {
    Opened {
        run: RunId,
        request: RequestId,
        name: String,
    },
    Enqueued {
        run: RunId,
        node: NodeId,
    },
    Started {
        run: RunId,
        node: NodeId,
    },
    Passed {
        run: RunId,
        node: NodeId,
        duration: Option<f64>,
    },
    Failed {
        run: RunId,
        node: NodeId,
        messages: Vec<TestMessage>,
        duration: Option<f64>,
    },
    Skipped {
        run: RunId,
        node: NodeId,
    },
    Output {
        run: RunId,
        output: String,
        node: Option<NodeId>,
    },
    Coverage {
        run: RunId,
        file: PathBuf,
        data: Value,
    },
    Ended {
        run: RunId,
    },
    Warning {
        message: String,
    },
}

/// The single open run.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRun {
    pub id: RunId,
    pub request: RunRequest,
    /// Opened by a dispatch of ours; the rerun notification the process sends
    /// for it must not open a second run.
    awaiting_rerun: bool,
}

/// A run waiting for the active one to end.
#[derive(Debug, Clone)]
struct PendingRun {
    request: RunRequest,
    /// File paths, or folder paths ending in a separator standing for every
    /// file under the folder. `None` means all files.
    filters: Option<Vec<String>>,
    name_pattern: Option<String>,
    /// Send the run command when the run opens. Reruns started by the
    /// process itself are only tracked.
    dispatch: bool,
}

pub struct TestRunner<A: TestApi> {
    api: A,
    active: Option<ActiveRun>,
    pending: VecDeque<PendingRun>,
    /// The one-shot request currently executing.
    current_request: Option<RunRequest>,
    continuous: Vec<RunRequest>,
    coverage_enabled: bool,
    next_run_id: RunId,
    updates: Vec<RunUpdate>,
}

impl<A: TestApi> TestRunner<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            active: None,
            pending: VecDeque::new(),
            current_request: None,
            continuous: Vec::new(),
            coverage_enabled: false,
            next_run_id: 1,
            updates: Vec::new(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    #[must_use]
    pub fn active_run(&self) -> Option<&ActiveRun> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn pending_runs(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn continuous_requests(&self) -> &[RunRequest] {
        &self.continuous
    }

    #[must_use]
    pub fn coverage_enabled(&self) -> bool {
        self.coverage_enabled
    }

    pub fn take_updates(&mut self) -> Vec<RunUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// Start `request`. Continuous requests register with the watcher and
    /// return; one-shot requests open a run once no other run is open.
    pub fn run_tests(&mut self, tree: &mut TestTree, request: RunRequest) -> Result<(), ExplorerError> {
        if request.continuous {
            return self.watch(tree, request);
        }

        let (filters, name_pattern) = match &request.include {
            Some(include) => (Some(file_filters(tree, include)), name_pattern(tree, include)),
            None => (None, None),
        };
        self.enqueue(
            tree,
            PendingRun {
                request,
                filters,
                name_pattern,
                dispatch: true,
            },
        );
        Ok(())
    }

    /// Like [`TestRunner::run_tests`] with coverage instrumentation on.
    pub fn run_coverage(&mut self, tree: &mut TestTree, request: RunRequest) -> Result<(), ExplorerError> {
        let request = RunRequest {
            coverage: true,
            ..request
        };
        if !self.coverage_enabled {
            match self.api.enable_coverage() {
                Ok(()) => self.coverage_enabled = true,
                Err(err) => self.warn(format!("Failed to enable coverage: {err}")),
            }
        }
        self.run_tests(tree, request)
    }

    /// Cancel a request. A continuous request leaves the watch set; a
    /// one-shot request ends its run and aborts the process run.
    pub fn cancel(&mut self, tree: &mut TestTree, id: &str) -> Result<(), ExplorerError> {
        if let Some(index) = self.continuous.iter().position(|r| r.id == id) {
            let cancelled = self.continuous.remove(index);
            log::info!("continuous request {id} cancelled");
            if self.continuous.is_empty() {
                if let Err(err) = self.api.unwatch_tests() {
                    log::warn!("failed to stop watching: {err}");
                }
                self.pending.retain(|p| !p.request.continuous);
                if self.active.as_ref().is_some_and(|run| run.request.continuous) {
                    self.end_run(tree);
                }
                self.on_exhausted();
            } else if cancelled.coverage {
                self.disable_unused_coverage();
            }
            return Ok(());
        }

        if self.active.as_ref().is_some_and(|run| run.request.id == id) {
            log::info!("run for request {id} cancelled");
            if let Err(err) = self.api.cancel_run() {
                log::warn!("failed to cancel run: {err}");
            }
            self.end_run(tree);
            return Ok(());
        }

        if let Some(index) = self.pending.iter().position(|p| p.request.id == id) {
            self.pending.remove(index);
            self.disable_unused_coverage();
            return Ok(());
        }

        Err(ExplorerError::UnknownRequest(id.to_string()))
    }

    /// Ask the process to collect a file node that has not been expanded yet.
    pub fn resolve_file(&mut self, tree: &TestTree, id: &NodeId) -> Result<(), ExplorerError> {
        let node = tree
            .node(id)
            .ok_or_else(|| ExplorerError::UnknownNode(id.to_string()))?;
        if let NodeData::File { resolvable: true, .. } = node.data {
            self.api.collect_tests(&node.path)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, tree: &mut TestTree, event: RunnerEvent) {
        match event {
            RunnerEvent::WatcherRerun {
                files,
                trigger,
                collecting,
            } => self.on_watcher_rerun(tree, &files, trigger.as_deref(), collecting),
            RunnerEvent::TaskUpdate { packs } => self.on_task_update(tree, &packs),
            RunnerEvent::Collected { files, collecting } => self.on_collected(tree, &files, collecting),
            RunnerEvent::Finished {
                files,
                unhandled_error,
                collecting,
            } => self.on_finished(tree, &files, unhandled_error.as_deref(), collecting),
            RunnerEvent::ConsoleLog { content, task_id } => {
                self.on_console_log(tree, &content, task_id.as_deref());
            }
        }
    }

    fn on_watcher_rerun(
        &mut self,
        tree: &mut TestTree,
        files: &[PathBuf],
        trigger: Option<&str>,
        collecting: bool,
    ) {
        if collecting {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            if active.awaiting_rerun {
                active.awaiting_rerun = false;
                return;
            }
        }

        let Some(request) = self.continuous_request().or_else(|| self.current_request.clone()) else {
            log::debug!("rerun of {} file(s) without a request", files.len());
            return;
        };
        log::info!("rerun triggered by {}", trigger.unwrap_or("the test process"));
        self.enqueue(
            tree,
            PendingRun {
                request,
                filters: Some(files.iter().map(|f| f.display().to_string()).collect()),
                name_pattern: None,
                dispatch: false,
            },
        );
    }

    fn on_task_update(&mut self, tree: &mut TestTree, packs: &[(TaskId, Option<TaskResult>)]) {
        if self.active.is_none() {
            log::debug!("dropping {} task update(s) outside a run", packs.len());
            return;
        }
        for (id, result) in packs {
            let Some(node) = tree.get_test_item_by_task_id(id).cloned() else {
                log::error!("no test node for task {id}");
                continue;
            };
            if let Some(result) = result {
                self.mark_result(tree, &node, result);
            }
        }
    }

    fn on_collected(&mut self, tree: &mut TestTree, files: &[TestFile], collecting: bool) {
        for file in files {
            tree.collect_file(self.api.handle(), file);
        }
        if collecting || self.active.is_none() {
            return;
        }

        for file in files {
            for task in walk_tasks(&file.tasks).into_iter().filter(|t| t.is_concrete()) {
                let Some(node) = tree.get_test_item_by_task(task) else {
                    log::error!("no test node for task {}", task.id);
                    continue;
                };
                if matches!(task.mode, TaskMode::Skip | TaskMode::Todo) {
                    self.mark(RunUpdateKind::Skipped, node);
                } else if let Some(result) = &task.result {
                    self.mark_result(tree, &node, result);
                }
            }
        }
    }

    fn on_finished(
        &mut self,
        tree: &mut TestTree,
        files: &[TestFile],
        unhandled_error: Option<&str>,
        collecting: bool,
    ) {
        let Some(run) = self.active.as_ref().map(|r| r.id) else {
            log::debug!("finished outside a run");
            return;
        };

        if !collecting {
            self.attach_coverage(run);
        }

        for file in files {
            let Some(node) = tree.get_test_item_by_task(file) else {
                log::error!("no test node for file {}", file.filepath);
                continue;
            };
            if let Some(result) = &file.result {
                self.mark_result(tree, &node, result);
            }
        }

        if let Some(error) = unhandled_error {
            self.updates.push(RunUpdate::Output {
                run,
                output: to_crlf(error),
                node: None,
            });
        }

        self.end_run(tree);
    }

    fn on_console_log(&mut self, tree: &TestTree, content: &str, task_id: Option<&str>) {
        match self.active.as_ref() {
            Some(active) => {
                let node = task_id.and_then(|id| tree.get_test_item_by_task_id(id)).cloned();
                self.updates.push(RunUpdate::Output {
                    run: active.id,
                    output: to_crlf(content),
                    node,
                });
            }
            None => log::info!("{}", content.trim_end()),
        }
    }

    /// Apply one task result to a node. Suites only surface their own
    /// declaration errors; files and tests get run marks.
    fn mark_result(&mut self, tree: &mut TestTree, node: &NodeId, result: &TaskResult) {
        let Some(data) = tree.node(node).map(|n| n.data.clone()) else {
            return;
        };
        match data {
            NodeData::Folder => {}
            NodeData::Suite { .. } => {
                if result.is_fail() && !result.errors.is_empty() {
                    tree.set_error(node, Some(format_errors(&result.errors)));
                }
            }
            NodeData::File { .. } | NodeData::Test { .. } => match result.state() {
                Ok(TaskState::Fail) => {
                    if result.errors.is_empty() {
                        return;
                    }
                    let path = tree.node(node).map(|n| n.path.clone()).unwrap_or_default();
                    let messages = result
                        .errors
                        .iter()
                        .map(|error| test_message_for_error(error, &path))
                        .collect();
                    self.mark(
                        RunUpdateKind::Failed {
                            messages,
                            duration: result.duration,
                        },
                        node.clone(),
                    );
                }
                Ok(TaskState::Pass) => self.mark(
                    RunUpdateKind::Passed {
                        duration: result.duration,
                    },
                    node.clone(),
                ),
                Ok(TaskState::Todo | TaskState::Skip) => self.mark(RunUpdateKind::Skipped, node.clone()),
                Ok(TaskState::Only | TaskState::Run) => self.mark(RunUpdateKind::Started, node.clone()),
                Err(_) => {
                    log::error!(
                        "{}",
                        ExplorerError::InvalidTaskState(result.state.clone())
                    );
                }
            },
        }
    }

    fn mark(&mut self, kind: RunUpdateKind, node: NodeId) {
        let Some(run) = self.active.as_ref().map(|r| r.id) else {
            return;
        };
        self.updates.push(match kind {
            RunUpdateKind::Started => RunUpdate::Started { run, node },
            RunUpdateKind::Passed { duration } => RunUpdate::Passed { run, node, duration },
            RunUpdateKind::Failed { messages, duration } => RunUpdate::Failed {
                run,
                node,
                messages,
                duration,
            },
            RunUpdateKind::Skipped => RunUpdate::Skipped { run, node },
        });
    }

    fn watch(&mut self, tree: &mut TestTree, request: RunRequest) -> Result<(), ExplorerError> {
        let (files, name_pattern) = match &request.include {
            Some(include) => {
                let filters = file_filters(tree, include);
                (
                    Some(resolve_filters(tree, &self.api.handle().id, &filters)),
                    name_pattern(tree, include),
                )
            }
            None => (None, None),
        };
        self.continuous.push(request);
        if let Err(err) = self.api.watch_tests(files.as_deref(), name_pattern.as_deref()) {
            self.warn(format!("Failed to start watching: {err}"));
        }
        Ok(())
    }

    /// The union of every continuous request.
    fn continuous_request(&self) -> Option<RunRequest> {
        if self.continuous.is_empty() {
            return None;
        }
        let include = self
            .continuous
            .iter()
            .map(|r| r.include.clone())
            .collect::<Option<Vec<_>>>()
            .map(|sets| {
                let mut union: Vec<NodeId> = Vec::new();
                for id in sets.into_iter().flatten() {
                    if !union.contains(&id) {
                        union.push(id);
                    }
                }
                union
            });
        Some(RunRequest {
            id: CONTINUOUS_REQUEST_ID.to_string(),
            include,
            continuous: true,
            coverage: self.continuous.iter().any(|r| r.coverage),
            update_snapshots: false,
        })
    }

    fn enqueue(&mut self, tree: &mut TestTree, run: PendingRun) {
        if let Some(active) = &self.active {
            log::debug!("request {} waits for run {}", run.request.id, active.id);
            self.pending.push_back(run);
            return;
        }
        self.start(tree, run);
    }

    fn start(&mut self, tree: &mut TestTree, run: PendingRun) {
        let id = self.next_run_id;
        self.next_run_id += 1;

        let api_id = self.api.handle().id.clone();
        let files = run
            .filters
            .as_ref()
            .map(|filters| resolve_filters(tree, &api_id, filters));
        let name = match (&files, run.request.continuous) {
            (_, true) => "Watching".to_string(),
            (Some(files), false) => format!("Running {} files", files.len()),
            (None, false) => "Running all files".to_string(),
        };

        if !run.request.continuous {
            self.current_request = Some(run.request.clone());
        }
        self.updates.push(RunUpdate::Opened {
            run: id,
            request: run.request.id.clone(),
            name,
        });
        self.active = Some(ActiveRun {
            id,
            request: run.request.clone(),
            awaiting_rerun: run.dispatch,
        });
        log::info!("run {id} opened for request {}", run.request.id);

        let enqueued: Vec<NodeId> = match (&run.request.include, &files, run.dispatch) {
            (Some(include), _, true) => include.iter().filter(|n| tree.contains(n)).cloned().collect(),
            (_, Some(files), _) => files
                .iter()
                .flat_map(|f| tree.get_file_test_items(f).to_vec())
                .filter(|n| tree.get_api_from_test_item(n) == Some(&api_id))
                .collect(),
            (_, None, _) => tree
                .get_all_file_items()
                .into_iter()
                .filter(|n| tree.get_api_from_test_item(n) == Some(&api_id))
                .cloned()
                .collect(),
        };
        for node in enqueued {
            self.updates.push(RunUpdate::Enqueued { run: id, node });
        }

        if !run.dispatch {
            return;
        }
        let result = if run.request.update_snapshots {
            self.api
                .update_snapshots(files.as_deref(), run.name_pattern.as_deref())
        } else {
            self.api.run_files(files.as_deref(), run.name_pattern.as_deref())
        };
        if let Err(err) = result {
            self.warn(format!("Failed to start test run: {err}"));
            self.end_run(tree);
        }
    }

    /// Close the active run and open the next waiting one.
    fn end_run(&mut self, tree: &mut TestTree) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.updates.push(RunUpdate::Ended { run: active.id });
        log::info!("run {} ended", active.id);

        if self
            .current_request
            .as_ref()
            .is_some_and(|r| r.id == active.request.id)
        {
            self.current_request = None;
            self.on_exhausted();
        }

        if let Some(next) = self.pending.pop_front() {
            self.start(tree, next);
        }
    }

    /// No request is left to consume results.
    fn on_exhausted(&mut self) {
        log::debug!("run requests exhausted");
        self.disable_unused_coverage();
    }

    fn disable_unused_coverage(&mut self) {
        let in_use = self.continuous.iter().any(|r| r.coverage)
            || self.current_request.as_ref().is_some_and(|r| r.coverage)
            || self.pending.iter().any(|p| p.request.coverage);
        if !self.coverage_enabled || in_use {
            return;
        }
        self.coverage_enabled = false;
        if let Err(err) = self.api.disable_coverage() {
            self.warn(format!("Failed to disable coverage: {err}"));
        }
    }

    fn attach_coverage(&mut self, run: RunId) {
        let dir = match self.api.wait_for_coverage_report() {
            Ok(Some(dir)) => dir,
            Ok(None) => return,
            Err(err) => {
                self.warn(format!("Failed to read coverage report: {err}"));
                return;
            }
        };

        match CoverageReport::read(&dir) {
            Ok(report) => {
                for (file, data) in report.entries() {
                    self.updates.push(RunUpdate::Coverage {
                        run,
                        file: file.clone(),
                        data: data.clone(),
                    });
                }
            }
            Err(err) => self.warn(format!("Failed to read coverage report: {err}")),
        }

        if let Err(err) = coverage::remove_report(&dir) {
            log::warn!("failed to remove coverage report {}: {err}", dir.display());
        }
    }

    fn warn(&mut self, message: String) {
        log::warn!("{message}");
        self.updates.push(RunUpdate::Warning { message });
    }
}

enum RunUpdateKind {
    Started,
    Passed {
        duration: Option<f64>,
    },
    Failed {
        messages: Vec<TestMessage>,
        duration: Option<f64>,
    },
    Skipped,
}

/// File filters for an include set. Folders become their path with a
/// trailing separator, resolved to files only when the run starts.
pub fn file_filters(tree: &TestTree, include: &[NodeId]) -> Vec<String> {
    let mut filters: Vec<String> = Vec::new();
    for id in include {
        let Some(node) = tree.node(id) else {
            log::error!("run requested for unknown node {id}");
            continue;
        };
        let filter = match node.data {
            NodeData::Folder => format!("{}{MAIN_SEPARATOR}", node.path.display()),
            _ => node.path.display().to_string(),
        };
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }
    filters
}

/// Expand folder filters into the folder's current files of collaborator
/// `api`.
pub fn resolve_filters(tree: &TestTree, api: &ApiId, filters: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for filter in filters {
        let expanded = match filter.strip_suffix(MAIN_SEPARATOR) {
            Some(folder) => tree
                .get_folder_by_path(Path::new(folder))
                .map(|folder| tree.get_folder_files(folder))
                .unwrap_or_default()
                .into_iter()
                .filter(|f| tree.get_api_from_test_item(f) == Some(api))
                .filter_map(|f| tree.node(&f).map(|n| n.path.clone()))
                .collect(),
            None => vec![PathBuf::from(filter)],
        };
        for file in expanded {
            if !files.contains(&file) {
                files.push(file);
            }
        }
    }
    files
}

/// One alternation of the name patterns of every suite and test in
/// `include`.
pub fn name_pattern(tree: &TestTree, include: &[NodeId]) -> Option<String> {
    let patterns: Vec<String> = include.iter().filter_map(|id| tree.test_name_pattern(id)).collect();
    (!patterns.is_empty()).then(|| patterns.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::ApiHandle,
        task::{Task, TaskKind},
    };

    fn tree_with_tests() -> (TestTree, ApiHandle) {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut tree = TestTree::new(tx);
        tree.reset(&[PathBuf::from("/ws")]);
        let api = ApiHandle::new(Path::new("/ws"), "ws");
        let test = |id: &str| Task {
            id: id.into(),
            name: id.into(),
            kind: TaskKind::Test,
            mode: TaskMode::Run,
            location: None,
            result: None,
            tasks: vec![],
        };
        for (path, id) in [("/ws/src/a.test.ts", "a1"), ("/ws/src/deep/b.test.ts", "b1")] {
            tree.collect_file(
                &api,
                &TestFile {
                    id: format!("file-{id}"),
                    name: path.into(),
                    filepath: path.into(),
                    tasks: vec![test(id)],
                    ..Default::default()
                },
            );
        }
        (tree, api)
    }

    #[test]
    fn folders_become_trailing_separator_filters() {
        let (tree, api) = tree_with_tests();
        let folder = tree.get_folder_by_path(Path::new("/ws/src")).unwrap().clone();
        let include = vec![folder, NodeId::task("a1"), NodeId::file(Path::new("/ws/src/a.test.ts"), "")];

        let filters = file_filters(&tree, &include);
        assert_eq!(filters, [format!("/ws/src{MAIN_SEPARATOR}"), "/ws/src/a.test.ts".to_string()]);

        let files = resolve_filters(&tree, &api.id, &filters);
        assert_eq!(
            files,
            [PathBuf::from("/ws/src/a.test.ts"), PathBuf::from("/ws/src/deep/b.test.ts")]
        );
    }

    #[test]
    fn name_pattern_skips_files_and_folders() {
        let (tree, _) = tree_with_tests();
        let include = vec![
            NodeId::file(Path::new("/ws/src/a.test.ts"), ""),
            NodeId::task("a1"),
            NodeId::task("b1"),
        ];
        assert_eq!(
            name_pattern(&tree, &include).as_deref(),
            Some(r"^\s?a1$|^\s?b1$")
        );
        assert_eq!(name_pattern(&tree, &include[..1]), None);
    }
}
