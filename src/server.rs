use std::{
    collections::HashMap,
    env::current_dir,
    path::{Path, PathBuf},
};

use crossbeam_channel::{Receiver, Sender, select};
use lsp_server::{Message, Notification, Request, RequestId};
use lsp_types::{InitializeParams, InitializeResult, ServerCapabilities, ServerInfo};
use serde::Deserialize;
use serde_json::Value;
use vitest_explorer::{
    api::{JsonRpcApi, RunnerEvent, TestApi},
    config::Config,
    error::ExplorerError,
    node::{ApiHandle, ApiId, NodeId},
    protocol::{self, TEST_RUN, TEST_TREE},
    runner::{RunRequest, TestRunner},
    tree::TestTree,
    watch::FsEvent,
    workspace::{self, normalize},
};

/// Whether the main loop keeps going.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    #[serde(default)]
    project: String,
    file: PathBuf,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DiscoverParams {
    folder: PathBuf,
    #[serde(default)]
    files: Option<Vec<FileEntry>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RunTestsParams {
    #[serde(default)]
    folder: Option<PathBuf>,
    #[serde(flatten)]
    request: RunRequest,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    request_id: String,
}

#[derive(Deserialize, Debug)]
struct ResolveParams {
    node: NodeId,
}

#[derive(Deserialize, Debug)]
struct RunnerEventParams {
    folder: PathBuf,
    #[serde(flatten)]
    event: RunnerEvent,
}

#[derive(Deserialize, Debug)]
struct CoverageReportParams {
    folder: PathBuf,
    dir: PathBuf,
}

pub struct Server {
    sender: Sender<Message>,
    config: Config,
    tree: TestTree,
    runners: HashMap<ApiId, TestRunner<JsonRpcApi>>,
    fs_events: Receiver<FsEvent>,
    shutdown_requested: bool,
}

impl Server {
    pub fn new(
        sender: Sender<Message>,
        config: Config,
        fs_tx: Sender<FsEvent>,
        fs_rx: Receiver<FsEvent>,
    ) -> Self {
        Self {
            sender,
            config,
            tree: TestTree::new(fs_tx),
            runners: HashMap::new(),
            fs_events: fs_rx,
            shutdown_requested: false,
        }
    }

    /// Process incoming messages and filesystem events one at a time until
    /// the client exits.
    pub fn main_loop(&mut self, receiver: &Receiver<Message>) -> Result<(), ExplorerError> {
        let fs_events = self.fs_events.clone();
        loop {
            select! {
                recv(receiver) -> message => {
                    let Ok(message) = message else {
                        log::warn!("client connection closed");
                        return Ok(());
                    };
                    match self.handle_message(message) {
                        Ok(Flow::Exit) => return Ok(()),
                        Ok(Flow::Continue) => {}
                        Err(err) => log::error!("{err}"),
                    }
                }
                recv(fs_events) -> event => {
                    if let Ok(event) = event {
                        self.tree.handle_fs_event(&event);
                    }
                }
            }
            self.flush()?;
        }
    }

    pub fn handle_message(&mut self, message: Message) -> Result<Flow, ExplorerError> {
        match message {
            Message::Request(request) => self.handle_request(request),
            Message::Notification(notification) => self.handle_notification(notification),
            Message::Response(response) => {
                log::debug!("ignoring response {:?}", response.id);
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<Flow, ExplorerError> {
        log::info!("request {}", request.method);
        match request.method.as_str() {
            "initialize" => {
                let params: InitializeParams = serde_json::from_value(request.params)?;
                self.initialize(request.id, &params)?;
            }
            "shutdown" => {
                self.shutdown_requested = true;
                protocol::respond(&self.sender, request.id, &Value::Null)?;
            }
            method => {
                protocol::respond_error(
                    &self.sender,
                    request.id,
                    -32601, // Method not found
                    format!("method not found: {method}"),
                )?;
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_notification(&mut self, notification: Notification) -> Result<Flow, ExplorerError> {
        log::debug!("notification {}", notification.method);
        let params = notification.params;
        match notification.method.as_str() {
            "exit" => {
                if !self.shutdown_requested {
                    log::warn!("exit without shutdown");
                }
                return Ok(Flow::Exit);
            }
            "initialized" => self.discover_workspaces(),
            "$/discoverFiles" => {
                let params: DiscoverParams = serde_json::from_value(params)?;
                self.discover(&params)?;
            }
            "$/runTests" => {
                let params: RunTestsParams = serde_json::from_value(params)?;
                self.run_tests(params)?;
            }
            "$/cancelRun" => {
                let params: CancelParams = serde_json::from_value(params)?;
                self.cancel(&params.request_id)?;
            }
            "$/resolveFile" => {
                let params: ResolveParams = serde_json::from_value(params)?;
                let api = self
                    .tree
                    .get_api_from_test_item(&params.node)
                    .cloned()
                    .ok_or_else(|| ExplorerError::UnknownNode(params.node.to_string()))?;
                let runner = self
                    .runners
                    .get_mut(&api)
                    .ok_or_else(|| ExplorerError::UnknownNode(params.node.to_string()))?;
                runner.resolve_file(&self.tree, &params.node)?;
            }
            "$/runner/event" => {
                let params: RunnerEventParams = serde_json::from_value(params)?;
                let api = self.api_for_folder(&params.folder)?;
                let runner = self
                    .runners
                    .get_mut(&api)
                    .ok_or_else(|| ExplorerError::UnknownWorkspaceFolder(params.folder.clone()))?;
                runner.handle_event(&mut self.tree, params.event);
            }
            "$/runner/coverageReport" => {
                let params: CoverageReportParams = serde_json::from_value(params)?;
                let api = self.api_for_folder(&params.folder)?;
                self.runner_mut(&api)?.api_mut().set_coverage_report(params.dir);
            }
            method => log::debug!("unhandled notification {method}"),
        }
        Ok(Flow::Continue)
    }

    fn initialize(&mut self, id: RequestId, params: &InitializeParams) -> Result<(), ExplorerError> {
        let mut roots: Vec<PathBuf> = params
            .workspace_folders
            .iter()
            .flatten()
            .filter_map(|folder| folder.uri.to_file_path().ok())
            .collect();
        if roots.is_empty() {
            roots.push(current_dir().map_err(|_| ExplorerError::NoWorkspaceFolders)?);
        }

        self.config = self
            .config
            .with_workspace_overrides(&roots[0], params.initialization_options.as_ref())?;

        self.tree.reset(&roots);
        self.runners.clear();
        for root in &roots {
            let tag = root
                .file_name()
                .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().to_string());
            let handle = ApiHandle::new(root, tag);
            self.runners.insert(
                handle.id.clone(),
                TestRunner::new(JsonRpcApi::new(handle, self.sender.clone())),
            );
        }

        let result = InitializeResult {
            capabilities: ServerCapabilities::default(),
            server_info: Some(ServerInfo {
                name: "vitest-explorer".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..InitializeResult::default()
        };
        protocol::respond(&self.sender, id, &result)
    }

    /// Glob every workspace folder for test files.
    fn discover_workspaces(&mut self) {
        let folders: Vec<PathBuf> = self
            .runners
            .values()
            .map(|r| r.api().handle().workspace_folder.clone())
            .collect();
        for folder in folders {
            let params = DiscoverParams { folder, files: None };
            if let Err(err) = self.discover(&params) {
                log::warn!("discovery failed: {err}");
            }
        }
    }

    fn discover(&mut self, params: &DiscoverParams) -> Result<(), ExplorerError> {
        let api = self.api_for_folder(&params.folder)?;
        let handle = self.runner_mut(&api)?.api().handle().clone();
        let files: Vec<(String, PathBuf)> = match &params.files {
            Some(entries) => entries
                .iter()
                .map(|e| (e.project.clone(), workspace::resolve_path(&handle.workspace_folder, &e.file.to_string_lossy())))
                .collect(),
            None => workspace::find_test_files(&handle.workspace_folder, &self.config.include, &self.config.exclude)?
                .into_iter()
                .map(|file| (self.config.project.clone(), file))
                .collect(),
        };
        log::info!("discovered {} test file(s) in {}", files.len(), handle.workspace_folder.display());

        if let Err(err) = self.tree.watch_test_files_in_workspace(&handle, &files) {
            log::warn!("could not watch {}: {err}", handle.workspace_folder.display());
        }
        Ok(())
    }

    /// Route a request to the runners owning its nodes.
    fn run_tests(&mut self, params: RunTestsParams) -> Result<(), ExplorerError> {
        let mut targets: Vec<(ApiId, RunRequest)> = Vec::new();
        match (&params.folder, &params.request.include) {
            (Some(folder), _) => targets.push((self.api_for_folder(folder)?, params.request.clone())),
            (None, Some(include)) => {
                let mut by_api: Vec<(ApiId, Vec<NodeId>)> = Vec::new();
                for node in include {
                    let Some(api) = self.tree.get_api_from_test_item(node) else {
                        log::error!("no workspace folder owns {node}");
                        continue;
                    };
                    match by_api.iter_mut().find(|(id, _)| id == api) {
                        Some((_, nodes)) => nodes.push(node.clone()),
                        None => by_api.push((api.clone(), vec![node.clone()])),
                    }
                }
                for (api, nodes) in by_api {
                    let request = RunRequest {
                        include: Some(nodes),
                        ..params.request.clone()
                    };
                    targets.push((api, request));
                }
            }
            (None, None) => {
                targets.extend(self.runners.keys().map(|api| (api.clone(), params.request.clone())));
            }
        }

        for (api, request) in targets {
            let runner = self
                .runners
                .get_mut(&api)
                .ok_or_else(|| ExplorerError::UnknownWorkspaceFolder(PathBuf::from(&api)))?;
            if request.coverage {
                runner.run_coverage(&mut self.tree, request)?;
            } else {
                runner.run_tests(&mut self.tree, request)?;
            }
        }
        Ok(())
    }

    fn cancel(&mut self, request_id: &str) -> Result<(), ExplorerError> {
        let mut found = false;
        for runner in self.runners.values_mut() {
            match runner.cancel(&mut self.tree, request_id) {
                Ok(()) => found = true,
                Err(ExplorerError::UnknownRequest(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if found {
            Ok(())
        } else {
            Err(ExplorerError::UnknownRequest(request_id.to_string()))
        }
    }

    /// Send every pending tree change and run update to the client.
    pub fn flush(&mut self) -> Result<(), ExplorerError> {
        for change in self.tree.take_changes() {
            protocol::notify(&self.sender, TEST_TREE, &change)?;
        }
        for runner in self.runners.values_mut() {
            for update in runner.take_updates() {
                protocol::notify(&self.sender, TEST_RUN, &update)?;
            }
        }
        Ok(())
    }

    pub fn dispose(&mut self) {
        self.tree.dispose();
        self.runners.clear();
    }

    fn api_for_folder(&self, folder: &Path) -> Result<ApiId, ExplorerError> {
        let id = normalize(folder).to_string_lossy().to_string();
        if self.runners.contains_key(&id) {
            Ok(id)
        } else {
            Err(ExplorerError::UnknownWorkspaceFolder(folder.to_path_buf()))
        }
    }

    fn runner_mut(&mut self, api: &ApiId) -> Result<&mut TestRunner<JsonRpcApi>, ExplorerError> {
        self.runners
            .get_mut(api)
            .ok_or_else(|| ExplorerError::UnknownWorkspaceFolder(PathBuf::from(api)))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use lsp_types::{Url, WorkspaceFolder};
    use serde_json::json;

    use super::*;

    fn server() -> (Server, Receiver<Message>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (fs_tx, fs_rx) = crossbeam_channel::unbounded();
        (Server::new(tx, Config::default(), fs_tx, fs_rx), rx)
    }

    fn initialize(server: &mut Server, root: &Path) {
        #[allow(deprecated)]
        let params = InitializeParams {
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: Url::from_file_path(root).unwrap(),
                name: "demo".to_string(),
            }]),
            ..InitializeParams::default()
        };
        let request = Request::new(RequestId::from(1), "initialize".to_string(), params);
        server.handle_message(Message::Request(request)).unwrap();
    }

    fn notification(method: &str, params: Value) -> Message {
        Message::Notification(Notification::new(method.to_string(), params))
    }

    fn drain(rx: &Receiver<Message>) -> Vec<Message> {
        rx.try_iter().collect()
    }

    #[test]
    fn initialize_then_discover_from_globs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/math.test.ts"), "").unwrap();
        fs::write(dir.path().join("src/math.ts"), "").unwrap();

        let (mut server, rx) = server();
        initialize(&mut server, dir.path());
        assert!(matches!(drain(&rx).first(), Some(Message::Response(r)) if r.error.is_none()));

        server.handle_message(notification("initialized", Value::Null)).unwrap();
        server.flush().unwrap();

        let file = dir.path().join("src/math.test.ts");
        assert_eq!(server.tree.get_file_test_items(&file).len(), 1);
        assert!(server.tree.is_watching(&normalize(dir.path()).to_string_lossy().to_string()));
        let tree_messages = drain(&rx)
            .into_iter()
            .filter(|m| matches!(m, Message::Notification(n) if n.method == TEST_TREE))
            .count();
        assert!(tree_messages >= 2);
    }

    #[test]
    fn run_request_becomes_runner_command() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, rx) = server();
        initialize(&mut server, dir.path());
        let folder = dir.path().to_string_lossy().to_string();
        server
            .handle_message(notification(
                "$/discoverFiles",
                json!({ "folder": folder, "files": [{ "file": "a.test.ts" }] }),
            ))
            .unwrap();
        drain(&rx);

        server
            .handle_message(notification("$/runTests", json!({ "id": "r1" })))
            .unwrap();
        server.flush().unwrap();

        let methods: Vec<String> = drain(&rx)
            .into_iter()
            .filter_map(|m| match m {
                Message::Notification(n) => Some(n.method),
                _ => None,
            })
            .collect();
        assert!(methods.contains(&"$/runner/runFiles".to_string()));
        assert!(methods.contains(&TEST_RUN.to_string()));
    }

    #[test]
    fn runner_events_are_routed_by_folder() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, _rx) = server();
        initialize(&mut server, dir.path());
        let filepath = dir.path().join("a.test.ts").to_string_lossy().to_string();

        server
            .handle_message(notification(
                "$/runner/event",
                json!({
                    "folder": dir.path(),
                    "event": "collected",
                    "files": [{
                        "id": "f1",
                        "name": "a.test.ts",
                        "filepath": filepath,
                        "tasks": [{ "id": "t1", "name": "adds", "type": "test" }],
                    }],
                }),
            ))
            .unwrap();
        assert!(server.tree.get_test_item_by_task_id("t1").is_some());
    }

    #[test]
    fn unknown_request_gets_method_not_found() {
        let (mut server, rx) = server();
        let request = Request::new(RequestId::from(9), "$/nope".to_string(), Value::Null);
        server.handle_message(Message::Request(request)).unwrap();
        let Some(Message::Response(response)) = drain(&rx).pop() else {
            panic!("expected a response");
        };
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn exit_stops_the_loop() {
        let (mut server, _rx) = server();
        assert_eq!(
            server.handle_message(notification("exit", Value::Null)).unwrap(),
            Flow::Exit
        );
    }
}
