//! The test tree: folders, files, suites and tests mirrored from the runner.
//!
//! Nodes live in one map keyed by [`NodeId`]; auxiliary indices resolve file
//! paths, task ids and folder paths to node ids. Every mutation visible to the
//! host is queued as a [`TreeChange`] and drained with [`TestTree::take_changes`].

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use crossbeam_channel::Sender;
use lsp_types::{Position, Range};
use serde::{Deserialize, Serialize};

use crate::{
    error::ExplorerError,
    message::format_errors,
    node::{ApiHandle, ApiId, Node, NodeData, NodeId, NodeView},
    task::{ReportedTask, Task, TaskId, TaskKind, TaskLocation, TestFile},
    watch::{FolderWatcher, FsEvent},
    workspace::normalize,
};

pub const NO_TESTS_FOUND: &str = "No tests found";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "node", rename_all = "camelCase")]
pub enum TreeChange {
    /// Every node was dropped.
    Reset,
    Upsert(NodeView),
    Removed(NodeId),
}

pub struct TestTree {
    nodes: HashMap<NodeId, Node>,
    /// Hidden root used with a single workspace folder.
    inline_root: Option<NodeId>,
    folder_items: HashMap<PathBuf, NodeId>,
    file_items_by_path: HashMap<PathBuf, Vec<NodeId>>,
    task_items: HashMap<TaskId, NodeId>,
    watchers: HashMap<ApiId, FolderWatcher>,
    fs_events: Sender<FsEvent>,
    changes: Vec<TreeChange>,
}

impl TestTree {
    /// `fs_events` receives deletions seen by the folder watchers; feed them
    /// back through [`TestTree::handle_fs_event`].
    #[must_use]
    pub fn new(fs_events: Sender<FsEvent>) -> Self {
        Self {
            nodes: HashMap::new(),
            inline_root: None,
            folder_items: HashMap::new(),
            file_items_by_path: HashMap::new(),
            task_items: HashMap::new(),
            watchers: HashMap::new(),
            fs_events,
            changes: Vec::new(),
        }
    }

    /// Drop every node and index and lay out the workspace roots again.
    pub fn reset(&mut self, workspace_roots: &[PathBuf]) {
        self.nodes.clear();
        self.folder_items.clear();
        self.file_items_by_path.clear();
        self.task_items.clear();
        self.watchers.clear();
        self.inline_root = None;
        self.changes.push(TreeChange::Reset);

        if let [root] = workspace_roots {
            let path = normalize(root);
            let id = NodeId::inline_root();
            let label = label_for_path(&path);
            self.nodes
                .insert(id.clone(), Node::new(id.clone(), label, None, path.clone(), NodeData::Folder));
            self.folder_items.insert(path, id.clone());
            self.inline_root = Some(id);
            return;
        }

        for root in workspace_roots {
            let path = normalize(root);
            let id = NodeId::folder(&path);
            let mut node = Node::new(id.clone(), label_for_path(&path), None, path.clone(), NodeData::Folder);
            node.busy = true;
            self.nodes.insert(id.clone(), node);
            self.folder_items.insert(path, id.clone());
            self.emit(&id);
        }
    }

    /// Register the files a collaborator globbed, creating their folders.
    pub fn discover_all_test_files(&mut self, api: &ApiHandle, files: &[(String, PathBuf)]) {
        let folder = normalize(&api.workspace_folder);
        if let Some(id) = self.folder_items.get(&folder).cloned() {
            if Some(&id) != self.inline_root.as_ref() {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.busy = false;
                }
                self.emit(&id);
            }
        }

        for (project, file) in files {
            self.get_or_create_file_test_item(api, project, file);
        }
    }

    /// Discover `files` and, once per workspace folder, watch the folder for
    /// deleted files.
    pub fn watch_test_files_in_workspace(
        &mut self,
        api: &ApiHandle,
        files: &[(String, PathBuf)],
    ) -> Result<(), ExplorerError> {
        self.discover_all_test_files(api, files);

        if self.watchers.contains_key(&api.id) {
            return Ok(());
        }
        let watcher = FolderWatcher::start(&api.workspace_folder, self.fs_events.clone())?;
        self.watchers.insert(api.id.clone(), watcher);
        Ok(())
    }

    pub fn handle_fs_event(&mut self, event: &FsEvent) {
        match event {
            FsEvent::Deleted(path) => self.remove_file(path),
        }
    }

    /// Prune every file node for `path`, and any folders left empty.
    pub fn remove_file(&mut self, path: &Path) {
        let Some(ids) = self.file_items_by_path.get(&normalize(path)).cloned() else {
            return;
        };
        log::debug!("removing {} file node(s) for {}", ids.len(), path.display());
        for id in ids {
            self.remove_node_recursively(&id);
        }
    }

    pub fn get_or_create_file_test_item(
        &mut self,
        api: &ApiHandle,
        project: &str,
        file: &Path,
    ) -> NodeId {
        let path = normalize(file);
        let id = NodeId::file(&path, project);
        if self.nodes.contains_key(&id) {
            return id;
        }

        let parent = self.get_or_create_folder_test_item(api, path.parent().unwrap_or(&path));
        let basename = label_for_path(&path);
        let label = if project.is_empty() {
            basename
        } else {
            format!("[{project}] {basename}")
        };
        let mut node = Node::new(
            id.clone(),
            label,
            Some(parent.clone()),
            path.clone(),
            NodeData::File {
                project: project.to_string(),
                api: api.id.clone(),
                resolvable: true,
            },
        );
        node.add_tag(&api.tag);
        self.nodes.insert(id.clone(), node);
        self.attach_child(&parent, &id);
        self.file_items_by_path.entry(path).or_default().push(id.clone());
        self.emit(&id);
        id
    }

    /// Return the folder node for `path`, creating it and its missing
    /// ancestors up to the collaborator's workspace folder.
    pub fn get_or_create_folder_test_item(&mut self, api: &ApiHandle, path: &Path) -> NodeId {
        let id = self.folder_chain(api, &normalize(path));
        self.tag_folder_chain(&id, &api.tag);
        id
    }

    fn folder_chain(&mut self, api: &ApiHandle, path: &Path) -> NodeId {
        if let Some(id) = self.folder_items.get(path) {
            return id.clone();
        }

        let workspace_folder = normalize(&api.workspace_folder);
        let parent = match path.parent() {
            Some(parent) if path != workspace_folder && path.starts_with(&workspace_folder) => {
                Some(self.folder_chain(api, parent))
            }
            _ => self.inline_root.clone(),
        };

        let id = NodeId::folder(path);
        self.nodes.insert(
            id.clone(),
            Node::new(
                id.clone(),
                label_for_path(path),
                parent.clone(),
                path.to_path_buf(),
                NodeData::Folder,
            ),
        );
        if let Some(parent) = &parent {
            self.attach_child(parent, &id);
        }
        self.folder_items.insert(path.to_path_buf(), id.clone());
        id
    }

    fn tag_folder_chain(&mut self, id: &NodeId, tag: &str) {
        let mut current = Some(id.clone());
        while let Some(id) = current {
            if Some(&id) == self.inline_root.as_ref() {
                break;
            }
            let Some(node) = self.nodes.get_mut(&id) else {
                break;
            };
            node.add_tag(tag);
            current = node.parent.clone();
            self.emit(&id);
        }
    }

    /// Re-synchronize a file node from a fresh collection report.
    pub fn collect_file(&mut self, api: &ApiHandle, file: &TestFile) -> NodeId {
        let id = self.get_or_create_file_test_item(api, &file.project_name, Path::new(&file.filepath));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.error = None;
        }

        self.collect_tasks(&api.tag, &id, &file.tasks, &id);

        let errors = file.result.as_ref().map(|r| r.errors.as_slice()).unwrap_or_default();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.error = if !errors.is_empty() {
                Some(format_errors(errors))
            } else if file.tasks.is_empty() {
                Some(NO_TESTS_FOUND.to_string())
            } else {
                None
            };
            if let NodeData::File { resolvable, .. } = &mut node.data {
                *resolvable = false;
            }
        }
        self.emit(&id);
        id
    }

    /// Mirror `tasks` as the children of `parent`, recursively. Children of
    /// `parent` that are not reported any more are deleted.
    pub fn collect_tasks(&mut self, tag: &str, file: &NodeId, tasks: &[Task], parent: &NodeId) {
        let Some(parent_node) = self.nodes.get(parent) else {
            log::error!("collecting tasks under unknown node {parent}");
            return;
        };
        let parent_tags = parent_node.tags.clone();
        let file_path = self
            .nodes
            .get(file)
            .map(|n| n.path.clone())
            .unwrap_or_default();

        let mut reported = HashSet::new();
        for task in tasks {
            let id = NodeId::task(&task.id);
            reported.insert(id.clone());

            let data = match task.kind {
                TaskKind::Suite => NodeData::Suite {
                    task: task.id.clone(),
                    file: file.clone(),
                },
                TaskKind::Test | TaskKind::Custom => NodeData::Test {
                    task: task.id.clone(),
                    file: file.clone(),
                },
            };

            match self.nodes.get(&id).map(|n| n.parent.clone()) {
                Some(previous_parent) => {
                    if previous_parent.as_ref() != Some(parent) {
                        if let Some(previous) = previous_parent {
                            self.detach_child(&previous, &id);
                        }
                        self.attach_child(parent, &id);
                    }
                }
                None => {
                    self.nodes.insert(
                        id.clone(),
                        Node::new(id.clone(), task.name.clone(), Some(parent.clone()), file_path.clone(), data.clone()),
                    );
                    self.attach_child(parent, &id);
                    self.task_items.insert(task.id.clone(), id.clone());
                }
            }

            if let Some(node) = self.nodes.get_mut(&id) {
                node.parent = Some(parent.clone());
                node.data = data;
                node.label.clone_from(&task.name);
                node.path.clone_from(&file_path);
                node.tags.clone_from(&parent_tags);
                node.add_tag(tag);
                node.error = task
                    .result
                    .as_ref()
                    .filter(|r| !r.errors.is_empty())
                    .map(|r| format_errors(&r.errors));
                match task.location {
                    Some(location) => {
                        node.range = Some(point_range(location));
                        node.sort_text = None;
                    }
                    None => {
                        node.range = None;
                        node.sort_text = Some(task.id.clone());
                    }
                }
            }
            self.emit(&id);

            if task.kind == TaskKind::Suite {
                self.collect_tasks(tag, file, &task.tasks, &id);
            }
        }

        let stale: Vec<NodeId> = self
            .nodes
            .get(parent)
            .map(|n| n.children.iter().filter(|c| !reported.contains(*c)).cloned().collect())
            .unwrap_or_default();
        for id in stale {
            self.detach_child(parent, &id);
            self.delete_subtree(&id);
        }
    }

    /// Owning collaborator of any node.
    #[must_use]
    pub fn get_api_from_test_item(&self, id: &NodeId) -> Option<&ApiId> {
        match &self.nodes.get(id)?.data {
            NodeData::File { api, .. } => Some(api),
            NodeData::Suite { file, .. } | NodeData::Test { file, .. } => {
                self.get_api_from_test_item(file)
            }
            NodeData::Folder => self.get_api_from_folder(id),
        }
    }

    /// Folders have no collaborator of their own: the first file found
    /// depth-first decides.
    #[must_use]
    pub fn get_api_from_folder(&self, id: &NodeId) -> Option<&ApiId> {
        let node = self.nodes.get(id)?;
        node.children.iter().find_map(|child| match &self.nodes.get(child)?.data {
            NodeData::File { api, .. } => Some(api),
            NodeData::Folder => self.get_api_from_folder(child),
            _ => None,
        })
    }

    #[must_use]
    pub fn get_file_test_items(&self, path: &Path) -> &[NodeId] {
        self.file_items_by_path
            .get(&normalize(path))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_all_file_items(&self) -> Vec<&NodeId> {
        self.file_items_by_path.values().flatten().collect()
    }

    #[must_use]
    pub fn get_test_item_by_task_id(&self, id: &str) -> Option<&NodeId> {
        self.task_items.get(id)
    }

    /// Look a task up by id; a whole-file task falls back to its
    /// `(filepath, project)` key.
    #[must_use]
    pub fn get_test_item_by_task<T: ReportedTask>(&self, task: &T) -> Option<NodeId> {
        if let Some(id) = self.task_items.get(task.id()) {
            return Some(id.clone());
        }
        let (filepath, project) = task.file_key()?;
        let id = NodeId::file(Path::new(filepath), project);
        self.nodes.contains_key(&id).then_some(id)
    }

    /// Every file node below `folder`.
    #[must_use]
    pub fn get_folder_files(&self, folder: &NodeId) -> Vec<NodeId> {
        let mut files = Vec::new();
        let mut stack = vec![folder.clone()];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for child in node.children.iter().rev() {
                match self.nodes.get(child).map(|n| &n.data) {
                    Some(NodeData::File { .. }) => files.push(child.clone()),
                    Some(NodeData::Folder) => stack.push(child.clone()),
                    _ => {}
                }
            }
        }
        files
    }

    #[must_use]
    pub fn get_folder_by_path(&self, path: &Path) -> Option<&NodeId> {
        self.folder_items.get(&normalize(path))
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes, the hidden root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn set_error(&mut self, id: &NodeId, error: Option<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.error = error;
            self.emit(id);
        }
    }

    /// Test name pattern selecting this task node: the labels from the
    /// outermost suite down to the node, joined with spaces. Tests match the
    /// full name exactly, suites match it as a prefix.
    #[must_use]
    pub fn test_name_pattern(&self, id: &NodeId) -> Option<String> {
        let node = self.nodes.get(id)?;
        let exact = match node.data {
            NodeData::Test { .. } => true,
            NodeData::Suite { .. } => false,
            _ => return None,
        };

        let mut names = vec![node.label.as_str()];
        let mut current = node.parent.as_ref();
        while let Some(parent) = current.and_then(|p| self.nodes.get(p)) {
            if !matches!(parent.data, NodeData::Suite { .. }) {
                break;
            }
            names.push(parent.label.as_str());
            current = parent.parent.as_ref();
        }
        names.reverse();

        let escaped = regex::escape(&names.join(" "));
        Some(if exact {
            format!(r"^\s?{escaped}$")
        } else {
            format!(r"^\s?{escaped}")
        })
    }

    pub fn take_changes(&mut self) -> Vec<TreeChange> {
        std::mem::take(&mut self.changes)
    }

    /// Release every node, index and watcher.
    pub fn dispose(&mut self) {
        self.watchers.clear();
        self.nodes.clear();
        self.folder_items.clear();
        self.file_items_by_path.clear();
        self.task_items.clear();
        self.inline_root = None;
        self.changes.clear();
    }

    #[must_use]
    pub fn is_watching(&self, api: &ApiId) -> bool {
        self.watchers.contains_key(api)
    }

    fn remove_node_recursively(&mut self, id: &NodeId) {
        let Some(parent) = self.nodes.get(id).and_then(|n| n.parent.clone()) else {
            return;
        };
        self.detach_child(&parent, id);
        self.delete_subtree(id);

        let prune_parent = self.nodes.get(&parent).is_some_and(|p| {
            p.children.is_empty() && p.parent.is_some() && matches!(p.data, NodeData::Folder)
        });
        if prune_parent {
            self.remove_node_recursively(&parent);
        }
    }

    /// Remove `id` and its descendants from the node map and every index.
    fn delete_subtree(&mut self, id: &NodeId) {
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            stack.extend(node.children);
            match node.data {
                NodeData::Folder => {
                    self.folder_items.remove(&node.path);
                }
                NodeData::File { .. } => {
                    if let Some(ids) = self.file_items_by_path.get_mut(&node.path) {
                        ids.retain(|i| *i != current);
                        if ids.is_empty() {
                            self.file_items_by_path.remove(&node.path);
                        }
                    }
                }
                NodeData::Suite { task, .. } | NodeData::Test { task, .. } => {
                    self.task_items.remove(&task);
                }
            }
        }
        self.changes.push(TreeChange::Removed(id.clone()));
    }

    fn attach_child(&mut self, parent: &NodeId, child: &NodeId) {
        if let Some(node) = self.nodes.get_mut(parent) {
            if !node.children.contains(child) {
                node.children.push(child.clone());
            }
        }
    }

    fn detach_child(&mut self, parent: &NodeId, child: &NodeId) {
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.retain(|c| c != child);
        }
    }

    fn emit(&mut self, id: &NodeId) {
        if Some(id) == self.inline_root.as_ref() {
            return;
        }
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let mut view = node.view();
        if view.parent.is_some() && view.parent == self.inline_root {
            view.parent = None;
        }
        self.changes.push(TreeChange::Upsert(view));
    }
}

/// 1-based task location to a 0-based point. Only the line is shifted.
fn point_range(location: TaskLocation) -> Range {
    let position = Position {
        line: location.line.saturating_sub(1),
        character: location.column,
    };
    Range {
        start: position,
        end: position,
    }
}

fn label_for_path(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().to_string())
}
