//! Identity of tree nodes.
//!
//! Every node is addressed by an opaque [`NodeId`]. What the node *is* lives in
//! a side table ([`NodeData`]) keyed by that id, so the host only ever sees ids
//! and snapshots.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use lsp_types::Range;
use serde::{Deserialize, Serialize};

use crate::{task::TaskId, workspace::normalize};

/// Identity of the collaborator (test process handle) bound to one workspace
/// folder. Folders are unique per collaborator, so the normalized folder path
/// is the id.
pub type ApiId = String;

/// What the tree needs to know about a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiHandle {
    pub id: ApiId,
    pub workspace_folder: PathBuf,
    /// Tag merged into every node that receives tests from this collaborator.
    pub tag: String,
}

impl ApiHandle {
    #[must_use]
    pub fn new(workspace_folder: &Path, tag: impl Into<String>) -> Self {
        let folder = normalize(workspace_folder);
        Self {
            id: folder.to_string_lossy().to_string(),
            workspace_folder: folder,
            tag: tag.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// The hidden root used when there is a single workspace folder.
    #[must_use]
    pub fn inline_root() -> Self {
        Self("root:".to_string())
    }

    #[must_use]
    pub fn folder(path: &Path) -> Self {
        Self(format!("folder:{}", normalize(path).display()))
    }

    /// One file node exists per (path, project) pair.
    #[must_use]
    pub fn file(path: &Path, project: &str) -> Self {
        Self(format!("file:{}{}", normalize(path).display(), project))
    }

    #[must_use]
    pub fn task(id: &str) -> Self {
        Self(format!("task:{id}"))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind-specific data of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Folder,
    File {
        project: String,
        api: ApiId,
        /// Children can still be produced by collecting the file.
        resolvable: bool,
    },
    Suite {
        task: TaskId,
        file: NodeId,
    },
    Test {
        task: TaskId,
        file: NodeId,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    File,
    Suite,
    Test,
}

impl NodeData {
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeData::Folder => NodeKind::Folder,
            NodeData::File { .. } => NodeKind::File,
            NodeData::Suite { .. } => NodeKind::Suite,
            NodeData::Test { .. } => NodeKind::Test,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub parent: Option<NodeId>,
    /// Children in insertion order.
    pub children: Vec<NodeId>,
    /// Filesystem path of the folder or file the node belongs to.
    pub path: PathBuf,
    pub tags: Vec<String>,
    pub error: Option<String>,
    pub busy: bool,
    /// 0-based point range of the declaration, if known.
    pub range: Option<Range>,
    pub sort_text: Option<String>,
    pub data: NodeData,
}

impl Node {
    #[must_use]
    pub fn new(id: NodeId, label: String, parent: Option<NodeId>, path: PathBuf, data: NodeData) -> Self {
        Self {
            id,
            label,
            parent,
            children: Vec::new(),
            path,
            tags: Vec::new(),
            error: None,
            busy: false,
            range: None,
            sort_text: None,
            data,
        }
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    /// Merge `tag` into the tag set, keeping the first occurrence.
    pub fn add_tag(&mut self, tag: &str) {
        if !tag.is_empty() && !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    #[must_use]
    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id.clone(),
            parent: self.parent.clone(),
            kind: self.kind(),
            label: self.label.clone(),
            path: self.path.clone(),
            range: self.range,
            sort_text: self.sort_text.clone(),
            tags: self.tags.clone(),
            error: self.error.clone(),
            busy: self.busy,
            can_resolve_children: matches!(self.data, NodeData::File { resolvable: true, .. }),
        }
    }
}

/// Host-facing snapshot of a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub label: String,
    pub path: PathBuf,
    pub range: Option<Range>,
    pub sort_text: Option<String>,
    pub tags: Vec<String>,
    pub error: Option<String>,
    pub busy: bool,
    pub can_resolve_children: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids_differ_per_project() {
        let path = Path::new("/a/b.test.js");
        assert_ne!(NodeId::file(path, "web"), NodeId::file(path, "api"));
        assert_eq!(NodeId::file(path, "web"), NodeId::file(Path::new("/a/./b.test.js"), "web"));
    }

    #[test]
    fn tags_are_merged_not_replaced() {
        let mut node = Node::new(
            NodeId::folder(Path::new("/a")),
            "a".into(),
            None,
            PathBuf::from("/a"),
            NodeData::Folder,
        );
        node.add_tag("web");
        node.add_tag("api");
        node.add_tag("web");
        assert_eq!(node.tags, ["web", "api"]);
    }
}
