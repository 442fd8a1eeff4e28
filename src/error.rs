use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExplorerError {
    // Standard errors with From implementations
    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Glob error: {0}")]
    Glob(#[from] ignore::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // Collaborator errors
    #[error("Test process call `{command}` failed: {message}")]
    Api { command: String, message: String },

    #[error("Invalid task state: {0}")]
    InvalidTaskState(String),

    // Lookup errors
    #[error("Unknown workspace folder: {0}")]
    UnknownWorkspaceFolder(PathBuf),

    #[error("Unknown run request: {0}")]
    UnknownRequest(String),

    #[error("Unknown test node: {0}")]
    UnknownNode(String),

    // Configuration errors
    #[error("No workspace folders found")]
    NoWorkspaceFolders,
}

impl<T> From<crossbeam_channel::SendError<T>> for ExplorerError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        Self::ChannelClosed(err.to_string())
    }
}
