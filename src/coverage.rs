//! Coverage reports left behind by a run.
//!
//! The report directory holds an istanbul `coverage-final.json` keyed by
//! absolute file path. Entries are passed through to the host untouched.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::{error::ExplorerError, workspace::normalize};

pub const REPORT_FILE_NAME: &str = "coverage-final.json";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CoverageReport {
    files: HashMap<PathBuf, Value>,
}

impl CoverageReport {
    pub fn read(dir: &Path) -> Result<Self, ExplorerError> {
        let content = fs::read_to_string(dir.join(REPORT_FILE_NAME))?;
        let raw: HashMap<String, Value> = serde_json::from_str(&content)?;
        Ok(Self {
            files: raw
                .into_iter()
                .map(|(path, data)| (normalize(Path::new(&path)), data))
                .collect(),
        })
    }

    #[must_use]
    pub fn for_file(&self, path: &Path) -> Option<&Value> {
        self.files.get(&normalize(path))
    }

    /// Entries sorted by path.
    #[must_use]
    pub fn entries(&self) -> Vec<(&PathBuf, &Value)> {
        let mut entries: Vec<_> = self.files.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Delete the report directory once it has been read.
pub fn remove_report(dir: &Path) -> Result<(), ExplorerError> {
    fs::remove_dir_all(dir)?;
    Ok(())
}
