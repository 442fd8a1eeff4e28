//! Path normalization and workspace file discovery.

use std::path::{Component, Path, PathBuf};

use ignore::{WalkBuilder, overrides::OverrideBuilder};

use crate::error::ExplorerError;

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. The filesystem is not consulted.
pub fn normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                }
            }
            Component::CurDir => {}
            Component::Normal(_) | Component::RootDir | Component::Prefix(_) => {
                components.push(component);
            }
        }
    }

    PathBuf::from_iter(components)
}

/// Resolve a relative path against a base directory, handling ../ and ./
/// components.
pub fn resolve_path(base_dir: &Path, relative_path: &str) -> PathBuf {
    let path = Path::new(relative_path);
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base_dir.join(path))
    }
}

/// Walk `base_dir` and return the files matching `include` but not `exclude`.
///
/// `.gitignore` rules are honored. Results are normalized and sorted.
pub fn find_test_files(
    base_dir: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<PathBuf>, ExplorerError> {
    let mut overrides = OverrideBuilder::new(base_dir);
    for pattern in include {
        overrides.add(pattern)?;
    }
    for pattern in exclude {
        overrides.add(&format!("!{pattern}"))?;
    }
    let overrides = overrides.build()?;

    let mut result: Vec<PathBuf> = WalkBuilder::new(base_dir)
        .overrides(overrides)
        .follow_links(true)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(|entry| normalize(entry.path()))
        .collect();
    result.sort();
    Ok(result)
}
