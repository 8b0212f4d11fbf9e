//! Mapping of local paths in a payload onto the remote directory layout.
//!
//! ```text
//! <root>/src              runner sources
//! <root>/data/uploads     datasets
//! <root>/data/plugins     benchmark and training plugins
//! <root>/artifacts        run outputs, mirrors the local artifacts tree
//! ```

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

pub const SRC_DIR: &str = "src";
pub const UPLOADS_DIR: &str = "data/uploads";
pub const PLUGINS_DIR: &str = "data/plugins";
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Payload keys holding local paths, wherever they appear in the payload.
const PATH_KEYS: &[&str] = &[
    "output_dir",
    "checkpoint_path",
    "lightning_module_path",
    "dataloaders_path",
    "benchmark_plugin_path",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCategory {
    Artifacts,
    Plugins,
    Uploads,
}

impl PathCategory {
    fn remote_dir(self) -> &'static str {
        match self {
            Self::Artifacts => ARTIFACTS_DIR,
            Self::Plugins => PLUGINS_DIR,
            Self::Uploads => UPLOADS_DIR,
        }
    }
}

/// A local path reduced to its place in the remote layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPath {
    pub category: PathCategory,
    pub relative: PathBuf,
}

impl LogicalPath {
    /// Classify `local` by its components.
    ///
    /// The last component named `artifacts` keeps everything after it; a
    /// component named `plugins` keeps only the file name. Anything else is
    /// not mapped.
    pub fn classify(local: &Path) -> Option<Self> {
        let parts: Vec<&std::ffi::OsStr> = local
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();

        if let Some(pos) = parts.iter().rposition(|p| *p == ARTIFACTS_DIR) {
            let relative: PathBuf = parts[pos + 1..].iter().collect();
            return Some(Self {
                category: PathCategory::Artifacts,
                relative,
            });
        }
        if parts.iter().any(|p| *p == "plugins") {
            let name = local.file_name()?;
            return Some(Self {
                category: PathCategory::Plugins,
                relative: PathBuf::from(name),
            });
        }
        None
    }

    /// A dataset file, placed by name under the uploads directory.
    pub fn upload(local: &Path) -> Option<Self> {
        local.file_name().map(|name| Self {
            category: PathCategory::Uploads,
            relative: PathBuf::from(name),
        })
    }

    pub fn resolve(&self, root: &str) -> String {
        let base = format!("{}/{}", root.trim_end_matches('/'), self.category.remote_dir());
        if self.relative.as_os_str().is_empty() {
            base
        } else {
            format!("{}/{}", base, self.relative.to_string_lossy())
        }
    }
}

/// Remote location of a local path, or `None` when it has no counterpart.
pub fn remote_path_for(local: &str, root: &str) -> Option<String> {
    LogicalPath::classify(Path::new(local)).map(|logical| logical.resolve(root))
}

/// Rewrite the local paths of a payload so they point into `root`.
///
/// Known path keys are rewritten at any depth. `dataset.path` moves under
/// the uploads directory. `config.training.output_dir` is only rewritten
/// when it lies inside an artifacts tree. Unmapped values stay as they are.
pub fn adjust_payload_paths(payload: &Value, root: &str) -> Value {
    let mut adjusted = payload.clone();
    rewrite_keys(&mut adjusted, root);

    if let Some(path) = adjusted.pointer_mut("/dataset/path") {
        if let Some(remote) = path
            .as_str()
            .and_then(|p| LogicalPath::upload(Path::new(p)))
            .map(|logical| logical.resolve(root))
        {
            *path = Value::String(remote);
        }
    }
    adjusted
}

fn rewrite_keys(value: &mut Value, root: &str) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if PATH_KEYS.contains(&key.as_str()) {
                    if let Some(remote) = child.as_str().and_then(|p| remote_path_for(p, root)) {
                        *child = Value::String(remote);
                        continue;
                    }
                }
                rewrite_keys(child, root);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| rewrite_keys(item, root)),
        _ => {}
    }
}
