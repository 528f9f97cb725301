//! Inventory of a checked-out repository: directory tree, file extensions
//! and directory list used by clients to build an export selection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// A node of the repository tree as sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    Directory {
        name: String,
        path: String,
        children: Vec<TreeNode>,
    },
    File {
        name: String,
        path: String,
    },
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::Directory { name, .. } | TreeNode::File { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            TreeNode::Directory { path, .. } | TreeNode::File { path, .. } => path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TreeNode::Directory { .. })
    }

    pub fn children(&self) -> &[TreeNode] {
        match self {
            TreeNode::Directory { children, .. } => children,
            TreeNode::File { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInventory {
    #[serde(rename = "dirs_tree")]
    pub tree: TreeNode,
    /// Sorted file suffixes including the dot, e.g. `.rs`
    pub extensions: Vec<String>,
    /// Sorted relative directory paths, `/` separated
    pub dirs: Vec<String>,
    /// Relative paths that could not be read
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

/// Walk `root` and build its inventory; the root node is labelled `name`.
///
/// Hidden entries and symbolic links are left out. Unreadable subdirectories
/// are recorded in `skipped` rather than failing the walk; only an
/// unreadable root is an error.
pub fn explore(root: &Path, name: &str) -> io::Result<RepoInventory> {
    let mut walk = Walk::default();
    let children = walk.children(root, root)?;
    let inventory = RepoInventory {
        tree: TreeNode::Directory {
            name: name.to_string(),
            path: String::new(),
            children,
        },
        extensions: walk.extensions.into_iter().collect(),
        dirs: walk.dirs.into_iter().collect(),
        skipped: walk.skipped,
    };
    debug!(
        "Explored {}: {} directories, {} extensions, {} skipped",
        root.display(),
        inventory.dirs.len(),
        inventory.extensions.len(),
        inventory.skipped.len()
    );
    Ok(inventory)
}

#[derive(Default)]
struct Walk {
    extensions: BTreeSet<String>,
    dirs: BTreeSet<String>,
    skipped: Vec<String>,
}

impl Walk {
    fn children(&mut self, base: &Path, dir: &Path) -> io::Result<Vec<TreeNode>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => {
                    self.skipped.push(relative_path(base, dir));
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => entries.push((false, name, entry.path())),
                Ok(file_type) if file_type.is_file() => entries.push((true, name, entry.path())),
                Ok(_) => {}
                Err(_) => self.skipped.push(relative_path(base, &entry.path())),
            }
        }
        entries.sort_by_cached_key(|(is_file, name, _)| {
            (*is_file, name.to_lowercase(), name.clone())
        });

        let mut nodes = Vec::with_capacity(entries.len());
        for (is_file, name, path) in entries {
            let relative = relative_path(base, &path);
            if is_file {
                if let Some(extension) = extension_of(&name) {
                    self.extensions.insert(extension);
                }
                nodes.push(TreeNode::File {
                    name,
                    path: relative,
                });
                continue;
            }

            match self.children(base, &path) {
                Ok(children) => {
                    self.dirs.insert(relative.clone());
                    nodes.push(TreeNode::Directory {
                        name,
                        path: relative,
                        children,
                    });
                }
                Err(e) => {
                    debug!("Skipping unreadable directory {}: {}", path.display(), e);
                    self.skipped.push(relative);
                }
            }
        }
        Ok(nodes)
    }
}

/// `/`-separated path of `path` relative to `base`
pub fn relative_path(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Suffix of a file name including the dot; dotfiles and names ending in a dot have none
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{ext}"))
}
