//! Markdown export of a filtered selection of repository files

use crate::explorer::{self, relative_path, TreeNode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const PREAMBLE: &str = "Analyze the project tree and code below and keep them in mind for the rest of this session.\n\
Every later answer must build on this analysis.";

const UNREADABLE: &str = "<binary or unreadable file>";

/// Which files of a checkout to export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSelection {
    /// Extensions with their leading dot; empty selects every file
    #[serde(default, rename = "exts")]
    pub extensions: Vec<String>,
    /// Relative directories; empty, `""` or `/` selects the whole tree
    #[serde(default)]
    pub dirs: Vec<String>,
}

impl ExportSelection {
    pub fn new(extensions: Vec<String>, dirs: Vec<String>) -> Self {
        Self { extensions, dirs }
    }

    fn normalized_dirs(&self) -> Option<Vec<String>> {
        let dirs: Vec<String> = self
            .dirs
            .iter()
            .map(|dir| dir.trim().trim_matches('/').to_string())
            .collect();
        if dirs.is_empty() || dirs.iter().any(String::is_empty) {
            None
        } else {
            Some(dirs)
        }
    }

    fn normalized_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|ext| ext.trim())
            .filter(|ext| !ext.is_empty())
            .map(|ext| {
                if ext.starts_with('.') {
                    ext.to_string()
                } else {
                    format!(".{ext}")
                }
            })
            .collect()
    }

    /// Whether a `/`-separated relative file path is selected
    pub fn matches(&self, relative: &str) -> bool {
        self.matches_with(
            relative,
            self.normalized_dirs().as_deref(),
            &self.normalized_extensions(),
        )
    }

    fn matches_with(&self, relative: &str, dirs: Option<&[String]>, extensions: &[String]) -> bool {
        let in_dir = dirs.map_or(true, |dirs| {
            dirs.iter().any(|dir| {
                relative == dir
                    || relative
                        .strip_prefix(dir.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        });
        if !in_dir {
            return false;
        }
        if extensions.is_empty() {
            return true;
        }
        let name = relative.rsplit('/').next().unwrap_or(relative);
        explorer::extension_of(name).is_some_and(|ext| extensions.contains(&ext))
    }
}

/// Files under `root` matching `selection`, sorted by lowercase relative path.
///
/// Hidden entries and symbolic links are never exported.
pub fn collect_files(root: &Path, selection: &ExportSelection) -> io::Result<Vec<PathBuf>> {
    let dirs = selection.normalized_dirs();
    let extensions = selection.normalized_extensions();

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop while collecting files"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relative_path(root, entry.path());
        if selection.matches_with(&relative, dirs.as_deref(), &extensions) {
            files.push((relative.to_lowercase(), entry.into_path()));
        }
    }

    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Render the selected files of `root` as one Markdown document
pub fn render_markdown(repo_name: &str, root: &Path, files: &[PathBuf]) -> io::Result<String> {
    let inventory = explorer::explore(root, repo_name)?;

    let mut lines: Vec<String> = vec![
        format!("# {repo_name}"),
        String::new(),
        PREAMBLE.to_string(),
        String::new(),
        "## Project Tree".to_string(),
        "```".to_string(),
        format!("{repo_name}/"),
    ];
    tree_lines(inventory.tree.children(), "    ", &mut lines);
    lines.push("```".to_string());
    lines.push(String::new());

    lines.push("## Files".to_string());
    for file in files {
        let relative = relative_path(root, file);
        let language = file
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();

        lines.push(format!("### `{relative}`"));
        lines.push(format!("```{language}"));
        lines.push(file_contents(file));
        lines.push("```".to_string());
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn tree_lines(nodes: &[TreeNode], prefix: &str, lines: &mut Vec<String>) {
    for (index, node) in nodes.iter().enumerate() {
        let last = index + 1 == nodes.len();
        let connector = if last { "└── " } else { "├── " };
        lines.push(format!("{prefix}{connector}{}", node.name()));
        if node.is_dir() {
            let extension = if last { "    " } else { "│   " };
            tree_lines(node.children(), &format!("{prefix}{extension}"), lines);
        }
    }
}

fn file_contents(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) if !bytes.contains(&0) => {
            let text = String::from_utf8_lossy(&bytes);
            text.strip_suffix('\n').unwrap_or(&text).to_string()
        }
        _ => UNREADABLE.to_string(),
    }
}

/// Reduce a name to characters safe for a download file name
pub fn safe_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut replaced = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() || matches!(c, '_' | '.' | '-') {
            out.push(c);
            replaced = false;
        } else if !replaced {
            out.push('_');
            replaced = true;
        }
    }
    if out.is_empty() {
        "export".to_string()
    } else {
        out
    }
}

/// File name offered for a downloaded export
pub fn export_file_name(repo_name: &str) -> String {
    format!("{}_export.md", safe_filename(repo_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo() -> TempDir {
        let root = TempDir::new().unwrap();
        for (path, contents) in [
            ("src/main.rs", "fn main() {}\n"),
            ("src/util/mod.rs", "pub mod x;"),
            ("srcx/other.rs", "//"),
            ("README.md", "# Demo\n"),
            ("Cargo.toml", "[package]"),
            (".git/HEAD", "ref"),
        ] {
            let path = root.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        root
    }

    fn relatives(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files.iter().map(|f| relative_path(root, f)).collect()
    }

    #[test]
    fn test_empty_selection_exports_everything_visible() {
        let root = repo();
        let files = collect_files(root.path(), &ExportSelection::default()).unwrap();
        assert_eq!(
            relatives(root.path(), &files),
            vec![
                "Cargo.toml",
                "README.md",
                "src/main.rs",
                "src/util/mod.rs",
                "srcx/other.rs"
            ]
        );
    }

    #[test]
    fn test_dir_filter_matches_whole_segments() {
        let root = repo();
        let selection = ExportSelection::new(vec![], vec!["/src/".to_string()]);
        let files = collect_files(root.path(), &selection).unwrap();
        assert_eq!(
            relatives(root.path(), &files),
            vec!["src/main.rs", "src/util/mod.rs"]
        );

        let everything = ExportSelection::new(vec![], vec!["src".into(), "/".into()]);
        assert_eq!(collect_files(root.path(), &everything).unwrap().len(), 5);
    }

    #[test]
    fn test_extension_filter() {
        let root = repo();
        let selection = ExportSelection::new(vec![".md".into(), "toml".into()], vec![]);
        let files = collect_files(root.path(), &selection).unwrap();
        assert_eq!(relatives(root.path(), &files), vec!["Cargo.toml", "README.md"]);

        let none = ExportSelection::new(vec![".go".into()], vec![]);
        assert!(collect_files(root.path(), &none).unwrap().is_empty());
    }

    #[test]
    fn test_selection_matches() {
        let selection = ExportSelection::new(vec![".rs".into()], vec!["src".into()]);
        assert!(selection.matches("src/lib.rs"));
        // The directory itself has no `.rs` suffix
        assert!(!selection.matches("src"));
        assert!(ExportSelection::new(vec![], vec!["src".into()]).matches("src"));
        assert!(!selection.matches("srcx/lib.rs"));
        assert!(!selection.matches("src/lib.py"));
    }

    #[test]
    fn test_render_markdown_layout() {
        let root = repo();
        let selection = ExportSelection::new(vec![".rs".into()], vec!["src".into()]);
        let files = collect_files(root.path(), &selection).unwrap();
        let markdown = render_markdown("demo", root.path(), &files).unwrap();

        let expected_tree = [
            "## Project Tree",
            "```",
            "demo/",
            "    ├── src",
            "    │   ├── util",
            "    │   │   └── mod.rs",
            "    │   └── main.rs",
            "    ├── srcx",
            "    │   └── other.rs",
            "    ├── Cargo.toml",
            "    └── README.md",
            "```",
        ]
        .join("\n");

        assert!(markdown.starts_with("# demo\n\n"));
        assert!(markdown.contains(&expected_tree), "{markdown}");
        assert!(markdown.contains("## Files\n### `src/main.rs`\n```rs\nfn main() {}\n```\n"));
        assert!(markdown.contains("### `src/util/mod.rs`"));
        assert!(!markdown.contains("### `README.md`"));
        assert!(!markdown.contains(".git"));
    }

    #[test]
    fn test_binary_files_render_placeholder() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("logo.png");
        fs::write(&path, [0x89, b'P', b'N', b'G', 0, 0, 1]).unwrap();

        let markdown = render_markdown("img", root.path(), &[path]).unwrap();
        assert!(markdown.contains("```png\n<binary or unreadable file>\n```"));
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("my repo!!"), "my_repo_");
        assert_eq!(safe_filename("  tool-v1.2 "), "tool-v1.2");
        assert_eq!(safe_filename("   "), "export");
        assert_eq!(export_file_name("a/b"), "a_b_export.md");
    }
}
