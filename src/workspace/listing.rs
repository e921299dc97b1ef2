//! File listing of a workspace for judge context.

use std::path::Path;

use walkdir::WalkDir;

/// Relative file paths under a workspace, `.git` excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListing {
    pub files: Vec<String>,
    pub total: usize,
}

impl FileListing {
    /// Walks `root`, keeping at most `max_files` sorted entries.
    pub fn collect(root: &Path, max_files: usize) -> Self {
        let mut files: Vec<String> = WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();

        let total = files.len();
        files.truncate(max_files);
        Self { files, total }
    }

    pub fn render(&self) -> String {
        let mut out = self.files.join("\n");
        let hidden = self.total.saturating_sub(self.files.len());
        if hidden > 0 {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("... {hidden} more files"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_excludes_git_dir_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();

        let listing = FileListing::collect(dir.path(), 100);
        assert_eq!(listing.files, vec!["Cargo.toml", "src/main.rs"]);
        assert_eq!(listing.render(), "Cargo.toml\nsrc/main.rs");
    }

    #[test]
    fn test_caps_entries() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "").unwrap();
        }
        let listing = FileListing::collect(dir.path(), 2);
        assert_eq!(listing.total, 5);
        assert_eq!(listing.files.len(), 2);
        assert!(listing.render().ends_with("... 3 more files"));
    }
}
