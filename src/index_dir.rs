use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const INDEX_DIR_ENV_VAR: &str = "OPENQA_INDEX_DIR";

/// On-disk location of a persisted index.
#[derive(Debug, Clone)]
pub struct IndexDir {
    root: PathBuf,
}

impl IndexDir {
    /// Resolve the index directory from, in order of priority:
    /// 1. An explicit path
    /// 2. The OPENQA_INDEX_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/openqa-index/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(INDEX_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("openqa-index")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Configuration(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The columnar vector table (also holds the token map).
    pub fn vectors_db(&self) -> PathBuf {
        self.root.join("vectors.redb")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Whether an index has been persisted here.
    pub fn is_populated(&self) -> bool {
        self.vectors_db().exists() && self.config_file().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.vectors_db(), tmp.path().join("vectors.redb"));
        assert_eq!(dir.config_file(), tmp.path().join("index.json"));
        assert!(!dir.is_populated());
    }

    #[test]
    fn nested_directory_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = IndexDir::resolve(Some(&nested)).unwrap();

        assert!(nested.is_dir());
        assert_eq!(dir.root(), nested);
    }
}
