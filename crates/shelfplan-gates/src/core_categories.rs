//! # Core Subcategory Set
//!
//! Subcategories whose reductions are held to the tighter core cap.
//!
//! ## Matching
//! Names and aliases are normalized once at load time (lowercase, whitespace
//! and punctuation stripped). A subcategory is core iff its normalized form
//! is an exact member of the set.
//!
//! ## Loading
//! A missing or malformed file never aborts a run: the built-in list is used
//! and the `ConfigLoadError` is reported as a run-summary warning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Built-in core subcategories: (name, aliases).
const BUILTIN_CORE_CATEGORIES: &[(&str, &[&str])] = &[
    ("t-shirt", &["T恤", "tee", "tshirt"]),
    ("casual pants", &["休闲裤"]),
    ("jeans", &["牛仔裤", "denim"]),
    ("polo", &["POLO衫"]),
    ("shirt", &["衬衫"]),
    ("hoodie", &["卫衣", "sweatshirt"]),
];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Core category file not readable: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Core category file malformed: {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Core category file lists no categories: {path}")]
    Empty { path: PathBuf },
}

/// On-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreCategoryFile {
    pub categories: Vec<CoreCategoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreCategoryEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Normalize a subcategory name for lookup.
pub fn normalize_category(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Where the active set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreCategorySource {
    File,
    Builtin,
}

impl CoreCategorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            CoreCategorySource::File => "file",
            CoreCategorySource::Builtin => "builtin",
        }
    }
}

/// Immutable normalized lookup set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreCategorySet {
    normalized: BTreeSet<String>,
    source: CoreCategorySource,
}

impl CoreCategorySet {
    pub fn builtin() -> Self {
        let entries = BUILTIN_CORE_CATEGORIES.iter().map(|(name, aliases)| CoreCategoryEntry {
            name: (*name).to_string(),
            aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
        });
        Self::from_entries(entries, CoreCategorySource::Builtin)
    }

    /// Set from explicit names (no aliases).
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = names
            .into_iter()
            .map(|n| normalize_category(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            normalized,
            source: CoreCategorySource::File,
        }
    }

    fn from_entries(
        entries: impl IntoIterator<Item = CoreCategoryEntry>,
        source: CoreCategorySource,
    ) -> Self {
        let mut normalized = BTreeSet::new();
        for entry in entries {
            for name in std::iter::once(&entry.name).chain(entry.aliases.iter()) {
                let n = normalize_category(name);
                if !n.is_empty() {
                    normalized.insert(n);
                }
            }
        }
        Self { normalized, source }
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CoreCategoryFile =
            serde_json::from_str(&content).map_err(|source| ConfigLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let set = Self::from_entries(file.categories, CoreCategorySource::File);
        if set.is_empty() {
            return Err(ConfigLoadError::Empty {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), count = set.len(), "Loaded core categories");
        Ok(set)
    }

    /// Load from `path`, or fall back to the built-in list.
    ///
    /// Returns the active set and the warning to report, if any.
    pub fn load_or_builtin(path: Option<&Path>) -> (Self, Option<String>) {
        let Some(path) = path else {
            return (Self::builtin(), None);
        };
        match Self::load(path) {
            Ok(set) => (set, None),
            Err(e) => {
                warn!(error = %e, "Falling back to built-in core categories");
                (Self::builtin(), Some(format!("{e}; using built-in core categories")))
            }
        }
    }

    pub fn is_core(&self, subcategory: &str) -> bool {
        self.normalized.contains(&normalize_category(subcategory))
    }

    pub fn source(&self) -> CoreCategorySource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.normalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.normalized.iter().map(String::as_str)
    }
}

impl Default for CoreCategorySet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalization_strips_case_space_punctuation() {
        assert_eq!(normalize_category(" T-Shirt "), "tshirt");
        assert_eq!(normalize_category("Casual  Pants"), "casualpants");
        assert_eq!(normalize_category("牛仔裤"), "牛仔裤");
    }

    #[test]
    fn test_builtin_matches_names_and_aliases() {
        let set = CoreCategorySet::builtin();
        assert!(set.is_core("T-shirt"));
        assert!(set.is_core("T恤"));
        assert!(set.is_core("casual_pants"));
        assert!(set.is_core("Jeans"));
        assert_eq!(set.source(), CoreCategorySource::Builtin);
    }

    #[test]
    fn test_exact_match_not_substring() {
        let set = CoreCategorySet::builtin();
        // "shirt" is core, "overshirt" is not.
        assert!(set.is_core("shirt"));
        assert!(!set.is_core("overshirt"));
        assert!(!set.is_core("socks"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"categories": [{{"name": "Socks", "aliases": ["袜子"]}}]}}"#
        )
        .unwrap();
        let set = CoreCategorySet::load(file.path()).unwrap();
        assert!(set.is_core("socks"));
        assert!(set.is_core("袜子"));
        assert!(!set.is_core("jeans"));
        assert_eq!(set.source(), CoreCategorySource::File);
    }

    #[test]
    fn test_missing_file_falls_back_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let (set, warning) = CoreCategorySet::load_or_builtin(Some(&path));
        assert_eq!(set, CoreCategorySet::builtin());
        assert!(warning.unwrap().contains("not readable"));
    }

    #[test]
    fn test_malformed_file_falls_back_with_warning() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let (set, warning) = CoreCategorySet::load_or_builtin(Some(file.path()));
        assert_eq!(set.source(), CoreCategorySource::Builtin);
        assert!(warning.unwrap().contains("malformed"));
    }

    #[test]
    fn test_empty_file_is_a_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"categories": []}}"#).unwrap();
        assert!(matches!(
            CoreCategorySet::load(file.path()),
            Err(ConfigLoadError::Empty { .. })
        ));
    }

    #[test]
    fn test_no_path_is_builtin_without_warning() {
        let (set, warning) = CoreCategorySet::load_or_builtin(None);
        assert_eq!(set.source(), CoreCategorySource::Builtin);
        assert!(warning.is_none());
    }
}
