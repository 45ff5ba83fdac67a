//! Scan-time filter rules: path prefixes, name globs, time and size bounds
//!
//! Exclusion always wins. When no include rule is configured the default is
//! "include unless excluded". Path containment is component-boundary
//! containment on lexically normalized paths, so `/a/foo` never captures
//! `/a/foobar` and `..` escapes are never contained.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

/// User-facing filter configuration, persisted as part of task configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    /// Only include entries under these path prefixes.
    pub include_paths: Vec<String>,
    /// Exclude entries under these path prefixes. Wins over includes.
    pub exclude_paths: Vec<String>,
    /// Glob patterns matched against basenames, files only.
    pub include_names: Vec<String>,
    /// Glob patterns matched against basenames; matching directories are
    /// pruned whole.
    pub exclude_names: Vec<String>,
    /// Keep entries modified strictly after this instant (non-directories).
    pub newer_than: Option<DateTime<Utc>>,
    /// Keep entries modified strictly before this instant (non-directories).
    pub older_than: Option<DateTime<Utc>>,
    /// Minimum regular-file size in bytes; 0 matches everything.
    pub min_size: i64,
    /// Maximum regular-file size in bytes; values ≤ 0 mean no upper bound.
    pub max_size: i64,
}

impl FilterConfig {
    /// Compile the glob patterns and normalize the path rules once per scan.
    pub fn compile(&self) -> Result<FilterSet> {
        Ok(FilterSet {
            include_paths: self.include_paths.iter().map(lexical_clean).collect(),
            exclude_paths: self.exclude_paths.iter().map(lexical_clean).collect(),
            include_names: build_globset(&self.include_names)?,
            exclude_names: build_globset(&self.exclude_names)?,
            newer_than: self.newer_than,
            older_than: self.older_than,
            min_size: self.min_size,
            max_size: self.max_size,
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| Error::InvalidInput {
            reason: format!("invalid filter pattern '{pattern}': {err}"),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|err| Error::InvalidInput {
        reason: format!("failed to build filter patterns: {err}"),
    })?;
    Ok(Some(set))
}

/// Normalize `.`/`..` segments without touching the filesystem. `..` that
/// escapes past the start of the path is kept, which makes escaped paths
/// compare as not-contained.
fn lexical_clean<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if !(can_pop && out.pop()) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Compiled filter rules applied to every scanned entry.
pub struct FilterSet {
    include_paths: Vec<PathBuf>,
    exclude_paths: Vec<PathBuf>,
    include_names: Option<GlobSet>,
    exclude_names: Option<GlobSet>,
    newer_than: Option<DateTime<Utc>>,
    older_than: Option<DateTime<Utc>>,
    min_size: i64,
    max_size: i64,
}

impl FilterSet {
    /// Decide whether `path` survives the filters. A rejected directory is
    /// pruned whole by the scanner.
    pub fn should_include(&self, path: &Path, meta: &Metadata) -> bool {
        let cleaned = lexical_clean(path);
        let is_dir = meta.is_dir();

        for excluded in &self.exclude_paths {
            if cleaned.starts_with(excluded) {
                return false;
            }
        }

        let name = path.file_name().unwrap_or(path.as_os_str());
        if let Some(exclude_names) = &self.exclude_names {
            if exclude_names.is_match(Path::new(name)) {
                return false;
            }
        }

        if !is_dir {
            if let Ok(modified) = meta.modified() {
                let modified: DateTime<Utc> = modified.into();
                if let Some(older_than) = self.older_than {
                    if modified >= older_than {
                        return false;
                    }
                }
                if let Some(newer_than) = self.newer_than {
                    if modified <= newer_than {
                        return false;
                    }
                }
            }
        }

        if meta.is_file() {
            let size = meta.len() as i64;
            if self.min_size > 0 && size < self.min_size {
                return false;
            }
            if self.max_size > 0 && size > self.max_size {
                return false;
            }
        }

        let has_include_rules =
            !self.include_paths.is_empty() || self.include_names.is_some();
        if !has_include_rules {
            return true;
        }

        if !self.include_paths.is_empty() {
            let contained = self
                .include_paths
                .iter()
                .any(|included| cleaned.starts_with(included));
            if !contained {
                if !is_dir {
                    return false;
                }
                // A directory outside every include root survives only as an
                // ancestor the walk must pass through to reach one.
                let reaches_include_root = self
                    .include_paths
                    .iter()
                    .any(|included| included.starts_with(&cleaned));
                if !reaches_include_root {
                    return false;
                }
            }
        }

        if let Some(include_names) = &self.include_names {
            if !is_dir && !include_names.is_match(Path::new(name)) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> FilterConfig {
        FilterConfig::default()
    }

    #[test]
    fn test_default_includes_everything() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        fs::write(&file, b"a").unwrap();
        let set = config().compile().unwrap();
        assert!(set.should_include(&file, &fs::symlink_metadata(&file).unwrap()));
    }

    #[test]
    fn test_exclude_paths_respect_component_boundary() {
        let tmp = TempDir::new().unwrap();
        let dir_foo = tmp.path().join("foo");
        let dir_foobar = tmp.path().join("foobar");
        fs::create_dir_all(&dir_foo).unwrap();
        fs::create_dir_all(&dir_foobar).unwrap();
        let a = dir_foo.join("a.txt");
        let b = dir_foobar.join("b.txt");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut cfg = config();
        cfg.exclude_paths = vec![dir_foo.to_string_lossy().into_owned()];
        let set = cfg.compile().unwrap();

        assert!(!set.should_include(&a, &fs::symlink_metadata(&a).unwrap()));
        assert!(set.should_include(&b, &fs::symlink_metadata(&b).unwrap()));
    }

    #[test]
    fn test_include_paths_respect_component_boundary() {
        let tmp = TempDir::new().unwrap();
        let dir_foo = tmp.path().join("foo");
        let dir_foobar = tmp.path().join("foobar");
        fs::create_dir_all(&dir_foo).unwrap();
        fs::create_dir_all(&dir_foobar).unwrap();
        let a = dir_foo.join("a.txt");
        let b = dir_foobar.join("b.txt");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut cfg = config();
        cfg.include_paths = vec![dir_foo.to_string_lossy().into_owned()];
        let set = cfg.compile().unwrap();

        assert!(set.should_include(&a, &fs::symlink_metadata(&a).unwrap()));
        assert!(!set.should_include(&b, &fs::symlink_metadata(&b).unwrap()));
        // A sibling directory is not an ancestor of the include root.
        assert!(!set.should_include(&dir_foobar, &fs::symlink_metadata(&dir_foobar).unwrap()));
    }

    #[test]
    fn test_include_path_ancestor_dir_survives_for_traversal() {
        let tmp = TempDir::new().unwrap();
        let dir_foo = tmp.path().join("foo");
        let dir_foo_bar = dir_foo.join("bar");
        fs::create_dir_all(&dir_foo_bar).unwrap();
        let inside = dir_foo_bar.join("a.txt");
        let outside = dir_foo.join("b.txt");
        fs::write(&inside, b"a").unwrap();
        fs::write(&outside, b"b").unwrap();

        let mut cfg = config();
        cfg.include_paths = vec![dir_foo_bar.to_string_lossy().into_owned()];
        let set = cfg.compile().unwrap();

        assert!(set.should_include(&dir_foo, &fs::symlink_metadata(&dir_foo).unwrap()));
        assert!(set.should_include(&inside, &fs::symlink_metadata(&inside).unwrap()));
        assert!(!set.should_include(&outside, &fs::symlink_metadata(&outside).unwrap()));
    }

    #[test]
    fn test_exclude_names_win_over_includes() {
        let tmp = TempDir::new().unwrap();
        let keep = tmp.path().join("keep.log");
        let drop = tmp.path().join("drop.tmp");
        fs::write(&keep, b"k").unwrap();
        fs::write(&drop, b"d").unwrap();

        let mut cfg = config();
        cfg.include_names = vec!["*.log".into(), "*.tmp".into()];
        cfg.exclude_names = vec!["*.tmp".into()];
        let set = cfg.compile().unwrap();

        assert!(set.should_include(&keep, &fs::symlink_metadata(&keep).unwrap()));
        assert!(!set.should_include(&drop, &fs::symlink_metadata(&drop).unwrap()));
    }

    #[test]
    fn test_include_names_do_not_prune_directories() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sub");
        fs::create_dir_all(&dir).unwrap();
        let other = tmp.path().join("note.md");
        fs::write(&other, b"n").unwrap();

        let mut cfg = config();
        cfg.include_names = vec!["*.txt".into()];
        let set = cfg.compile().unwrap();

        assert!(set.should_include(&dir, &fs::symlink_metadata(&dir).unwrap()));
        assert!(!set.should_include(&other, &fs::symlink_metadata(&other).unwrap()));
    }

    #[test]
    fn test_size_bounds_apply_to_regular_files_only() {
        let tmp = TempDir::new().unwrap();
        let small = tmp.path().join("small.bin");
        let big = tmp.path().join("big.bin");
        fs::write(&small, vec![0u8; 10]).unwrap();
        fs::write(&big, vec![0u8; 1000]).unwrap();

        let mut cfg = config();
        cfg.min_size = 100;
        cfg.max_size = 500;
        let set = cfg.compile().unwrap();

        assert!(!set.should_include(&small, &fs::symlink_metadata(&small).unwrap()));
        assert!(!set.should_include(&big, &fs::symlink_metadata(&big).unwrap()));
        // Directories ignore size bounds.
        assert!(set.should_include(tmp.path(), &fs::symlink_metadata(tmp.path()).unwrap()));
    }

    #[test]
    fn test_max_size_zero_means_unbounded() {
        let tmp = TempDir::new().unwrap();
        let big = tmp.path().join("big.bin");
        fs::write(&big, vec![0u8; 4096]).unwrap();
        let set = config().compile().unwrap();
        assert!(set.should_include(&big, &fs::symlink_metadata(&big).unwrap()));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut cfg = config();
        cfg.exclude_names = vec!["[invalid".into()];
        assert!(matches!(
            cfg.compile(),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_lexical_clean_handles_escapes() {
        assert_eq!(lexical_clean("/a/b/../c"), PathBuf::from("/a/c"));
        assert_eq!(lexical_clean("/a/./b"), PathBuf::from("/a/b"));
        // An escape above the base never compares as contained.
        let escaped = lexical_clean("/base/../../etc/passwd");
        assert!(!escaped.starts_with("/base"));
    }

    #[test]
    fn test_filter_config_serde_roundtrip() {
        let mut cfg = config();
        cfg.exclude_names = vec!["*.tmp".into()];
        cfg.max_size = -1;
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("excludeNames"));
        let parsed: FilterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.exclude_names, vec!["*.tmp".to_string()]);
        assert_eq!(parsed.max_size, -1);
    }
}
