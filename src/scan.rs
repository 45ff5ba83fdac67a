//! Source scanning: deterministic walks that feed the archive worker pool
//! and produce the manifest-ready file list

use crate::archive::mode_of;
use crate::backup::BackupManager;
use crate::filters::{FilterConfig, FilterSet};
use crate::manifest::{sort_manifest_files, ManifestFile};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// One entry the backup workers will archive.
#[derive(Debug, Clone)]
pub(crate) struct ArchiveJob {
    pub path: PathBuf,
    pub rel_path: String,
}

/// Scan output: jobs in stable walk order plus the manifest view.
#[derive(Debug)]
pub(crate) struct ScanResult {
    pub jobs: Vec<ArchiveJob>,
    pub jobs_by_rel: HashMap<String, ArchiveJob>,
    pub files: Vec<ManifestFile>,
    pub selected_file_count: u64,
    pub selected_bytes: u64,
}

/// Forward-slash path relative to the scan base; the root maps to ".".
fn slash_rel_path(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

impl ScanResult {
    fn add_entry(&mut self, path: &Path, base: &Path, meta: &fs::Metadata) {
        let rel = slash_rel_path(path, base);
        let job = ArchiveJob {
            path: path.to_path_buf(),
            rel_path: rel.clone(),
        };
        self.jobs_by_rel.insert(rel.clone(), job.clone());
        self.jobs.push(job);

        if !meta.is_dir() {
            self.selected_file_count += 1;
            if meta.is_file() {
                self.selected_bytes += meta.len();
            }
        }

        // The synthetic root "." stays out of the manifest so incremental
        // diffs do not churn on it.
        if rel == "." {
            return;
        }

        let is_link = meta.file_type().is_symlink();
        let link_dest = if is_link {
            fs::read_link(path)
                .map(|dest| dest.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };

        self.files.push(ManifestFile {
            path: rel,
            size: if meta.is_file() { meta.len() } else { 0 },
            mode: mode_of(meta),
            mod_time: meta
                .modified()
                .map(Into::into)
                .unwrap_or_else(|_| chrono::Utc::now()),
            is_dir: meta.is_dir(),
            is_link,
            link_dest,
        });
    }
}

impl BackupManager {
    /// Walk every source root, apply the filters and collect the archive
    /// jobs. Two scans of an unchanged tree with identical filters produce
    /// byte-identical manifests.
    pub(crate) fn scan_sources(
        &self,
        sources: &[PathBuf],
        filters: &FilterConfig,
    ) -> Result<ScanResult> {
        if sources.is_empty() {
            return Err(Error::InvalidInput {
                reason: "no source paths provided".into(),
            });
        }
        let filter_set = filters.compile()?;

        let mut result = ScanResult {
            jobs: Vec::new(),
            jobs_by_rel: HashMap::new(),
            files: Vec::new(),
            selected_file_count: 0,
            selected_bytes: 0,
        };

        for source in sources {
            self.cancel().check()?;

            let meta = fs::symlink_metadata(source)?;
            if !meta.is_dir() {
                // A file or symlink source archives relative to its parent.
                let base = source.parent().unwrap_or(Path::new("."));
                if filter_set.should_include(source, &meta) {
                    result.add_entry(source, base, &meta);
                }
                continue;
            }

            self.walk_directory(source, &filter_set, &mut result)?;
        }

        sort_manifest_files(&mut result.files);
        Ok(result)
    }

    fn walk_directory(
        &self,
        root: &Path,
        filter_set: &FilterSet,
        result: &mut ScanResult,
    ) -> Result<()> {
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            self.cancel().check()?;

            let entry = entry.map_err(|err| Error::Io(err.into()))?;
            let meta = entry.metadata().map_err(|err| Error::Io(err.into()))?;

            if !filter_set.should_include(entry.path(), &meta) {
                if meta.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            result.add_entry(entry.path(), root, &meta);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use std::fs;
    use tempfile::TempDir;

    fn manager() -> BackupManager {
        BackupManager::new(CancelToken::new())
    }

    fn scan(sources: &[PathBuf], filters: &FilterConfig) -> ScanResult {
        manager().scan_sources(sources, filters).unwrap()
    }

    #[test]
    fn test_scan_collects_nested_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("src");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"aaa").unwrap();
        fs::write(root.join("sub/b.txt"), b"bb").unwrap();

        let result = scan(&[root], &FilterConfig::default());
        assert_eq!(result.selected_file_count, 2);
        assert_eq!(result.selected_bytes, 5);

        let paths: Vec<&str> = result.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub", "sub/b.txt"]);
        // The root itself is archived as ".".
        assert_eq!(result.jobs[0].rel_path, ".");
    }

    #[test]
    fn test_scan_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("src");
        fs::create_dir_all(root.join("z")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("z/1.txt"), b"1").unwrap();
        fs::write(root.join("a/2.txt"), b"2").unwrap();

        let first = scan(&[root.clone()], &FilterConfig::default());
        let second = scan(&[root], &FilterConfig::default());

        let order =
            |r: &ScanResult| r.jobs.iter().map(|j| j.rel_path.clone()).collect::<Vec<_>>();
        assert_eq!(order(&first), order(&second));
        assert_eq!(
            serde_json::to_vec(&first.files).unwrap(),
            serde_json::to_vec(&second.files).unwrap()
        );
    }

    #[test]
    fn test_excluded_directory_is_pruned_whole() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("src");
        fs::create_dir_all(root.join("node_modules/deep")).unwrap();
        fs::write(root.join("node_modules/deep/x.js"), b"x").unwrap();
        fs::write(root.join("keep.txt"), b"k").unwrap();

        let mut filters = FilterConfig::default();
        filters.exclude_names = vec!["node_modules".into()];
        let result = scan(&[root], &filters);

        assert!(result
            .files
            .iter()
            .all(|f| !f.path.starts_with("node_modules")));
        assert_eq!(result.selected_file_count, 1);
    }

    #[test]
    fn test_single_file_source_uses_basename() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("solo.txt");
        fs::write(&file, b"solo").unwrap();

        let result = scan(&[file], &FilterConfig::default());
        assert_eq!(result.jobs.len(), 1);
        assert_eq!(result.jobs[0].rel_path, "solo.txt");
        assert_eq!(result.files[0].path, "solo.txt");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_recorded_not_followed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("src");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("target.txt"), b"t").unwrap();
        std::os::unix::fs::symlink("target.txt", root.join("ln")).unwrap();

        let result = scan(&[root], &FilterConfig::default());
        let link = result.files.iter().find(|f| f.path == "ln").unwrap();
        assert!(link.is_link);
        assert_eq!(link.link_dest, "target.txt");
        assert_eq!(link.size, 0);
    }

    #[test]
    fn test_empty_sources_is_invalid_input() {
        let err = manager()
            .scan_sources(&[], &FilterConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn test_cancelled_scan_stops() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        let token = CancelToken::new();
        token.cancel();
        let manager = BackupManager::new(token);
        let err = manager
            .scan_sources(&[tmp.path().to_path_buf()], &FilterConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
