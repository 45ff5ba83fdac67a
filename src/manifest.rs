//! Backup manifests: the complete source-side snapshot written as the first
//! entry of every archive, and the diff relation incremental backups use

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved prefix for entries owned by the archive itself.
pub const INTERNAL_META_PREFIX: &str = ".qbakmeta/";
/// Archive path of the manifest entry. Always the first entry.
pub const MANIFEST_ENTRY_PATH: &str = ".qbakmeta/manifest.json";

pub const MANIFEST_VERSION: u32 = 1;

pub fn is_internal_path(path: &str) -> bool {
    path.starts_with(INTERNAL_META_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

/// One file as the scan observed it. This is the unit the incremental diff
/// compares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_link: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_dest: String,
}

impl ManifestFile {
    /// Change-detection relation: mode and type always; link destination for
    /// symlinks; size and modification time for files. Directory size and
    /// modTime are deliberately ignored so child churn does not produce
    /// spurious incremental entries.
    pub fn equal_for_diff(&self, other: &ManifestFile) -> bool {
        if self.path != other.path {
            return false;
        }
        if self.is_dir != other.is_dir || self.is_link != other.is_link {
            return false;
        }
        if self.mode != other.mode {
            return false;
        }
        if self.is_link {
            return self.link_dest == other.link_dest;
        }
        if self.is_dir {
            return true;
        }
        self.size == other.size && self.mod_time == other.mod_time
    }
}

/// First entry of every archive: a full snapshot of the selected source
/// state, sorted ascending by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub version: u32,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    /// Basename of the parent archive; empty for full backups.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    pub files: Vec<ManifestFile>,
}

pub(crate) fn sort_manifest_files(files: &mut [ManifestFile]) {
    files.sort_by(|a, b| a.path.cmp(&b.path));
}

pub(crate) fn manifest_files_to_map(
    files: &[ManifestFile],
) -> std::collections::HashMap<&str, &ManifestFile> {
    files.iter().map(|f| (f.path.as_str(), f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> ManifestFile {
        ManifestFile {
            path: path.into(),
            size,
            mode: 0o100644,
            mod_time: Utc::now(),
            is_dir: false,
            is_link: false,
            link_dest: String::new(),
        }
    }

    #[test]
    fn test_internal_path_detection() {
        assert!(is_internal_path(MANIFEST_ENTRY_PATH));
        assert!(is_internal_path(".qbakmeta/extra.json"));
        assert!(!is_internal_path("docs/.qbakmeta"));
        assert!(!is_internal_path("a.txt"));
    }

    #[test]
    fn test_equal_for_diff_files() {
        let a = file("a.txt", 10);
        let mut b = a.clone();
        assert!(a.equal_for_diff(&b));

        b.size = 11;
        assert!(!a.equal_for_diff(&b));

        b = a.clone();
        b.mod_time = b.mod_time + chrono::Duration::seconds(1);
        assert!(!a.equal_for_diff(&b));

        b = a.clone();
        b.mode = 0o100600;
        assert!(!a.equal_for_diff(&b));
    }

    #[test]
    fn test_equal_for_diff_ignores_dir_size_and_mtime() {
        let mut a = file("dir", 0);
        a.is_dir = true;
        a.mode = 0o040755;
        let mut b = a.clone();
        b.size = 999;
        b.mod_time = b.mod_time + chrono::Duration::hours(1);
        assert!(a.equal_for_diff(&b));
    }

    #[test]
    fn test_equal_for_diff_symlink_dest() {
        let mut a = file("ln", 0);
        a.is_link = true;
        a.mode = 0o120777;
        a.link_dest = "target".into();
        let mut b = a.clone();
        assert!(a.equal_for_diff(&b));
        b.link_dest = "elsewhere".into();
        assert!(!a.equal_for_diff(&b));
    }

    #[test]
    fn test_type_change_is_a_difference() {
        let a = file("x", 0);
        let mut b = a.clone();
        b.is_dir = true;
        assert!(!a.equal_for_diff(&b));
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_type: BackupType::Incremental,
            created_at: Utc::now(),
            parent: "base.qbak".into(),
            files: vec![file("a.txt", 1)],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"type\":\"incremental\""));
        assert!(json.contains("\"parent\":\"base.qbak\""));
        assert!(json.contains("\"createdAt\""));

        let parsed: BackupManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.backup_type, BackupType::Incremental);
        assert_eq!(parsed.files.len(), 1);
    }

    #[test]
    fn test_full_manifest_omits_parent() {
        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_type: BackupType::Full,
            created_at: Utc::now(),
            parent: String::new(),
            files: Vec::new(),
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(!json.contains("parent"));
    }

    #[test]
    fn test_sort_manifest_files() {
        let mut files = vec![file("b", 0), file("a/z", 0), file("a", 0)];
        sort_manifest_files(&mut files);
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/z", "b"]);
    }
}
