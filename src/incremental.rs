//! Incremental backups: manifest diffing against a parent archive,
//! tombstone emission, and base-to-tip chain restoration

use crate::archive::{ArchiveReader, ArchiveWriter, FileMetadata};
use crate::backup::{write_manifest_entry, ArchiveCounters, BackupManager, PipelineOptions, SinkStack};
use crate::events::{ProgressUpdate, Stage};
use crate::filters::FilterConfig;
use crate::manifest::{
    manifest_files_to_map, BackupManifest, BackupType, MANIFEST_ENTRY_PATH, MANIFEST_VERSION,
};
use crate::restore::open_reader_stack;
use crate::scan::ArchiveJob;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

impl BackupManager {
    /// Read only the manifest entry of an archive. `None` when the archive
    /// is empty or does not start with a manifest.
    pub(crate) fn read_manifest(
        &self,
        backup_file: &Path,
        password: &str,
    ) -> Result<Option<BackupManifest>> {
        let reader = open_reader_stack(backup_file, password)?;
        let mut archive = ArchiveReader::new(reader);

        let meta = match archive.next_entry()? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        if meta.path != MANIFEST_ENTRY_PATH {
            return Ok(None);
        }

        let payload = archive.read_payload(meta.size)?;
        if meta.has_crc {
            archive.read_crc()?;
        }
        let manifest = serde_json::from_slice(&payload).map_err(|err| Error::CorruptArchive {
            reason: format!("invalid manifest: {err}"),
        })?;
        Ok(Some(manifest))
    }

    /// Walk `parent` pointers back to the base full backup and return the
    /// chain in application order (base first). Cycles are detected on
    /// canonicalized paths.
    pub(crate) fn resolve_restore_chain(
        &self,
        backup_file: &Path,
        password: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut chain: Vec<PathBuf> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut current = backup_file.to_path_buf();

        loop {
            let key = fs::canonicalize(&current).unwrap_or_else(|_| current.clone());
            if !seen.insert(key) {
                return Err(Error::CorruptArchive {
                    reason: format!("backup chain cycle detected at {}", current.display()),
                });
            }
            chain.push(current.clone());

            let manifest = self.read_manifest(&current, password)?;
            let parent = match manifest {
                Some(m) if m.backup_type == BackupType::Incremental && !m.parent.is_empty() => {
                    m.parent
                }
                _ => break,
            };

            let parent_path = PathBuf::from(&parent);
            current = if parent_path.is_absolute() {
                parent_path
            } else {
                current
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(parent_path)
            };
        }

        chain.reverse();
        Ok(chain)
    }

    /// Restore a backup file. Incremental archives resolve their chain and
    /// replay it base-first; later archives overwrite earlier state and
    /// their tombstones remove restored paths.
    pub fn restore(&self, backup_file: &Path, restore_dir: &Path, password: &str) -> Result<()> {
        self.emit_stage("preparing restore", Stage::Scanning);

        let chain = self.resolve_restore_chain(backup_file, password)?;
        info!(
            archives = chain.len(),
            target = %backup_file.display(),
            "restoring backup chain"
        );

        for file in &chain {
            self.cancel().check()?;
            self.restore_single(file, restore_dir, password)?;
        }
        Ok(())
    }

    /// Create an incremental backup of `sources` against `parent_file`.
    ///
    /// Fails with [`Error::NoChanges`] before the destination is created
    /// when the scan matches the parent manifest exactly.
    pub fn backup_incremental(
        &self,
        sources: &[PathBuf],
        dest: &Path,
        parent_file: &Path,
        filters: &FilterConfig,
        options: &PipelineOptions,
    ) -> Result<()> {
        if parent_file.as_os_str().is_empty() {
            return Err(Error::InvalidInput {
                reason: "parent backup file is required".into(),
            });
        }
        let password = options
            .encryption
            .as_ref()
            .map(|e| e.password.as_str())
            .unwrap_or("");

        let parent_manifest =
            self.read_manifest(parent_file, password)?
                .ok_or_else(|| Error::InvalidInput {
                    reason: "parent backup has no manifest; create a new full backup first".into(),
                })?;

        self.emit_stage("scanning for changed files", Stage::Scanning);
        let mut scan = self.scan_sources(sources, filters)?;

        let mut changed: BTreeSet<String> = BTreeSet::new();
        let mut deleted: BTreeSet<String> = BTreeSet::new();
        let mut tombstones: Vec<FileMetadata> = Vec::new();
        let mut changed_jobs: Vec<ArchiveJob> = Vec::new();
        let mut total_bytes = 0u64;

        {
            let current_map = manifest_files_to_map(&scan.files);
            let parent_map = manifest_files_to_map(&parent_manifest.files);

            for path in parent_map.keys() {
                if !current_map.contains_key(path) {
                    deleted.insert((*path).to_string());
                }
            }
            for (path, cur) in &current_map {
                match parent_map.get(path) {
                    None => {
                        changed.insert((*path).to_string());
                    }
                    Some(prev) if !cur.equal_for_diff(prev) => {
                        changed.insert((*path).to_string());
                        // A type change needs the old object removed before
                        // the new one lands.
                        if cur.is_dir != prev.is_dir || cur.is_link != prev.is_link {
                            deleted.insert((*path).to_string());
                        }
                    }
                    Some(_) => {}
                }
            }

            for path in &deleted {
                let prev = parent_map
                    .get(path.as_str())
                    .ok_or_else(|| Error::InvalidInput {
                        reason: format!("missing parent manifest entry for {path}"),
                    })?;
                tombstones.push(FileMetadata {
                    path: path.clone(),
                    size: 0,
                    mode: prev.mode,
                    mod_time: prev.mod_time,
                    is_dir: prev.is_dir,
                    is_link: prev.is_link,
                    link_dest: prev.link_dest.clone(),
                    has_crc: false,
                    deleted: true,
                });
            }
            for path in &changed {
                let job = scan
                    .jobs_by_rel
                    .get(path.as_str())
                    .ok_or_else(|| Error::InvalidInput {
                        reason: format!("missing scan job for changed path {path}"),
                    })?;
                changed_jobs.push(job.clone());
                if let Some(cur) = current_map.get(path.as_str()) {
                    if !cur.is_dir && !cur.is_link {
                        total_bytes += cur.size;
                    }
                }
            }
        }

        if changed.is_empty() && deleted.is_empty() {
            return Err(Error::NoChanges);
        }

        let total_ops = (changed.len() + deleted.len()) as u64;
        let counters = ArchiveCounters::new(total_ops, total_bytes, true);
        self.emit_archiving(&counters, "archiving incremental changes".into(), true);
        info!(
            changed = changed.len(),
            deleted = deleted.len(),
            parent = %parent_file.display(),
            "starting incremental backup"
        );

        let parent_name = parent_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_type: BackupType::Incremental,
            created_at: chrono::Utc::now(),
            parent: parent_name,
            files: std::mem::take(&mut scan.files),
        };

        let mut archive = ArchiveWriter::new(SinkStack::open(dest, options)?);
        write_manifest_entry(&mut archive, &manifest)?;

        // Tombstones first so type changes never collide with fresh entries.
        for meta in &tombstones {
            self.cancel().check()?;
            archive.write_entry(meta, None, |_| {})?;
            counters.complete_op();
            self.emit_archiving(&counters, format!("archiving: {}", meta.path), true);
        }

        let archive = self.archive_jobs(archive, &changed_jobs, &counters)?;
        self.cancel().check()?;
        archive.into_inner().finish()?;

        self.events().progress_update(&ProgressUpdate {
            message: "incremental backup complete".into(),
            current: total_ops,
            total: total_ops,
            bytes_current: total_bytes,
            bytes_total: total_bytes,
            stage: Stage::Archiving,
        });
        Ok(())
    }
}
