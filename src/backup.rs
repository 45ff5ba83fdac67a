//! Backup engine: composes the sink stack (file ← encryption ← compression
//! ← archive writer) and archives scanned entries through a worker pool
//! serialized onto a single archive writer

use crate::archive::{mode_of, ArchiveWriter, FileMetadata};
use crate::cancel::CancelToken;
use crate::compress::CompressedWriter;
use crate::crypto::{Algorithm, EncryptedWriter};
use crate::events::{EventSink, NullEvents, ProgressThrottle, ProgressUpdate, Stage};
use crate::filters::FilterConfig;
use crate::manifest::{BackupManifest, BackupType, MANIFEST_ENTRY_PATH, MANIFEST_VERSION};
use crate::restore::ConflictHandler;
use crate::scan::ArchiveJob;
use crate::{Error, Result};
use crossbeam_channel::bounded;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info};

pub(crate) const BACKUP_WORKERS: usize = 8;

/// Stream transforms applied outside the archive container.
#[derive(Clone, Default)]
pub struct PipelineOptions {
    pub compression: bool,
    pub encryption: Option<Encryption>,
}

#[derive(Clone)]
pub struct Encryption {
    pub algorithm: Algorithm,
    pub password: String,
}

impl PipelineOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn compressed() -> Self {
        Self {
            compression: true,
            encryption: None,
        }
    }

    pub fn encrypted(algorithm: Algorithm, password: &str) -> Self {
        Self {
            compression: false,
            encryption: Some(Encryption {
                algorithm,
                password: password.to_string(),
            }),
        }
    }
}

/// The composed write side of an archive. Layers are fixed outside-in:
/// destination file, then encryption, then compression.
pub(crate) enum SinkStack {
    Plain(BufWriter<File>),
    Compressed(CompressedWriter<File>),
    Encrypted(EncryptedWriter<File>),
    CompressedEncrypted(CompressedWriter<EncryptedWriter<File>>),
}

impl SinkStack {
    pub(crate) fn open(dest: &Path, options: &PipelineOptions) -> Result<Self> {
        let file = File::create(dest)?;
        Ok(match (&options.encryption, options.compression) {
            (None, false) => SinkStack::Plain(BufWriter::new(file)),
            (None, true) => SinkStack::Compressed(CompressedWriter::new(file)?),
            (Some(enc), false) => {
                SinkStack::Encrypted(EncryptedWriter::new(file, &enc.password, enc.algorithm)?)
            }
            (Some(enc), true) => {
                let encrypted = EncryptedWriter::new(file, &enc.password, enc.algorithm)?;
                SinkStack::CompressedEncrypted(CompressedWriter::new(encrypted)?)
            }
        })
    }

    /// Drain every layer inside-out and sync the stream to the file.
    pub(crate) fn finish(self) -> Result<()> {
        match self {
            SinkStack::Plain(mut w) => {
                w.flush()?;
            }
            SinkStack::Compressed(w) => {
                w.finish()?;
            }
            SinkStack::Encrypted(w) => {
                w.finish()?;
            }
            SinkStack::CompressedEncrypted(w) => {
                w.finish()?.finish()?;
            }
        }
        Ok(())
    }
}

impl Write for SinkStack {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SinkStack::Plain(w) => w.write(buf),
            SinkStack::Compressed(w) => w.write(buf),
            SinkStack::Encrypted(w) => w.write(buf),
            SinkStack::CompressedEncrypted(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SinkStack::Plain(w) => w.flush(),
            SinkStack::Compressed(w) => w.flush(),
            SinkStack::Encrypted(w) => w.flush(),
            SinkStack::CompressedEncrypted(w) => w.flush(),
        }
    }
}

/// Shared progress accounting for an archiving pass.
pub(crate) struct ArchiveCounters {
    throttle: ProgressThrottle,
    ops: AtomicU64,
    bytes: AtomicU64,
    total_ops: u64,
    total_bytes: u64,
    /// Full backups count files only; incremental passes count every
    /// operation including directories and tombstones.
    count_dirs: bool,
}

impl ArchiveCounters {
    pub(crate) fn new(total_ops: u64, total_bytes: u64, count_dirs: bool) -> Self {
        Self {
            throttle: ProgressThrottle::new(),
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            total_ops,
            total_bytes,
            count_dirs,
        }
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn complete_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drives backup, restore and incremental operations. One cancellation
/// token scopes each public call; conflict resolution is only consulted by
/// restores.
pub struct BackupManager {
    cancel: CancelToken,
    events: std::sync::Arc<dyn EventSink>,
    pub(crate) conflict_handler: Option<ConflictHandler>,
}

impl BackupManager {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            events: std::sync::Arc::new(NullEvents),
            conflict_handler: None,
        }
    }

    pub fn with_events(cancel: CancelToken, events: std::sync::Arc<dyn EventSink>) -> Self {
        Self {
            cancel,
            events,
            conflict_handler: None,
        }
    }

    pub fn set_conflict_handler(&mut self, handler: ConflictHandler) {
        self.conflict_handler = Some(handler);
    }

    pub(crate) fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn events(&self) -> &dyn EventSink {
        &*self.events
    }

    pub(crate) fn emit_stage(&self, message: &str, stage: Stage) {
        self.events.progress_update(&ProgressUpdate {
            message: message.to_string(),
            current: 0,
            total: 0,
            bytes_current: 0,
            bytes_total: 0,
            stage,
        });
    }

    pub(crate) fn emit_archiving(&self, counters: &ArchiveCounters, message: String, force: bool) {
        if !counters.throttle.should_emit(force) {
            return;
        }
        self.events.progress_update(&ProgressUpdate {
            message,
            current: counters.ops.load(Ordering::Relaxed),
            total: counters.total_ops,
            bytes_current: counters.bytes.load(Ordering::Relaxed),
            bytes_total: counters.total_bytes,
            stage: Stage::Archiving,
        });
    }

    /// Create a full backup of `sources` at `dest`.
    ///
    /// Fails with [`Error::NoFilesSelected`] before the destination is
    /// created when the filters eliminate every candidate. On any later
    /// error the partial destination file is left for the caller to remove.
    pub fn backup(
        &self,
        sources: &[PathBuf],
        dest: &Path,
        filters: &FilterConfig,
        options: &PipelineOptions,
    ) -> Result<()> {
        self.emit_stage("scanning for files to back up", Stage::Scanning);
        let mut scan = self.scan_sources(sources, filters)?;
        if scan.selected_file_count == 0 {
            return Err(Error::NoFilesSelected);
        }

        let counters = ArchiveCounters::new(scan.selected_file_count, scan.selected_bytes, false);
        self.emit_archiving(&counters, "archiving".into(), true);
        info!(
            files = scan.selected_file_count,
            bytes = scan.selected_bytes,
            dest = %dest.display(),
            "starting full backup"
        );

        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_type: BackupType::Full,
            created_at: chrono::Utc::now(),
            parent: String::new(),
            files: std::mem::take(&mut scan.files),
        };

        let mut archive = ArchiveWriter::new(SinkStack::open(dest, options)?);
        write_manifest_entry(&mut archive, &manifest)?;

        let archive = self.archive_jobs(archive, &scan.jobs, &counters)?;
        self.cancel.check()?;
        archive.into_inner().finish()?;

        self.events.progress_update(&ProgressUpdate {
            message: "backup complete".into(),
            current: counters.total_ops,
            total: counters.total_ops,
            bytes_current: counters.total_bytes,
            bytes_total: counters.total_bytes,
            stage: Stage::Archiving,
        });
        info!(dest = %dest.display(), "backup complete");
        Ok(())
    }

    /// Fan `jobs` out to the worker pool. Entries reach the sink in mutex
    /// acquisition order; the manifest is the authoritative ordering.
    pub(crate) fn archive_jobs(
        &self,
        archive: ArchiveWriter<SinkStack>,
        jobs: &[ArchiveJob],
        counters: &ArchiveCounters,
    ) -> Result<ArchiveWriter<SinkStack>> {
        let writer = Mutex::new(archive);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let stop = AtomicBool::new(false);

        let record_error = |err: Error| {
            stop.store(true, Ordering::SeqCst);
            let mut slot = match first_error.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_none() {
                *slot = Some(err);
            }
        };

        thread::scope(|s| {
            let (tx, rx) = bounded::<&ArchiveJob>(BACKUP_WORKERS);

            for _ in 0..BACKUP_WORKERS {
                let rx = rx.clone();
                let writer = &writer;
                let record_error = &record_error;
                s.spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        if let Err(err) = self.archive_one(writer, job, counters) {
                            record_error(err);
                        }
                    }
                });
            }
            drop(rx);

            for job in jobs {
                if self.cancel.is_cancelled() || stop.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(job).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        self.cancel.check()?;
        let err = match first_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(err) = err {
            return Err(err);
        }
        writer.into_inner().map_err(|_| Error::CorruptArchive {
            reason: "archive worker panicked".into(),
        })
    }

    fn archive_one(
        &self,
        writer: &Mutex<ArchiveWriter<SinkStack>>,
        job: &ArchiveJob,
        counters: &ArchiveCounters,
    ) -> Result<()> {
        let info = fs::symlink_metadata(&job.path)?;

        let mut meta = FileMetadata {
            path: job.rel_path.clone(),
            size: info.len(),
            mode: mode_of(&info),
            mod_time: info
                .modified()
                .map(Into::into)
                .unwrap_or_else(|_| chrono::Utc::now()),
            is_dir: info.is_dir(),
            is_link: false,
            link_dest: String::new(),
            has_crc: false,
            deleted: false,
        };

        let mut opened: Option<File> = None;
        if info.file_type().is_symlink() {
            meta.is_link = true;
            meta.size = 0;
            meta.link_dest = fs::read_link(&job.path)?.to_string_lossy().into_owned();
        } else if info.is_file() {
            meta.has_crc = true;
            opened = Some(File::open(&job.path)?);
        } else {
            meta.size = 0;
        }

        self.events.log_message(&format!("archiving: {}", meta.path));
        debug!(path = %meta.path, size = meta.size, "archiving entry");

        let rel = meta.path.clone();
        let result = {
            let mut archive = writer.lock().map_err(|_| Error::CorruptArchive {
                reason: "archive writer poisoned".into(),
            })?;
            archive.write_entry(
                &meta,
                opened.as_mut().map(|f| f as &mut dyn Read),
                |n| {
                    counters.add_bytes(n);
                    self.emit_archiving(counters, format!("archiving: {rel}"), false);
                },
            )
        };
        result?;

        if counters.count_dirs || !meta.is_dir {
            counters.complete_op();
            self.emit_archiving(counters, format!("archiving: {rel}"), true);
        }
        Ok(())
    }
}

pub(crate) fn write_manifest_entry(
    archive: &mut ArchiveWriter<SinkStack>,
    manifest: &BackupManifest,
) -> Result<()> {
    let payload = serde_json::to_vec(manifest)?;
    let meta = FileMetadata {
        path: MANIFEST_ENTRY_PATH.to_string(),
        size: payload.len() as u64,
        mode: 0o100644,
        mod_time: chrono::Utc::now(),
        is_dir: false,
        is_link: false,
        link_dest: String::new(),
        has_crc: false,
        deleted: false,
    };
    archive.write_entry(&meta, Some(&mut &payload[..]), |_| {})
}
