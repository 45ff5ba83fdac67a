//! Restore engine: resolves the reader stack by magic sniffing, then
//! materializes entries through a parallel worker pool with per-file pipes,
//! CRC verification and caller-driven conflict resolution

use crate::archive::{is_regular_mode, ArchiveReader, FileMetadata, COPY_BUFFER_SIZE, MAX_HEADER_LEN};
use crate::backup::BackupManager;
use crate::compress::{CompressedReader, STREAM_MAGIC};
use crate::crypto::{DecryptedReader, ENCRYPTION_MAGIC};
use crate::events::{ProgressThrottle, ProgressUpdate, Stage};
use crate::manifest::{is_internal_path, BackupManifest, BackupType, MANIFEST_ENTRY_PATH};
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

pub(crate) const RESTORE_WORKERS: usize = 8;

const WORKER_STOPPED: &str = "restore worker stopped";

/// Resolution for a regular-file conflict during restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Skip,
    Overwrite,
    KeepBoth,
}

/// Caller-supplied resolver invoked from restore workers when a regular
/// file already exists at the target path.
pub type ConflictHandler = Arc<dyn Fn(&Path) -> Result<ConflictAction> + Send + Sync>;

type PipeChunk = Result<Vec<u8>>;

enum RestoreJob {
    Remove {
        dest: PathBuf,
    },
    Place {
        meta: FileMetadata,
        dest: PathBuf,
    },
    WriteFile {
        meta: FileMetadata,
        dest: PathBuf,
        pipe: Receiver<PipeChunk>,
    },
}

/// Fixed-size buffers recycled between the producer and the file writers.
struct BufferPool {
    slots: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn get(&self) -> Vec<u8> {
        let reused = match self.slots.lock() {
            Ok(mut slots) => slots.pop(),
            Err(_) => None,
        };
        reused.unwrap_or_else(|| Vec::with_capacity(COPY_BUFFER_SIZE))
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut slots) = self.slots.lock() {
            if slots.len() < self.capacity {
                slots.push(buf);
            }
        }
    }
}

pub(crate) struct RestoreCounters {
    throttle: ProgressThrottle,
    files: AtomicU64,
    bytes: AtomicU64,
    total_files: AtomicU64,
    total_bytes: AtomicU64,
}

impl RestoreCounters {
    fn new() -> Self {
        Self {
            throttle: ProgressThrottle::new(),
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            total_files: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }
}

/// Read exactly `buf.len()` bytes unless a clean EOF arrives first; returns
/// how many bytes were read.
fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read `want` bytes ahead of `reader` and hand back a reader that replays
/// them. Short reads (EOF) return fewer bytes.
fn peek_prefix(
    mut reader: Box<dyn Read + Send>,
    want: usize,
) -> Result<(Vec<u8>, Box<dyn Read + Send>)> {
    let mut head = vec![0u8; want];
    let filled = read_up_to(&mut reader, &mut head)?;
    head.truncate(filled);
    let replay = Cursor::new(head.clone()).chain(reader);
    Ok((head, Box::new(replay)))
}

/// Open a backup file and peel the optional encryption and compression
/// layers, each detected by its magic. Version-1 ciphertexts get an early
/// plaintext sanity check so a wrong password fails before a full scan.
pub(crate) fn open_reader_stack(path: &Path, password: &str) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read + Send> = Box::new(BufReader::with_capacity(COPY_BUFFER_SIZE, file));

    let (head, reader) = peek_prefix(reader, ENCRYPTION_MAGIC.len())?;
    let mut encrypted = false;
    let mut reader: Box<dyn Read + Send> = if head == ENCRYPTION_MAGIC {
        if password.is_empty() {
            return Err(Error::PasswordRequired);
        }
        encrypted = true;
        Box::new(DecryptedReader::new(reader, password)?)
    } else {
        reader
    };

    let (head, replay) = peek_prefix(reader, STREAM_MAGIC.len())?;
    if head == STREAM_MAGIC {
        reader = Box::new(CompressedReader::new(replay)?);
    } else if encrypted {
        // No compression layer: the first plaintext bytes must look like an
        // archive entry header, which catches wrong version-1 passwords.
        let (probe, replay) = peek_prefix(replay, 5)?;
        if probe.len() < 5 {
            return Err(Error::InvalidPassword);
        }
        let header_len = u32::from_be_bytes(probe[..4].try_into().expect("4-byte length")) as usize;
        if header_len == 0 || header_len > MAX_HEADER_LEN || probe[4] != b'{' {
            return Err(Error::InvalidPassword);
        }
        reader = replay;
    } else {
        reader = replay;
    }

    Ok(reader)
}

fn remove_path(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
        Ok(meta) => {
            let removed = if meta.is_dir() {
                fs::remove_dir_all(dest)
            } else {
                fs::remove_file(dest)
            };
            match removed {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other.map_err(Into::into),
            }
        }
    }
}

/// Pick `base (N).ext` with the smallest positive N that does not collide.
fn keep_both_path(dest: &Path) -> PathBuf {
    let parent = dest.parent().unwrap_or(Path::new(""));
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = dest
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{stem} ({n}){ext}"));
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

fn drain_pipe(pipe: &Receiver<PipeChunk>, pool: &BufferPool) {
    while let Ok(chunk) = pipe.recv() {
        if let Ok(buf) = chunk {
            pool.put(buf);
        }
    }
}

fn set_file_times(file: &File, meta: &FileMetadata) {
    let times = fs::FileTimes::new().set_modified(meta.mod_time.into());
    if let Err(err) = file.set_times(times) {
        debug!(path = %meta.path, "could not restore mtime: {err}");
    }
}

impl BackupManager {
    pub(crate) fn emit_restoring(&self, counters: &RestoreCounters, message: String, force: bool) {
        if !counters.throttle.should_emit(force) {
            return;
        }
        self.events().progress_update(&ProgressUpdate {
            message,
            current: counters.files.load(Ordering::Relaxed),
            total: counters.total_files.load(Ordering::Relaxed),
            bytes_current: counters.bytes.load(Ordering::Relaxed),
            bytes_total: counters.total_bytes.load(Ordering::Relaxed),
            stage: Stage::Restoring,
        });
    }

    /// Apply one archive to `restore_dir`. Chain resolution for incremental
    /// archives happens in [`BackupManager::restore`].
    pub(crate) fn restore_single(
        &self,
        backup_file: &Path,
        restore_dir: &Path,
        password: &str,
    ) -> Result<()> {
        let reader = open_reader_stack(backup_file, password)?;
        let mut archive = ArchiveReader::new(reader);
        self.run_restore(&mut archive, restore_dir)
    }

    pub(crate) fn run_restore(
        &self,
        archive: &mut ArchiveReader<Box<dyn Read + Send>>,
        restore_dir: &Path,
    ) -> Result<()> {
        self.emit_stage("reading backup archive", Stage::Scanning);

        let counters = RestoreCounters::new();
        let pool = BufferPool::new(RESTORE_WORKERS + 2);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        let record_error = |err: Error| {
            let mut slot = match first_error.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_none() {
                *slot = Some(err);
            }
        };

        let producer_result = thread::scope(|s| {
            let (jobs_tx, jobs_rx) = bounded::<RestoreJob>(RESTORE_WORKERS);

            for _ in 0..RESTORE_WORKERS {
                let jobs_rx = jobs_rx.clone();
                let pool = &pool;
                let counters = &counters;
                let record_error = &record_error;
                s.spawn(move || {
                    while let Ok(job) = jobs_rx.recv() {
                        if self.cancel().is_cancelled() {
                            return;
                        }
                        if let Err(err) = self.apply_restore_job(job, pool, counters) {
                            record_error(err);
                        }
                    }
                });
            }
            drop(jobs_rx);

            self.restore_produce(archive, restore_dir, &jobs_tx, &pool, &counters)
        });

        let worker_error = match first_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match (producer_result, worker_error) {
            (Err(err), Some(worker_err)) => {
                let stopped =
                    matches!(&err, Error::CorruptArchive { reason } if reason == WORKER_STOPPED);
                return Err(if stopped { worker_err } else { err });
            }
            (Err(err), None) => return Err(err),
            (Ok(()), Some(worker_err)) => return Err(worker_err),
            (Ok(()), None) => {}
        }

        self.cancel().check()?;
        self.emit_restoring(&counters, "restore complete".into(), true);
        Ok(())
    }

    fn restore_produce(
        &self,
        archive: &mut ArchiveReader<Box<dyn Read + Send>>,
        restore_dir: &Path,
        jobs: &Sender<RestoreJob>,
        pool: &BufferPool,
        counters: &RestoreCounters,
    ) -> Result<()> {
        let send = |job: RestoreJob| {
            jobs.send(job).map_err(|_| Error::CorruptArchive {
                reason: WORKER_STOPPED.to_string(),
            })
        };

        loop {
            self.cancel().check()?;

            let meta = match archive.next_entry()? {
                Some(meta) => meta,
                None => return Ok(()),
            };
            let dest = restore_dir.join(&meta.path);

            if is_internal_path(&meta.path) {
                if meta.path == MANIFEST_ENTRY_PATH {
                    let payload = archive.read_payload(meta.size)?;
                    if meta.has_crc {
                        archive.read_crc()?;
                    }
                    let manifest: BackupManifest = serde_json::from_slice(&payload)
                        .map_err(|err| Error::CorruptArchive {
                            reason: format!("invalid manifest: {err}"),
                        })?;
                    if manifest.backup_type == BackupType::Full {
                        let mut files = 0u64;
                        let mut bytes = 0u64;
                        for f in &manifest.files {
                            if f.is_dir {
                                continue;
                            }
                            let regular = !f.is_link && is_regular_mode(f.mode);
                            if f.is_link || regular {
                                files += 1;
                            }
                            if regular {
                                bytes += f.size;
                            }
                        }
                        counters.total_files.store(files, Ordering::Relaxed);
                        counters.total_bytes.store(bytes, Ordering::Relaxed);
                    } else {
                        counters.total_files.store(0, Ordering::Relaxed);
                        counters.total_bytes.store(0, Ordering::Relaxed);
                    }
                    self.emit_restoring(counters, "restoring".into(), true);
                } else {
                    archive.skip_payload(meta.size)?;
                    if meta.has_crc {
                        archive.read_crc()?;
                    }
                }
                continue;
            }

            if meta.deleted {
                archive.skip_payload(meta.size)?;
                if meta.has_crc {
                    archive.read_crc()?;
                }
                send(RestoreJob::Remove { dest })?;
                continue;
            }

            if meta.is_link || meta.is_dir {
                send(RestoreJob::Place { meta, dest })?;
                continue;
            }

            if !meta.is_regular() {
                // Sockets, fifos and other special files carry no payload
                // and are not materialized.
                archive.skip_payload(meta.size)?;
                if meta.has_crc {
                    archive.read_crc()?;
                }
                continue;
            }

            self.emit_restoring(counters, format!("restoring: {}", meta.path), true);

            let (pipe_tx, pipe_rx) = bounded::<PipeChunk>(4);
            let rel = meta.path.clone();
            let has_crc = meta.has_crc;
            let size = meta.size;
            send(RestoreJob::WriteFile {
                meta,
                dest,
                pipe: pipe_rx,
            })?;

            let copy_result =
                self.copy_payload_to_pipe(archive, &rel, size, has_crc, &pipe_tx, pool, counters);
            match copy_result {
                Ok(()) => {
                    drop(pipe_tx);
                    counters.files.fetch_add(1, Ordering::Relaxed);
                    self.emit_restoring(counters, format!("restored: {rel}"), true);
                }
                Err(err) => {
                    // Tell the worker the stream is dead, then surface the
                    // error to the caller.
                    let _ = pipe_tx.send(Err(Error::CorruptArchive {
                        reason: format!("payload stream for {rel} failed"),
                    }));
                    drop(pipe_tx);
                    return Err(err);
                }
            }
        }
    }

    fn copy_payload_to_pipe(
        &self,
        archive: &mut ArchiveReader<Box<dyn Read + Send>>,
        rel: &str,
        size: u64,
        has_crc: bool,
        pipe: &Sender<PipeChunk>,
        pool: &BufferPool,
        counters: &RestoreCounters,
    ) -> Result<()> {
        let mut crc = has_crc.then(crc32fast::Hasher::new);
        let mut remaining = size;

        while remaining > 0 {
            self.cancel().check()?;

            let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            let mut buf = pool.get();
            buf.resize(want, 0);
            let n = archive.inner_mut().read(&mut buf[..want])?;
            if n == 0 {
                pool.put(buf);
                return Err(Error::CorruptArchive {
                    reason: format!("truncated payload for {rel}"),
                });
            }
            buf.truncate(n);
            if let Some(crc) = crc.as_mut() {
                crc.update(&buf);
            }
            counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
            self.emit_restoring(counters, format!("restoring: {rel}"), false);

            pipe.send(Ok(buf)).map_err(|_| Error::CorruptArchive {
                reason: WORKER_STOPPED.to_string(),
            })?;
            remaining -= n as u64;
        }

        if let Some(crc) = crc {
            let expected = archive.read_crc()?;
            if crc.finalize() != expected {
                return Err(Error::CrcMismatch {
                    path: rel.to_string(),
                });
            }
        }
        Ok(())
    }

    fn apply_restore_job(
        &self,
        job: RestoreJob,
        pool: &BufferPool,
        counters: &RestoreCounters,
    ) -> Result<()> {
        match job {
            RestoreJob::Remove { dest } => remove_path(&dest),
            RestoreJob::Place { meta, dest } => {
                self.create_dir_or_link(&meta, &dest)?;
                if !meta.is_dir {
                    counters.files.fetch_add(1, Ordering::Relaxed);
                    self.emit_restoring(counters, format!("restored: {}", meta.path), true);
                }
                Ok(())
            }
            RestoreJob::WriteFile { meta, dest, pipe } => {
                self.write_file_from_pipe(&meta, dest, &pipe, pool)
            }
        }
    }

    /// Existing directories and symlinks are left as they are; only the
    /// conflict handler for regular files prompts the caller.
    fn create_dir_or_link(&self, meta: &FileMetadata, dest: &Path) -> Result<()> {
        if meta.is_link {
            #[cfg(unix)]
            {
                if let Err(err) = std::os::unix::fs::symlink(&meta.link_dest, dest) {
                    warn!(
                        dest = %dest.display(),
                        target = %meta.link_dest,
                        "could not create symlink: {err}"
                    );
                }
            }
            #[cfg(not(unix))]
            warn!(dest = %dest.display(), "symlinks are not restored on this platform");
            return Ok(());
        }

        if meta.is_dir {
            fs::create_dir_all(dest)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(err) = fs::set_permissions(dest, fs::Permissions::from_mode(meta.perm()))
                {
                    warn!(dest = %dest.display(), "could not chmod directory: {err}");
                }
            }
            if let Ok(dir) = File::open(dest) {
                set_file_times(&dir, meta);
            }
        }
        Ok(())
    }

    fn write_file_from_pipe(
        &self,
        meta: &FileMetadata,
        mut dest: PathBuf,
        pipe: &Receiver<PipeChunk>,
        pool: &BufferPool,
    ) -> Result<()> {
        if fs::symlink_metadata(&dest).is_ok() {
            if let Some(handler) = &self.conflict_handler {
                let action = match handler(&dest) {
                    Ok(action) => action,
                    Err(err) => {
                        drain_pipe(pipe, pool);
                        return Err(err);
                    }
                };
                match action {
                    ConflictAction::Skip => {
                        self.events()
                            .log_message(&format!("skipping existing file: {}", dest.display()));
                        // The pipe must still drain so the producer does not
                        // block on a full channel.
                        drain_pipe(pipe, pool);
                        return Ok(());
                    }
                    ConflictAction::KeepBoth => {
                        dest = keep_both_path(&dest);
                        self.events()
                            .log_message(&format!("keeping both, restoring to: {}", dest.display()));
                    }
                    ConflictAction::Overwrite => {
                        self.events()
                            .log_message(&format!("overwriting existing file: {}", dest.display()));
                    }
                }
            }
        }

        if let Some(parent) = dest.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                drain_pipe(pipe, pool);
                return Err(err.into());
            }
        }
        let mut file = match File::create(&dest) {
            Ok(file) => file,
            Err(err) => {
                drain_pipe(pipe, pool);
                return Err(err.into());
            }
        };

        loop {
            match pipe.recv() {
                Ok(Ok(buf)) => {
                    let write_result = file.write_all(&buf);
                    pool.put(buf);
                    if let Err(err) = write_result {
                        drain_pipe(pipe, pool);
                        return Err(err.into());
                    }
                }
                Ok(Err(_upstream)) => {
                    // The producer already owns the failure; leave the
                    // partial file for it to report.
                    return Ok(());
                }
                Err(_) => break,
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = file.set_permissions(fs::Permissions::from_mode(meta.perm())) {
                warn!(dest = %dest.display(), "could not chmod file: {err}");
            }
        }
        set_file_times(&file, meta);
        Ok(())
    }
}
