//! Ordered chunk pipelines shared by the compression and encryption streams
//!
//! Both stream layers move fixed-size chunks through the same shape: a
//! producer hands chunks with monotonically increasing ids to a worker pool,
//! and an aggregator restores strict id order before the bytes reach the
//! next layer. The first error observed anywhere wins; later ones are
//! dropped while the channels drain.

use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) fn worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Transform applied to chunk `id`. Returns the exact bytes to emit.
pub(crate) type ChunkFn = Arc<dyn Fn(u64, Vec<u8>) -> Result<Vec<u8>> + Send + Sync>;

/// Reads the next raw chunk from the inner source; `None` ends the stream.
pub(crate) type FrameFn<R> = Box<dyn FnMut(&mut R) -> Result<Option<Vec<u8>>> + Send>;

type ChunkResult = (u64, Result<Vec<u8>>);

fn spawn_workers(
    count: usize,
    jobs: Receiver<(u64, Vec<u8>)>,
    results: Sender<ChunkResult>,
    transform: ChunkFn,
    failed: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let jobs = jobs.clone();
            let results = results.clone();
            let transform = transform.clone();
            let failed = failed.clone();
            thread::spawn(move || {
                while let Ok((id, data)) = jobs.recv() {
                    match transform(id, data) {
                        Ok(out) => {
                            if results.send((id, Ok(out))).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            failed.store(true, Ordering::SeqCst);
                            let _ = results.send((id, Err(err)));
                            return;
                        }
                    }
                }
            })
        })
        .collect()
}

/// Chunking writer: buffers caller bytes into fixed-size chunks, transforms
/// them in parallel and writes the results to the inner sink in id order.
pub(crate) struct OrderedWriter<W: Write + Send + 'static> {
    chunk_size: usize,
    buffer: Vec<u8>,
    next_id: u64,
    jobs: Option<Sender<(u64, Vec<u8>)>>,
    results_guard: Option<Sender<ChunkResult>>,
    workers: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<(W, Option<Error>)>>,
    failed: Arc<AtomicBool>,
}

impl<W: Write + Send + 'static> OrderedWriter<W> {
    pub(crate) fn new(inner: W, chunk_size: usize, transform: ChunkFn) -> Self {
        let workers = worker_count();
        let (jobs_tx, jobs_rx) = bounded::<(u64, Vec<u8>)>(workers);
        let (results_tx, results_rx) = bounded::<ChunkResult>(workers);
        let failed = Arc::new(AtomicBool::new(false));

        let handles = spawn_workers(
            workers,
            jobs_rx,
            results_tx.clone(),
            transform,
            failed.clone(),
        );

        let agg_failed = failed.clone();
        let aggregator = thread::spawn(move || {
            let mut inner = inner;
            let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
            let mut next_write = 0u64;
            let mut first_err: Option<Error> = None;

            while let Ok((id, result)) = results_rx.recv() {
                match result {
                    Err(err) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                    Ok(data) => {
                        pending.insert(id, data);
                        while let Some(data) = pending.remove(&next_write) {
                            if first_err.is_none() {
                                if let Err(err) = inner.write_all(&data) {
                                    agg_failed.store(true, Ordering::SeqCst);
                                    first_err = Some(err.into());
                                }
                            }
                            next_write += 1;
                        }
                    }
                }
            }
            (inner, first_err)
        });

        Self {
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            next_id: 0,
            jobs: Some(jobs_tx),
            results_guard: Some(results_tx),
            workers: handles,
            aggregator: Some(aggregator),
            failed,
        }
    }

    fn dispatch(&mut self, data: Vec<u8>) -> io::Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::WriterClosed.into_io())?;
        jobs.send((self.next_id, data))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream pipeline stopped"))?;
        self.next_id += 1;
        Ok(())
    }

    /// Flush the final short chunk, join the pipeline and return the inner
    /// sink. An empty final chunk is still dispatched so transforms can emit
    /// their end-of-stream framing.
    pub(crate) fn finish(mut self) -> Result<W> {
        let tail = std::mem::take(&mut self.buffer);
        let _ = self.dispatch(tail);

        drop(self.jobs.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        drop(self.results_guard.take());

        let aggregator = self.aggregator.take().ok_or(Error::WriterClosed)?;
        let (inner, err) = aggregator.join().map_err(|_| Error::CorruptArchive {
            reason: "stream pipeline thread panicked".into(),
        })?;
        match err {
            Some(err) => Err(err),
            None => Ok(inner),
        }
    }
}

impl<W: Write + Send + 'static> Write for OrderedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "stream pipeline failed",
            ));
        }
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= self.chunk_size {
            let rest = self.buffer.split_off(self.chunk_size);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            self.dispatch(chunk)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Chunk framing cannot flush partial chunks; bytes drain on finish.
        Ok(())
    }
}

/// Ordered parallel reader: a producer thread slices the inner source into
/// chunks, workers transform them, and reads observe the results in id order.
pub(crate) struct OrderedReader {
    out: Receiver<Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
    failed: bool,
}

impl OrderedReader {
    pub(crate) fn spawn<R: Read + Send + 'static>(
        inner: R,
        mut frame: FrameFn<R>,
        transform: ChunkFn,
    ) -> Self {
        let workers = worker_count();
        let (jobs_tx, jobs_rx) = bounded::<(u64, Vec<u8>)>(workers);
        let (results_tx, results_rx) = bounded::<ChunkResult>(workers);
        let (out_tx, out_rx) = bounded::<Result<Vec<u8>>>(workers);
        let failed = Arc::new(AtomicBool::new(false));

        let producer_results = results_tx.clone();
        thread::spawn(move || {
            let mut inner = inner;
            let mut next_id = 0u64;
            loop {
                match frame(&mut inner) {
                    Ok(Some(data)) => {
                        if jobs_tx.send((next_id, data)).is_err() {
                            return;
                        }
                        next_id += 1;
                    }
                    Ok(None) => return,
                    Err(err) => {
                        let _ = producer_results.send((next_id, Err(err)));
                        return;
                    }
                }
            }
        });

        spawn_workers(workers, jobs_rx, results_tx, transform, failed);

        thread::spawn(move || {
            let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
            let mut next_out = 0u64;
            let mut stream_err: Option<(u64, Error)> = None;

            while let Ok((id, result)) = results_rx.recv() {
                match result {
                    Err(err) => {
                        if stream_err.as_ref().map_or(true, |(eid, _)| id < *eid) {
                            stream_err = Some((id, err));
                        }
                    }
                    Ok(data) => {
                        pending.insert(id, data);
                    }
                }
                while let Some(data) = pending.remove(&next_out) {
                    if out_tx.send(Ok(data)).is_err() {
                        return;
                    }
                    next_out += 1;
                }
                let due = matches!(&stream_err, Some((err_id, _)) if *err_id == next_out);
                if due {
                    if let Some((_, err)) = stream_err.take() {
                        let _ = out_tx.send(Err(err));
                    }
                    return;
                }
            }

            // Channels disconnected: flush what arrived in order, then
            // surface any error recorded past a gap.
            while let Some(data) = pending.remove(&next_out) {
                if out_tx.send(Ok(data)).is_err() {
                    return;
                }
                next_out += 1;
            }
            if let Some((_, err)) = stream_err {
                let _ = out_tx.send(Err(err));
            }
        });

        Self {
            out: out_rx,
            current: Vec::new(),
            pos: 0,
            failed: false,
        }
    }
}

impl Read for OrderedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "stream pipeline failed",
            ));
        }
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.out.recv() {
                Ok(Ok(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = true;
                    return Err(err.into_io());
                }
                Err(_) => return Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ChunkFn {
        Arc::new(|_, data| Ok(data))
    }

    #[test]
    fn test_writer_preserves_order() {
        let transform: ChunkFn = Arc::new(|id, data| {
            // Stagger completion so late ids finish first.
            if id % 2 == 0 {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(data)
        });
        let mut writer = OrderedWriter::new(Vec::new(), 4, transform);
        let input: Vec<u8> = (0..64u8).collect();
        writer.write_all(&input).unwrap();
        let out = writer.finish().unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_writer_short_final_chunk() {
        let mut writer = OrderedWriter::new(Vec::new(), 8, identity());
        writer.write_all(b"abcdefghij").unwrap();
        let out = writer.finish().unwrap();
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn test_writer_surfaces_transform_error() {
        let transform: ChunkFn = Arc::new(|id, data| {
            if id == 1 {
                Err(Error::CorruptArchive {
                    reason: "boom".into(),
                })
            } else {
                Ok(data)
            }
        });
        let mut writer = OrderedWriter::new(Vec::new(), 2, transform);
        let _ = writer.write_all(&[0u8; 64]);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_reader_reassembles_in_order() {
        let source: Vec<u8> = (0..100u8).collect();
        let frame: FrameFn<io::Cursor<Vec<u8>>> = Box::new(|r| {
            let mut chunk = vec![0u8; 7];
            let n = r.read(&mut chunk)?;
            chunk.truncate(n);
            Ok(if n == 0 { None } else { Some(chunk) })
        });
        let mut reader = OrderedReader::spawn(io::Cursor::new(source.clone()), frame, identity());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn test_reader_surfaces_frame_error_after_valid_prefix() {
        let mut calls = 0;
        let frame: FrameFn<io::Cursor<Vec<u8>>> = Box::new(move |_| {
            calls += 1;
            if calls <= 2 {
                Ok(Some(vec![calls as u8; 3]))
            } else {
                Err(Error::CorruptArchive {
                    reason: "bad frame".into(),
                })
            }
        });
        let mut reader = OrderedReader::spawn(io::Cursor::new(Vec::new()), frame, identity());
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        let err = loop {
            match reader.read(&mut buf) {
                Ok(0) => panic!("expected the pipeline to surface the frame error"),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) => break err,
            }
        };
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2]);
        assert!(err.to_string().contains("bad frame"));
    }
}
