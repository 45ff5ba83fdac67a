//! Reserved upload seam: remote targets can stand in for the file sink
//!
//! Concrete transports (FTP, S3, …) live outside the core. The engine only
//! needs a `Write`-shaped adapter that feeds an [`Uploader`] through a pipe.

use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, Read, Seek, Write};
use std::thread::{self, JoinHandle};

/// Remote sink contract. Implementations are expected to be sequential;
/// the engine drives one upload at a time.
pub trait Uploader: Send {
    fn upload(&mut self, path: &str, reader: &mut dyn Read) -> Result<()>;

    /// Server-side-append capable transports can resume from
    /// `get_remote_size`.
    fn upload_with_resume(
        &mut self,
        path: &str,
        reader: &mut (dyn ReadSeek),
        size: u64,
    ) -> Result<()>;

    fn get_remote_size(&mut self, path: &str) -> Result<u64>;

    fn close(&mut self) -> Result<()>;
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
    }
}

/// `Write` adapter that streams archive bytes into `Uploader::upload` on a
/// background thread, so the backup pipeline can target a remote path the
/// same way it targets a file.
pub struct UploadSink {
    tx: Option<Sender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl UploadSink {
    pub fn new<U: Uploader + 'static>(mut uploader: U, remote_path: &str) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(8);
        let path = remote_path.to_string();
        let worker = thread::spawn(move || {
            let mut reader = ChannelReader {
                rx,
                current: Vec::new(),
                pos: 0,
            };
            let result = uploader.upload(&path, &mut reader);
            let close_result = uploader.close();
            result.and(close_result)
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Close the stream and wait for the upload to complete.
    pub fn finish(mut self) -> Result<()> {
        drop(self.tx.take());
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "upload worker panicked",
            )))?,
            None => Ok(()),
        }
    }
}

impl Write for UploadSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "upload sink closed"))?;
        tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload worker stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
