//! Request body buffer that spills large bodies to a temporary file.

use crate::{errors::Error, http::types::StatusCode};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};
use tokio::runtime::{Handle, RuntimeFlavor};

/// Backing store of a body buffer.
pub trait Storage: Read + Write + Seek + Send + Sync {}

impl<T: Read + Write + Seek + Send + Sync> Storage for T {}

/// Body of known length, fed in pieces by the connection.
///
/// Declared sizes up to the memory threshold are kept in a `Vec`, larger
/// ones go to an anonymous temporary file removed on drop. Once the last
/// declared byte arrives the buffer rewinds itself so it can be read from
/// the start.
///
/// Disk work of a spilled body leaves the async worker through
/// [`tokio::task::block_in_place`] on multi-threaded runtimes.
///
/// ```
/// use std::io::Read;
/// use wicket::HttpData;
///
/// let mut data = HttpData::new(5, 1024).unwrap();
/// data.feed(b"hel").unwrap();
/// data.feed(b"lo").unwrap();
/// assert!(data.is_complete());
///
/// let mut body = String::new();
/// data.read_to_string(&mut body).unwrap();
/// assert_eq!(body, "hello");
/// ```
pub struct HttpData {
    size: u64,
    written: u64,
    in_memory: bool,
    storage: Box<dyn Storage>,
}

impl HttpData {
    /// Picks the backing store from `size` and the `memory_limit` threshold.
    pub fn new(size: u64, memory_limit: u64) -> Result<Self, Error> {
        let (in_memory, storage): (bool, Box<dyn Storage>) = match size > memory_limit {
            true => (false, Box::new(blocking(tempfile::tempfile)?)),
            false => (true, Box::new(Cursor::new(Vec::with_capacity(size as usize)))),
        };

        Ok(Self {
            size,
            written: 0,
            in_memory,
            storage,
        })
    }

    /// Appends a chunk.
    ///
    /// A chunk that would push the total past the declared size fails with
    /// [`Error::BodyTooLarge`] and is not written at all.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let total = self.written + chunk.len() as u64;
        if total > self.size {
            return Err(Error::BodyTooLarge);
        }

        let complete = total == self.size;
        let storage = &mut self.storage;
        let mut write = || -> io::Result<()> {
            storage.write_all(chunk)?;
            if complete {
                storage.flush()?;
                storage.seek(SeekFrom::Start(0))?;
            }
            Ok(())
        };

        match self.in_memory {
            true => write()?,
            false => blocking(write)?,
        }
        self.written = total;
        Ok(())
    }

    /// Fed bytes equal the declared size.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.written == self.size
    }

    /// Moves the read position back to the first byte.
    pub fn rewind(&mut self) -> Result<(), Error> {
        self.storage.flush()?;
        self.storage.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Declared size.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes fed so far.
    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Reads the remaining bytes into a `Vec`.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::with_capacity(self.size as usize);
        self.storage.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Deserializes the remaining bytes as JSON.
    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        serde_json::from_reader(&mut self.storage).map_err(|_| Error::Status(StatusCode::BadRequest))
    }
}

/// Runs disk work without stalling the other tasks of a multi-threaded
/// runtime; inline anywhere else.
fn blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(work),
        _ => work(),
    }
}

impl Read for HttpData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.storage.read(buf)
    }
}

impl fmt::Debug for HttpData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpData")
            .field("size", &self.size)
            .field("written", &self.written)
            .field("in_memory", &self.in_memory)
            .finish()
    }
}
