use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::error::PipelineError;

/// A body source that can be repositioned to its start.
pub trait SeekableSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekableSource for T {}

/// Body handed to [`Request::set_body`](crate::Request::set_body).
///
/// Only [`RequestBody::Bytes`] and [`RequestBody::Seekable`] are accepted by
/// `set_body`: both can be replayed byte-for-byte on every retry. A plain
/// stream has to go through [`Request::set_body_once`](crate::Request::set_body_once),
/// which marks the request as non-replayable.
pub enum RequestBody {
    /// Fully buffered content.
    Bytes(Bytes),
    /// Seekable source, re-read from offset 0 on every attempt.
    Seekable(Box<dyn SeekableSource>),
    /// Forward-only stream. Rejected by `set_body`.
    Stream(Box<dyn Read + Send>),
}

impl RequestBody {
    #[must_use]
    pub fn seekable(source: impl SeekableSource + 'static) -> Self {
        Self::Seekable(Box::new(source))
    }

    #[must_use]
    pub fn stream(source: impl Read + Send + 'static) -> Self {
        Self::Stream(Box::new(source))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Seekable(_) => f.write_str("Seekable(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

/// Body as stored on a request.
///
/// Cloning shares the underlying source. Buffered and seekable sources stay
/// independently replayable per clone; a one-shot source is consumed once for
/// the original and all its clones.
#[derive(Clone)]
pub enum BodySource {
    Buffered(Bytes),
    Seekable(Arc<Mutex<Box<dyn SeekableSource>>>),
    OneShot(Arc<Mutex<Option<Box<dyn Read + Send>>>>),
}

impl BodySource {
    pub fn replayable(body: RequestBody) -> Result<Self, PipelineError> {
        match body {
            RequestBody::Bytes(bytes) => Ok(Self::Buffered(bytes)),
            RequestBody::Seekable(source) => Ok(Self::Seekable(Arc::new(Mutex::new(source)))),
            RequestBody::Stream(_) => Err(PipelineError::InvalidArgument(
                "request body stream is neither seekable nor buffered; \
                 buffer it or use set_body_once"
                    .to_owned(),
            )),
        }
    }

    pub fn one_shot(source: Box<dyn Read + Send>) -> Self {
        Self::OneShot(Arc::new(Mutex::new(Some(source))))
    }

    /// Read the whole body from its start.
    ///
    /// Consumes a one-shot source; reading it again fails with
    /// [`PipelineError::BodyNotReplayable`].
    pub fn read_all(&self) -> Result<Bytes, PipelineError> {
        match self {
            Self::Buffered(bytes) => Ok(bytes.clone()),
            Self::Seekable(source) => {
                let mut source = source.lock();
                source.seek(SeekFrom::Start(0)).map_err(PipelineError::Body)?;
                let mut buf = Vec::new();
                source.read_to_end(&mut buf).map_err(PipelineError::Body)?;
                Ok(Bytes::from(buf))
            }
            Self::OneShot(slot) => {
                let mut source = slot.lock().take().ok_or(PipelineError::BodyNotReplayable)?;
                let mut buf = Vec::new();
                source.read_to_end(&mut buf).map_err(PipelineError::Body)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Prepare the body for another read from byte 0.
    pub fn rewind(&self) -> Result<(), PipelineError> {
        match self {
            Self::Buffered(_) => Ok(()),
            Self::Seekable(source) => source
                .lock()
                .seek(SeekFrom::Start(0))
                .map(|_| ())
                .map_err(PipelineError::Body),
            Self::OneShot(slot) => {
                if slot.lock().is_some() {
                    Ok(())
                } else {
                    Err(PipelineError::BodyNotReplayable)
                }
            }
        }
    }

    /// Length in bytes, when it can be known without consuming the body.
    pub fn content_length(&self) -> Result<Option<u64>, PipelineError> {
        match self {
            Self::Buffered(bytes) => Ok(Some(bytes.len() as u64)),
            Self::Seekable(source) => {
                let mut source = source.lock();
                let len = source.seek(SeekFrom::End(0)).map_err(PipelineError::Body)?;
                source.seek(SeekFrom::Start(0)).map_err(PipelineError::Body)?;
                Ok(Some(len))
            }
            Self::OneShot(_) => Ok(None),
        }
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::OneShot(_))
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(b) => f.debug_tuple("Buffered").field(&b.len()).finish(),
            Self::Seekable(_) => f.write_str("Seekable(..)"),
            Self::OneShot(_) => f.write_str("OneShot(..)"),
        }
    }
}
