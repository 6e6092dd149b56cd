use std::io::{ErrorKind, Read, Write};

use bytes::{Bytes, BytesMut};

use crate::PipelineError;

// Where compressed input comes from. `None` is end of input.
pub trait ChunkSource {
    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, PipelineError>;
}

// Where encoded frames go, one `write_chunk` per frame
pub trait ChunkSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), PipelineError>;

    fn finish(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> ChunkSource for ReaderSource<R> {
    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, PipelineError> {
        if max_len == 0 {
            return Ok(Some(Bytes::new()));
        }
        let mut buf = BytesMut::zeroed(max_len);
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf.freeze()));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PipelineError::SourceRead(e)),
            }
        }
    }
}

pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ChunkSink for WriterSink<W> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        self.writer
            .write_all(chunk)
            .map_err(PipelineError::SinkWrite)
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.writer.flush().map_err(PipelineError::SinkWrite)
    }
}

// Output disabled; frames are still synced and counted
pub struct NullSink;

impl ChunkSink for NullSink {
    fn write_chunk(&mut self, _chunk: &[u8]) -> Result<(), PipelineError> {
        Ok(())
    }
}
