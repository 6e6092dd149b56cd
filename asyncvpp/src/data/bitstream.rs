use crate::PipelineError;

// A fixed-capacity byte buffer with a window of valid data.
//
// Used both for the compressed input the decoder eats from, and for the encoded output
// of each task. The backing allocation is made once and reused for the pipeline lifetime;
// only the offset/length markers move.
#[derive(Debug)]
pub struct Bitstream {
    data: Vec<u8>,
    offset: usize,
    length: usize,
}

impl Bitstream {
    pub fn with_capacity(max_length: usize) -> Self {
        Self {
            data: vec![0u8; max_length],
            offset: 0,
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    // Number of valid bytes
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.length
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    // Move the unconsumed window to the front, then copy `chunk` behind it
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        if chunk.len() > self.free_space() {
            return Err(PipelineError::BitstreamOverflow {
                capacity: self.capacity(),
            });
        }
        if self.offset > 0 {
            self.data
                .copy_within(self.offset..self.offset + self.length, 0);
            self.offset = 0;
        }
        let end = self.length + chunk.len();
        self.data[self.length..end].copy_from_slice(chunk);
        self.length = end;
        Ok(())
    }

    // Mark `n` bytes at the front of the window as consumed
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.length);
        self.offset += n;
        self.length -= n;
        if self.length == 0 {
            self.offset = 0;
        }
    }

    // Replace the contents with `payload`
    pub fn fill(&mut self, payload: &[u8]) -> Result<(), PipelineError> {
        if payload.len() > self.capacity() {
            return Err(PipelineError::NotEnoughBuffer {
                needed: payload.len(),
                capacity: self.capacity(),
            });
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.offset = 0;
        self.length = payload.len();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
    }
}
