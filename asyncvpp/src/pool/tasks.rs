use crate::accel::SyncPoint;
use crate::data::Bitstream;
use crate::PipelineError;

// One outstanding encode operation and the buffer its output lands in
#[derive(Debug)]
pub struct Task {
    bitstream: Bitstream,
    sync: Option<SyncPoint>,
}

impl Task {
    pub fn sync_point(&self) -> Option<SyncPoint> {
        self.sync
    }

    pub fn bitstream(&self) -> &Bitstream {
        &self.bitstream
    }
}

// Circular pool of `async_depth` tasks.
//
// Outstanding tasks always form one contiguous run starting at `head`; claims happen at
// the tail and flushes at the head, so the flush order is the claim order.
#[derive(Debug)]
pub struct TaskPool {
    tasks: Vec<Task>,
    head: usize,
    outstanding: usize,
}

impl TaskPool {
    pub fn new(depth: usize, max_bitstream: usize) -> Result<Self, PipelineError> {
        if depth == 0 || depth > crate::MAX_ASYNC_DEPTH {
            return Err(PipelineError::InvalidAsyncDepth(depth));
        }
        let tasks = (0..depth)
            .map(|_| Task {
                bitstream: Bitstream::with_capacity(max_bitstream),
                sync: None,
            })
            .collect();
        Ok(Self {
            tasks,
            head: 0,
            outstanding: 0,
        })
    }

    pub fn depth(&self) -> usize {
        self.tasks.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    // A task with no completion token, searched from the FIFO tail
    pub fn acquire_free(&self) -> Option<usize> {
        let len = self.tasks.len();
        let tail = self.head + self.outstanding;
        (0..len)
            .map(|i| (tail + i) % len)
            .find(|&i| self.tasks[i].sync.is_none())
    }

    // Record the token of an encode issued into `index`
    pub fn claim(&mut self, index: usize, sync: SyncPoint) -> Result<(), PipelineError> {
        let tail = (self.head + self.outstanding) % self.tasks.len();
        if index != tail || self.tasks[index].sync.is_some() {
            return Err(PipelineError::TaskOutOfOrder {
                index,
                expected: tail,
            });
        }
        self.tasks[index].sync = Some(sync);
        self.outstanding += 1;
        Ok(())
    }

    pub fn oldest_outstanding(&self) -> Option<usize> {
        if self.outstanding > 0 {
            Some(self.head)
        } else {
            None
        }
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub(crate) fn bitstream_mut(&mut self, index: usize) -> &mut Bitstream {
        &mut self.tasks[index].bitstream
    }

    // Only the head may be recycled, and only once its token was waited on and its data
    // written out. Clears the token, resets the byte markers and advances the head.
    pub fn recycle(&mut self, index: usize) -> Result<(), PipelineError> {
        match self.oldest_outstanding() {
            Some(head) if head == index => {}
            _ => {
                return Err(PipelineError::TaskOutOfOrder {
                    index,
                    expected: self.head,
                })
            }
        }
        let task = &mut self.tasks[index];
        task.sync = None;
        task.bitstream.reset();
        self.head = (self.head + 1) % self.tasks.len();
        self.outstanding -= 1;
        Ok(())
    }
}
