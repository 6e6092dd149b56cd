use std::fmt;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use crate::data::FrameInfo;

mod tasks;

pub use tasks::{Task, TaskPool};

// A fixed set of surfaces sitting on one stage boundary.
//
// Surfaces are allocated once and live as long as the pipeline. The pool itself never
// marks anything as owned: whichever device stage takes a surface as input or output
// bumps its lock count, and drops it once the work touching the surface has completed.
// Scanning is O(n); pools hold a handful of entries.
pub struct SurfacePool {
    info: FrameInfo,
    slots: Arc<[SurfaceSlot]>,
}

#[derive(Debug, Default)]
struct SurfaceSlot {
    locked: AtomicU16,
}

// Index handle into a pool. Cheap to clone; all clones observe the same lock count.
#[derive(Clone)]
pub struct Surface {
    index: usize,
    info: FrameInfo,
    slots: Arc<[SurfaceSlot]>,
}

impl SurfacePool {
    pub fn new(info: FrameInfo, count: usize) -> Self {
        let slots: Vec<SurfaceSlot> = (0..count).map(|_| SurfaceSlot::default()).collect();
        Self {
            info,
            slots: slots.into(),
        }
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // First surface nobody holds a lock on. `None` is backpressure, not an error: the
    // caller has to let in-flight work complete before asking again.
    pub fn acquire_free(&self) -> Option<Surface> {
        self.slots
            .iter()
            .position(|slot| slot.locked.load(SeqCst) == 0)
            .map(|index| self.handle(index))
    }

    pub fn surface(&self, index: usize) -> Option<Surface> {
        if index < self.slots.len() {
            Some(self.handle(index))
        } else {
            None
        }
    }

    pub fn num_locked(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.locked.load(SeqCst) > 0)
            .count()
    }

    fn handle(&self, index: usize) -> Surface {
        Surface {
            index,
            info: self.info,
            slots: self.slots.clone(),
        }
    }
}

impl Surface {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn lock(&self) {
        self.slots[self.index].locked.fetch_add(1, SeqCst);
    }

    pub fn unlock(&self) {
        let _ = self.slots[self.index]
            .locked
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1));
    }

    pub fn lock_count(&self) -> u16 {
        self.slots[self.index].locked.load(SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("index", &self.index)
            .field("locked", &self.lock_count())
            .finish()
    }
}
