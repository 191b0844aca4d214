/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::buffer::replacement::PageReplacer;
use crate::common::BufferFrameIdT;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// An LRU eviction policy for the database buffer.
///
/// Frames are ordered by the monotonic stamp assigned when they were last
/// unpinned: the smallest stamp is the least recently unpinned frame and is
/// the next victim. The side map from frame ID to stamp makes `pin` and
/// `unpin` O(log n).
pub struct LRUReplacer {
    state: Mutex<LRUState>,
}

struct LRUState {
    /// Stamp-ordered queue; the first entry is the eviction candidate.
    queue: BTreeMap<u64, BufferFrameIdT>,
    /// Mapping of a frame ID to its stamp in the queue.
    stamps: HashMap<BufferFrameIdT, u64>,
    /// Next stamp to hand out.
    next_stamp: u64,
}

impl LRUReplacer {
    pub fn new(buffer_size: BufferFrameIdT) -> Self {
        Self {
            state: Mutex::new(LRUState {
                queue: BTreeMap::new(),
                stamps: HashMap::with_capacity(buffer_size as usize),
                next_stamp: 0,
            }),
        }
    }
}

impl PageReplacer for LRUReplacer {
    fn victim(&self) -> Option<BufferFrameIdT> {
        let mut state = self.state.lock().unwrap();
        let (&stamp, &frame_id) = state.queue.iter().next()?;
        state.queue.remove(&stamp);
        state.stamps.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&self, frame_id: BufferFrameIdT) {
        let mut state = self.state.lock().unwrap();
        if let Some(stamp) = state.stamps.remove(&frame_id) {
            state.queue.remove(&stamp);
        }
    }

    fn unpin(&self, frame_id: BufferFrameIdT) {
        let mut state = self.state.lock().unwrap();
        // Repeated unpins have no effect on the eviction order.
        if state.stamps.contains_key(&frame_id) {
            return;
        }
        let stamp = state.next_stamp;
        state.next_stamp += 1;
        state.queue.insert(stamp, frame_id);
        state.stamps.insert(frame_id, stamp);
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}
