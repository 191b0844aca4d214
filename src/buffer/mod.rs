/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::buffer::replacement::lru::LRUReplacer;
use crate::buffer::replacement::slow::SlowReplacer;
use crate::buffer::replacement::{PageReplacer, ReplacerAlgorithm};
use crate::common::{BufferFrameIdT, PageIdT, PAGE_SIZE};
use crate::disk::{FileStore, FileStoreError, FileType};

use log::{debug, error};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

pub mod replacement;

/// A single buffer frame contained in the buffer pool.
///
/// The frame holds one disk page's bytes plus the book-keeping the pool
/// needs: a pin count (number of active references that require the frame to
/// stay resident) and a dirty flag (the in-memory bytes differ from disk).
/// Which page the frame currently hosts is recorded in the pool's guarded
/// state, not here, so the pool mutex stays the single synchronization point
/// for residency.
pub struct Frame {
    /// A unique identifier for this buffer frame.
    id: BufferFrameIdT,

    /// The hosted page's data.
    data: RwLock<[u8; PAGE_SIZE as usize]>,

    /// Number of active references to the hosted page.
    pin_count: AtomicU32,

    /// True if the hosted page has been modified since being read from disk.
    dirty: AtomicBool,
}

impl Frame {
    fn new(id: BufferFrameIdT) -> Self {
        Self {
            id,
            data: RwLock::new([0; PAGE_SIZE as usize]),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Return the frame ID.
    pub fn id(&self) -> BufferFrameIdT {
        self.id
    }

    /// Return a read latch on the page data.
    /// The latch must be released before unpinning the page.
    pub fn data(&self) -> RwLockReadGuard<[u8; PAGE_SIZE as usize]> {
        self.data.read().unwrap()
    }

    /// Return a write latch on the page data.
    /// The latch must be released before unpinning the page.
    pub fn data_mut(&self) -> RwLockWriteGuard<[u8; PAGE_SIZE as usize]> {
        self.data.write().unwrap()
    }

    /// Return the pin count of this buffer frame.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    /// Return the dirty flag of this buffer frame.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

/// Book-keeping guarded by the single pool mutex. Every frame is in exactly
/// one of three places: the free list, or the page table with a pin count of
/// zero (tracked by the replacer), or the page table with a positive pin
/// count.
struct PoolState {
    /// Mapping of resident pages to the frames that host them.
    page_table: HashMap<(FileType, PageIdT), BufferFrameIdT>,

    /// Frames that have never hosted a page, or whose content was abandoned.
    free_list: VecDeque<BufferFrameIdT>,

    /// Reverse mapping: the page each frame currently hosts, if any.
    residents: Vec<Option<(FileType, PageIdT)>>,
}

/// The buffer pool manager reads disk pages into a fixed set of in-memory
/// frames and writes modified frames back through the file store. Victim
/// frames are preferred from the free list; otherwise the replacement policy
/// chooses among unpinned resident pages.
///
/// All operations are serialized by the pool mutex. When constructed with
/// `wait_on_exhaustion`, fetch and append block on a condition variable
/// until some caller unpins a page; otherwise exhaustion is surfaced as
/// `BufferError::PoolExhausted`.
pub struct BufferPoolManager {
    /// Fixed array of frames, created once at pool construction.
    frames: Vec<Arc<Frame>>,

    /// File store for reading from and writing to disk.
    file_store: FileStore,

    /// Page replacement manager.
    replacer: Box<dyn PageReplacer + Send + Sync>,

    /// Page table, free list, and residency records.
    state: Mutex<PoolState>,

    /// Signaled whenever a page's pin count reaches zero.
    frame_available: Condvar,

    /// Whether to block instead of failing when every frame is pinned.
    wait_on_exhaustion: bool,
}

impl BufferPoolManager {
    /// Construct a new buffer pool manager. Initially, every frame is in the
    /// free list.
    pub fn new(
        pool_size: BufferFrameIdT,
        file_store: FileStore,
        algorithm: ReplacerAlgorithm,
        wait_on_exhaustion: bool,
    ) -> Self {
        let replacer: Box<dyn PageReplacer + Send + Sync> = match algorithm {
            ReplacerAlgorithm::Lru => Box::new(LRUReplacer::new(pool_size)),
            ReplacerAlgorithm::Slow => Box::new(SlowReplacer::new(pool_size)),
        };

        let mut frames = Vec::with_capacity(pool_size as usize);
        let mut free_list = VecDeque::with_capacity(pool_size as usize);
        for frame_id in 0..pool_size {
            frames.push(Arc::new(Frame::new(frame_id)));
            free_list.push_back(frame_id);
        }

        Self {
            frames,
            file_store,
            replacer,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size as usize),
                free_list,
                residents: vec![None; pool_size as usize],
            }),
            frame_available: Condvar::new(),
            wait_on_exhaustion,
        }
    }

    /// Fetch the specified page, pin it, and return its frame.
    ///
    /// If the page is not resident it is read from disk into a victim frame,
    /// writing the victim's content back first when dirty. Every successful
    /// fetch must be paired with exactly one `unpin_page` once the caller is
    /// done with the frame (and has released any data latch on it).
    pub fn fetch_page(
        &self,
        file_type: FileType,
        page_id: PageIdT,
    ) -> Result<Arc<Frame>, BufferError> {
        let mut state = self.state.lock().unwrap();

        loop {
            // If the page is already resident, pin it and return its frame.
            if let Some(&frame_id) = state.page_table.get(&(file_type, page_id)) {
                let frame = &self.frames[frame_id as usize];
                if frame.pin_count() == 0 {
                    self.replacer.pin(frame_id);
                }
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                return Ok(Arc::clone(frame));
            }

            // Otherwise the page must replace a victim. If no victim exists,
            // give up or wait for an unpin, re-checking residency afterwards.
            match self.take_victim(&mut state)? {
                Some(frame_id) => {
                    let frame = &self.frames[frame_id as usize];
                    state.page_table.insert((file_type, page_id), frame_id);
                    state.residents[frame_id as usize] = Some((file_type, page_id));
                    frame.pin_count.store(1, Ordering::SeqCst);
                    frame.dirty.store(false, Ordering::SeqCst);

                    let read_result = {
                        let mut data = frame.data_mut();
                        self.file_store.read_raw_page(file_type, page_id, &mut data)
                    };
                    if let Err(e) = read_result {
                        // Abandon the half-installed frame back to the free
                        // list so the failed fetch leaks nothing.
                        state.page_table.remove(&(file_type, page_id));
                        state.residents[frame_id as usize] = None;
                        frame.pin_count.store(0, Ordering::SeqCst);
                        state.free_list.push_back(frame_id);
                        if self.wait_on_exhaustion {
                            self.frame_available.notify_one();
                        }
                        return Err(e.into());
                    }
                    return Ok(Arc::clone(frame));
                }
                None => {
                    if !self.wait_on_exhaustion {
                        return Err(BufferError::PoolExhausted);
                    }
                    state = self.frame_available.wait(state).unwrap();
                }
            }
        }
    }

    /// Append a new zeroed page to the file, pin it, and return its frame.
    ///
    /// The page is written through to disk immediately, pre-extending the
    /// file so subsequent fetches of this page ID are defined.
    pub fn append_new_page(
        &self,
        file_type: FileType,
        page_id: PageIdT,
    ) -> Result<Arc<Frame>, BufferError> {
        let mut state = self.state.lock().unwrap();

        loop {
            match self.take_victim(&mut state)? {
                Some(frame_id) => {
                    let frame = &self.frames[frame_id as usize];
                    state.page_table.insert((file_type, page_id), frame_id);
                    state.residents[frame_id as usize] = Some((file_type, page_id));
                    frame.pin_count.store(1, Ordering::SeqCst);
                    frame.dirty.store(false, Ordering::SeqCst);

                    let write_result = {
                        let mut data = frame.data_mut();
                        *data = [0; PAGE_SIZE as usize];
                        self.file_store.write_raw_page(file_type, page_id, &data)
                    };
                    if let Err(e) = write_result {
                        state.page_table.remove(&(file_type, page_id));
                        state.residents[frame_id as usize] = None;
                        frame.pin_count.store(0, Ordering::SeqCst);
                        state.free_list.push_back(frame_id);
                        if self.wait_on_exhaustion {
                            self.frame_available.notify_one();
                        }
                        return Err(e.into());
                    }
                    debug!("appended new page {:?}:{}", file_type, page_id);
                    return Ok(Arc::clone(frame));
                }
                None => {
                    if !self.wait_on_exhaustion {
                        return Err(BufferError::PoolExhausted);
                    }
                    state = self.frame_available.wait(state).unwrap();
                }
            }
        }
    }

    /// Unpin the specified page.
    ///
    /// `is_dirty` is OR-ed into the frame's dirty flag; unpinning never
    /// clears it. Unpinning a page that is not resident succeeds as a no-op.
    /// Returns `false` if the page's pin count is already zero, which
    /// indicates a caller bug. Callers must release any data latch on the
    /// frame before unpinning.
    pub fn unpin_page(&self, file_type: FileType, page_id: PageIdT, is_dirty: bool) -> bool {
        let state = self.state.lock().unwrap();

        let frame_id = match state.page_table.get(&(file_type, page_id)) {
            Some(&frame_id) => frame_id,
            None => return true,
        };
        let frame = &self.frames[frame_id as usize];

        if is_dirty {
            frame.dirty.store(true, Ordering::SeqCst);
        }

        match frame.pin_count() {
            0 => false,
            count => {
                frame.pin_count.store(count - 1, Ordering::SeqCst);
                if count == 1 {
                    self.replacer.unpin(frame_id);
                    if self.wait_on_exhaustion {
                        self.frame_available.notify_one();
                    }
                }
                true
            }
        }
    }

    /// Flush the specified page to disk, clearing its dirty flag. The page
    /// is written back whether or not it is dirty. Returns `false` if the
    /// page is not resident.
    pub fn flush_page(&self, file_type: FileType, page_id: PageIdT) -> Result<bool, BufferError> {
        let state = self.state.lock().unwrap();
        self.flush_resident(&state, file_type, page_id)
    }

    /// Flush every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferError> {
        let state = self.state.lock().unwrap();
        for &(file_type, page_id) in state.page_table.keys() {
            self.flush_resident(&state, file_type, page_id)?;
        }
        Ok(())
    }

    /// Return the number of frames in the pool.
    pub fn pool_size(&self) -> BufferFrameIdT {
        self.frames.len() as BufferFrameIdT
    }

    /// Return the number of pages currently resident in the pool.
    pub fn resident_count(&self) -> usize {
        self.state.lock().unwrap().page_table.len()
    }

    /// Return the number of frames in the free list.
    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free_list.len()
    }

    /// Return the number of resident pages that can currently be evicted.
    pub fn evictable_count(&self) -> usize {
        self.replacer.size()
    }

    /// Obtain a victim frame, preferring the free list over the replacer.
    /// An evicted resident has its dirty content written back first. Returns
    /// Ok(None) if every frame is pinned.
    fn take_victim(
        &self,
        state: &mut PoolState,
    ) -> Result<Option<BufferFrameIdT>, BufferError> {
        let (frame_id, from_free_list) = match state.free_list.pop_front() {
            Some(frame_id) => (frame_id, true),
            None => match self.replacer.victim() {
                Some(frame_id) => (frame_id, false),
                None => return Ok(None),
            },
        };

        let frame = &self.frames[frame_id as usize];
        if let Some((file_type, page_id)) = state.residents[frame_id as usize].take() {
            state.page_table.remove(&(file_type, page_id));
            if frame.is_dirty() {
                debug!(
                    "evicting dirty page {:?}:{} from frame {}",
                    file_type, page_id, frame_id
                );
                let write_result = {
                    let data = frame.data();
                    self.file_store.write_raw_page(file_type, page_id, &data)
                };
                if let Err(e) = write_result {
                    // Reinstate the victim so a failed write-back loses
                    // nothing; the frame goes back to where it came from.
                    state.page_table.insert((file_type, page_id), frame_id);
                    state.residents[frame_id as usize] = Some((file_type, page_id));
                    debug_assert!(!from_free_list);
                    self.replacer.unpin(frame_id);
                    return Err(e.into());
                }
                frame.dirty.store(false, Ordering::SeqCst);
            }
        }
        Ok(Some(frame_id))
    }

    fn flush_resident(
        &self,
        state: &PoolState,
        file_type: FileType,
        page_id: PageIdT,
    ) -> Result<bool, BufferError> {
        let frame_id = match state.page_table.get(&(file_type, page_id)) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let frame = &self.frames[frame_id as usize];

        let data = frame.data();
        self.file_store.write_raw_page(file_type, page_id, &data)?;
        frame.dirty.store(false, Ordering::SeqCst);
        Ok(true)
    }
}

impl Drop for BufferPoolManager {
    /// Tearing down the pool flushes every resident page so on-disk state is
    /// consistent with what callers last wrote.
    fn drop(&mut self) {
        if let Err(e) = self.flush_all_pages() {
            error!("failed to flush buffer pool during teardown: {}", e);
        }
    }
}

/// Custom error types to be used by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Error to be thrown when no free frames are open, every resident page
    /// is pinned, and the pool was not configured to wait.
    #[error("no available buffer frames, and all resident pages are pinned")]
    PoolExhausted,

    /// Error to be thrown when the underlying file store fails.
    #[error(transparent)]
    Store(#[from] FileStoreError),
}
