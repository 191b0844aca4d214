/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::common::{PageIdT, PAGE_SIZE};

use log::debug;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// The kind of file a page belongs to. Only the heap file of the single
/// table is in scope; the discriminant exists so page addresses stay unique
/// if further files (write-ahead log, overflow) are ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Table,
}

/// The file store is responsible for raw paged I/O over the table's heap
/// file. Page `k` occupies bytes `[k * PAGE_SIZE, (k + 1) * PAGE_SIZE)`.
///
/// The handle is guarded by an internal mutex, so the API is atomic and can
/// be shared behind `&self` by the buffer pool.
pub struct FileStore {
    table_path: PathBuf,
    table_file: Mutex<File>,
}

impl FileStore {
    /// Open the heap file `<base>.db`, creating it if it does not exist.
    pub fn open(base: &Path) -> Result<Self, FileStoreError> {
        let table_path = base.with_extension("db");
        let table_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&table_path)?;
        debug!("opened heap file {:?}", table_path);

        Ok(Self {
            table_path,
            table_file: Mutex::new(table_file),
        })
    }

    /// Read a single page's data from disk into the specified byte array.
    /// Reading fewer than `PAGE_SIZE` bytes is an error.
    pub fn read_raw_page(
        &self,
        file_type: FileType,
        page_id: PageIdT,
        page_data: &mut [u8; PAGE_SIZE as usize],
    ) -> Result<(), FileStoreError> {
        let mut file = self.file_for(file_type);
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.read_exact(page_data)?;
        Ok(())
    }

    /// Write the specified byte array out to disk as a single page. The data
    /// is flushed before returning, to bound what a crash can lose.
    pub fn write_raw_page(
        &self,
        file_type: FileType,
        page_id: PageIdT,
        page_data: &[u8; PAGE_SIZE as usize],
    ) -> Result<(), FileStoreError> {
        let mut file = self.file_for(file_type);
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.write_all(page_data)?;
        file.flush()?;
        Ok(())
    }

    /// Return the path of the heap file.
    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    fn file_for(&self, file_type: FileType) -> std::sync::MutexGuard<File> {
        match file_type {
            FileType::Table => self.table_file.lock().unwrap(),
        }
    }

    fn page_offset(page_id: PageIdT) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}

/// Custom errors to be used by the file store.
#[derive(Debug, Error)]
pub enum FileStoreError {
    /// Error to be thrown when opening, seeking, or transferring a page
    /// fails, including short reads past the end of the file.
    #[error("heap file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
