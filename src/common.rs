/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

/// Note: The type aliases and global constants below are primarily to improve readability
/// throughout the codebase. The values should not be configured/modified unless explicitly
/// annotated with "safe to modify".

/// Type aliases
pub type PageIdT = u32;
pub type BufferFrameIdT = u32;
pub type RecordIdT = u64;

/// Global constants
pub const PAGE_SIZE: u32 = 4096;
pub const BUFFER_SIZE: BufferFrameIdT = 1024; // safe to modify
