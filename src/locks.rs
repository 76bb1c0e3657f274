// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! Job state is shared between HTTP handlers and the download worker. If a
//! thread panics while holding one of those locks the lock becomes poisoned;
//! the queue keeps serving with whatever state the lock holds instead of
//! taking every later request down with it.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use vidqueue::locks::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(0u32);
//! *resilient_write(&lock) += 1;
//! assert_eq!(*resilient_read(&lock), 1);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vidqueue::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vidqueue::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering the guard if the mutex is poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vidqueue::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned, recovering data"
            );
            poisoned.into_inner()
        }
    }
}
