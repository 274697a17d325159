// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`SyncTypes`](sync_types::SyncTypes) for the locking
//! types provided by Rust `std`.

extern crate std;

use crate::sync_types;
use core::{convert, marker};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// [`Lock`](sync_types::Lock) trait implementation built on Rust
/// `std` [`Mutex`](std::sync::Mutex).
///
/// A poisoned `Mutex` is recovered from rather than propagating the panic: all
/// users in this crate only ever mutate the protected state after any
/// user-supplied callback invoked under the lock has returned, so the state
/// is consistent even after a panic unwound through a critical section.
pub struct StdLock<T: marker::Send> {
    mtx: Mutex<T>,
}

impl<T: marker::Send> sync_types::Lock<T> for StdLock<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        T: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        self.mtx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: marker::Send> sync_types::ConstructibleLock<T> for StdLock<T> {
    fn get_mut(&mut self) -> &mut T {
        self.mtx.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: marker::Send> convert::From<T> for StdLock<T> {
    fn from(value: T) -> Self {
        Self { mtx: Mutex::new(value) }
    }
}

/// [`SyncTypes`](sync_types::SyncTypes) trait implementation based on Rust
/// [`std::sync`].
pub struct StdSyncTypes {}

impl sync_types::SyncTypes for StdSyncTypes {
    type Lock<T: marker::Send> = StdLock<T>;
}

#[test]
fn test_std_lock_recovers_from_poisoning() {
    use sync_types::Lock as _;

    let lock = std::sync::Arc::new(StdLock::from(1u32));
    let lock_for_thread = lock.clone();
    let r = std::thread::spawn(move || {
        let mut guard = lock_for_thread.lock();
        *guard = 2;
        panic!("poison the lock");
    })
    .join();
    assert!(r.is_err());
    assert_eq!(*lock.lock(), 2);
}
