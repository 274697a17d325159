// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Lock abstraction traits.
//!
//! In `[no_std]` environments, the `std::sync::Mutex` is unavailable and the
//! exact semantics of a provided lock implementation depend heavily on the
//! target execution environment -- it could be anything ranging from a simple
//! spinlock up to a full blown mutex with scheduling semantics. The
//! [`Synchronizer`](crate::Synchronizer) and the
//! [`SharedFuture`](crate::asynchronous::SharedFuture) are generic over the
//! [`ConstructibleLock`] trait defined here, grouped as an associated type of
//! the [`SyncTypes`] trait expected to get implemented for a target execution
//! environment.
//!
//! With the `std` feature enabled, [`std_sync_types::StdSyncTypes`] provides
//! an implementation on top of [`std::sync::Mutex`].

use core::{convert, marker, ops};

#[cfg(feature = "std")]
pub mod std_sync_types;

/// Execution environment agnostic lock abstraction.
///
/// Users of the `Lock` must assume that the implementation is of the spinlock
/// type and **must not** block while holding the lock or execute otherwise
/// long-running work. This includes IO in particular, but also memory
/// allocations.
pub trait Lock<T: ?Sized>: marker::Send + marker::Sync {
    /// Lock guard type returned by [`lock()`](Self::lock).
    type Guard<'a>: ops::Deref<Target = T> + ops::DerefMut
    where
        Self: 'a;

    /// Lock the lock.
    ///
    /// Users of the `Lock` **must not** block or execute otherwise long-running
    /// work while holding the lock.
    fn lock(&self) -> Self::Guard<'_>;
}

/// [`Lock`] constructible by wrapping the value to get protected.
pub trait ConstructibleLock<T>: Lock<T> + convert::From<T> {
    /// Access the wrapped value.
    ///
    /// Access the wrapped value through a mutable reference on `Self` without
    /// going through a locking operation. The existence of the `mut`
    /// reference on `Self` implies that it cannot have been locked
    /// concurrently and that access is exclusive.
    fn get_mut(&mut self) -> &mut T;
}

/// Collection of the synchronization primitive types to be used for a given
/// execution environment.
pub trait SyncTypes: marker::Unpin + 'static {
    /// The [`ConstructibleLock`] type.
    type Lock<T: marker::Send>: ConstructibleLock<T>;
}
