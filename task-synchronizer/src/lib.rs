// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Single-flight coalescing of concurrent requests for the same asynchronous
//! operation.
//!
//! A [`Synchronizer`] runs at most one instance of an operation at a time.
//! Callers arriving while it's in flight join it and observe the very same
//! result through a [`SharedFuture`](asynchronous::SharedFuture).

#![no_std]

// Lifetimes are not always obvious at first sight, allow for making them explicit even if
// redundant.
#![allow(clippy::needless_lifetimes)]

pub mod asynchronous;
pub mod sync_types;
mod synchronizer;
#[cfg(test)]
pub mod test;

pub use synchronizer::{GenerationId, Synchronizer, SynchronizerError, SynchronizerLease};
