// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Rust `async` related [`Future`] adaptors.

mod shared_future;
pub use shared_future::{SharedFuture, SharedFutureError, SharedFutureSubscription};
pub(crate) use shared_future::VacantSharedFuture;
