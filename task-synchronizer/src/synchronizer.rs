// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`Synchronizer`], coalescing concurrent requests for the
//! same asynchronous operation into a single execution.

use crate::asynchronous::{SharedFuture, SharedFutureError, SharedFutureSubscription, VacantSharedFuture};
use crate::sync_types::{self, Lock as _};
use core::{convert, fmt, future, num};

/// Error returned by [`SynchronizerLease::subscribe()`] and
/// [`Synchronizer::run()`].
#[derive(Clone, Copy, Debug)]
pub enum SynchronizerError {
    /// A memory allocation failed.
    MemoryAllocationFailure,
}

impl convert::From<SharedFutureError> for SynchronizerError {
    fn from(value: SharedFutureError) -> Self {
        match value {
            SharedFutureError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
        }
    }
}

/// Identifier of one generation of a [`Synchronizer`], i.e. of one execution
/// of the coalesced operation.
///
/// Ids are minted from a per-[`Synchronizer`] 64 bit counter and don't get
/// reused within an instance. The counter saturates: once `u64::MAX`
/// generations have been started, all subsequent ones share the last id and
/// are no longer told apart on [release](Synchronizer::release).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GenerationId(num::NonZeroU64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of [`Synchronizer::state`].
struct SynchronizerState<ST: sync_types::SyncTypes, F: future::Future> {
    /// The current generation, if any.
    current: Option<(GenerationId, SharedFuture<ST, F>)>,
    /// Last minted [`GenerationId`].
    last_generation_id: u64,
}

/// Single-flight coalescing of an asynchronous operation.
///
/// At most one execution of the operation, a "generation", is current at any
/// time. A caller [acquiring](Self::acquire) the `Synchronizer` while no
/// generation is current starts a new one by means of the provided factory.
/// Any caller acquiring while a generation is current joins it instead: the
/// factory doesn't get invoked and the caller obtains the very same
/// [`SharedFuture`] as everyone else in that generation.
///
/// A generation stays current until [released](SynchronizerLease::release).
/// The release is identity checked: it clears the current generation only if
/// that is still the one the releasing [`SynchronizerLease`] had witnessed. A
/// late release from an already superseded generation is a nop and can never
/// clear a subsequent generation.
///
/// The factory gets invoked under the [spinlock type](sync_types::Lock) lock.
/// Rust futures don't do anything before getting polled, and so the factory is
/// expected to only construct the future. It **must not** block or do any
/// otherwise long-running work.
pub struct Synchronizer<ST: sync_types::SyncTypes, F: future::Future + Send>
where
    F::Output: Clone + Send + Sync,
{
    state: ST::Lock<SynchronizerState<ST, F>>,
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> Synchronizer<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    /// Create a new `Synchronizer` with no current generation.
    pub fn new() -> Self {
        Self {
            state: ST::Lock::from(SynchronizerState {
                current: None,
                last_generation_id: 0,
            }),
        }
    }

    /// Join the current generation or start a new one.
    ///
    /// If no generation is current, invoke `start` to create the operation's
    /// [`Future`](future::Future), wrap it in a [`SharedFuture`] and install
    /// it as a new generation. Otherwise join the current generation without
    /// invoking `start`.
    ///
    /// The returned [`SynchronizerLease`] provides access to the generation's
    /// [`SharedFuture`] and releases the generation when dropped.
    ///
    /// May allocate memory, must not be called with any spinlock type
    /// [`Lock`](sync_types::Lock) held.
    ///
    /// # Arguments:
    ///
    /// * `start` - Factory for the operation's [`Future`](future::Future).
    ///   Gets invoked under a lock and must not block.
    pub fn acquire<S: FnOnce() -> F>(&self, start: S) -> SynchronizerLease<'_, ST, F> {
        match self.try_acquire(|| Ok::<F, convert::Infallible>(start())) {
            Ok(lease) => lease,
            Err(e) => match e {},
        }
    }

    /// Join the current generation or start a new one with a fallible
    /// factory.
    ///
    /// Like [`acquire()`](Self::acquire), but `start` may fail. A failure gets
    /// returned to the caller and the `Synchronizer` is left without a new
    /// generation installed, exactly as before the call. Joining callers are
    /// not affected, as they never invoke `start`.
    ///
    /// # Arguments:
    ///
    /// * `start` - Fallible factory for the operation's
    ///   [`Future`](future::Future). Gets invoked under a lock and must not
    ///   block.
    ///
    /// # Errors:
    ///
    /// * `E` - The error returned by `start`.
    pub fn try_acquire<E, S: FnOnce() -> Result<F, E>>(&self, start: S) -> Result<SynchronizerLease<'_, ST, F>, E> {
        // Storage for a new generation's SharedFuture is allocated with the
        // lock dropped, after which the state must get re-evaluated.
        let mut vacant_shared_future: Option<VacantSharedFuture<ST, F>> = None;
        let mut state_guard = self.state.lock();
        loop {
            if let Some((generation, shared_future)) = state_guard
                .current
                .as_ref()
                .map(|(generation, shared_future)| (*generation, shared_future.clone()))
            {
                drop(state_guard);
                tracing::trace!(%generation, "joining current generation");
                return Ok(SynchronizerLease {
                    synchronizer: Some(self),
                    generation,
                    shared_future,
                    started: false,
                });
            }

            let vacant = match vacant_shared_future.take() {
                Some(vacant) => vacant,
                None => {
                    drop(state_guard);
                    vacant_shared_future = Some(SharedFuture::new_vacant());
                    state_guard = self.state.lock();
                    continue;
                }
            };

            let inner = match start() {
                Ok(inner) => inner,
                Err(e) => {
                    drop(state_guard);
                    tracing::debug!("operation factory failed, no generation started");
                    return Err(e);
                }
            };

            // Saturates, c.f. the GenerationId documentation.
            let generation = GenerationId(num::NonZeroU64::MIN.saturating_add(state_guard.last_generation_id));
            state_guard.last_generation_id = generation.0.get();
            let shared_future = vacant.occupy(inner);
            state_guard.current = Some((generation, shared_future.clone()));
            drop(state_guard);

            tracing::debug!(%generation, "started new generation");
            return Ok(SynchronizerLease {
                synchronizer: Some(self),
                generation,
                shared_future,
                started: true,
            });
        }
    }

    /// Release a generation.
    ///
    /// Clear the current generation if and only if it is the one identified
    /// by `generation`, otherwise do nothing. Releasing the same generation
    /// multiple times is harmless.
    ///
    /// Usually invoked implicitly through [`SynchronizerLease`]. Needed only
    /// for leases disarmed via [`SynchronizerLease::into_parts()`].
    ///
    /// Returns `true` if the current generation has been cleared by this
    /// call.
    ///
    /// # Arguments:
    ///
    /// * `generation` - The [`GenerationId`] witnessed at acquisition time.
    pub fn release(&self, generation: GenerationId) -> bool {
        let mut state_guard = self.state.lock();
        let is_current = state_guard
            .current
            .as_ref()
            .is_some_and(|(current_generation, _)| *current_generation == generation);
        if !is_current {
            drop(state_guard);
            tracing::trace!(%generation, "ignoring release of stale generation");
            return false;
        }

        let cleared = state_guard.current.take();
        drop(state_guard);
        drop(cleared);
        tracing::debug!(%generation, "released generation");
        true
    }

    /// The [`GenerationId`] of the current generation, if any.
    pub fn current_generation(&self) -> Option<GenerationId> {
        self.state.lock().current.as_ref().map(|(generation, _)| *generation)
    }

    /// Acquire, await the shared result and release.
    ///
    /// Convenience for the common pattern of [acquiring](Self::acquire) the
    /// `Synchronizer`, [subscribing](SynchronizerLease::subscribe) to the
    /// generation's [`SharedFuture`], awaiting its completion and finally
    /// releasing the generation.
    ///
    /// # Arguments:
    ///
    /// * `start` - Factory for the operation's [`Future`](future::Future).
    ///   Gets invoked under a lock and must not block.
    ///
    /// # Errors:
    ///
    /// * [`SynchronizerError::MemoryAllocationFailure`] - Memory allocation
    ///   failure.
    pub async fn run<S: FnOnce() -> F>(&self, start: S) -> Result<F::Output, SynchronizerError> {
        let lease = self.acquire(start);
        let subscription = lease.subscribe()?;
        let result = subscription.await;
        lease.release();
        Ok(result)
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> Default for Synchronizer<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Participation in a [`Synchronizer`] generation.
///
/// Returned by [`Synchronizer::acquire()`] and
/// [`Synchronizer::try_acquire()`]. [Releases](Synchronizer::release) the
/// witnessed generation when dropped, unless
/// [disarmed](Self::into_parts).
pub struct SynchronizerLease<'a, ST: sync_types::SyncTypes, F: future::Future + Send>
where
    F::Output: Clone + Send + Sync,
{
    synchronizer: Option<&'a Synchronizer<ST, F>>,
    generation: GenerationId,
    shared_future: SharedFuture<ST, F>,
    started: bool,
}

impl<'a, ST: sync_types::SyncTypes, F: future::Future + Send> SynchronizerLease<'a, ST, F>
where
    F::Output: Clone + Send + Sync,
{
    /// The witnessed generation.
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// The witnessed generation's [`SharedFuture`].
    pub fn shared_future(&self) -> &SharedFuture<ST, F> {
        &self.shared_future
    }

    /// Whether the acquisition started the generation, i.e. invoked the
    /// factory.
    pub fn is_starter(&self) -> bool {
        self.started
    }

    /// Subscribe to the witnessed generation's [`SharedFuture`].
    ///
    /// # Errors:
    ///
    /// * [`SynchronizerError::MemoryAllocationFailure`] - Memory allocation
    ///   failure.
    pub fn subscribe(&self) -> Result<SharedFutureSubscription<ST, F>, SynchronizerError> {
        Ok(self.shared_future.subscribe()?)
    }

    /// Release the witnessed generation.
    ///
    /// Returns `true` if the generation was still current and has been
    /// cleared. See [`Synchronizer::release()`].
    pub fn release(mut self) -> bool {
        match self.synchronizer.take() {
            Some(synchronizer) => synchronizer.release(self.generation),
            None => false,
        }
    }

    /// Disarm the lease and return the witnessed generation's
    /// [`GenerationId`] and [`SharedFuture`].
    ///
    /// The generation won't get released when the lease is dropped, it's the
    /// caller's responsibility to eventually invoke
    /// [`Synchronizer::release()`] on the returned [`GenerationId`].
    pub fn into_parts(mut self) -> (GenerationId, SharedFuture<ST, F>) {
        self.synchronizer = None;
        (self.generation, self.shared_future.clone())
    }
}

impl<'a, ST: sync_types::SyncTypes, F: future::Future + Send> Drop for SynchronizerLease<'a, ST, F>
where
    F::Output: Clone + Send + Sync,
{
    fn drop(&mut self) {
        if let Some(synchronizer) = self.synchronizer.take() {
            synchronizer.release(self.generation);
        }
    }
}

#[test]
fn test_synchronizer_coalescing() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};
    use core::cell;

    let starts = cell::Cell::new(0u32);
    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    let (operation0, trigger0) = TestOperation::new();
    let (operation1, _trigger1) = TestOperation::new();
    let lease0 = synchronizer.acquire(|| {
        starts.set(starts.get() + 1);
        operation0
    });
    let lease1 = synchronizer.acquire(|| {
        starts.set(starts.get() + 1);
        operation1
    });
    assert_eq!(starts.get(), 1);
    assert!(lease0.is_starter());
    assert!(!lease1.is_starter());
    assert_eq!(lease0.generation(), lease1.generation());
    assert_eq!(lease0.shared_future(), lease1.shared_future());
    assert_eq!(synchronizer.current_generation(), Some(lease0.generation()));

    let e = TestAsyncExecutor::new();
    let w0 = TestAsyncExecutor::spawn(&e, lease0.subscribe().unwrap());
    let w1 = TestAsyncExecutor::spawn(&e, lease1.subscribe().unwrap());
    TestAsyncExecutor::run_until_stalled(&e);
    trigger0.complete(5u32);
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w0.take().unwrap(), 5u32);
    assert_eq!(w1.take().unwrap(), 5u32);
}

#[test]
fn test_synchronizer_renewal() {
    use crate::test::{TestNopSyncTypes, TestOperation};

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    let (operation0, _trigger0) = TestOperation::new();
    let lease0 = synchronizer.acquire(|| operation0);
    let generation0 = lease0.generation();
    let shared_future0 = lease0.shared_future().clone();
    assert!(lease0.release());
    assert_eq!(synchronizer.current_generation(), None);

    let (operation1, _trigger1) = TestOperation::new();
    let lease1 = synchronizer.acquire(|| operation1);
    assert!(lease1.is_starter());
    assert_ne!(lease1.generation(), generation0);
    assert_ne!(*lease1.shared_future(), shared_future0);
}

#[test]
fn test_synchronizer_late_release_doesnt_clobber() {
    use crate::test::{TestNopSyncTypes, TestOperation};

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    let (operation0, _trigger0) = TestOperation::new();
    let lease0 = synchronizer.acquire(|| operation0);
    let (operation1, _trigger1) = TestOperation::new();
    let lease1 = synchronizer.acquire(|| operation1);
    assert_eq!(lease0.generation(), lease1.generation());

    // The first one to release retires the generation, a new one gets
    // started while the slower lease is still around.
    assert!(lease1.release());
    let (operation2, _trigger2) = TestOperation::new();
    let lease2 = synchronizer.acquire(|| operation2);
    assert!(lease2.is_starter());

    assert!(!lease0.release());
    assert_eq!(synchronizer.current_generation(), Some(lease2.generation()));
}

#[test]
fn test_synchronizer_idempotent_release() {
    use crate::test::{TestNopSyncTypes, TestOperation};

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    let (operation, _trigger) = TestOperation::new();
    let (generation, _shared_future) = synchronizer.acquire(|| operation).into_parts();
    assert_eq!(synchronizer.current_generation(), Some(generation));
    assert!(synchronizer.release(generation));
    assert!(!synchronizer.release(generation));
    assert_eq!(synchronizer.current_generation(), None);
}

#[test]
fn test_synchronizer_release_on_drop() {
    use crate::test::{TestNopSyncTypes, TestOperation};

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    {
        let (operation, _trigger) = TestOperation::new();
        let _lease = synchronizer.acquire(|| operation);
        assert!(synchronizer.current_generation().is_some());
    }
    assert_eq!(synchronizer.current_generation(), None);
}

#[test]
fn test_synchronizer_try_acquire_failure() {
    use crate::test::{TestNopSyncTypes, TestOperation};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct TestFactoryFailed;

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    let r = synchronizer.try_acquire(|| Err::<TestOperation<u32>, _>(TestFactoryFailed));
    assert!(matches!(r, Err(TestFactoryFailed)));
    assert_eq!(synchronizer.current_generation(), None);

    // A failing factory is never invoked when joining.
    let (operation, _trigger) = TestOperation::new();
    let lease0 = synchronizer.acquire(|| operation);
    let lease1 = match synchronizer.try_acquire(|| Err::<TestOperation<u32>, _>(TestFactoryFailed)) {
        Ok(lease1) => lease1,
        Err(_) => panic!("joining invoked the factory"),
    };
    assert_eq!(lease0.generation(), lease1.generation());
}

#[test]
fn test_synchronizer_failure_replicated() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct TestOperationFailed;

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<Result<u32, TestOperationFailed>>>::new();
    let (operation, trigger) = TestOperation::new();
    let lease0 = synchronizer.acquire(|| operation);
    let lease1 = synchronizer.acquire(|| unreachable!());

    let e = TestAsyncExecutor::new();
    let w0 = TestAsyncExecutor::spawn(&e, lease0.subscribe().unwrap());
    let w1 = TestAsyncExecutor::spawn(&e, lease1.subscribe().unwrap());
    TestAsyncExecutor::run_until_stalled(&e);
    trigger.complete(Err(TestOperationFailed));
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w0.take().unwrap(), Err(TestOperationFailed));
    assert_eq!(w1.take().unwrap(), Err(TestOperationFailed));
}

#[test]
fn test_synchronizer_unit_output() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};
    extern crate alloc;
    use alloc::sync::Arc;

    let synchronizer = Arc::new(Synchronizer::<TestNopSyncTypes, TestOperation<()>>::new());
    let (operation0, trigger) = TestOperation::new();
    let (operation1, _) = TestOperation::new();

    let e = TestAsyncExecutor::new();
    let w0 = TestAsyncExecutor::spawn(&e, {
        let synchronizer = synchronizer.clone();
        async move { synchronizer.run(|| operation0).await }
    });
    let w1 = TestAsyncExecutor::spawn(&e, {
        let synchronizer = synchronizer.clone();
        async move { synchronizer.run(|| operation1).await }
    });
    TestAsyncExecutor::run_until_stalled(&e);
    assert!(synchronizer.current_generation().is_some());
    trigger.complete(());
    TestAsyncExecutor::run_to_completion(&e);
    assert!(w0.take().unwrap().is_ok());
    assert!(w1.take().unwrap().is_ok());
    assert_eq!(synchronizer.current_generation(), None);
}

#[cfg(feature = "std")]
#[test]
fn test_synchronizer_factory_panic() {
    extern crate std;
    use crate::sync_types::std_sync_types::StdSyncTypes;
    use crate::test::TestOperation;
    use std::panic;

    let synchronizer = Synchronizer::<StdSyncTypes, TestOperation<u32>>::new();
    let r = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let _lease = synchronizer.acquire(|| panic!("operation factory panicked"));
    }));
    assert!(r.is_err());
    assert_eq!(synchronizer.current_generation(), None);

    // The instance remains usable, the next acquisition starts afresh.
    let (operation, _trigger) = TestOperation::new();
    let lease0 = synchronizer.acquire(|| operation);
    assert!(lease0.is_starter());
    assert_eq!(synchronizer.current_generation(), Some(lease0.generation()));

    // A panicking factory is never invoked when joining.
    let lease1 = synchronizer.acquire(|| panic!("operation factory invoked when joining"));
    assert!(!lease1.is_starter());
    assert_eq!(lease0.generation(), lease1.generation());
}

#[test]
fn test_synchronizer_generation_id_saturation() {
    use crate::test::{TestNopSyncTypes, TestOperation};

    let synchronizer = Synchronizer::<TestNopSyncTypes, TestOperation<u32>>::new();
    synchronizer.state.lock().last_generation_id = u64::MAX - 1;

    let (operation0, _trigger0) = TestOperation::new();
    let (generation0, _) = synchronizer.acquire(|| operation0).into_parts();
    assert_eq!(generation0, GenerationId(num::NonZeroU64::MAX));
    assert!(synchronizer.release(generation0));

    // Past the last id, the counter sticks to it.
    let (operation1, _trigger1) = TestOperation::new();
    let (generation1, _) = synchronizer.acquire(|| operation1).into_parts();
    assert_eq!(generation1, generation0);
    assert!(synchronizer.release(generation1));
}
