// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`SharedFuture`].

extern crate alloc;
use alloc::{sync::Arc, task::Wake, vec::Vec};

use crate::sync_types::{self, Lock as _};
use core::{cell, fmt, future, num, pin, ptr, sync::atomic, task};

/// Error returned by [`SharedFuture::subscribe()`].
#[derive(Clone, Copy, Debug)]
pub enum SharedFutureError {
    /// A memory allocation failed.
    MemoryAllocationFailure,
}

/// Handle to a single asynchronous computation observable by any number of
/// independent awaiters.
///
/// A `SharedFuture` wraps a given inner [`Future`](future::Future) and allows
/// for collective polling from one or more
/// [subscriptions](SharedFutureSubscription) instantiated via
/// [`subscribe()`](Self::subscribe). The inner future gets polled to
/// completion exactly once, and its [`Output`](future::Future::Output) is
/// replicated as a [`Clone`] to every subscription, including those made
/// after completion. A failure encoded in the output, e.g. as an `Err` of a
/// [`Result`], is thus delivered identically to everyone.
///
/// `SharedFuture` instances are cheap to [`clone()`](Clone::clone): all
/// clones refer to the same computation and compare equal. Equality is
/// identity, i.e. two `SharedFuture`s wrapping distinct computations never
/// compare equal, regardless of their results.
///
/// The implementation is robust against subscribers "loosing interest", e.g.
/// abandoned tasks never polled again: as long as at least one subscription
/// is still getting polled, wakeups get processed and the inner future makes
/// progress. Whenever the inner future is woken, the wake-up is broadcasted to
/// all subscribers.
pub struct SharedFuture<ST: sync_types::SyncTypes, F: future::Future> {
    core: pin::Pin<Arc<SharedFutureCore<ST, F>>>,
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> SharedFuture<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    /// Wrap a given [`Future`](future::Future) in a `SharedFuture`.
    ///
    /// Like any Rust [`Future`](future::Future), `inner` won't make any
    /// progress before the first [subscription](Self::subscribe) gets polled.
    ///
    /// # Arguments:
    ///
    /// * `inner` - The [`Future`](future::Future) to get wrapped, collectively
    ///   polled and whose result is to get replicated to all subscriptions.
    pub fn new(inner: F) -> Self {
        Self::new_vacant().occupy(inner)
    }

    /// Allocate the storage for a `SharedFuture` without providing the inner
    /// [`Future`](future::Future) yet.
    ///
    /// Enables the allocation to happen outside of some [spinlock
    /// type](sync_types::Lock) critical section whose outcome decides whether
    /// the inner [`Future`](future::Future) gets created at all.
    pub(crate) fn new_vacant() -> VacantSharedFuture<ST, F> {
        VacantSharedFuture {
            core: Arc::new(SharedFutureCore {
                wakers: Arc::new(SharedFutureWakers::new()),
                polling_state: ST::Lock::from(SharedFuturePollingState::Idle),
                inner: cell::UnsafeCell::new(SharedFutureInner::Vacant),
            }),
        }
    }

    /// Subscribe to the `SharedFuture`.
    ///
    /// On success, a [`SharedFutureSubscription`] gets returned, which can
    /// subsequently get polled to drive progress on the wrapped future forward
    /// and to eventually obtain the replicated result.
    ///
    /// May allocate memory, must not be called with any spinlock type
    /// [`Lock`](sync_types::Lock) held.
    ///
    /// # Errors:
    ///
    /// * [`SharedFutureError::MemoryAllocationFailure`] - Memory allocation
    ///   failure.
    pub fn subscribe(&self) -> Result<SharedFutureSubscription<ST, F>, SharedFutureError> {
        let subscription_id = self.core.wakers.subscribe()?;
        Ok(SharedFutureSubscription {
            state: SharedFutureSubscriptionState::Pending {
                shared_future: self.clone(),
                subscription_id,
            },
        })
    }

    /// Whether the inner [`Future`](future::Future) has completed and its
    /// result is available.
    pub fn is_completed(&self) -> bool {
        let polling_state_guard = self.core.polling_state.lock();
        if *polling_state_guard != SharedFuturePollingState::Idle {
            return false;
        }
        atomic::compiler_fence(atomic::Ordering::Acquire);
        // Safe, no subscription can enter the InPoll state while the
        // polling_state_guard is held.
        let inner = unsafe { &*self.core.inner.get() };
        matches!(inner, SharedFutureInner::Ready(_))
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future> SharedFuture<ST, F> {
    /// Test whether two `SharedFuture`s refer to the same computation.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        ptr::eq(this.core_ptr(), other.core_ptr())
    }

    fn core_ptr(&self) -> *const SharedFutureCore<ST, F> {
        &*self.core
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future> Clone for SharedFuture<ST, F> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future> PartialEq for SharedFuture<ST, F> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future> Eq for SharedFuture<ST, F> {}

impl<ST: sync_types::SyncTypes, F: future::Future> fmt::Debug for SharedFuture<ST, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedFuture").field(&self.core_ptr()).finish()
    }
}

/// Storage for a [`SharedFuture`] whose inner [`Future`](future::Future) has
/// not been provided yet.
///
/// Obtained from [`SharedFuture::new_vacant()`]. Never shared, so providing
/// the inner [`Future`](future::Future) through [`occupy()`](Self::occupy)
/// requires no synchronization.
pub(crate) struct VacantSharedFuture<ST: sync_types::SyncTypes, F: future::Future> {
    core: Arc<SharedFutureCore<ST, F>>,
}

impl<ST: sync_types::SyncTypes, F: future::Future> VacantSharedFuture<ST, F> {
    /// Install the inner [`Future`](future::Future) and convert into a
    /// [`SharedFuture`].
    pub(crate) fn occupy(self, inner: F) -> SharedFuture<ST, F> {
        // Safe: the core has not been handed out to anyone yet, access is
        // exclusive.
        unsafe { *self.core.inner.get() = SharedFutureInner::Pending(inner) };
        // The core is never moved out of the Arc.
        SharedFuture {
            core: unsafe { pin::Pin::new_unchecked(self.core) },
        }
    }
}

/// The state shared between all clones of a [`SharedFuture`] and its
/// subscriptions.
struct SharedFutureCore<ST: sync_types::SyncTypes, F: future::Future> {
    /// The subscriptions, also serving as the broadcast
    /// [`Waker`](task::Waker) passed to the inner future.
    wakers: Arc<SharedFutureWakers<ST>>,
    /// Concurrent polling state for the `inner` future. Used to ensure only
    /// one subscription is polling it at a time.
    polling_state: ST::Lock<SharedFuturePollingState>,
    /// The inner future or its result.
    inner: cell::UnsafeCell<SharedFutureInner<F>>,
}

// Accesses to inner are serialized through polling_state. The Output gets
// cloned out concurrently from a shared reference once Ready, hence Sync.
unsafe impl<ST: sync_types::SyncTypes, F: future::Future + Send> Send for SharedFutureCore<ST, F> where
    F::Output: Send + Sync
{
}

unsafe impl<ST: sync_types::SyncTypes, F: future::Future + Send> Sync for SharedFutureCore<ST, F> where
    F::Output: Send + Sync
{
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> SharedFutureCore<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    /// Poll on behalf of a subscription.
    ///
    /// Only one subscriber -- the first to come -- ever polls the inner future
    /// at a time. That subscriber sets and owns the
    /// [`InPoll`](SharedFuturePollingState::InPoll) state for the duration of
    /// the poll, without holding the `polling_state` lock. All others
    /// observing `InPoll` register their [`Waker`](task::Waker) and return
    /// [`Pending`](task::Poll::Pending) immediately; they'll get woken either
    /// by a broadcast wake-up from the inner future or upon completion.
    ///
    /// As the polling subscriber might never get polled again after returning
    /// [`Pending`](task::Poll::Pending), it must not return while a wake-up
    /// received in the meanwhile is unaccounted for, which is tracked through
    /// the [wake generation](SharedFutureWakers::wake_gen).
    ///
    /// # Arguments:
    ///
    /// * `subscription_id` - The id associated with the subscription on whose
    ///   behalf to poll.
    /// * `cx` - Asynchronous task context providing access to a
    ///   [`Waker`](task::Waker).
    fn poll_from_subscription(
        self: pin::Pin<&Self>,
        subscription_id: SharedFutureSubscriptionId,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<F::Output> {
        // The Pin only concerns the inner future, which gets repinned below.
        let this = self.get_ref();

        let mut polling_state_guard = this.polling_state.lock();

        // Obtain the wake generation under the lock: if woken while some other
        // subscription is polling, the latter will observe the update upon
        // reacquiring the lock and loop over.
        let mut wake_gen = this.wakers.wake_gen();

        if *polling_state_guard == SharedFuturePollingState::InPoll {
            this.wakers.set_subscription_waker(subscription_id, cx.waker());
            return task::Poll::Pending;
        }
        // The contents of inner are consistent only if Idle, don't let the
        // compiler move accesses before the check above.
        atomic::compiler_fence(atomic::Ordering::Acquire);

        // Once Ready, other subscriptions may clone the result concurrently
        // without holding the lock, only ever access it through a shared
        // reference.
        if let SharedFutureInner::Ready(result) = unsafe { &*this.inner.get() } {
            // The result is stable once installed, don't clone under the
            // lock.
            drop(polling_state_guard);
            this.wakers.unsubscribe(subscription_id, false);
            return task::Poll::Ready(result.clone());
        }

        // Safe, access is exclusive as per holding the lock in Idle state and
        // the inner future not having completed yet.
        let inner = unsafe { &mut *this.inner.get() };
        let f = match inner {
            SharedFutureInner::Pending(f) => f,
            SharedFutureInner::Ready(_) | SharedFutureInner::Vacant => unreachable!(),
        };

        let waker = task::Waker::from(this.wakers.clone());

        let mut task_waker_installed = false;
        loop {
            // Transitions to InPoll and drops the lock for the duration of
            // the poll.
            let in_poll_guard = SharedFutureInPollGuard::new(this, polling_state_guard);

            // Projection repin, the core itself is pinned.
            let f = unsafe { pin::Pin::new_unchecked(&mut *f) };
            let result = future::Future::poll(f, &mut task::Context::from_waker(&waker));

            match result {
                task::Poll::Ready(result) => {
                    *inner = SharedFutureInner::Ready(result.clone());
                    polling_state_guard = in_poll_guard.release();
                    drop(polling_state_guard);
                    // Unsubscribe and wake the others to grab their copy.
                    this.wakers.unsubscribe(subscription_id, true);
                    return task::Poll::Ready(result);
                }
                task::Poll::Pending => {
                    if !task_waker_installed {
                        this.wakers.set_subscription_waker(subscription_id, cx.waker());
                        task_waker_installed = true;
                    }

                    polling_state_guard = in_poll_guard.release();
                    // A wake-up before the waker installation above is
                    // guaranteed to be visible as an updated wake generation,
                    // any later one wakes the installed waker.
                    let cur_wake_gen = this.wakers.wake_gen();
                    if wake_gen == cur_wake_gen {
                        return task::Poll::Pending;
                    }
                    wake_gen = cur_wake_gen;
                }
            }
        }
    }
}

/// Polling progress of a [`SharedFuture`]'s inner future.
enum SharedFutureInner<F: future::Future> {
    /// Storage allocated, inner future not provided yet. Never observed by
    /// subscribers.
    Vacant,
    /// The inner future has not completed yet.
    Pending(F),
    /// The inner future has completed with the given result.
    Ready(F::Output),
}

/// Concurrent polling state of a [`SharedFuture`]'s inner future, tracked at
/// [`SharedFutureCore::polling_state`].
///
/// Updates are done under the protection of a [`Lock`](sync_types::Lock),
/// but that's getting dropped inbetween while the inner future is being
/// polled.
#[derive(PartialEq, Eq, Debug)]
enum SharedFuturePollingState {
    /// No subscription is currently polling the inner future.
    Idle,
    /// A subscription is currently exclusively polling the inner future and
    /// owns a [`SharedFutureInPollGuard`].
    InPoll,
}

/// Guard for [`SharedFutureCore::polling_state`]'s
/// [`InPoll`](SharedFuturePollingState::InPoll) state.
///
/// Resets the state back to [`Idle`](SharedFuturePollingState::Idle) when
/// dropped, e.g. when unwinding from a panicking inner future.
struct SharedFutureInPollGuard<'a, ST: sync_types::SyncTypes, F: future::Future> {
    core: &'a SharedFutureCore<ST, F>,
    locked_in_poll: bool,
}

impl<'a, ST: sync_types::SyncTypes, F: future::Future> SharedFutureInPollGuard<'a, ST, F> {
    /// Transition from [`Idle`](SharedFuturePollingState::Idle) to
    /// [`InPoll`](SharedFuturePollingState::InPoll) and release the
    /// `polling_state_guard`.
    fn new<'b>(
        core: &'a SharedFutureCore<ST, F>,
        mut polling_state_guard: <ST::Lock<SharedFuturePollingState> as sync_types::Lock<
            SharedFuturePollingState,
        >>::Guard<'b>,
    ) -> Self {
        debug_assert_eq!(*polling_state_guard, SharedFuturePollingState::Idle);
        *polling_state_guard = SharedFuturePollingState::InPoll;
        Self {
            core,
            locked_in_poll: true,
        }
    }

    /// Reacquire the [`SharedFutureCore::polling_state`] lock, switch back to
    /// [`Idle`](SharedFuturePollingState::Idle) and return the guard.
    ///
    /// As long as the returned guard is held, no other subscription can
    /// become the polling one.
    fn release(
        mut self,
    ) -> <ST::Lock<SharedFuturePollingState> as sync_types::Lock<SharedFuturePollingState>>::Guard<'a> {
        let mut polling_state_guard = self.core.polling_state.lock();
        *polling_state_guard = SharedFuturePollingState::Idle;
        self.locked_in_poll = false;
        polling_state_guard
    }
}

impl<'a, ST: sync_types::SyncTypes, F: future::Future> Drop for SharedFutureInPollGuard<'a, ST, F> {
    fn drop(&mut self) {
        if self.locked_in_poll {
            *self.core.polling_state.lock() = SharedFuturePollingState::Idle;
            self.locked_in_poll = false;
        }
    }
}

/// ID identifying a subscription registered at a [`SharedFutureWakers`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct SharedFutureSubscriptionId(num::NonZeroU64);

/// State of [`SharedFutureWakers::state`].
struct SharedFutureWakersState {
    /// Pairs of (subscription id, installed [`Waker`](task::Waker), if any).
    subscribers: Vec<(SharedFutureSubscriptionId, Option<task::Waker>)>,
    /// Last allocated subscription id.
    last_subscription_id: u64,
}

/// The subscriptions to a [`SharedFuture`].
///
/// Doubles as the broadcast [`Waker`](task::Waker) handed to the inner future:
/// waking it wakes all subscribed wakers.
struct SharedFutureWakers<ST: sync_types::SyncTypes> {
    state: ST::Lock<SharedFutureWakersState>,
    /// Wake generation, incremented upon each broadcast wake event.
    wake_gen: atomic::AtomicU64,
}

impl<ST: sync_types::SyncTypes> SharedFutureWakers<ST> {
    fn new() -> Self {
        Self {
            state: ST::Lock::from(SharedFutureWakersState {
                subscribers: Vec::new(),
                last_subscription_id: 0,
            }),
            wake_gen: atomic::AtomicU64::new(0),
        }
    }

    /// Allocate a subscription, initially without a [`Waker`](task::Waker).
    ///
    /// Doesn't allocate under the lock: if the subscriber slots are exhausted,
    /// the lock gets dropped for allocating a larger storage, which then gets
    /// installed under the reacquired lock unless some concurrent subscriber
    /// did so already in the meanwhile.
    fn subscribe(&self) -> Result<SharedFutureSubscriptionId, SharedFutureError> {
        let mut state_guard = self.state.lock();
        while state_guard.subscribers.len() == state_guard.subscribers.capacity() {
            let reallocated_capacity = state_guard
                .subscribers
                .capacity()
                .checked_mul(2)
                .ok_or(SharedFutureError::MemoryAllocationFailure)?
                .max(4);
            drop(state_guard);

            let mut reallocated_subscribers = Vec::new();
            reallocated_subscribers
                .try_reserve_exact(reallocated_capacity)
                .map_err(|_| SharedFutureError::MemoryAllocationFailure)?;

            state_guard = self.state.lock();
            if reallocated_subscribers.capacity() > state_guard.subscribers.capacity() {
                reallocated_subscribers.append(&mut state_guard.subscribers);
                state_guard.subscribers = reallocated_subscribers;
            }
        }

        let subscription_id =
            SharedFutureSubscriptionId(num::NonZeroU64::MIN.saturating_add(state_guard.last_subscription_id));
        state_guard.last_subscription_id = subscription_id.0.get();
        state_guard.subscribers.push((subscription_id, None));
        Ok(subscription_id)
    }

    /// Cancel a subscription.
    ///
    /// If `wake_remaining` is `true`, all other remaining subscribed
    /// [`Waker`](task::Waker)s will get woken.
    fn unsubscribe(&self, subscription_id: SharedFutureSubscriptionId, wake_remaining: bool) {
        let mut state_guard = self.state.lock();
        if let Some(index) = state_guard
            .subscribers
            .iter()
            .position(|(entry_subscription_id, _)| *entry_subscription_id == subscription_id)
        {
            state_guard.subscribers.swap_remove(index);
        }

        if wake_remaining {
            self.wake_all(&state_guard);
        }
    }

    /// Update a subscription's associated [`Waker`](task::Waker).
    fn set_subscription_waker(&self, subscription_id: SharedFutureSubscriptionId, waker: &task::Waker) {
        let mut state_guard = self.state.lock();
        if let Some((_, entry_waker)) = state_guard
            .subscribers
            .iter_mut()
            .find(|(entry_subscription_id, _)| *entry_subscription_id == subscription_id)
        {
            match entry_waker {
                Some(entry_waker) if entry_waker.will_wake(waker) => (),
                _ => *entry_waker = Some(waker.clone()),
            }
        }
    }

    /// Obtain the wake generation, a number incremented upon each broadcast
    /// wake event.
    ///
    /// Has [`Acquire`](atomic::Ordering::Acquire) semantics, pairing with the
    /// [`Release`](atomic::Ordering::Release) of the increment in
    /// [`wake_all()`](Self::wake_all): memory writes sequenced before a
    /// wake-up happen before reads sequenced after loading the updated
    /// generation value.
    fn wake_gen(&self) -> u64 {
        // Pairs with the fence in wake_all() if called from a woken thread.
        atomic::fence(atomic::Ordering::Acquire);
        self.wake_gen.load(atomic::Ordering::Acquire)
    }

    /// Broadcast a wake event.
    fn wake_all(&self, state: &SharedFutureWakersState) {
        self.wake_gen.fetch_add(1, atomic::Ordering::Release);
        // Waking involves some sort of atomic store at least. The fence makes
        // woken threads doing a corresponding Acquire see the updated
        // wake_gen.
        atomic::fence(atomic::Ordering::Release);
        for (_, waker) in state.subscribers.iter() {
            if let Some(waker) = waker {
                waker.wake_by_ref();
            }
        }
    }
}

impl<ST: sync_types::SyncTypes> Wake for SharedFutureWakers<ST> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let state_guard = self.state.lock();
        self.wake_all(&state_guard);
    }
}

/// Subscription to a [`SharedFuture`].
///
/// Instantiated through [`SharedFuture::subscribe()`], implements
/// [`Future`](future::Future) resolving to a clone of the shared result.
/// Polling it drives the shared computation forward. Any number of
/// subscriptions to the same [`SharedFuture`] may get polled concurrently.
///
/// Dropping a subscription before completion unsubscribes it, the shared
/// computation is unaffected as long as other subscriptions keep polling.
pub struct SharedFutureSubscription<ST: sync_types::SyncTypes, F: future::Future + Send>
where
    F::Output: Clone + Send + Sync,
{
    state: SharedFutureSubscriptionState<ST, F>,
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> SharedFutureSubscription<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    /// The [`SharedFuture`] subscribed to, `None` once completed.
    pub fn shared_future(&self) -> Option<&SharedFuture<ST, F>> {
        match &self.state {
            SharedFutureSubscriptionState::Pending { shared_future, .. } => Some(shared_future),
            SharedFutureSubscriptionState::Done => None,
        }
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> future::Future for SharedFutureSubscription<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    type Output = F::Output;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            SharedFutureSubscriptionState::Pending {
                shared_future,
                subscription_id,
            } => {
                let result = shared_future.core.as_ref().poll_from_subscription(*subscription_id, cx);
                if result.is_ready() {
                    this.state = SharedFutureSubscriptionState::Done;
                }
                result
            }
            SharedFutureSubscriptionState::Done => unreachable!(),
        }
    }
}

impl<ST: sync_types::SyncTypes, F: future::Future + Send> Drop for SharedFutureSubscription<ST, F>
where
    F::Output: Clone + Send + Sync,
{
    fn drop(&mut self) {
        if let SharedFutureSubscriptionState::Pending {
            shared_future,
            subscription_id,
        } = &self.state
        {
            shared_future.core.wakers.unsubscribe(*subscription_id, false);
            self.state = SharedFutureSubscriptionState::Done;
        }
    }
}

/// Private state of [`SharedFutureSubscription`].
enum SharedFutureSubscriptionState<ST: sync_types::SyncTypes, F: future::Future> {
    /// The subscription has not been polled to completion yet.
    Pending {
        shared_future: SharedFuture<ST, F>,
        subscription_id: SharedFutureSubscriptionId,
    },
    /// The subscription has been polled to completion and the result
    /// returned.
    Done,
}

#[test]
fn test_shared_future_single() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes};

    let shared_future = SharedFuture::<TestNopSyncTypes, _>::new(async { 1u32 });
    let subscription = shared_future.subscribe().unwrap();

    let e = TestAsyncExecutor::new();
    let w = TestAsyncExecutor::spawn(&e, subscription);
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w.take().unwrap(), 1u32);
    assert!(shared_future.is_completed());
}

#[test]
fn test_shared_future_broadcast() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};

    let (operation, trigger) = TestOperation::<u32>::new();
    let shared_future = SharedFuture::<TestNopSyncTypes, _>::new(operation);
    let subscription0 = shared_future.subscribe().unwrap();
    let subscription1 = shared_future.subscribe().unwrap();

    let e = TestAsyncExecutor::new();
    let w0 = TestAsyncExecutor::spawn(&e, subscription0);
    let w1 = TestAsyncExecutor::spawn(&e, subscription1);
    TestAsyncExecutor::run_until_stalled(&e);
    assert!(!shared_future.is_completed());

    trigger.complete(1u32);
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w0.take().unwrap(), 1u32);
    assert_eq!(w1.take().unwrap(), 1u32);
    assert!(shared_future.is_completed());
}

#[test]
fn test_shared_future_post_completion_subscribe() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};

    let (operation, trigger) = TestOperation::<u32>::new();
    trigger.complete(1u32);
    let shared_future = SharedFuture::<TestNopSyncTypes, _>::new(operation);
    let subscription0 = shared_future.subscribe().unwrap();

    let e = TestAsyncExecutor::new();
    let w0 = TestAsyncExecutor::spawn(&e, subscription0);
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w0.take().unwrap(), 1u32);

    let subscription1 = shared_future.subscribe().unwrap();
    let w1 = TestAsyncExecutor::spawn(&e, subscription1);
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w1.take().unwrap(), 1u32);
    assert_eq!(trigger.polls(), 1);
}

#[test]
fn test_shared_future_cancel_subscription() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};

    let (operation, trigger) = TestOperation::<u32>::new();
    let shared_future = SharedFuture::<TestNopSyncTypes, _>::new(operation);
    let subscription0 = shared_future.subscribe().unwrap();
    let subscription1 = shared_future.subscribe().unwrap();

    let e = TestAsyncExecutor::new();
    // The first subscription polls the inner future once and then gets
    // abandoned.
    let w0 = TestAsyncExecutor::spawn(&e, subscription0);
    TestAsyncExecutor::run_until_stalled(&e);
    drop(w0);

    let w1 = TestAsyncExecutor::spawn(&e, subscription1);
    TestAsyncExecutor::run_until_stalled(&e);
    trigger.complete(1u32);
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w1.take().unwrap(), 1u32);
}

#[test]
fn test_shared_future_failure_replicated() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct TestOperationFailed;

    let (operation, trigger) = TestOperation::<Result<u32, TestOperationFailed>>::new();
    let shared_future = SharedFuture::<TestNopSyncTypes, _>::new(operation);

    let e = TestAsyncExecutor::new();
    let w0 = TestAsyncExecutor::spawn(&e, shared_future.subscribe().unwrap());
    let w1 = TestAsyncExecutor::spawn(&e, shared_future.subscribe().unwrap());
    TestAsyncExecutor::run_until_stalled(&e);
    trigger.complete(Err(TestOperationFailed));
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w0.take().unwrap(), Err(TestOperationFailed));
    assert_eq!(w1.take().unwrap(), Err(TestOperationFailed));
}

#[test]
fn test_shared_future_identity() {
    use crate::test::TestNopSyncTypes;

    let shared_future0 = SharedFuture::<TestNopSyncTypes, _>::new(future::ready(1u32));
    let shared_future1 = SharedFuture::<TestNopSyncTypes, _>::new(future::ready(1u32));
    assert_eq!(shared_future0, shared_future0.clone());
    assert_ne!(shared_future0, shared_future1);
}

#[test]
fn test_shared_future_many_subscriptions() {
    use crate::test::{TestAsyncExecutor, TestNopSyncTypes, TestOperation};

    let (operation, trigger) = TestOperation::<u32>::new();
    let shared_future = SharedFuture::<TestNopSyncTypes, _>::new(operation);

    let e = TestAsyncExecutor::new();
    // Exceeds the initial subscriber slot capacity a couple of times.
    let waiters: Vec<_> = (0..37)
        .map(|_| TestAsyncExecutor::spawn(&e, shared_future.subscribe().unwrap()))
        .collect();
    TestAsyncExecutor::run_until_stalled(&e);
    trigger.complete(7u32);
    TestAsyncExecutor::run_to_completion(&e);
    for w in waiters {
        assert_eq!(w.take().unwrap(), 7u32);
    }
}

#[cfg(feature = "std")]
#[test]
fn test_shared_future_concurrent_completed_subscriptions() {
    extern crate std;
    use crate::sync_types::std_sync_types::StdSyncTypes;
    use crate::test::TestAsyncExecutor;

    let shared_future = SharedFuture::<StdSyncTypes, _>::new(future::ready(alloc::vec![1u32, 2, 3]));
    let e = TestAsyncExecutor::new();
    let w = TestAsyncExecutor::spawn(&e, shared_future.subscribe().unwrap());
    TestAsyncExecutor::run_to_completion(&e);
    assert_eq!(w.take().unwrap(), [1u32, 2, 3]);

    // All threads clone the stored result out in parallel.
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..64 {
                    let e = TestAsyncExecutor::new();
                    let w = TestAsyncExecutor::spawn(&e, shared_future.subscribe().unwrap());
                    TestAsyncExecutor::run_to_completion(&e);
                    assert_eq!(w.take().unwrap(), [1u32, 2, 3]);
                }
            });
        }
    });
    assert!(shared_future.is_completed());
}
