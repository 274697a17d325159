// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Testing [`TestNopSyncTypes`], a [`Future`] [test
//! exector](TestAsyncExecutor) and a manually completed [test
//! operation](TestOperation).

extern crate alloc;
use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::sync_types::{self, Lock as _};
use core::{cell, convert, future, marker, ops, pin, sync::atomic, task};

/// Dummy [`Lock`](sync_types::Lock) for testing purposes.
///
/// Any attempt to lock an already locked `TestNopLock` will panic.
pub struct TestNopLock<T: marker::Send> {
    locked: atomic::AtomicBool,
    v: cell::UnsafeCell<T>,
}

impl<T: marker::Send> convert::From<T> for TestNopLock<T> {
    fn from(value: T) -> Self {
        Self {
            locked: atomic::AtomicBool::new(false),
            v: cell::UnsafeCell::new(value),
        }
    }
}

unsafe impl<T: marker::Send> marker::Send for TestNopLock<T> {}
unsafe impl<T: marker::Send> marker::Sync for TestNopLock<T> {}

impl<T: marker::Send> sync_types::Lock<T> for TestNopLock<T> {
    type Guard<'a>
        = TestNopLockGuard<'a, T>
    where
        Self: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        assert_eq!(
            self.locked
                .compare_exchange(false, true, atomic::Ordering::Acquire, atomic::Ordering::Relaxed),
            Ok(false),
            "Testing TestNopLocks are not expected to ever be contended."
        );
        TestNopLockGuard { lock: self }
    }
}

impl<T: marker::Send> sync_types::ConstructibleLock<T> for TestNopLock<T> {
    fn get_mut(&mut self) -> &mut T {
        assert!(!self.locked.load(atomic::Ordering::Relaxed));
        self.v.get_mut()
    }
}

/// The [locking guard](sync_types::Lock::Guard) associated with
/// [`TestNopLock`].
pub struct TestNopLockGuard<'a, T: marker::Send> {
    lock: &'a TestNopLock<T>,
}

impl<'a, T: marker::Send> Drop for TestNopLockGuard<'a, T> {
    fn drop(&mut self) {
        assert_eq!(
            self.lock
                .locked
                .compare_exchange(true, false, atomic::Ordering::Release, atomic::Ordering::Relaxed),
            Ok(true),
            "Testing TestNopLock with active lock guard found unlocked."
        );
    }
}

impl<'a, T: marker::Send> ops::Deref for TestNopLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        let p = self.lock.v.get();
        // Safety: the very purpose of a Lock is exclusive access, so no aliasing.
        unsafe { &*p }
    }
}

impl<'a, T: marker::Send> ops::DerefMut for TestNopLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let p = self.lock.v.get();
        // Safety: the very purpose of a Lock is exclusive access, so no aliasing.
        unsafe { &mut *p }
    }
}

/// Dummy [`SyncTypes`](sync_types::SyncTypes) collection for testing purposes.
pub struct TestNopSyncTypes;

impl sync_types::SyncTypes for TestNopSyncTypes {
    type Lock<T: marker::Send> = TestNopLock<T>;
}

/// State shared between a [`TestOperation`] and its [`TestOperationTrigger`].
struct TestOperationState<T: marker::Send> {
    result: Option<T>,
    waker: Option<task::Waker>,
    polls: usize,
    done: bool,
}

/// [`Future`] standing in for some asynchronous operation in tests.
///
/// Stays [`Pending`](task::Poll::Pending) until its associated
/// [`TestOperationTrigger`] [completes](TestOperationTrigger::complete) it.
/// Panics if polled again after having returned
/// [`Ready`](task::Poll::Ready).
pub struct TestOperation<T: marker::Send> {
    state: Arc<TestNopLock<TestOperationState<T>>>,
}

impl<T: marker::Send> TestOperation<T> {
    /// Create a new [`TestOperation`] alongside its [`TestOperationTrigger`].
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, TestOperationTrigger<T>) {
        let state = Arc::new(TestNopLock::from(TestOperationState {
            result: None,
            waker: None,
            polls: 0,
            done: false,
        }));
        (Self { state: state.clone() }, TestOperationTrigger { state })
    }
}

impl<T: marker::Send> future::Future for TestOperation<T> {
    type Output = T;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let mut state = self.state.lock();
        assert!(!state.done, "TestOperation polled after completion.");
        state.polls += 1;
        match state.result.take() {
            Some(result) => {
                state.done = true;
                task::Poll::Ready(result)
            }
            None => {
                state.waker = Some(cx.waker().clone());
                task::Poll::Pending
            }
        }
    }
}

/// Completion handle of a [`TestOperation`].
pub struct TestOperationTrigger<T: marker::Send> {
    state: Arc<TestNopLock<TestOperationState<T>>>,
}

impl<T: marker::Send> TestOperationTrigger<T> {
    /// Make the associated [`TestOperation`] [`Ready`](task::Poll::Ready)
    /// with `result` and wake it, if polled before.
    pub fn complete(&self, result: T) {
        let mut state = self.state.lock();
        assert!(state.result.is_none() && !state.done);
        state.result = Some(result);
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// The number of times the associated [`TestOperation`] has been polled.
    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }
}

/// Dyn dispatcher trait to a [`Future`] enqueued at [`TestAsyncExecutor`].
trait QueuedTaskDispatch: marker::Send {
    /// Poll the wrapped [`Future`].
    ///
    /// Return true once the wrapped [`Future`]'s
    /// [`poll()`](future::Future::poll) returns
    /// [`Ready`](task::Poll::Ready), `false` otherwise.
    fn poll_pinned(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> bool;
}

/// Dyn dispatcher to a [`Future`] enqueued at [`TestAsyncExecutor`].
///
/// As the individual enqueued [`Future`]s can all have different
/// [`Output`](future::Future::Output) types, it is not possible to store them
/// as `dyn` objects and dispatch to their [`poll()`](future::Future::poll)
/// implementations directly, hence the indirection.
struct QueuedTask<F: future::Future + Send>
where
    F::Output: Send + 'static,
{
    /// The queued [`Future`].
    f: F,
    /// The result, stored once `f`'s [`poll()`](future::Future::poll) returns
    /// [`Ready`](task::Poll::Ready), to get taken by the task's associated
    /// [`TestAsyncExecutorTaskWaiter`].
    result: Arc<TestNopLock<Option<F::Output>>>,
}

impl<F: future::Future + Send> QueuedTaskDispatch for QueuedTask<F>
where
    F::Output: Send + 'static,
{
    fn poll_pinned(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> bool {
        // Safety: projection repin, the result member is never pinned.
        let this = unsafe { self.get_unchecked_mut() };
        let f = unsafe { pin::Pin::new_unchecked(&mut this.f) };
        match future::Future::poll(f, cx) {
            task::Poll::Ready(result) => {
                *this.result.lock() = Some(result);
                true
            }
            task::Poll::Pending => false,
        }
    }
}

/// Runnable status of a [`TaskQueueEntry`] enqueued at [`TestAsyncExecutor`].
enum TaskStatus {
    /// The task's last poll returned [`Pending`](task::Poll::Pending) and it
    /// has not been woken since.
    Blocked,
    /// The task is either freshly enqueued or has been woken.
    Runnable,
}

/// State for a top-level [`Future`] [enqueued](TestAsyncExecutor::spawn) at a
/// [`TestAsyncExecutor`].
struct TaskQueueEntry {
    id: u64,
    status: TaskStatus,
    /// The enqueued top-level [`Future`], temporarily taken while getting
    /// polled.
    task: Option<pin::Pin<Box<dyn QueuedTaskDispatch>>>,
}

/// A [`Waker`](task::Waker) for the [`TestAsyncExecutor`].
struct Waker {
    task_id: u64,
    executor: Arc<TestAsyncExecutor>,
}

impl alloc::task::Wake for Waker {
    fn wake(self: Arc<Self>) {
        let mut tasks = self.executor.tasks.lock();
        if let Some(t) = tasks.iter_mut().find(|t| t.id == self.task_id) {
            t.status = TaskStatus::Runnable;
        }
    }
}

/// Waiter returned for top level [`Future`]s from
/// [`TestAsyncExecutor::spawn()`](TestAsyncExecutor::spawn).
///
/// Provides a means to obtain the [`Output`](future::Future::Output) of the
/// associated enqueued [`Future`] once [`Ready`](task::Poll::Ready). Dropping
/// the waiter before that cancels the task.
pub struct TestAsyncExecutorTaskWaiter<T: marker::Send> {
    executor: Arc<TestAsyncExecutor>,
    task_id: u64,
    result: Arc<TestNopLock<Option<T>>>,
    taken: bool,
}

impl<T: marker::Send> TestAsyncExecutorTaskWaiter<T> {
    /// Take the associated enqueued [`Future`]'s
    /// [`Output`](future::Future::Output) if [`Ready`](task::Poll::Ready).
    pub fn take(mut self) -> Option<T> {
        self.taken = true;
        self.result.lock().take()
    }
}

impl<T: marker::Send> Drop for TestAsyncExecutorTaskWaiter<T> {
    fn drop(&mut self) {
        if !self.taken && self.result.lock().is_none() {
            self.executor.remove_task(self.task_id);
        }
    }
}

/// Single-threaded [`Future`] task executor for testing purposes.
///
/// Enqueue top-level [`Future`]s via [`spawn()`](Self::spawn) and poll all
/// currently enqueued ones to completion via
/// [`run_to_completion()`](Self::run_to_completion), or only until none is
/// runnable anymore via [`run_until_stalled()`](Self::run_until_stalled).
pub struct TestAsyncExecutor {
    /// All enqueued top-level [`Future`]s, in the order of their enqueueing.
    tasks: TestNopLock<Vec<TaskQueueEntry>>,
    /// The task id to assign to the next [`Future`] to get
    /// [enqueued](Self::spawn).
    next_id: atomic::AtomicU64,
}

impl TestAsyncExecutor {
    /// Create a new [`TestAsyncExecutor`] instance.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: TestNopLock::from(Vec::new()),
            next_id: atomic::AtomicU64::new(0),
        })
    }

    /// Enqueue a top-level [`Future`] for polling from a subsequent
    /// [`run_to_completion()`](Self::run_to_completion) or
    /// [`run_until_stalled()`](Self::run_until_stalled) invocation.
    pub fn spawn<F: future::Future + Send + 'static>(this: &Arc<Self>, f: F) -> TestAsyncExecutorTaskWaiter<F::Output>
    where
        F::Output: Send + 'static,
    {
        let id = this.next_id.fetch_add(1, atomic::Ordering::Relaxed);
        let result = Arc::new(TestNopLock::from(None));
        let task = Box::pin(QueuedTask {
            f,
            result: result.clone(),
        }) as pin::Pin<Box<dyn QueuedTaskDispatch>>;
        this.tasks.lock().push(TaskQueueEntry {
            id,
            status: TaskStatus::Runnable,
            task: Some(task),
        });

        TestAsyncExecutorTaskWaiter {
            executor: this.clone(),
            task_id: id,
            result,
            taken: false,
        }
    }

    fn remove_task(&self, id: u64) {
        let mut tasks = self.tasks.lock();
        if let Some(index) = tasks.iter().position(|task| task.id == id) {
            // Dropping the task might drop further TaskWaiter instances held by
            // it, which would in turn reenter here.
            let entry = tasks.remove(index);
            drop(tasks);
            drop(entry);
        };
    }

    /// Poll all currently [enqueued](Self::spawn) [`Future`]s to completion.
    ///
    /// There must always be at least one runnable [`Future`] left, or the
    /// executor will become stuck and report the fact via a panic.
    pub fn run_to_completion(this: &Arc<Self>) {
        let stalled = Self::run(this);
        assert!(!stalled, "TestAsyncExecutor stuck with no runnable task.");
    }

    /// Poll the [enqueued](Self::spawn) [`Future`]s until all are either
    /// completed or blocked.
    pub fn run_until_stalled(this: &Arc<Self>) {
        Self::run(this);
    }

    /// Poll the runnable enqueued [`Future`]s in a round-robin fashion, in the
    /// order of their enqueueing.
    ///
    /// Returns `true` if stopped with some task blocked, `false` if all have
    /// completed.
    fn run(this: &Arc<Self>) -> bool {
        let mut last_polled_id: Option<u64> = None;
        loop {
            let mut tasks = this.tasks.lock();
            if tasks.is_empty() {
                return false;
            }

            // Continue after the last polled task, wrapping around.
            let search_begin = match last_polled_id {
                Some(last_polled_id) => tasks
                    .iter()
                    .position(|entry| entry.id > last_polled_id)
                    .unwrap_or(0),
                None => 0,
            };
            let index = tasks
                .iter()
                .enumerate()
                .skip(search_begin)
                .chain(tasks.iter().enumerate().take(search_begin))
                .find(|(_, entry)| matches!(entry.status, TaskStatus::Runnable) && entry.task.is_some())
                .map(|(index, _)| index);
            let index = match index {
                Some(index) => index,
                None => return true,
            };

            let entry = &mut tasks[index];
            let task_id = entry.id;
            last_polled_id = Some(task_id);
            let mut task = match entry.task.take() {
                Some(task) => task,
                None => continue,
            };
            // Set the status to blocked now, so that any wake-ups from wakers
            // won't get missed.
            entry.status = TaskStatus::Blocked;
            // The task might spawn more tasks or drop some TaskWaiters.
            drop(tasks);

            let waker = task::Waker::from(Arc::new(Waker {
                task_id,
                executor: this.clone(),
            }));
            let mut cx = task::Context::from_waker(&waker);
            let done = task.as_mut().poll_pinned(&mut cx);
            let task = if done {
                // Dropping the task might reenter Self::remove_task(), do it
                // outside the tasks lock.
                drop(task);
                None
            } else {
                Some(task)
            };

            let mut tasks = this.tasks.lock();
            let index = match tasks.iter().position(|entry| entry.id == task_id) {
                Some(index) => index,
                // The task is gone, its TaskWaiter has been dropped.
                None => continue,
            };
            if done {
                tasks.remove(index);
            } else {
                tasks[index].task = task;
            }
        }
    }
}

#[test]
fn test_test_async_executor_simple() {
    let executor = TestAsyncExecutor::new();
    let waiter = TestAsyncExecutor::spawn(&executor, async { async { 42 }.await });
    TestAsyncExecutor::run_to_completion(&executor);
    assert_eq!(waiter.take().unwrap(), 42);
    assert_eq!(Arc::strong_count(&executor), 1);
}

#[test]
fn test_test_async_executor_wake_self() {
    use ops::Deref as _;

    enum SelfWakingTask {
        Unpolled,
        PolledOnce,
    }

    impl future::Future for SelfWakingTask {
        type Output = u32;

        fn poll(mut self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
            match self.deref() {
                Self::Unpolled => {
                    cx.waker().wake_by_ref();
                    *self = Self::PolledOnce;
                    task::Poll::Pending
                }
                Self::PolledOnce => task::Poll::Ready(42),
            }
        }
    }

    let executor = TestAsyncExecutor::new();
    let waiter = TestAsyncExecutor::spawn(&executor, SelfWakingTask::Unpolled);
    TestAsyncExecutor::run_to_completion(&executor);
    assert_eq!(waiter.take().unwrap(), 42);
}

#[test]
fn test_test_async_executor_stalled() {
    let (operation, trigger) = TestOperation::<u32>::new();
    let executor = TestAsyncExecutor::new();
    let waiter = TestAsyncExecutor::spawn(&executor, operation);
    TestAsyncExecutor::run_until_stalled(&executor);
    assert_eq!(trigger.polls(), 1);

    trigger.complete(42);
    TestAsyncExecutor::run_to_completion(&executor);
    assert_eq!(waiter.take().unwrap(), 42);
    assert_eq!(trigger.polls(), 2);
}
