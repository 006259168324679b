//! Stackless task / scheduler.
//!
//! Mirrors `include/task.hh`: a task starts suspended, can be awaited by
//! another task (the awaiter is resumed at the callee's final suspension),
//! and can be `detach()`-ed so dropping the handle does not destroy the
//! frame. There is a single thread-local ready queue; the sole thread that
//! ever drains it is the one running [`crate::reactor::Reactor::run`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

thread_local! {
    static READY_QUEUE: RefCell<VecDeque<Rc<dyn Runnable>>> = RefCell::new(VecDeque::new());
}

trait Runnable {
    fn poll_once(self: Rc<Self>);
}

struct TaskInner<T> {
    future: RefCell<Option<Pin<Box<dyn Future<Output = T>>>>>,
    output: RefCell<Option<T>>,
    awaiter: RefCell<Option<Waker>>,
    detached: Cell<bool>,
    done: Cell<bool>,
}

impl<T: 'static> Runnable for TaskInner<T> {
    fn poll_once(self: Rc<Self>) {
        if self.done.get() {
            return;
        }
        let mut slot = self.future.borrow_mut();
        let poll_result = match slot.as_mut() {
            Some(fut) => {
                let waker = make_waker(self.clone());
                let mut cx = Context::from_waker(&waker);
                fut.as_mut().poll(&mut cx)
            }
            None => return,
        };
        if let Poll::Ready(value) = poll_result {
            *slot = None;
            drop(slot);
            self.done.set(true);
            *self.output.borrow_mut() = Some(value);
            if let Some(waker) = self.awaiter.borrow_mut().take() {
                waker.wake();
            }
        }
    }
}

fn schedule<T: 'static>(inner: Rc<TaskInner<T>>) {
    READY_QUEUE.with(|q| q.borrow_mut().push_back(inner));
}

fn make_waker<T: 'static>(inner: Rc<TaskInner<T>>) -> Waker {
    let ptr = Rc::into_raw(inner) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, vtable::<T>())) }
}

fn vtable<T: 'static>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(clone_fn::<T>, wake_fn::<T>, wake_by_ref_fn::<T>, drop_fn::<T>)
}

unsafe fn clone_fn<T: 'static>(ptr: *const ()) -> RawWaker {
    let rc = Rc::from_raw(ptr as *const TaskInner<T>);
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), vtable::<T>())
}

unsafe fn wake_fn<T: 'static>(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const TaskInner<T>);
    schedule(rc);
}

unsafe fn wake_by_ref_fn<T: 'static>(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const TaskInner<T>);
    schedule(rc.clone());
    std::mem::forget(rc);
}

unsafe fn drop_fn<T: 'static>(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const TaskInner<T>));
}

/// A handle to a spawned coroutine-like task.
///
/// Dropping a `Task<T>` that has not been [`detach`](Task::detach)ed leaves
/// the frame self-owned only while something else (an awaiter, or the
/// ready queue) still references it; once nothing does, the frame is
/// destroyed — matching "if there is no awaiter, the frame self-destroys"
/// from spec §4.4.
pub struct Task<T> {
    inner: Rc<TaskInner<T>>,
}

impl<T: 'static> Task<T> {
    /// Detach the task so it keeps running to completion even after this
    /// handle is dropped. Used for the accept loop, per-connection
    /// handlers, and the sync/bleach loops (spec §4.9).
    pub fn detach(self) {
        self.inner.detached.set(true);
        std::mem::forget(self);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.done.get()
    }
}

impl<T: 'static> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if self.inner.done.get() {
            return Poll::Ready(self.inner.output.borrow_mut().take().expect(
                "Task polled again after its output was already taken",
            ));
        }
        *self.inner.awaiter.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // Non-detached handles don't cancel the frame (spec §5 — "there is
        // no cancellation at task granularity"); the ready queue and any
        // fd waiter still reference the `Rc<TaskInner<T>>`, so the frame
        // keeps running until it finishes on its own.
    }
}

/// Spawns a future onto the reactor's task queue. The task starts
/// suspended and begins executing the next time the reactor drains its
/// ready queue (spec §4.4 — "starts suspended").
pub fn spawn<T: 'static>(fut: impl Future<Output = T> + 'static) -> Task<T> {
    let inner = Rc::new(TaskInner {
        future: RefCell::new(Some(Box::pin(fut))),
        output: RefCell::new(None),
        awaiter: RefCell::new(None),
        detached: Cell::new(false),
        done: Cell::new(false),
    });
    schedule(inner.clone());
    Task { inner }
}

/// Drains and polls every task currently in the ready queue, returning the
/// number polled. Called once per reactor loop turn before the next
/// `epoll_wait`.
pub(crate) fn run_ready_queue() -> usize {
    let mut polled = 0;
    loop {
        let next = READY_QUEUE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(task) => {
                task.poll_once();
                polled += 1;
            }
            None => break,
        }
    }
    polled
}
