//! The native queue.
//!
//! Submissions execute on a dedicated worker thread in submission order.
//! Completion is signaled through fences and optionally through a callback
//! into a [`CompletionContext`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::DeviceError;

use super::executor;
use super::native::{NativeCommandBuffer, NativeShared};

/// A native fence. Signaled by the queue, reset by the host.
#[derive(Clone, Debug, Default)]
pub(crate) struct NativeFence(Arc<AtomicBool>);

impl NativeFence {
    pub fn new(signaled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(signaled)))
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Receives completion notifications from the queue worker.
pub(crate) trait CompletionContext: Send + Sync {
    fn on_native_completion(&self, user_data: u64);
}

/// A completion callback registered with a submission.
///
/// The context is held weakly. A callback whose context is gone is dropped.
pub(crate) struct NativeCallback {
    pub context: Weak<dyn CompletionContext>,
    pub user_data: u64,
}

impl NativeCallback {
    fn invoke(self) {
        match self.context.upgrade() {
            Some(context) => context.on_native_completion(self.user_data),
            None => tracing::debug!(
                "dropping completion {} for destroyed context",
                self.user_data
            ),
        }
    }
}

/// A batch of work for the queue.
pub(crate) struct NativeSubmission {
    pub command_buffers: Vec<NativeCommandBuffer>,
    pub fence: Option<NativeFence>,
    pub callback: Option<NativeCallback>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Mutex<usize>,
    /// Notified whenever a fence is signaled or `pending` changes.
    cond: Condvar,
    /// Number of submissions the worker may still start. `None` if the
    /// queue is not held.
    gate: Mutex<Option<usize>>,
    gate_cond: Condvar,
}

impl QueueState {
    fn pass_gate(&self) {
        let mut gate = self.gate.lock();
        while *gate == Some(0) {
            self.gate_cond.wait(&mut gate);
        }

        if let Some(budget) = gate.as_mut() {
            *budget -= 1;
        }
    }

    fn set_gate(&self, gate: Option<usize>) {
        *self.gate.lock() = gate;
        self.gate_cond.notify_all();
    }
}

#[derive(Debug)]
pub(crate) struct NativeQueue {
    sender: Option<mpsc::Sender<NativeSubmission>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    state: Arc<QueueState>,
}

impl NativeQueue {
    pub fn new(shared: Arc<NativeShared>) -> Self {
        let (tx, rx) = mpsc::channel::<NativeSubmission>();
        let state = Arc::new(QueueState::default());

        let worker = {
            let state = state.clone();
            thread::Builder::new()
                .name("render-queue".to_owned())
                .spawn(move || run_queue(&shared, &state, rx))
                .ok()
        };

        if worker.is_none() {
            tracing::error!("failed to spawn queue worker");
        }

        let worker_id = worker
            .as_ref()
            .map_or_else(|| thread::current().id(), |handle| handle.thread().id());

        Self {
            sender: worker.is_some().then_some(tx),
            worker,
            worker_id,
            state,
        }
    }

    pub fn submit(&self, submission: NativeSubmission) -> Result<(), DeviceError> {
        let Some(sender) = &self.sender else {
            return Err(DeviceError::Lost);
        };

        *self.state.pending.lock() += 1;

        if sender.send(submission).is_err() {
            let mut pending = self.state.pending.lock();
            *pending -= 1;
            self.state.cond.notify_all();
            return Err(DeviceError::Lost);
        }

        Ok(())
    }

    /// Blocks until every submission has executed and its callback returned.
    pub fn wait_idle(&self) {
        let mut pending = self.state.pending.lock();
        while *pending != 0 {
            self.state.cond.wait(&mut pending);
        }
    }

    /// Returns the number of submissions that have not completed yet.
    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }

    /// Blocks until all (or any) `fences` are signaled.
    ///
    /// Returns `false` if `timeout` expired first.
    pub fn wait_fences(
        &self,
        fences: &[&NativeFence],
        wait_all: bool,
        timeout: Option<Duration>,
    ) -> bool {
        let ready = || {
            if wait_all {
                fences.iter().all(|fence| fence.is_signaled())
            } else {
                fences.iter().any(|fence| fence.is_signaled())
            }
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut guard = self.state.pending.lock();
        loop {
            if ready() {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if self.state.cond.wait_until(&mut guard, deadline).timed_out() {
                        return ready();
                    }
                }
                None => self.state.cond.wait(&mut guard),
            }
        }
    }

    /// Stops the worker before it starts the next submission.
    pub fn hold(&self) {
        self.state.set_gate(Some(0));
    }

    /// Lets a held worker start `submissions` more submissions.
    pub fn step(&self, submissions: usize) {
        let mut gate = self.state.gate.lock();
        if let Some(budget) = gate.as_mut() {
            *budget += submissions;
            self.state.gate_cond.notify_all();
        }
    }

    pub fn release(&self) {
        self.state.set_gate(None);
    }

    /// Returns `true` if called from the worker thread, i.e. from inside a
    /// completion callback.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

impl Drop for NativeQueue {
    fn drop(&mut self) {
        self.state.set_gate(None);
        self.sender.take();

        let Some(worker) = self.worker.take() else {
            return;
        };

        // The last owner may be dropped by a completion callback running on
        // the worker. The worker exits by itself once the channel is closed.
        if self.is_worker_thread() {
            return;
        }

        if worker.join().is_err() {
            tracing::error!("queue worker panicked");
        }
    }
}

fn run_queue(
    shared: &NativeShared,
    state: &QueueState,
    rx: mpsc::Receiver<NativeSubmission>,
) {
    while let Ok(submission) = rx.recv() {
        state.pass_gate();

        if shared.is_lost() {
            tracing::warn!("skipping execution on lost device");
        } else {
            for command_buffer in &submission.command_buffers {
                executor::execute(shared, &command_buffer.data().lock());
            }
        }

        if let Some(fence) = &submission.fence {
            let _guard = state.pending.lock();
            fence.signal();
            state.cond.notify_all();
        }

        if let Some(callback) = submission.callback {
            callback.invoke();
        }

        let mut pending = state.pending.lock();
        *pending -= 1;
        state.cond.notify_all();
    }

    tracing::debug!("queue worker exiting");
}
