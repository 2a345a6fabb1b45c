//! Inbound scheduling: pipes with pending messages are kept in one round-robin
//! list per priority, and a single dispatch task drains them highest priority
//! first, one message per turn. Lower priorities starve only while strictly
//! higher ones have traffic.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::message::Message;
use crate::messenger::MessengerCore;
use crate::pipe::Pipe;

/// One unit of work for the dispatch task. Session events travel through the
/// same queue as messages so they cannot overtake each other arbitrarily.
pub(crate) enum DispatchItem {
    Message(Message),
    Connect(Arc<Connection>),
    Reset(Arc<Connection>),
    RemoteReset(Arc<Connection>),
}

#[derive(Default)]
struct DqInner {
    /// priority -> pipes with pending items at that priority, in arrival order
    queued: BTreeMap<u8, VecDeque<Arc<Pipe>>>,
}

pub(crate) struct DispatchQueue {
    inner: Mutex<DqInner>,
    cond: Notify,
    stop: AtomicBool,
    qlen: AtomicUsize,
}

impl DispatchQueue {
    pub fn new() -> DispatchQueue {
        DispatchQueue {
            inner: Mutex::new(DqInner::default()),
            cond: Notify::new(),
            stop: AtomicBool::new(false),
            qlen: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.qlen.load(Ordering::Acquire)
    }

    pub fn inc_len(&self) {
        self.qlen.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_len(&self, by: usize) {
        self.qlen.fetch_sub(by, Ordering::AcqRel);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.cond.notify_waiters();
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Put a pipe on the round-robin for `priority`. The caller (holding the
    /// pipe's lock) has just made its first pending item at that priority.
    pub fn queue_pipe(&self, priority: u8, pipe: Arc<Pipe>) {
        let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");
        inner.queued.entry(priority).or_default().push_back(pipe);
        drop(inner);
        self.cond.notify_waiters();
    }

    fn pop_next(&self) -> Option<(u8, Arc<Pipe>)> {
        let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");
        let (&priority, list) = inner.queued.iter_mut().next_back()?;
        let pipe = list.pop_front().expect("empty round-robin list left in map");
        if list.is_empty() {
            inner.queued.remove(&priority);
        }
        Some((priority, pipe))
    }

    /// Take a pipe out of every round-robin it is on. Called while tearing the
    /// pipe's queues down.
    pub fn remove_pipe(&self, pipe: &Arc<Pipe>) {
        let mut inner = self.inner.lock().expect("dispatch queue lock poisoned");
        inner.queued.retain(|_, list| {
            list.retain(|p| !Arc::ptr_eq(p, pipe));
            !list.is_empty()
        });
    }

    async fn wait_for_work(&self) {
        let notified = self.cond.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.stopped() || self.pop_would_succeed() {
            return;
        }
        notified.await;
    }

    fn pop_would_succeed(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("dispatch queue lock poisoned")
            .queued
            .is_empty()
    }
}

/// The dispatch task: pull the highest-priority pipe with pending work, take
/// one item, rotate the pipe to the tail if it has more at that priority, and
/// deliver. Runs until `shutdown` stops the queue; the in-flight handler call
/// finishes before the task exits.
pub(crate) async fn dispatch_entry(core: Arc<MessengerCore>) {
    debug!("dispatch task starting");
    let dq = &core.dispatch_queue;
    loop {
        if dq.stopped() {
            break;
        }
        let Some((priority, pipe)) = dq.pop_next() else {
            dq.wait_for_work().await;
            continue;
        };

        let item = {
            let mut inner = pipe.inner.lock().await;
            let (item, more) = inner.pop_in_item(priority);
            if more {
                dq.queue_pipe(priority, pipe.clone());
            }
            item
        };
        let Some(item) = item else {
            continue;
        };
        dq.dec_len(1);

        match item {
            DispatchItem::Message(mut m) => {
                let msize = m.take_dispatch_throttle_size();
                trace!("dispatching {:?}", m);
                core.dispatcher.dispatch(m).await;
                core.dispatch_throttler.release(msize);
            }
            DispatchItem::Connect(con) => core.dispatcher.handle_connect(con).await,
            DispatchItem::Reset(con) => core.dispatcher.handle_reset(con).await,
            DispatchItem::RemoteReset(con) => core.dispatcher.handle_remote_reset(con).await,
        }
    }
    debug!("dispatch task done");
}
