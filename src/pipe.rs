//! One Pipe per peer address: it owns the TCP connection, runs the handshake,
//! and drives a reader and a writer task. The reader parses frames and feeds
//! the dispatch queue; the writer drains the priority queues, acks, and
//! reconnects when the state machine calls for it.
//!
//! All state transitions happen under the pipe's own lock; both tasks release
//! it for the actual socket I/O and re-observe state when they take it back.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::dispatch_queue::DispatchItem;
use crate::entity::{EntityAddr, EntityType};
use crate::error::TransportError;
use crate::message::{
    aligned_chunk_lens, BufferList, HeaderLayout, Message, MessageHeader, Footer, PRIO_HIGHEST,
};
use crate::messenger::MessengerCore;
use crate::policy::Policy;
use crate::throttle::{ThrottleDebit, Throttler};
use crate::wire::{
    features, proto_version, ConnectRecord, ConnectReply, Tag, BANNER, CONNECT_LOSSY,
};

/// Largest number of iovecs handed to one vectored write; longer messages are
/// split into several writes with identical on-wire content.
const IOV_MAX: usize = 1024;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum PipeState {
    Accepting,
    Connecting,
    Open,
    Standby,
    Wait,
    Closing,
    Closed,
}

/// What the acceptor does with an inbound connect when a pipe for the same
/// peer already exists. Pulled out as a pure function so the whole table is
/// testable without sockets.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum RaceOutcome {
    RetryGlobal(u32),
    RetrySession(u32),
    Wait,
    ResetSession,
    /// Reset the existing session (peer lost state, or the channel is lossy),
    /// then take over.
    ReplaceReset,
    /// Take over, carrying the existing session's queues and sequences.
    Replace,
}

pub(crate) fn resolve_accept_race(
    connect: &ConnectRecord,
    existing_peer_global_seq: u32,
    existing_connect_seq: u32,
    existing_lossy: bool,
    peer_wins_ties: bool,
) -> RaceOutcome {
    if connect.global_seq < existing_peer_global_seq {
        return RaceOutcome::RetryGlobal(existing_peer_global_seq);
    }
    if existing_lossy {
        return RaceOutcome::ReplaceReset;
    }
    if connect.connect_seq < existing_connect_seq {
        return if connect.connect_seq == 0 {
            // peer lost all session state and is starting over
            RaceOutcome::ReplaceReset
        } else {
            RaceOutcome::RetrySession(existing_connect_seq)
        };
    }
    if connect.connect_seq == existing_connect_seq {
        return if peer_wins_ties {
            RaceOutcome::Replace
        } else {
            RaceOutcome::Wait
        };
    }
    // connect.connect_seq > existing_connect_seq
    if existing_connect_seq == 0 {
        RaceOutcome::ResetSession
    } else {
        RaceOutcome::Replace
    }
}

pub(crate) struct PipeInner {
    pub state: PipeState,
    pub peer_addr: EntityAddr,
    pub peer_type: Option<EntityType>,
    pub policy: Policy,
    pub connection: Arc<Connection>,

    sock_rd: Option<OwnedReadHalf>,
    sock_wr: Option<OwnedWriteHalf>,
    /// socket address seen by accept(); used to fill in a blank claimed IP
    accept_socket_addr: Option<SocketAddr>,

    pub reader_running: bool,
    pub writer_running: bool,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,

    out_q: BTreeMap<u8, VecDeque<Message>>,
    sent: VecDeque<Message>,
    in_q: BTreeMap<u8, VecDeque<DispatchItem>>,
    in_qlen: usize,
    queued_priorities: BTreeSet<u8>,

    keepalive: bool,
    pub close_on_empty: bool,
    pub disposable: bool,
    halt_delivery: bool,

    pub connect_seq: u32,
    pub peer_global_seq: u32,
    pub out_seq: u64,
    pub in_seq: u64,
    pub in_seq_acked: u64,

    backoff: Option<Duration>,
}

impl PipeInner {
    pub fn is_queued(&self) -> bool {
        !self.out_q.is_empty() || self.keepalive
    }

    pub fn out_q_empty(&self) -> bool {
        self.out_q.is_empty()
    }

    pub fn send(&mut self, m: Message) {
        self.out_q.entry(m.priority()).or_default().push_back(m);
    }

    pub fn send_keepalive(&mut self) {
        self.keepalive = true;
    }

    fn get_next_outgoing(&mut self) -> Option<Message> {
        let (&priority, q) = self.out_q.iter_mut().next_back()?;
        let m = q.pop_front();
        if q.is_empty() {
            self.out_q.remove(&priority);
        }
        m
    }

    /// Move everything un-acked from `sent` back to the front of the highest
    /// priority queue, keeping the seq numbers already assigned so a replay
    /// carries the same identity. Messages the peer acked are dropped.
    fn requeue_sent(&mut self, max_acked: u64) {
        if self.sent.is_empty() {
            return;
        }
        let rq = self.out_q.entry(PRIO_HIGHEST).or_default();
        while let Some(m) = self.sent.pop_back() {
            if m.seq() > max_acked {
                trace!("requeueing {:?} for resend", m);
                rq.push_front(m);
            } else {
                // acked along with everything before it
                self.sent.clear();
                break;
            }
        }
        if rq.is_empty() {
            self.out_q.remove(&PRIO_HIGHEST);
        }
    }

    /// Drop requeued messages the peer has already seen, per the seq exchange
    /// of a reconnect. Requeued messages sit at the front of the highest
    /// priority queue and are the only ones with a seq already assigned.
    fn trim_requeued(&mut self, acked: u64) {
        let Some(rq) = self.out_q.get_mut(&PRIO_HIGHEST) else {
            return;
        };
        while let Some(m) = rq.front() {
            if m.seq() != 0 && m.seq() <= acked {
                trace!("peer already has {:?}, dropping from replay", m);
                rq.pop_front();
            } else {
                break;
            }
        }
        if rq.is_empty() {
            self.out_q.remove(&PRIO_HIGHEST);
        }
    }

    /// Prune `sent` up to the peer's cumulative ack. Returns true when this
    /// emptied the sent list and the pipe was asked to close once drained.
    fn handle_ack(&mut self, seq: u64) -> bool {
        while let Some(m) = self.sent.front() {
            if m.seq() <= seq {
                trace!("ack covers {:?}", m);
                self.sent.pop_front();
            } else {
                break;
            }
        }
        self.sent.is_empty() && self.close_on_empty
    }

    /// One inbound item for the dispatch task; the bool says whether more
    /// items remain at that priority (pipe rotates to the tail).
    pub(crate) fn pop_in_item(&mut self, priority: u8) -> (Option<DispatchItem>, bool) {
        let Some(q) = self.in_q.get_mut(&priority) else {
            return (None, false);
        };
        let item = q.pop_front();
        if item.is_some() {
            self.in_qlen -= 1;
        }
        if q.is_empty() {
            self.in_q.remove(&priority);
            self.queued_priorities.remove(&priority);
            (item, false)
        } else {
            (item, true)
        }
    }
}

pub(crate) struct Pipe {
    pub(crate) id: u64,
    core: Arc<MessengerCore>,
    pub(crate) inner: Mutex<PipeInner>,
    cond: Notify,
    /// bumped to break reader/writer out of blocking socket calls
    io_interrupt: watch::Sender<u64>,
    stopped: AtomicBool,
}

impl Pipe {
    fn new(
        core: Arc<MessengerCore>,
        state: PipeState,
        peer_addr: EntityAddr,
        peer_type: Option<EntityType>,
        policy: Policy,
        connection: Arc<Connection>,
    ) -> Arc<Pipe> {
        let (io_interrupt, _) = watch::channel(0);
        Arc::new(Pipe {
            id: core.next_pipe_id(),
            core,
            inner: Mutex::new(PipeInner {
                state,
                peer_addr,
                peer_type,
                policy,
                connection,
                sock_rd: None,
                sock_wr: None,
                accept_socket_addr: None,
                reader_running: false,
                writer_running: false,
                reader_handle: None,
                writer_handle: None,
                out_q: BTreeMap::new(),
                sent: VecDeque::new(),
                in_q: BTreeMap::new(),
                in_qlen: 0,
                queued_priorities: BTreeSet::new(),
                keepalive: false,
                close_on_empty: false,
                disposable: false,
                halt_delivery: false,
                connect_seq: 0,
                peer_global_seq: 0,
                out_seq: 0,
                in_seq: 0,
                in_seq_acked: 0,
                backoff: None,
            }),
            cond: Notify::new(),
            io_interrupt,
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn new_accepting(
        core: Arc<MessengerCore>,
        stream: TcpStream,
        socket_addr: SocketAddr,
    ) -> Arc<Pipe> {
        let peer_addr = EntityAddr::new(socket_addr, 0);
        let connection = Connection::new(peer_addr, None);
        let pipe = Pipe::new(
            core,
            PipeState::Accepting,
            peer_addr,
            None,
            Policy::default(),
            connection.clone(),
        );
        let (rd, wr) = stream.into_split();
        {
            let mut inner = pipe.inner.try_lock().expect("fresh pipe is uncontended");
            inner.sock_rd = Some(rd);
            inner.sock_wr = Some(wr);
            inner.accept_socket_addr = Some(socket_addr);
        }
        connection.set_pipe(pipe.clone());
        pipe
    }

    pub(crate) fn new_connecting(
        core: Arc<MessengerCore>,
        peer_addr: EntityAddr,
        peer_type: EntityType,
        policy: Policy,
    ) -> Arc<Pipe> {
        let connection = Connection::new(peer_addr, Some(peer_type));
        let pipe = Pipe::new(
            core,
            PipeState::Connecting,
            peer_addr,
            Some(peer_type),
            policy,
            connection.clone(),
        );
        connection.set_pipe(pipe.clone());
        pipe
    }

    /// The loopback pipe: permanently Open, no socket, no tasks. Self-sends
    /// go through its inbound queue like everything else.
    pub(crate) fn new_local(core: Arc<MessengerCore>, connection: Arc<Connection>) -> Arc<Pipe> {
        let peer_addr = connection.peer_addr();
        let pipe = Pipe::new(core, PipeState::Open, peer_addr, None, Policy::default(), connection.clone());
        connection.set_pipe(pipe.clone());
        pipe
    }

    pub(crate) async fn connection(&self) -> Arc<Connection> {
        self.inner.lock().await.connection.clone()
    }

    pub(crate) async fn start_reader(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        assert!(!inner.reader_running);
        inner.reader_running = true;
        let pipe = self.clone();
        inner.reader_handle = Some(tokio::spawn(async move { pipe.reader_entry().await }));
    }

    pub(crate) async fn start_writer(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        self.start_writer_locked(&mut inner);
    }

    fn start_writer_locked(self: &Arc<Self>, inner: &mut PipeInner) {
        assert!(!inner.writer_running);
        inner.writer_running = true;
        let pipe = self.clone();
        inner.writer_handle = Some(tokio::spawn(async move { pipe.writer_entry().await }));
    }

    pub(crate) fn notify(&self) {
        self.cond.notify_waiters();
    }

    fn interrupt_io(&self) {
        self.io_interrupt.send_modify(|v| *v += 1);
    }

    /// Abrupt close: terminal, interrupts any blocked I/O.
    pub(crate) fn stop_locked(&self, inner: &mut PipeInner) {
        inner.state = PipeState::Closed;
        self.stopped.store(true, Ordering::Release);
        inner.sock_rd = None;
        inner.sock_wr = None;
        self.interrupt_io();
        self.cond.notify_waiters();
    }

    /// Close, emitting a CLOSE tag first if the writer is in a position to.
    pub(crate) fn stop_gracefully_locked(&self, inner: &mut PipeInner) {
        if inner.state == PipeState::Open && inner.writer_running {
            inner.state = PipeState::Closing;
            self.interrupt_io();
            self.cond.notify_waiters();
        } else {
            self.stop_locked(inner);
        }
    }

    fn maybe_reap(self: &Arc<Self>, inner: &mut PipeInner) {
        if !inner.reader_running && !inner.writer_running {
            self.core.queue_reap(self.clone());
        }
    }

    /// Final cleanup, run by the reaper once both tasks have exited.
    pub(crate) async fn reap(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        self.discard_queue(&mut inner).await;
        inner.sock_rd = None;
        inner.sock_wr = None;
        let reader = inner.reader_handle.take();
        let writer = inner.writer_handle.take();
        let connection = inner.connection.clone();
        drop(inner);
        if let Some(h) = reader {
            let _ = h.await;
        }
        if let Some(h) = writer {
            let _ = h.await;
        }
        connection.clear_pipe_if(self);
    }

    // ---- inbound queueing --------------------------------------------------

    pub(crate) fn queue_received(
        self: &Arc<Self>,
        inner: &mut PipeInner,
        item: DispatchItem,
        priority: u8,
    ) {
        if inner.halt_delivery {
            self.release_item(item);
            return;
        }
        let newly_queued = !inner.queued_priorities.contains(&priority);
        inner.in_q.entry(priority).or_default().push_back(item);
        inner.in_qlen += 1;
        self.core.dispatch_queue.inc_len();
        if newly_queued {
            inner.queued_priorities.insert(priority);
            self.core.dispatch_queue.queue_pipe(priority, self.clone());
        }
    }

    fn release_item(&self, item: DispatchItem) {
        if let DispatchItem::Message(mut m) = item {
            self.core.dispatch_throttle_release(m.take_dispatch_throttle_size());
            // the policy throttle debit rides the message and releases on drop
        }
    }

    /// Tear down every queue this pipe owns and take it off the dispatch
    /// round-robins, releasing throttle credit for undelivered inbound.
    pub(crate) async fn discard_queue(self: &Arc<Self>, inner: &mut PipeInner) {
        inner.halt_delivery = true;
        self.core.dispatch_queue.remove_pipe(self);
        self.core.dispatch_queue.dec_len(inner.in_qlen);
        for (_, q) in std::mem::take(&mut inner.in_q) {
            for item in q {
                self.release_item(item);
            }
        }
        inner.in_qlen = 0;
        inner.queued_priorities.clear();
        inner.out_q.clear();
        inner.sent.clear();
    }

    async fn was_session_reset(self: &Arc<Self>, inner: &mut PipeInner) {
        debug!("session to {:?} was reset", inner.peer_addr);
        self.discard_queue(inner).await;
        self.core.queue_remote_reset(inner.connection.clone()).await;
        inner.out_seq = 0;
        inner.in_seq = 0;
        inner.in_seq_acked = 0;
        inner.connect_seq = 0;
    }

    // ---- fault policy ------------------------------------------------------

    /// Single entry point for error handling on an established or connecting
    /// session. Lossy channels die on the spot; durable ones requeue and
    /// reconnect with exponential backoff, or park in standby when idle.
    async fn fault(self: &Arc<Self>, inner: &mut PipeInner, onconnect: bool, onread: bool) {
        self.cond.notify_waiters();

        if onread && inner.state == PipeState::Connecting {
            trace!("fault on read while connecting, reader backing off");
            return;
        }
        if inner.state == PipeState::Closed || inner.state == PipeState::Closing {
            trace!("fault but already closed|closing");
            return;
        }

        // drop our halves and kick the other task out of any blocked call
        inner.sock_rd = None;
        inner.sock_wr = None;
        self.interrupt_io();

        if inner.policy.lossy {
            debug!("fault on lossy channel to {:?}, failing", inner.peer_addr);
            self.stop_locked(inner);
            self.discard_queue(inner).await;
            self.core.queue_remote_reset(inner.connection.clone()).await;
            return;
        }

        inner.requeue_sent(0);

        if !inner.is_queued() {
            if onconnect {
                debug!("fault on connect with empty queue: closing");
                self.stop_locked(inner);
            } else {
                debug!("fault with nothing to send, going to standby");
                inner.state = PipeState::Standby;
            }
            return;
        }

        if inner.state != PipeState::Connecting {
            debug!("fault initiating reconnect to {:?}", inner.peer_addr);
            inner.connect_seq += 1;
            inner.state = PipeState::Connecting;
            inner.backoff = None;
        } else {
            let next = match inner.backoff {
                None => self.core.config.initial_backoff,
                Some(b) => (b * 2).min(self.core.config.max_backoff),
            };
            debug!("fault, next attempt in {:?}", next);
            inner.backoff = Some(next);
        }
    }

    /// Fatal failure of a durable session (e.g. repeated authorization
    /// rejects): tear down and tell the dispatcher via `reset`.
    async fn fail_fatal(self: &Arc<Self>, inner: &mut PipeInner) {
        warn!("session to {:?} failed fatally", inner.peer_addr);
        self.stop_locked(inner);
        self.discard_queue(inner).await;
        self.core.queue_reset(inner.connection.clone()).await;
    }

    // ---- abortable I/O -----------------------------------------------------

    async fn io_read<T>(
        &self,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::ShutdownRequested);
        }
        let mut rx = self.io_interrupt.subscribe();
        let epoch = *rx.borrow_and_update();
        let timeout = self.core.config.timeout;
        tokio::select! {
            r = async {
                match timeout {
                    Some(d) => match time::timeout(d, fut).await {
                        Ok(r) => r.map_err(TransportError::from),
                        Err(_) => Err(TransportError::Timeout),
                    },
                    None => fut.await.map_err(TransportError::from),
                }
            } => r,
            _ = rx.wait_for(move |v| *v != epoch) => Err(TransportError::ShutdownRequested),
        }
    }

    async fn io_write<T>(
        &self,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::ShutdownRequested);
        }
        let mut rx = self.io_interrupt.subscribe();
        let epoch = *rx.borrow_and_update();
        tokio::select! {
            r = fut => r.map_err(TransportError::from),
            _ = rx.wait_for(move |v| *v != epoch) => Err(TransportError::ShutdownRequested),
        }
    }

    async fn acquire_throttle(&self, throttler: &Throttler, amount: u64) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::ShutdownRequested);
        }
        let mut rx = self.io_interrupt.subscribe();
        let epoch = *rx.borrow_and_update();
        tokio::select! {
            _ = throttler.acquire(amount) => Ok(()),
            _ = rx.wait_for(move |v| *v != epoch) => Err(TransportError::ShutdownRequested),
        }
    }

    async fn backoff_sleep(&self, d: Duration) {
        let mut rx = self.io_interrupt.subscribe();
        let epoch = *rx.borrow_and_update();
        tokio::select! {
            _ = time::sleep(d) => {}
            _ = rx.wait_for(move |v| *v != epoch) => {}
        }
    }

    /// Park on the pipe's condition, releasing the lock; wakes on any notify.
    async fn wait_cond(&self, guard: MutexGuard<'_, PipeInner>) {
        let notified = self.cond.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        notified.await;
    }

    /// Write `sections` as a sequence of vectored writes, at most `IOV_MAX - 2`
    /// iovecs per call, resuming mid-section after short writes.
    async fn write_sections(
        &self,
        wr: &mut OwnedWriteHalf,
        sections: &[&[u8]],
    ) -> Result<(), TransportError> {
        let total: usize = sections.iter().map(|s| s.len()).sum();
        let mut written = 0usize;
        while written < total {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(sections.len().min(IOV_MAX - 2));
            let mut skip = written;
            for s in sections {
                if skip >= s.len() {
                    skip -= s.len();
                    continue;
                }
                slices.push(IoSlice::new(&s[skip..]));
                skip = 0;
                if slices.len() >= IOV_MAX - 2 {
                    break;
                }
            }
            let n = self.io_write(wr.write_vectored(&slices)).await?;
            if n == 0 {
                return Err(TransportError::Socket(std::io::Error::from(
                    std::io::ErrorKind::WriteZero,
                )));
            }
            written += n;
        }
        Ok(())
    }

    // ---- reader ------------------------------------------------------------

    pub(crate) async fn reader_entry(self: Arc<Self>) {
        let accepting = { self.inner.lock().await.state == PipeState::Accepting };
        if accepting {
            if let Err(e) = self.accept().await {
                debug!("accept failed: {}", e);
                let mut inner = self.inner.lock().await;
                if inner.is_queued() {
                    // we replaced an existing session before failing; dial out
                    inner.state = PipeState::Connecting;
                    if !inner.writer_running {
                        self.start_writer_locked(&mut inner);
                    }
                } else if inner.state != PipeState::Closed {
                    self.stop_locked(&mut inner);
                }
            }
        }

        loop {
            let inner = self.inner.lock().await;
            match inner.state {
                PipeState::Closed => break,
                PipeState::Open | PipeState::Closing => {
                    let mut inner = inner;
                    let Some(mut rd) = inner.sock_rd.take() else {
                        self.wait_cond(inner).await;
                        continue;
                    };
                    let con = inner.connection.clone();
                    let policy_throttler = inner.policy.throttler.clone();
                    drop(inner);

                    let event = self.read_frame(&mut rd, &con, policy_throttler.as_ref()).await;

                    let mut inner = self.inner.lock().await;
                    if inner.sock_rd.is_none() && inner.state != PipeState::Closed {
                        inner.sock_rd = Some(rd);
                    }
                    match event {
                        Ok(ReadEvent::Keepalive) => {
                            trace!("reader got KEEPALIVE");
                        }
                        Ok(ReadEvent::Ack(seq)) => {
                            trace!("reader got ACK {}", seq);
                            if inner.state != PipeState::Closed && inner.handle_ack(seq) {
                                debug!("got last ack and queue is empty, closing");
                                inner.policy.lossy = true;
                                self.fault(&mut inner, false, false).await;
                            } else {
                                // replayable tail shrank; writer may be waiting on it
                                self.cond.notify_waiters();
                            }
                        }
                        Ok(ReadEvent::Msg(None)) => {}
                        Ok(ReadEvent::Msg(Some(mut m))) => {
                            if inner.state == PipeState::Closed
                                || inner.state == PipeState::Connecting
                            {
                                self.core
                                    .dispatch_throttle_release(m.take_dispatch_throttle_size());
                            } else if m.seq() <= inner.in_seq {
                                debug!(
                                    "reader got old message {} <= {}, discarding",
                                    m.seq(),
                                    inner.in_seq
                                );
                                self.core
                                    .dispatch_throttle_release(m.take_dispatch_throttle_size());
                            } else {
                                inner.in_seq = m.seq();
                                m.connection = Some(con.clone());
                                trace!("reader got message {:?}", m);
                                let priority = m.priority();
                                self.queue_received(
                                    &mut inner,
                                    DispatchItem::Message(m),
                                    priority,
                                );
                                // wake the writer so it can ack
                                self.cond.notify_waiters();
                            }
                        }
                        Ok(ReadEvent::Close) => {
                            debug!("reader got CLOSE");
                            if inner.state == PipeState::Closing {
                                self.stop_locked(&mut inner);
                            } else {
                                inner.state = PipeState::Closing;
                            }
                            self.cond.notify_waiters();
                            break;
                        }
                        Err(TransportError::ShutdownRequested) => {
                            // stop or fault elsewhere; loop and re-observe state
                        }
                        Err(e) => {
                            debug!("reader error: {}", e);
                            self.fault(&mut inner, false, true).await;
                        }
                    }
                }
                // Accepting is only seen here if accept() faulted into it;
                // Connecting/Standby/Wait mean the writer owns recovery.
                _ => {
                    self.wait_cond(inner).await;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        inner.reader_running = false;
        self.maybe_reap(&mut inner);
        drop(inner);
        trace!("reader done");
    }

    async fn read_frame(
        &self,
        rd: &mut OwnedReadHalf,
        con: &Arc<Connection>,
        policy_throttler: Option<&Arc<Throttler>>,
    ) -> Result<ReadEvent, TransportError> {
        let mut tag_buf = [0u8; 1];
        self.io_read(rd.read_exact(&mut tag_buf)).await?;
        let tag = Tag::try_from(tag_buf[0])
            .map_err(|_| TransportError::Decode(format!("bad tag {}", tag_buf[0])))?;
        match tag {
            Tag::Keepalive => Ok(ReadEvent::Keepalive),
            Tag::Ack => {
                let mut seq_buf = [0u8; 8];
                self.io_read(rd.read_exact(&mut seq_buf)).await?;
                Ok(ReadEvent::Ack(u64::from_le_bytes(seq_buf)))
            }
            Tag::Msg => Ok(ReadEvent::Msg(
                self.read_message(rd, con, policy_throttler).await?,
            )),
            Tag::Close => Ok(ReadEvent::Close),
            other => Err(TransportError::Decode(format!(
                "unexpected tag {:?} in open state",
                other
            ))),
        }
    }

    /// Read one framed message. `Ok(None)` covers the non-fatal cases: an
    /// aborted message, a failed section CRC, or a codec reject; throttle
    /// credit is returned and the session lives on. A header CRC failure is
    /// fatal because the framing itself can no longer be trusted.
    async fn read_message(
        &self,
        rd: &mut OwnedReadHalf,
        con: &Arc<Connection>,
        policy_throttler: Option<&Arc<Throttler>>,
    ) -> Result<Option<Message>, TransportError> {
        let layout = HeaderLayout::for_features(con.features());
        let mut header_buf = vec![0u8; layout.serialized_len()];
        self.io_read(rd.read_exact(&mut header_buf)).await?;
        let (header, _src_addr) = MessageHeader::try_deser(&header_buf, layout)?;
        trace!(
            "reader got envelope type={} seq={} front={} middle={} data={} off={}",
            header.msg_type,
            header.seq,
            header.front_len,
            header.middle_len,
            header.data_len,
            header.data_off
        );

        let message_size =
            header.front_len as u64 + header.middle_len as u64 + header.data_len as u64;

        // policy throttle first (held for the message's lifetime), then the
        // dispatch throttle (held until the handler takes the message)
        let mut policy_debit = None;
        if message_size > 0 {
            if let Some(throttler) = policy_throttler {
                trace!(
                    "reader wants {} from policy throttler {}/{}",
                    message_size,
                    throttler.get_current(),
                    throttler.get_max()
                );
                self.acquire_throttle(throttler, message_size).await?;
                policy_debit = Some(Arc::new(ThrottleDebit::new(throttler.clone(), message_size)));
            }
            self.acquire_throttle(&self.core.dispatch_throttler, message_size)
                .await?;
        }
        // released on every early exit below until disarmed
        let mut dispatch_charge = DispatchCharge {
            core: &self.core,
            amount: message_size,
        };

        let mut front = vec![0u8; header.front_len as usize];
        if !front.is_empty() {
            self.io_read(rd.read_exact(&mut front)).await?;
        }
        let mut middle = vec![0u8; header.middle_len as usize];
        if !middle.is_empty() {
            self.io_read(rd.read_exact(&mut middle)).await?;
        }

        let mut data = BufferList::new();
        if header.data_len > 0 {
            let data_len = header.data_len as usize;
            if let Some(mut posted) = con.take_rx_buffer(header.tid, data_len) {
                trace!("reader using posted rx buffer for tid {}", header.tid);
                posted.resize(data_len, 0);
                self.io_read(rd.read_exact(&mut posted[..])).await?;
                data.push(posted.freeze());
            } else {
                for chunk_len in aligned_chunk_lens(data_len, header.data_off as usize) {
                    let mut chunk = BytesMut::zeroed(chunk_len);
                    self.io_read(rd.read_exact(&mut chunk[..])).await?;
                    data.push(chunk.freeze());
                }
            }
        }

        let mut footer_buf = [0u8; Footer::SERIALIZED_LEN];
        self.io_read(rd.read_exact(&mut footer_buf)).await?;
        let footer = Footer::try_deser(&mut &footer_buf[..])?;

        if !footer.is_complete() {
            debug!("reader got aborted message, discarding");
            return Ok(None);
        }

        let msg = Message {
            header,
            payload: Bytes::from(front),
            middle: Bytes::from(middle),
            data,
            connection: None,
            policy_debit,
            dispatch_throttle_size: 0,
        };

        let expected = msg.build_footer();
        if expected.front_crc != footer.front_crc
            || expected.middle_crc != footer.middle_crc
            || expected.data_crc != footer.data_crc
        {
            warn!(
                "section crc mismatch on {:?} ({}/{}/{} != {}/{}/{}), dropping",
                msg,
                footer.front_crc,
                footer.middle_crc,
                footer.data_crc,
                expected.front_crc,
                expected.middle_crc,
                expected.data_crc
            );
            return Ok(None);
        }

        match self.core.codec.decode(msg) {
            Ok(mut msg) => {
                msg.dispatch_throttle_size = message_size;
                dispatch_charge.disarm();
                Ok(Some(msg))
            }
            Err(e) => {
                warn!("codec rejected message: {}, dropping", e);
                Ok(None)
            }
        }
    }

    // ---- writer ------------------------------------------------------------

    pub(crate) async fn writer_entry(self: Arc<Self>) {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                PipeState::Closed => break,
                PipeState::Standby => {
                    if inner.is_queued() && !inner.policy.server {
                        debug!("writer leaving standby to reconnect");
                        inner.connect_seq += 1;
                        inner.state = PipeState::Connecting;
                        continue;
                    }
                    self.wait_cond(inner).await;
                }
                PipeState::Connecting => {
                    if inner.policy.server {
                        // passive side never dials; wait to be dialed
                        inner.state = PipeState::Standby;
                        continue;
                    }
                    let backoff = inner.backoff;
                    drop(inner);
                    if let Some(d) = backoff {
                        self.backoff_sleep(d).await;
                    }
                    self.connect().await;
                }
                PipeState::Closing => {
                    let wr = inner.sock_wr.take();
                    drop(inner);
                    if let Some(mut wr) = wr {
                        debug!("writer writing CLOSE tag");
                        let _ = time::timeout(
                            Duration::from_secs(1),
                            wr.write_all(&[Tag::Close.into()]),
                        )
                        .await;
                    }
                    let mut inner = self.inner.lock().await;
                    self.stop_locked(&mut inner);
                }
                PipeState::Open => {
                    self.writer_open_step(inner).await;
                }
                // Accepting / Wait: nothing for the writer to do yet
                _ => {
                    self.wait_cond(inner).await;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        inner.writer_running = false;
        self.maybe_reap(&mut inner);
        drop(inner);
        trace!("writer done");
    }

    async fn writer_open_step(self: &Arc<Self>, mut inner: MutexGuard<'_, PipeInner>) {
        enum Work {
            Keepalive,
            Ack(u64),
            Msg {
                m: Message,
                header_bytes: BytesMut,
                footer_bytes: BytesMut,
            },
        }

        let work = if inner.keepalive {
            Work::Keepalive
        } else if inner.in_seq > inner.in_seq_acked {
            Work::Ack(inner.in_seq)
        } else if let Some(mut m) = inner.get_next_outgoing() {
            m.connection = Some(inner.connection.clone());
            if let Err(e) = self.core.codec.encode(&mut m) {
                warn!("codec failed to encode {:?}: {}, dropping", m, e);
                return;
            }
            if m.seq() == 0 {
                inner.out_seq += 1;
                m.header.seq = inner.out_seq;
            }
            let my_name = self.core.my_name();
            if let Some(name) = my_name {
                m.header.src = name;
            }
            m.sync_section_lens();
            let layout = HeaderLayout::for_features(inner.connection.features());
            let header_bytes = m.header.ser(layout, &self.core.my_addr());
            let mut footer_bytes = BytesMut::with_capacity(Footer::SERIALIZED_LEN);
            m.build_footer().ser(&mut footer_bytes);
            if !inner.policy.lossy || inner.close_on_empty {
                inner.sent.push_back(m.clone());
            }
            Work::Msg {
                m,
                header_bytes,
                footer_bytes,
            }
        } else if inner.sent.is_empty() && inner.close_on_empty {
            debug!("writer out and sent queues empty, closing");
            inner.policy.lossy = true;
            self.fault(&mut inner, false, false).await;
            return;
        } else {
            self.wait_cond(inner).await;
            return;
        };

        let Some(mut wr) = inner.sock_wr.take() else {
            self.wait_cond(inner).await;
            return;
        };
        drop(inner);

        let res = match &work {
            Work::Keepalive => {
                trace!("writer writing KEEPALIVE");
                self.io_write(wr.write_all(&[Tag::Keepalive.into()])).await
            }
            Work::Ack(seq) => {
                trace!("writer writing ACK {}", seq);
                let mut buf = [0u8; 9];
                buf[0] = Tag::Ack.into();
                buf[1..].copy_from_slice(&seq.to_le_bytes());
                self.io_write(wr.write_all(&buf)).await
            }
            Work::Msg {
                m,
                header_bytes,
                footer_bytes,
            } => {
                trace!("writer sending {:?}", m);
                let tag = [u8::from(Tag::Msg)];
                let mut sections: Vec<&[u8]> = Vec::with_capacity(5 + m.data.chunks().len());
                sections.push(&tag);
                sections.push(header_bytes.as_ref());
                sections.push(m.payload.as_ref());
                sections.push(m.middle.as_ref());
                for chunk in m.data.chunks() {
                    sections.push(chunk.as_ref());
                }
                sections.push(footer_bytes.as_ref());
                sections.retain(|s| !s.is_empty());
                self.write_sections(&mut wr, &sections).await
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.sock_wr.is_none() && inner.state != PipeState::Closed {
            inner.sock_wr = Some(wr);
        }
        match res {
            Ok(_) => match work {
                Work::Keepalive => inner.keepalive = false,
                Work::Ack(seq) => inner.in_seq_acked = inner.in_seq_acked.max(seq),
                Work::Msg { .. } => {}
            },
            Err(TransportError::ShutdownRequested) => {
                // state changed under us; next loop iteration re-observes
            }
            Err(e) => {
                debug!("writer error: {}", e);
                self.fault(&mut inner, false, false).await;
            }
        }
    }

    // ---- connect-side handshake -------------------------------------------

    async fn connect(self: &Arc<Self>) {
        let snapshot = {
            let inner = self.inner.lock().await;
            if inner.state != PipeState::Connecting {
                return;
            }
            (
                inner.peer_addr,
                inner.peer_type,
                inner.connect_seq,
                inner.policy.clone(),
            )
        };
        let (peer_addr, peer_type, cseq, policy) = snapshot;
        debug!("connecting to {:?}, cseq {}", peer_addr, cseq);

        match self.try_connect(peer_addr, peer_type, cseq, policy).await {
            Ok(()) => {}
            Err(e) => {
                debug!("connect to {:?} failed: {}", peer_addr, e);
                let mut inner = self.inner.lock().await;
                if inner.state == PipeState::Connecting {
                    self.fault(&mut inner, true, false).await;
                }
            }
        }
    }

    async fn try_connect(
        self: &Arc<Self>,
        peer_addr: EntityAddr,
        peer_type: Option<EntityType>,
        initial_cseq: u32,
        policy: Policy,
    ) -> Result<(), TransportError> {
        let peer_type = peer_type.ok_or_else(|| {
            TransportError::Decode("connecting pipe without a peer type".to_string())
        })?;
        let my_name = self
            .core
            .my_name()
            .ok_or_else(|| TransportError::Decode("no entity registered".to_string()))?;

        let stream = self.io_read(TcpStream::connect(peer_addr.addr)).await?;
        if self.core.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("couldn't set TCP_NODELAY: {}", e);
            }
        }
        let (mut rd, mut wr) = stream.into_split();

        // banner, then read the peer's two addresses: its own, and its view
        // of us (which teaches us our IP when we bound without one)
        self.io_write(wr.write_all(BANNER)).await?;
        let mut banner = [0u8; BANNER.len()];
        self.io_read(rd.read_exact(&mut banner)).await?;
        if banner != *BANNER {
            return Err(TransportError::BadMagic);
        }

        let mut addr_buf = [0u8; 2 * EntityAddr::SERIALIZED_LEN];
        self.io_read(rd.read_exact(&mut addr_buf)).await?;
        let mut b: &[u8] = &addr_buf;
        let claimed = EntityAddr::try_deser(&mut b)?;
        let peer_addr_for_me = EntityAddr::try_deser(&mut b)?;

        if claimed != peer_addr {
            if claimed.is_blank_ip()
                && claimed.port() == peer_addr.port()
                && claimed.nonce == peer_addr.nonce
            {
                debug!(
                    "peer claims to be {:?} not {:?} - same node before learning its ip",
                    claimed, peer_addr
                );
            } else {
                warn!(
                    "peer claims to be {:?} not {:?} - wrong node",
                    claimed, peer_addr
                );
                return Err(TransportError::PeerReset);
            }
        }
        if self.core.needs_addr() {
            self.core.learned_addr(&peer_addr_for_me).await;
        }

        let mut my_addr_buf = BytesMut::with_capacity(EntityAddr::SERIALIZED_LEN);
        self.core.my_addr().ser(&mut my_addr_buf);
        self.io_write(wr.write_all(&my_addr_buf)).await?;

        let mut gseq = self.core.get_global_seq(0);
        let mut cseq = initial_cseq;
        let mut got_bad_auth = false;

        for _ in 0..self.core.config.handshake_retry_limit {
            let authorizer = self.core.authorizer.build(peer_type, got_bad_auth).await;
            let (auth_protocol, auth_blob) = match &authorizer {
                Some(a) => (a.protocol, a.blob.clone()),
                None => (0, Bytes::new()),
            };

            let record = ConnectRecord {
                features: policy.features_supported,
                host_type: my_name.entity_type.into(),
                global_seq: gseq,
                connect_seq: cseq,
                protocol_version: proto_version(my_name.entity_type, peer_type, true),
                authorizer_protocol: auth_protocol,
                authorizer_len: auth_blob.len() as u32,
                flags: if policy.lossy { CONNECT_LOSSY } else { 0 },
            };
            debug!(
                "connect sending gseq={} cseq={} proto={}",
                gseq, cseq, record.protocol_version
            );
            let mut record_buf = BytesMut::with_capacity(ConnectRecord::SERIALIZED_LEN);
            record.ser(&mut record_buf);
            self.io_write(wr.write_all(&record_buf)).await?;
            if !auth_blob.is_empty() {
                self.io_write(wr.write_all(&auth_blob)).await?;
            }

            let mut reply_buf = [0u8; ConnectReply::SERIALIZED_LEN];
            self.io_read(rd.read_exact(&mut reply_buf)).await?;
            let reply = ConnectReply::try_deser(&mut &reply_buf[..])?;
            debug!(
                "connect got reply tag {:?} cseq {} gseq {}",
                reply.tag, reply.connect_seq, reply.global_seq
            );

            let auth_reply = if reply.authorizer_len > 0 {
                let mut blob = vec![0u8; reply.authorizer_len as usize];
                self.io_read(rd.read_exact(&mut blob)).await?;
                Bytes::from(blob)
            } else {
                Bytes::new()
            };
            if let Some(a) = &authorizer {
                if !self.core.authorizer.verify_reply(a, auth_reply).await {
                    warn!("failed verifying authorizer reply");
                    return Err(TransportError::AuthRejected);
                }
            }

            let mut inner = self.inner.lock().await;
            if inner.state != PipeState::Connecting {
                debug!("connect got reply but no longer connecting, stopping");
                return Ok(());
            }

            match reply.tag {
                Tag::Features => {
                    let missing = policy.features_required & !reply.features;
                    warn!("connect feature mismatch, missing {:#x}", missing);
                    return Err(TransportError::FeatureMismatch { missing });
                }
                Tag::BadProtoVer => {
                    warn!(
                        "connect protocol version mismatch, ours {} theirs {}",
                        record.protocol_version, reply.protocol_version
                    );
                    return Err(TransportError::BadProtocolVersion {
                        ours: record.protocol_version,
                        theirs: reply.protocol_version,
                    });
                }
                Tag::BadAuthorizer => {
                    if got_bad_auth {
                        // second reject in a row: the peer will not take us
                        self.fail_fatal(&mut inner).await;
                        return Ok(());
                    }
                    debug!("connect got BADAUTHORIZER, retrying with a fresh one");
                    got_bad_auth = true;
                }
                Tag::ResetSession => {
                    debug!("connect got RESETSESSION");
                    self.was_session_reset(&mut inner).await;
                    inner.halt_delivery = false;
                    cseq = 0;
                }
                Tag::RetryGlobal => {
                    drop(inner);
                    gseq = self.core.get_global_seq(reply.global_seq);
                    debug!("connect got RETRY_GLOBAL {}, retrying with {}", reply.global_seq, gseq);
                }
                Tag::RetrySession => {
                    debug!("connect got RETRY_SESSION {} -> {}", cseq, reply.connect_seq);
                    cseq = reply.connect_seq;
                    inner.connect_seq = reply.connect_seq;
                }
                Tag::Wait => {
                    debug!("connect got WAIT (lost the connection race)");
                    inner.state = PipeState::Wait;
                    return Ok(());
                }
                Tag::Ready | Tag::Seq => {
                    let missing = policy.features_required & !reply.features;
                    if missing != 0 {
                        warn!("peer is missing required features {:#x}", missing);
                        return Err(TransportError::FeatureMismatch { missing });
                    }

                    if reply.tag == Tag::Seq {
                        drop(inner);
                        let mut seq_buf = [0u8; 8];
                        self.io_read(rd.read_exact(&mut seq_buf)).await?;
                        let newly_acked = u64::from_le_bytes(seq_buf);
                        debug!("connect got SEQ, peer acked up to {}", newly_acked);
                        let in_seq = {
                            let mut relocked = self.inner.lock().await;
                            if relocked.state != PipeState::Connecting {
                                return Ok(());
                            }
                            relocked.trim_requeued(newly_acked);
                            relocked.handle_ack(newly_acked);
                            relocked.in_seq
                        };
                        self.io_write(wr.write_all(&in_seq.to_le_bytes())).await?;
                        inner = self.inner.lock().await;
                        if inner.state != PipeState::Connecting {
                            return Ok(());
                        }
                    }

                    inner.peer_global_seq = reply.global_seq;
                    if !inner.disposable {
                        inner.policy.lossy = reply.flags & CONNECT_LOSSY != 0;
                    }
                    inner.state = PipeState::Open;
                    inner.connect_seq = cseq + 1;
                    inner.backoff = None;
                    let con = inner.connection.clone();
                    con.set_features(reply.features & policy.features_supported);
                    inner.sock_rd = Some(rd);
                    inner.sock_wr = Some(wr);
                    let start_reader = !inner.reader_running;
                    info!(
                        "connect success to {:?}, cseq {}, lossy={}, features {:#x}",
                        peer_addr,
                        inner.connect_seq,
                        inner.policy.lossy,
                        con.features()
                    );
                    drop(inner);

                    self.core.queue_connect(con).await;
                    if start_reader {
                        self.start_reader().await;
                    }
                    self.cond.notify_waiters();
                    return Ok(());
                }
                other => {
                    return Err(TransportError::Decode(format!(
                        "unexpected connect reply tag {:?}",
                        other
                    )));
                }
            }
        }

        warn!("handshake with {:?} exceeded the retry limit", peer_addr);
        Err(TransportError::Timeout)
    }

    // ---- accept-side handshake --------------------------------------------

    async fn accept(self: &Arc<Self>) -> Result<(), TransportError> {
        let (mut rd, mut wr, socket_addr) = {
            let mut inner = self.inner.lock().await;
            let rd = inner.sock_rd.take().ok_or(TransportError::LocalClosed)?;
            let wr = inner.sock_wr.take().ok_or(TransportError::LocalClosed)?;
            let addr = inner.accept_socket_addr.ok_or(TransportError::LocalClosed)?;
            (rd, wr, addr)
        };
        let my_name = self
            .core
            .my_name()
            .ok_or_else(|| TransportError::Decode("no entity registered".to_string()))?;
        let observed = EntityAddr::new(socket_addr, 0);

        // banner, our address, and the peer's address as we see it (they may
        // not know their own IP yet)
        let mut hello = BytesMut::with_capacity(BANNER.len() + 2 * EntityAddr::SERIALIZED_LEN);
        hello.put_slice(BANNER);
        self.core.my_addr().ser(&mut hello);
        observed.ser(&mut hello);
        self.io_write(wr.write_all(&hello)).await?;

        let mut banner = [0u8; BANNER.len()];
        self.io_read(rd.read_exact(&mut banner)).await?;
        if banner != *BANNER {
            debug!("accept peer sent bad banner");
            return Err(TransportError::BadMagic);
        }

        let mut addr_buf = [0u8; EntityAddr::SERIALIZED_LEN];
        self.io_read(rd.read_exact(&mut addr_buf)).await?;
        let mut claimed = EntityAddr::try_deser(&mut &addr_buf[..])?;
        if claimed.is_blank_ip() {
            // peer doesn't know its IP; we do
            claimed.set_ip_from(&observed);
            debug!("accept peer addr is really {:?} (socket is {:?})", claimed, observed);
        }
        debug!("accept of peer {:?}", claimed);
        {
            let mut inner = self.inner.lock().await;
            inner.peer_addr = claimed;
            inner.connection.set_peer_addr(claimed);
        }

        for _ in 0..self.core.config.handshake_retry_limit {
            let mut record_buf = [0u8; ConnectRecord::SERIALIZED_LEN];
            self.io_read(rd.read_exact(&mut record_buf)).await?;
            let connect = ConnectRecord::try_deser(&mut &record_buf[..])?;
            let auth_blob = if connect.authorizer_len > 0 {
                let mut blob = vec![0u8; connect.authorizer_len as usize];
                self.io_read(rd.read_exact(&mut blob)).await?;
                Bytes::from(blob)
            } else {
                Bytes::new()
            };
            debug!(
                "accept got cseq {} gseq {} from host_type {}",
                connect.connect_seq, connect.global_seq, connect.host_type
            );

            let peer_type = EntityType::try_from(connect.host_type).map_err(|_| {
                TransportError::Decode(format!("invalid host type {}", connect.host_type))
            })?;
            let policy = self.core.get_policy(peer_type);
            {
                let mut inner = self.inner.lock().await;
                inner.peer_type = Some(peer_type);
                inner.policy = policy.clone();
                inner.connection.set_peer_type(peer_type);
            }

            let our_proto = proto_version(my_name.entity_type, peer_type, false);
            if connect.protocol_version != our_proto {
                debug!(
                    "accept protocol mismatch: ours {}, theirs {}",
                    our_proto, connect.protocol_version
                );
                self.send_reject(&mut wr, &connect, &policy, Tag::BadProtoVer, 0, 0, our_proto, Bytes::new())
                    .await?;
                continue;
            }

            let feat_missing = policy.features_required & !connect.features;
            if feat_missing != 0 {
                debug!("accept peer missing required features {:#x}", feat_missing);
                self.send_reject(&mut wr, &connect, &policy, Tag::Features, 0, 0, our_proto, Bytes::new())
                    .await?;
                continue;
            }

            let auth_reply = match self
                .core
                .authorizer
                .verify(peer_type, connect.authorizer_protocol, auth_blob)
                .await
            {
                Ok(reply_blob) => reply_blob,
                Err(_) => {
                    debug!("accept bad authorizer");
                    self.send_reject(&mut wr, &connect, &policy, Tag::BadAuthorizer, 0, 0, our_proto, Bytes::new())
                        .await?;
                    continue;
                }
            };

            // race resolution against any pipe already registered for this peer
            let decision = {
                let mut table = self.core.pipes.lock().await;
                let existing = table.registered(&claimed);
                match existing {
                    Some(ex) if !Arc::ptr_eq(&ex, self) => {
                        let mut ex_inner = ex.inner.lock().await;
                        let peer_wins_ties = claimed < self.core.my_addr() || policy.server;
                        let outcome = resolve_accept_race(
                            &connect,
                            ex_inner.peer_global_seq,
                            ex_inner.connect_seq,
                            ex_inner.policy.lossy,
                            peer_wins_ties,
                        );
                        debug!(
                            "accept race vs existing (pgs={} cs={} lossy={}): {:?}",
                            ex_inner.peer_global_seq,
                            ex_inner.connect_seq,
                            ex_inner.policy.lossy,
                            outcome
                        );
                        match outcome {
                            RaceOutcome::Replace | RaceOutcome::ReplaceReset => {
                                let reset = outcome == RaceOutcome::ReplaceReset;
                                self.take_over(&mut table, &ex, &mut ex_inner, reset, claimed)
                                    .await;
                                drop(ex_inner);
                                self.open_accepted(&mut table, &connect, &policy, claimed, true)
                                    .await
                            }
                            reject => {
                                drop(ex_inner);
                                drop(table);
                                let (tag, gseq, cseq) = match reject {
                                    RaceOutcome::RetryGlobal(g) => (Tag::RetryGlobal, g, 0),
                                    RaceOutcome::RetrySession(c) => (Tag::RetrySession, 0, c),
                                    RaceOutcome::Wait => (Tag::Wait, 0, 0),
                                    RaceOutcome::ResetSession => (Tag::ResetSession, 0, 0),
                                    RaceOutcome::Replace | RaceOutcome::ReplaceReset => {
                                        unreachable!("handled above")
                                    }
                                };
                                self.send_reject(&mut wr, &connect, &policy, tag, gseq, cseq, our_proto, auth_reply)
                                    .await?;
                                continue;
                            }
                        }
                    }
                    _ => {
                        if connect.connect_seq > 0 {
                            // peer is resuming a session we have no record of
                            drop(table);
                            debug!("accept peer tried to resume unknown session, RESETSESSION");
                            self.send_reject(&mut wr, &connect, &policy, Tag::ResetSession, 0, 0, our_proto, auth_reply)
                                .await?;
                            continue;
                        }
                        debug!("accept new session");
                        self.open_accepted(&mut table, &connect, &policy, claimed, false)
                            .await
                    }
                }
            };

            // decision reached: reply READY (or SEQ) and go open
            let (mut reply, existing_in_seq) = decision;
            reply.protocol_version = our_proto;
            reply.authorizer_len = auth_reply.len() as u32;
            let mut reply_buf = BytesMut::with_capacity(ConnectReply::SERIALIZED_LEN);
            reply.ser(&mut reply_buf);
            self.io_write(wr.write_all(&reply_buf)).await?;
            if !auth_reply.is_empty() {
                self.io_write(wr.write_all(&auth_reply)).await?;
            }

            if reply.tag == Tag::Seq {
                self.io_write(wr.write_all(&existing_in_seq.to_le_bytes())).await?;
                let mut seq_buf = [0u8; 8];
                self.io_read(rd.read_exact(&mut seq_buf)).await?;
                let newly_acked = u64::from_le_bytes(seq_buf);
                debug!("accept seq exchange: peer acked up to {}", newly_acked);
                let mut inner = self.inner.lock().await;
                inner.trim_requeued(newly_acked);
            }

            let mut inner = self.inner.lock().await;
            if inner.state == PipeState::Closed {
                return Err(TransportError::LocalClosed);
            }
            inner.sock_rd = Some(rd);
            inner.sock_wr = Some(wr);
            let con = inner.connection.clone();
            if !inner.writer_running {
                self.start_writer_locked(&mut inner);
            }
            drop(inner);
            self.core.queue_connect(con).await;
            self.cond.notify_waiters();
            debug!("accept done");
            return Ok(());
        }

        warn!("accept from {:?} exceeded the retry limit", socket_addr);
        Err(TransportError::Timeout)
    }

    /// Stop and unregister `ex`, then inherit its Connection, sequence
    /// numbers, and un-acked traffic (durable sessions only). Runs under the
    /// messenger table lock plus both pipe locks.
    async fn take_over(
        self: &Arc<Self>,
        table: &mut crate::messenger::PipeTable,
        ex: &Arc<Pipe>,
        ex_inner: &mut PipeInner,
        reset_first: bool,
        claimed: EntityAddr,
    ) {
        debug!("accept replacing existing pipe for {:?}", claimed);
        ex.stop_locked(ex_inner);
        table.unregister(&claimed, ex);

        if reset_first {
            ex.was_session_reset(ex_inner).await;
        }

        if !ex_inner.policy.lossy {
            let con = ex_inner.connection.clone();
            con.set_pipe(self.clone());
            let mut inner = self.inner.lock().await;
            inner.connection = con;
            ex_inner.requeue_sent(0);
            inner.out_seq = ex_inner.out_seq;
            inner.in_seq = ex_inner.in_seq;
            inner.in_seq_acked = ex_inner.in_seq;
            debug!(
                "accept continuing at out_seq {} in_seq {}",
                inner.out_seq, inner.in_seq
            );
            let ex_q = std::mem::take(&mut ex_inner.out_q);
            for (priority, mut q) in ex_q {
                let ours = inner.out_q.entry(priority).or_default();
                // the old session's backlog goes in front of anything new
                while let Some(m) = q.pop_back() {
                    ours.push_front(m);
                }
            }
        }
    }

    /// Transition to Open under the table lock and build the READY/SEQ reply.
    async fn open_accepted(
        self: &Arc<Self>,
        table: &mut crate::messenger::PipeTable,
        connect: &ConnectRecord,
        policy: &Policy,
        claimed: EntityAddr,
        replaced: bool,
    ) -> (ConnectReply, u64) {
        let mut inner = self.inner.lock().await;
        inner.connect_seq = connect.connect_seq + 1;
        inner.peer_global_seq = connect.global_seq;
        inner.state = PipeState::Open;

        // the seq exchange only means something when a session was taken over
        let tag = if replaced
            && connect.features & policy.features_supported & features::RECONNECT_SEQ != 0
        {
            Tag::Seq
        } else {
            Tag::Ready
        };

        let mut reply = ConnectReply::new(tag);
        reply.features = policy.features_supported;
        reply.global_seq = self.core.get_global_seq(0);
        reply.connect_seq = inner.connect_seq;
        if policy.lossy {
            reply.flags |= CONNECT_LOSSY;
        }
        inner.connection.set_features(reply.features & connect.features);
        debug!(
            "accept success, cseq {}, features {:#x}, sending {:?}",
            inner.connect_seq,
            inner.connection.features(),
            tag
        );

        table.register(claimed, self.clone());
        (reply, inner.in_seq)
    }

    /// Write a rejecting connect reply; the peer decides whether to retry on
    /// the same connection.
    #[allow(clippy::too_many_arguments)]
    async fn send_reject(
        &self,
        wr: &mut OwnedWriteHalf,
        connect: &ConnectRecord,
        policy: &Policy,
        tag: Tag,
        global_seq: u32,
        connect_seq: u32,
        our_proto: u32,
        auth_reply: Bytes,
    ) -> Result<(), TransportError> {
        let mut reply = ConnectReply::new(tag);
        reply.features =
            (connect.features & policy.features_supported) | policy.features_required;
        reply.protocol_version = our_proto;
        reply.authorizer_len = auth_reply.len() as u32;
        reply.global_seq = global_seq;
        reply.connect_seq = connect_seq;
        debug!("accept replying {:?}", tag);
        let mut buf = BytesMut::with_capacity(ConnectReply::SERIALIZED_LEN);
        reply.ser(&mut buf);
        self.io_write(wr.write_all(&buf)).await?;
        if !auth_reply.is_empty() {
            self.io_write(wr.write_all(&auth_reply)).await?;
        }
        Ok(())
    }
}

enum ReadEvent {
    Keepalive,
    Ack(u64),
    Msg(Option<Message>),
    Close,
}

/// Releases a dispatch-throttler charge unless disarmed (the charge moved
/// into the message).
struct DispatchCharge<'a> {
    core: &'a MessengerCore,
    amount: u64,
}
impl DispatchCharge<'_> {
    fn disarm(&mut self) {
        self.amount = 0;
    }
}
impl Drop for DispatchCharge<'_> {
    fn drop(&mut self) {
        self.core.dispatch_throttle_release(self.amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn connect_record(global_seq: u32, connect_seq: u32) -> ConnectRecord {
        ConnectRecord {
            features: 0,
            host_type: 2,
            global_seq,
            connect_seq,
            protocol_version: 24,
            authorizer_protocol: 0,
            authorizer_len: 0,
            flags: 0,
        }
    }

    #[rstest]
    // gseq < existing peer gseq: tell the peer which global seq to come back with
    #[case::retry_global(connect_record(5, 1), 10, 1, false, false, RaceOutcome::RetryGlobal(10))]
    // existing lossy channel always yields
    #[case::lossy_replace(connect_record(20, 0), 10, 4, true, false, RaceOutcome::ReplaceReset)]
    #[case::lossy_replace_ties(connect_record(20, 7), 10, 4, true, true, RaceOutcome::ReplaceReset)]
    // cseq == 0 below ours: peer lost state
    #[case::peer_lost_state(connect_record(20, 0), 10, 4, false, false, RaceOutcome::ReplaceReset)]
    // cseq below ours but nonzero: stale attempt
    #[case::stale_session(connect_record(20, 2), 10, 4, false, true, RaceOutcome::RetrySession(4))]
    // equal cseq: the race; tie broken by address order / server policy
    #[case::race_incoming_wins(connect_record(20, 4), 10, 4, false, true, RaceOutcome::Replace)]
    #[case::race_outgoing_wins(connect_record(20, 4), 10, 4, false, false, RaceOutcome::Wait)]
    // cseq above ours with existing at 0: we reset
    #[case::we_reset(connect_record(20, 4), 10, 0, false, false, RaceOutcome::ResetSession)]
    // cseq above ours otherwise: plain reconnect
    #[case::reconnect(connect_record(20, 5), 10, 4, false, false, RaceOutcome::Replace)]
    fn test_resolve_accept_race(
        #[case] connect: ConnectRecord,
        #[case] existing_pgseq: u32,
        #[case] existing_cseq: u32,
        #[case] existing_lossy: bool,
        #[case] peer_wins_ties: bool,
        #[case] expected: RaceOutcome,
    ) {
        assert_eq!(
            resolve_accept_race(&connect, existing_pgseq, existing_cseq, existing_lossy, peer_wins_ties),
            expected
        );
    }

    fn message_with_seq(seq: u64, priority: u8) -> Message {
        let mut m = Message::new(1, Bytes::from_static(b"x"));
        m.header.seq = seq;
        m.set_priority(priority);
        m
    }

    fn bare_inner() -> PipeInner {
        PipeInner {
            state: PipeState::Open,
            peer_addr: EntityAddr::blank(),
            peer_type: None,
            policy: Policy::default(),
            connection: Connection::new(EntityAddr::blank(), None),
            sock_rd: None,
            sock_wr: None,
            accept_socket_addr: None,
            reader_running: false,
            writer_running: false,
            reader_handle: None,
            writer_handle: None,
            out_q: BTreeMap::new(),
            sent: VecDeque::new(),
            in_q: BTreeMap::new(),
            in_qlen: 0,
            queued_priorities: BTreeSet::new(),
            keepalive: false,
            close_on_empty: false,
            disposable: false,
            halt_delivery: false,
            connect_seq: 0,
            peer_global_seq: 0,
            out_seq: 0,
            in_seq: 0,
            in_seq_acked: 0,
            backoff: None,
        }
    }

    #[rstest]
    #[case::all_unacked(vec![1, 2, 3], 0, vec![1, 2, 3])]
    #[case::partially_acked(vec![1, 2, 3], 2, vec![3])]
    #[case::fully_acked(vec![1, 2, 3], 3, vec![])]
    #[case::over_acked(vec![1, 2, 3], 99, vec![])]
    #[case::empty(vec![], 5, vec![])]
    fn test_requeue_sent(
        #[case] sent_seqs: Vec<u64>,
        #[case] max_acked: u64,
        #[case] expected_requeued: Vec<u64>,
    ) {
        let mut inner = bare_inner();
        inner.out_seq = sent_seqs.len() as u64;
        for seq in &sent_seqs {
            inner.sent.push_back(message_with_seq(*seq, 100));
        }
        inner.requeue_sent(max_acked);
        assert!(inner.sent.is_empty());
        let requeued: Vec<u64> = inner
            .out_q
            .get(&PRIO_HIGHEST)
            .map(|q| q.iter().map(|m| m.seq()).collect())
            .unwrap_or_default();
        assert_eq!(requeued, expected_requeued);
        // seq numbers survive the requeue untouched
        assert_eq!(inner.out_seq, sent_seqs.len() as u64);
    }

    #[rstest]
    #[case::nothing_acked(vec![4, 5, 6], 3, vec![4, 5, 6])]
    #[case::some_acked(vec![4, 5, 6], 5, vec![6])]
    #[case::all_acked(vec![4, 5, 6], 6, vec![])]
    fn test_trim_requeued(
        #[case] requeued_seqs: Vec<u64>,
        #[case] acked: u64,
        #[case] expected: Vec<u64>,
    ) {
        let mut inner = bare_inner();
        for seq in &requeued_seqs {
            inner
                .out_q
                .entry(PRIO_HIGHEST)
                .or_default()
                .push_back(message_with_seq(*seq, PRIO_HIGHEST));
        }
        inner.trim_requeued(acked);
        let remaining: Vec<u64> = inner
            .out_q
            .get(&PRIO_HIGHEST)
            .map(|q| q.iter().map(|m| m.seq()).collect())
            .unwrap_or_default();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn test_trim_requeued_stops_at_fresh_messages() {
        let mut inner = bare_inner();
        let q = inner.out_q.entry(PRIO_HIGHEST).or_default();
        q.push_back(message_with_seq(4, PRIO_HIGHEST));
        q.push_back(message_with_seq(0, PRIO_HIGHEST)); // fresh, never trimmed
        inner.trim_requeued(99);
        let remaining: Vec<u64> = inner.out_q[&PRIO_HIGHEST].iter().map(|m| m.seq()).collect();
        assert_eq!(remaining, vec![0]);
    }

    #[rstest]
    #[case::partial(vec![1, 2, 3], 2, vec![3], false)]
    #[case::full(vec![1, 2, 3], 3, vec![], false)]
    #[case::none(vec![2, 3], 1, vec![2, 3], false)]
    fn test_handle_ack(
        #[case] sent_seqs: Vec<u64>,
        #[case] ack: u64,
        #[case] expected_left: Vec<u64>,
        #[case] expected_close: bool,
    ) {
        let mut inner = bare_inner();
        for seq in sent_seqs {
            inner.sent.push_back(message_with_seq(seq, 100));
        }
        assert_eq!(inner.handle_ack(ack), expected_close);
        let left: Vec<u64> = inner.sent.iter().map(|m| m.seq()).collect();
        assert_eq!(left, expected_left);
    }

    #[test]
    fn test_handle_ack_triggers_close_on_empty() {
        let mut inner = bare_inner();
        inner.close_on_empty = true;
        inner.sent.push_back(message_with_seq(1, 100));
        assert!(inner.handle_ack(1));
    }

    #[test]
    fn test_get_next_outgoing_priority_order() {
        let mut inner = bare_inner();
        inner.send(message_with_seq(0, 10));
        inner.send(message_with_seq(0, 200));
        inner.send(message_with_seq(0, 10));
        inner.send(message_with_seq(0, 127));

        let order: Vec<u8> = std::iter::from_fn(|| inner.get_next_outgoing())
            .map(|m| m.priority())
            .collect();
        assert_eq!(order, vec![200, 127, 10, 10]);
        assert!(inner.out_q.is_empty());
    }

    #[test]
    fn test_pop_in_item_rotation_bookkeeping() {
        let mut inner = bare_inner();
        inner.queued_priorities.insert(127);
        let q = inner.in_q.entry(127).or_default();
        q.push_back(DispatchItem::Message(message_with_seq(1, 127)));
        q.push_back(DispatchItem::Message(message_with_seq(2, 127)));
        inner.in_qlen = 2;

        let (item, more) = inner.pop_in_item(127);
        assert!(item.is_some());
        assert!(more);
        assert!(inner.queued_priorities.contains(&127));

        let (item, more) = inner.pop_in_item(127);
        assert!(item.is_some());
        assert!(!more);
        assert!(!inner.queued_priorities.contains(&127));
        assert_eq!(inner.in_qlen, 0);
    }
}
