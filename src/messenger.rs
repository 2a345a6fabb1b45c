//! The messenger: owns the peer-address -> pipe table, the accepter, the
//! dispatch and reaper tasks, per-peer-type policies, and the loopback pipe.
//! External code talks to it through `send_message` / `get_connection` / the
//! `mark_down` family, and receives everything via its `Dispatcher`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accepter;
use crate::config::MessengerConfig;
use crate::connection::Connection;
use crate::contracts::{AuthorizerProvider, Dispatcher, MessageCodec};
use crate::dispatch_queue::{dispatch_entry, DispatchItem, DispatchQueue};
use crate::entity::{EntityAddr, EntityInst, EntityName, EntityType};
use crate::message::{Message, PRIO_DEFAULT, PRIO_HIGHEST};
use crate::pipe::{Pipe, PipeState};
use crate::policy::Policy;
use crate::throttle::Throttler;

/// Registered pipes by peer address, plus every live pipe by id (including
/// unregistered ones still being torn down or mid-handshake).
pub(crate) struct PipeTable {
    registered: FxHashMap<EntityAddr, Arc<Pipe>>,
    all: FxHashMap<u64, Arc<Pipe>>,
}

impl PipeTable {
    fn new() -> PipeTable {
        PipeTable {
            registered: FxHashMap::default(),
            all: FxHashMap::default(),
        }
    }

    pub(crate) fn registered(&self, addr: &EntityAddr) -> Option<Arc<Pipe>> {
        self.registered.get(addr).cloned()
    }

    pub(crate) fn register(&mut self, addr: EntityAddr, pipe: Arc<Pipe>) {
        debug!("registering pipe for {:?}", addr);
        self.registered.insert(addr, pipe);
    }

    /// Remove the registration, but only if it still points at `pipe`.
    pub(crate) fn unregister(&mut self, addr: &EntityAddr, pipe: &Arc<Pipe>) {
        if let Some(current) = self.registered.get(addr) {
            if Arc::ptr_eq(current, pipe) {
                debug!("unregistering pipe for {:?}", addr);
                self.registered.remove(addr);
            }
        }
    }

    fn add(&mut self, pipe: Arc<Pipe>) {
        self.all.insert(pipe.id, pipe);
    }

    fn remove(&mut self, id: u64) {
        self.all.remove(&id);
    }

    fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    fn all_pipes(&self) -> Vec<Arc<Pipe>> {
        self.all.values().cloned().collect()
    }

    fn drain_registered(&mut self) -> Vec<(EntityAddr, Arc<Pipe>)> {
        self.registered.drain().collect()
    }
}

struct Policies {
    default_policy: Policy,
    map: FxHashMap<EntityType, Policy>,
}

/// Everything the long-lived tasks (pipes, accepter, dispatch, reaper) need.
/// Pipes hold this, never the `Messenger` facade, so there is no ownership
/// cycle back through the public handle.
pub(crate) struct MessengerCore {
    pub(crate) config: MessengerConfig,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) authorizer: Arc<dyn AuthorizerProvider>,
    pub(crate) codec: Arc<dyn MessageCodec>,
    pub(crate) dispatch_queue: DispatchQueue,
    pub(crate) dispatch_throttler: Arc<Throttler>,
    pub(crate) pipes: Mutex<PipeTable>,

    my_name: StdMutex<Option<EntityName>>,
    my_addr: StdMutex<EntityAddr>,
    need_addr: AtomicBool,
    destination_stopped: AtomicBool,
    global_seq: StdMutex<u32>,
    pipe_id_counter: AtomicU64,
    policies: StdMutex<Policies>,
    local_pipe: StdMutex<Option<(Arc<Pipe>, Arc<Connection>)>>,
    reap_tx: mpsc::UnboundedSender<Arc<Pipe>>,
    pipes_drained: Notify,
    stop_tx: watch::Sender<bool>,
}

impl MessengerCore {
    pub(crate) fn my_name(&self) -> Option<EntityName> {
        *self.my_name.lock().expect("messenger lock poisoned")
    }

    pub(crate) fn my_addr(&self) -> EntityAddr {
        *self.my_addr.lock().expect("messenger lock poisoned")
    }

    fn set_my_addr(&self, addr: EntityAddr) {
        *self.my_addr.lock().expect("messenger lock poisoned") = addr;
    }

    pub(crate) fn needs_addr(&self) -> bool {
        self.need_addr.load(Ordering::Acquire)
    }

    /// Adopt the IP the peer sees us under; our port and nonce stay.
    pub(crate) async fn learned_addr(&self, peer_addr_for_me: &EntityAddr) {
        {
            let mut my_addr = self.my_addr.lock().expect("messenger lock poisoned");
            my_addr.set_ip_from(peer_addr_for_me);
            info!("learned my addr {:?}", *my_addr);
        }
        self.need_addr.store(false, Ordering::Release);
        self.init_local_pipe_connection();
    }

    fn init_local_pipe_connection(&self) {
        if let Some(con) = self.local_connection() {
            con.set_peer_addr(self.my_addr());
            if let Some(name) = self.my_name() {
                con.set_peer_type(name.entity_type);
            }
        }
    }

    pub(crate) fn destination_stopped(&self) -> bool {
        self.destination_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn get_policy(&self, peer_type: EntityType) -> Policy {
        let policies = self.policies.lock().expect("messenger lock poisoned");
        policies
            .map
            .get(&peer_type)
            .unwrap_or(&policies.default_policy)
            .clone()
    }

    /// Process-wide connection attempt counter; never goes backwards, and can
    /// be bumped up to what a peer has already seen from us.
    pub(crate) fn get_global_seq(&self, old: u32) -> u32 {
        let mut gs = self.global_seq.lock().expect("messenger lock poisoned");
        if old > *gs {
            *gs = old;
        }
        *gs += 1;
        *gs
    }

    pub(crate) fn next_pipe_id(&self) -> u64 {
        self.pipe_id_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn dispatch_throttle_release(&self, amount: u64) {
        self.dispatch_throttler.release(amount);
    }

    pub(crate) fn queue_reap(&self, pipe: Arc<Pipe>) {
        // the reaper is gone only after every pipe already drained
        let _ = self.reap_tx.send(pipe);
    }

    pub(crate) async fn add_pipe(&self, pipe: Arc<Pipe>) {
        self.pipes.lock().await.add(pipe);
    }

    fn local_pipe(&self) -> Option<Arc<Pipe>> {
        self.local_pipe
            .lock()
            .expect("messenger lock poisoned")
            .as_ref()
            .map(|(pipe, _)| pipe.clone())
    }

    fn local_connection(&self) -> Option<Arc<Connection>> {
        self.local_pipe
            .lock()
            .expect("messenger lock poisoned")
            .as_ref()
            .map(|(_, con)| con.clone())
    }

    /// Hand an item straight to the dispatch queue through the loopback pipe.
    pub(crate) async fn local_delivery(&self, item: DispatchItem, priority: u8) {
        let Some(local) = self.local_pipe() else {
            warn!("local delivery without a local endpoint, dropping");
            if let DispatchItem::Message(mut m) = item {
                self.dispatch_throttle_release(m.take_dispatch_throttle_size());
            }
            return;
        };
        let mut inner = local.inner.lock().await;
        local.queue_received(&mut inner, item, priority);
    }

    pub(crate) async fn queue_connect(&self, con: Arc<Connection>) {
        if self.destination_stopped() {
            return;
        }
        self.local_delivery(DispatchItem::Connect(con), PRIO_HIGHEST).await;
    }

    pub(crate) async fn queue_reset(&self, con: Arc<Connection>) {
        if self.destination_stopped() {
            return;
        }
        self.local_delivery(DispatchItem::Reset(con), PRIO_HIGHEST).await;
    }

    pub(crate) async fn queue_remote_reset(&self, con: Arc<Connection>) {
        if self.destination_stopped() {
            return;
        }
        self.local_delivery(DispatchItem::RemoteReset(con), PRIO_HIGHEST).await;
    }
}

struct AccepterTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

#[derive(Default)]
struct Tasks {
    dispatch: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
    accepter: Option<AccepterTask>,
    pending_listener: Option<TcpListener>,
    reap_rx: Option<mpsc::UnboundedReceiver<Arc<Pipe>>>,
}

pub struct Messenger {
    core: Arc<MessengerCore>,
    tasks: StdMutex<Tasks>,
    started: AtomicBool,
    did_bind: AtomicBool,
}

impl Messenger {
    pub fn new(
        config: MessengerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        authorizer: Arc<dyn AuthorizerProvider>,
        codec: Arc<dyn MessageCodec>,
    ) -> anyhow::Result<Messenger> {
        config.validate()?;
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let dispatch_throttler = Arc::new(Throttler::new(config.dispatch_throttle_bytes));
        let core = Arc::new(MessengerCore {
            config,
            dispatcher,
            authorizer,
            codec,
            dispatch_queue: DispatchQueue::new(),
            dispatch_throttler,
            pipes: Mutex::new(PipeTable::new()),
            my_name: StdMutex::new(None),
            my_addr: StdMutex::new(EntityAddr::blank()),
            need_addr: AtomicBool::new(true),
            destination_stopped: AtomicBool::new(false),
            global_seq: StdMutex::new(0),
            pipe_id_counter: AtomicU64::new(1),
            policies: StdMutex::new(Policies {
                default_policy: Policy::default(),
                map: FxHashMap::default(),
            }),
            local_pipe: StdMutex::new(None),
            reap_tx,
            pipes_drained: Notify::new(),
            stop_tx,
        });
        Ok(Messenger {
            core,
            tasks: StdMutex::new(Tasks {
                reap_rx: Some(reap_rx),
                ..Tasks::default()
            }),
            started: AtomicBool::new(false),
            did_bind: AtomicBool::new(false),
        })
    }

    /// Tell the messenger who it is. Required before `start`; the name seeds
    /// outbound message headers and the protocol version table.
    pub fn register_entity(&self, name: EntityName) -> bool {
        let mut my_name = self.core.my_name.lock().expect("messenger lock poisoned");
        match *my_name {
            Some(existing) if existing.entity_type != name.entity_type => return false,
            _ => {}
        }
        *my_name = Some(name);
        drop(my_name);
        self.init_local_pipe();
        true
    }

    fn init_local_pipe(&self) {
        let mut slot = self.core.local_pipe.lock().expect("messenger lock poisoned");
        if slot.is_none() {
            let con = Connection::new(
                self.core.my_addr(),
                self.core.my_name().map(|n| n.entity_type),
            );
            let pipe = Pipe::new_local(self.core.clone(), con.clone());
            *slot = Some((pipe, con));
        } else if let Some((_, con)) = slot.as_ref() {
            con.set_peer_addr(self.core.my_addr());
            if let Some(name) = self.core.my_name() {
                con.set_peer_type(name.entity_type);
            }
        }
    }

    /// Bind the listening socket. Only valid before `start`. Port 0 scans the
    /// configured range.
    pub async fn bind(&self, bind_addr: SocketAddr, nonce: u32) -> anyhow::Result<()> {
        if self.started.load(Ordering::Acquire) {
            bail!("bind after start");
        }
        let listener = accepter::bind(&self.core.config, bind_addr, 0, 0).await?;
        let listen_addr = listener.local_addr()?;

        let mut my_addr = EntityAddr::new(bind_addr, nonce);
        my_addr.set_port(listen_addr.port());
        self.core.need_addr.store(my_addr.is_blank_ip(), Ordering::Release);
        self.core.set_my_addr(my_addr);
        self.init_local_pipe();

        self.tasks.lock().expect("messenger lock poisoned").pending_listener = Some(listener);
        self.did_bind.store(true, Ordering::Release);
        info!("bound, my addr is {:?}", my_addr);
        Ok(())
    }

    /// Spawn the accepter (if bound), the dispatch task, and the reaper.
    pub fn start(&self) -> anyhow::Result<()> {
        self.start_with_nonce(0)
    }

    /// Like `start`, for messengers that never bound (pure clients); `nonce`
    /// disambiguates this process incarnation.
    pub fn start_with_nonce(&self, nonce: u32) -> anyhow::Result<()> {
        if self.core.my_name().is_none() {
            bail!("start before register_entity");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("already started");
        }
        if !self.did_bind.load(Ordering::Acquire) {
            let mut my_addr = self.core.my_addr();
            my_addr.nonce = nonce;
            self.core.set_my_addr(my_addr);
            self.init_local_pipe();
        }
        info!("messenger starting as {:?}", self.core.my_addr());

        let mut tasks = self.tasks.lock().expect("messenger lock poisoned");
        tasks.dispatch = Some(tokio::spawn(dispatch_entry(self.core.clone())));

        let reap_rx = tasks.reap_rx.take().expect("reaper started twice");
        tasks.reaper = Some(tokio::spawn(reaper_entry(self.core.clone(), reap_rx)));

        if let Some(listener) = tasks.pending_listener.take() {
            tasks.accepter = Some(self.spawn_accepter(listener));
        }
        Ok(())
    }

    fn spawn_accepter(&self, listener: TcpListener) -> AccepterTask {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(accepter::accept_loop(self.core.clone(), listener, stop_rx));
        AccepterTask { handle, stop }
    }

    /// Escape a half-open port: tear every session down and bind afresh,
    /// avoiding both the old port and the caller's.
    pub async fn rebind(&self, avoid_port: u16) -> anyhow::Result<()> {
        if !self.did_bind.load(Ordering::Acquire) {
            bail!("rebind without bind");
        }
        info!("rebind avoiding port {}", avoid_port);
        let accepter_task = self.tasks.lock().expect("messenger lock poisoned").accepter.take();
        if let Some(task) = accepter_task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }

        self.mark_down_all().await;

        let old = self.core.my_addr();
        let mut bind_addr = old.addr;
        bind_addr.set_port(0);
        let listener = accepter::bind(&self.core.config, bind_addr, old.port(), avoid_port).await?;
        let listen_addr = listener.local_addr()?;

        let mut my_addr = old;
        my_addr.set_port(listen_addr.port());
        self.core.set_my_addr(my_addr);
        self.init_local_pipe();
        info!("rebound, my addr is {:?}", my_addr);

        let mut tasks = self.tasks.lock().expect("messenger lock poisoned");
        if self.started.load(Ordering::Acquire) {
            tasks.accepter = Some(self.spawn_accepter(listener));
        } else {
            tasks.pending_listener = Some(listener);
        }
        Ok(())
    }

    pub fn get_myaddr(&self) -> EntityAddr {
        self.core.my_addr()
    }

    pub fn get_myinst(&self) -> Option<EntityInst> {
        self.core
            .my_name()
            .map(|name| EntityInst::new(name, self.core.my_addr()))
    }

    pub fn dispatch_queue_len(&self) -> usize {
        self.core.dispatch_queue.len()
    }

    pub fn set_default_policy(&self, policy: Policy) {
        self.core.policies.lock().expect("messenger lock poisoned").default_policy = policy;
    }

    pub fn set_policy(&self, peer_type: EntityType, policy: Policy) {
        self.core
            .policies
            .lock()
            .expect("messenger lock poisoned")
            .map
            .insert(peer_type, policy);
    }

    pub fn set_policy_throttler(&self, peer_type: EntityType, throttler: Arc<Throttler>) {
        let mut policies = self.core.policies.lock().expect("messenger lock poisoned");
        let default_policy = policies.default_policy.clone();
        let policy = policies.map.entry(peer_type).or_insert(default_policy);
        policy.throttler = Some(throttler);
    }

    // ---- send paths --------------------------------------------------------

    /// Queue a message for `dest`, opening a session if none exists. The
    /// messenger owns the message from here on.
    pub async fn send_message(&self, mut m: Message, dest: &EntityInst) -> anyhow::Result<()> {
        self.stamp(&mut m);
        debug!("--> {:?} {:?} -- {:?}", dest.name, dest.addr, m);
        self.submit_message(m, dest.addr, dest.name.entity_type).await;
        Ok(())
    }

    /// Queue a message on an existing connection handle, skipping the address
    /// lookup.
    pub async fn send_message_on(&self, mut m: Message, con: &Arc<Connection>) -> anyhow::Result<()> {
        self.stamp(&mut m);
        let Some(pipe) = con.pipe() else {
            // raced with the reaper; the session is gone
            debug!("send_message dropped {:?}: connection has no pipe", m);
            return Ok(());
        };
        if self.is_local_pipe(&pipe) {
            debug!("--> {:?} -- {:?} (local)", con.peer_addr(), m);
            let priority = m.priority();
            self.core
                .local_delivery(DispatchItem::Message(m), priority)
                .await;
            return Ok(());
        }
        debug!("--> {:?} -- {:?}", con.peer_addr(), m);
        let mut inner = pipe.inner.lock().await;
        if inner.state == PipeState::Closed {
            debug!("send_message dropped: pipe is closed");
            let addr = inner.peer_addr;
            drop(inner);
            self.core.pipes.lock().await.unregister(&addr, &pipe);
            return Ok(());
        }
        inner.send(m);
        drop(inner);
        pipe.notify();
        Ok(())
    }

    fn stamp(&self, m: &mut Message) {
        if let Some(name) = self.core.my_name() {
            m.header.src = name;
        }
        if m.header.priority == 0 {
            m.set_priority(PRIO_DEFAULT);
        }
    }

    fn is_local_pipe(&self, pipe: &Arc<Pipe>) -> bool {
        self.core
            .local_pipe()
            .map(|local| Arc::ptr_eq(&local, pipe))
            .unwrap_or(false)
    }

    async fn submit_message(&self, m: Message, dest_addr: EntityAddr, dest_type: EntityType) {
        if dest_addr == self.core.my_addr() {
            if self.core.destination_stopped() {
                debug!("submit {:?}: local but stopped, dropping", m);
                return;
            }
            let priority = m.priority();
            self.core
                .local_delivery(DispatchItem::Message(m), priority)
                .await;
            return;
        }

        let mut table = self.core.pipes.lock().await;
        if let Some(pipe) = table.registered(&dest_addr) {
            let mut inner = pipe.inner.lock().await;
            if inner.state != PipeState::Closed {
                inner.send(m);
                drop(inner);
                pipe.notify();
                return;
            }
            drop(inner);
            table.unregister(&dest_addr, &pipe);
        }

        let policy = self.core.get_policy(dest_type);
        if policy.lossy && policy.server {
            debug!(
                "submit {:?} to {:?}: lossy server for target type, no session, dropping",
                m, dest_addr
            );
            return;
        }

        debug!("submit to {:?}: new pipe", dest_addr);
        let pipe = Pipe::new_connecting(self.core.clone(), dest_addr, dest_type, policy);
        table.register(dest_addr, pipe.clone());
        table.add(pipe.clone());
        pipe.inner.lock().await.send(m);
        drop(table);
        pipe.start_writer().await;
        pipe.notify();
    }

    /// A handle for subsequent sends without address lookup; opens a session
    /// if policy permits dialing this peer type.
    pub async fn get_connection(&self, dest: &EntityInst) -> Option<Arc<Connection>> {
        if dest.addr == self.core.my_addr() {
            return self.core.local_connection();
        }
        let mut table = self.core.pipes.lock().await;
        if let Some(pipe) = table.registered(&dest.addr) {
            let inner = pipe.inner.lock().await;
            if inner.state != PipeState::Closed {
                return Some(inner.connection.clone());
            }
            drop(inner);
            table.unregister(&dest.addr, &pipe);
        }
        let policy = self.core.get_policy(dest.name.entity_type);
        if policy.lossy && policy.server {
            return None;
        }
        let pipe = Pipe::new_connecting(self.core.clone(), dest.addr, dest.name.entity_type, policy);
        table.register(dest.addr, pipe.clone());
        table.add(pipe.clone());
        drop(table);
        pipe.start_writer().await;
        Some(pipe.connection().await)
    }

    /// Ask the writer to emit a liveness probe when convenient.
    pub async fn send_keepalive(&self, dest: &EntityInst) {
        if dest.addr == self.core.my_addr() {
            return;
        }
        let table = self.core.pipes.lock().await;
        let Some(pipe) = table.registered(&dest.addr) else {
            debug!("send_keepalive: no pipe for {:?}", dest.addr);
            return;
        };
        drop(table);
        self.keepalive_pipe(&pipe).await;
    }

    pub async fn send_keepalive_on(&self, con: &Arc<Connection>) {
        if let Some(pipe) = con.pipe() {
            self.keepalive_pipe(&pipe).await;
        }
    }

    async fn keepalive_pipe(&self, pipe: &Arc<Pipe>) {
        let mut inner = pipe.inner.lock().await;
        if inner.state != PipeState::Closed {
            inner.send_keepalive();
            drop(inner);
            pipe.notify();
        }
    }

    // ---- session teardown --------------------------------------------------

    /// Forcibly close the session to `addr`, discarding queued traffic. A
    /// durable session does not reconnect after this.
    pub async fn mark_down(&self, addr: &EntityAddr) {
        let mut table = self.core.pipes.lock().await;
        if let Some(pipe) = table.registered(addr) {
            info!("mark_down {:?}", addr);
            table.unregister(addr, &pipe);
            let mut inner = pipe.inner.lock().await;
            pipe.stop_locked(&mut inner);
        } else {
            debug!("mark_down {:?} -- pipe dne", addr);
        }
    }

    pub async fn mark_down_con(&self, con: &Arc<Connection>) {
        if let Some(pipe) = con.pipe() {
            info!("mark_down {:?}", con.peer_addr());
            let mut table = self.core.pipes.lock().await;
            let mut inner = pipe.inner.lock().await;
            let addr = inner.peer_addr;
            table.unregister(&addr, &pipe);
            pipe.stop_locked(&mut inner);
        }
    }

    pub async fn mark_down_all(&self) {
        info!("mark_down_all");
        let doomed = {
            let mut table = self.core.pipes.lock().await;
            table.drain_registered()
        };
        for (addr, pipe) in doomed {
            debug!("mark_down_all {:?}", addr);
            let mut inner = pipe.inner.lock().await;
            pipe.stop_locked(&mut inner);
        }
    }

    /// Unregister now, close once the outbound queue fully drains and the
    /// peer has acked everything.
    pub async fn mark_down_on_empty(&self, con: &Arc<Connection>) {
        let Some(pipe) = con.pipe() else {
            return;
        };
        let mut table = self.core.pipes.lock().await;
        let mut inner = pipe.inner.lock().await;
        let addr = inner.peer_addr;
        table.unregister(&addr, &pipe);
        if inner.out_q_empty() && !inner.is_queued() {
            info!("mark_down_on_empty {:?}: closing now", addr);
            pipe.stop_locked(&mut inner);
        } else {
            info!("mark_down_on_empty {:?}: closing once drained", addr);
            inner.close_on_empty = true;
            drop(inner);
            pipe.notify();
        }
    }

    /// Make the rest of this session lossy: faults tear it down instead of
    /// reconnecting, and the peer's lossy flag no longer matters.
    pub async fn mark_disposable(&self, con: &Arc<Connection>) {
        if let Some(pipe) = con.pipe() {
            info!("mark_disposable {:?}", con.peer_addr());
            let mut inner = pipe.inner.lock().await;
            inner.policy.lossy = true;
            inner.disposable = true;
        }
    }

    // ---- shutdown ----------------------------------------------------------

    /// Begin shutdown: the dispatch task finishes its in-flight delivery and
    /// exits. `wait` completes the teardown.
    pub fn shutdown(&self) {
        info!("shutdown {:?}", self.core.my_addr());
        self.core.dispatch_queue.stop();
    }

    /// Block until shutdown is complete: dispatch drained, accepter stopped,
    /// every pipe closed and reaped.
    pub async fn wait(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }

        let dispatch = self.tasks.lock().expect("messenger lock poisoned").dispatch.take();
        if let Some(handle) = dispatch {
            debug!("wait: waiting for dispatch to drain");
            let _ = handle.await;
        }
        self.core.destination_stopped.store(true, Ordering::Release);

        let accepter_task = self.tasks.lock().expect("messenger lock poisoned").accepter.take();
        if let Some(task) = accepter_task {
            debug!("wait: stopping accepter");
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }

        debug!("wait: closing pipes");
        let pipes = { self.core.pipes.lock().await.all_pipes() };
        for pipe in pipes {
            let mut inner = pipe.inner.lock().await;
            pipe.stop_gracefully_locked(&mut inner);
        }

        loop {
            let drained = self.core.pipes_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.core.pipes.lock().await.is_empty() {
                break;
            }
            drained.await;
        }

        debug!("wait: stopping reaper");
        let _ = self.core.stop_tx.send(true);
        let reaper = self.tasks.lock().expect("messenger lock poisoned").reaper.take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        if let Some(local) = self.core.local_pipe() {
            let mut inner = local.inner.lock().await;
            local.discard_queue(&mut inner).await;
        }

        self.started.store(false, Ordering::Release);
        info!("shutdown complete");
    }
}

async fn reaper_entry(core: Arc<MessengerCore>, mut reap_rx: mpsc::UnboundedReceiver<Arc<Pipe>>) {
    debug!("reaper starting");
    let mut stop_rx = core.stop_rx();
    loop {
        tokio::select! {
            pipe = reap_rx.recv() => match pipe {
                Some(pipe) => reap_one(&core, pipe).await,
                None => break,
            },
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("reaper done");
}

async fn reap_one(core: &Arc<MessengerCore>, pipe: Arc<Pipe>) {
    {
        let mut table = core.pipes.lock().await;
        let addr = pipe.inner.lock().await.peer_addr;
        debug!("reaping pipe to {:?}", addr);
        table.unregister(&addr, &pipe);
        table.remove(pipe.id);
    }
    pipe.reap().await;
    core.pipes_drained.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{NullAuthorizer, RawCodec};
    use crate::message::PRIO_HIGH;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    struct CollectingDispatcher {
        messages: mpsc::UnboundedSender<Message>,
        events: mpsc::UnboundedSender<&'static str>,
    }

    #[async_trait]
    impl Dispatcher for CollectingDispatcher {
        async fn dispatch(&self, msg: Message) {
            let _ = self.messages.send(msg);
        }
        async fn handle_connect(&self, _con: Arc<Connection>) {
            let _ = self.events.send("connect");
        }
        async fn handle_reset(&self, _con: Arc<Connection>) {
            let _ = self.events.send("reset");
        }
        async fn handle_remote_reset(&self, _con: Arc<Connection>) {
            let _ = self.events.send("remote_reset");
        }
    }

    fn new_messenger(
        port_range: (u16, u16),
    ) -> (
        Messenger,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<&'static str>,
    ) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let mut config = MessengerConfig::default_config();
        config.port_range = port_range;
        config.timeout = Some(Duration::from_secs(30));
        let messenger = Messenger::new(
            config,
            Arc::new(CollectingDispatcher {
                messages: msg_tx,
                events: evt_tx,
            }),
            Arc::new(NullAuthorizer),
            Arc::new(RawCodec),
        )
        .unwrap();
        (messenger, msg_rx, evt_rx)
    }

    async fn recv_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("dispatcher channel closed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loopback_delivery() {
        let (a, mut msgs, _events) = new_messenger((18_800, 18_819));
        a.register_entity(EntityName::new(EntityType::Monitor, 1));
        a.bind("127.0.0.1:0".parse().unwrap(), 7).await.unwrap();
        a.start().unwrap();

        let me = a.get_myinst().unwrap();
        let m = Message::new(1, Bytes::from_static(b"to myself"));
        a.send_message(m, &me).await.unwrap();

        let got = recv_message(&mut msgs).await;
        assert_eq!(got.payload.as_ref(), b"to myself");

        a.shutdown();
        a.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simple_round_trip() {
        let (b, mut b_msgs, _b_events) = new_messenger((18_820, 18_839));
        b.register_entity(EntityName::new(EntityType::ObjectServer, 2));
        b.bind("127.0.0.1:0".parse().unwrap(), 9).await.unwrap();
        b.start().unwrap();

        let (a, _a_msgs, _a_events) = new_messenger((18_840, 18_859));
        a.register_entity(EntityName::new(EntityType::Client, 1));
        a.start_with_nonce(7).unwrap();

        let dest = EntityInst::new(EntityName::new(EntityType::ObjectServer, 2), b.get_myaddr());
        let mut m = Message::new(42, Bytes::from_static(b"ping"));
        m.set_priority(127);
        a.send_message(m, &dest).await.unwrap();

        let got = recv_message(&mut b_msgs).await;
        assert_eq!(got.payload.as_ref(), b"ping");
        assert_eq!(got.seq(), 1);
        assert_eq!(got.header.src, EntityName::new(EntityType::Client, 1));

        a.shutdown();
        a.wait().await;
        b.shutdown();
        b.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordered_delivery_within_priority() {
        let (b, mut b_msgs, _b_events) = new_messenger((18_860, 18_879));
        b.register_entity(EntityName::new(EntityType::ObjectServer, 5));
        b.bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        b.start().unwrap();

        let (a, _a_msgs, _a_events) = new_messenger((18_880, 18_899));
        a.register_entity(EntityName::new(EntityType::Client, 6));
        a.start_with_nonce(2).unwrap();

        let dest = EntityInst::new(EntityName::new(EntityType::ObjectServer, 5), b.get_myaddr());
        for i in 0..20u8 {
            let mut m = Message::new(1, Bytes::copy_from_slice(&[i]));
            m.set_priority(PRIO_HIGH);
            a.send_message(m, &dest).await.unwrap();
        }

        let mut seqs = Vec::new();
        for _ in 0..20 {
            let got = recv_message(&mut b_msgs).await;
            seqs.push(got.seq());
        }
        let expected: Vec<u64> = (1..=20).collect();
        assert_eq!(seqs, expected);

        a.shutdown();
        a.wait().await;
        b.shutdown();
        b.wait().await;
    }
}
