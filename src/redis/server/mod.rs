//! The server context: every piece of engine state, owned by one value.
//!
//! The implementation is split across several files:
//!
//! - `mod.rs` (this file): the struct, builder, client registry, collaborator
//!   hooks and the cron entry points
//! - `keyspace.rs`: lookups and the add/overwrite/delete primitives that also
//!   drive WATCH invalidation and notifications
//! - `pipeline.rs`: `process_command`, `call` and command dispatch
//! - `expire.rs`: lazy and active expiration, EXPIRE/TTL/PERSIST
//! - `multi.rs`: MULTI/EXEC/DISCARD/WATCH/UNWATCH
//! - `string_ops.rs`, `key_ops.rs`, `list_ops.rs`, `set_ops.rs`,
//!   `hash_ops.rs`, `zset_ops.rs`, `server_ops.rs`: command handlers
//!
//! All command execution is single threaded. The only other threads are the
//! background job workers, which never see engine state.

mod expire;
mod hash_ops;
mod key_ops;
mod keyspace;
mod list_ops;
mod multi;
mod pipeline;
mod server_ops;
mod set_ops;
mod string_ops;
mod zset_ops;

pub use expire::ExpireCycle;
pub use pipeline::CallFlags;

use super::client::{Client, ClientFlags, ClientId};
use super::data::lru_clock;
use super::db::Database;
use super::notify::{NotificationPublisher, NotifyFlags, NullPublisher};
use super::propagate::{NullSink, PropagateTargets, PropagationSink};
use super::registry::{CommandDescriptor, CommandTable};
use super::slowlog::Slowlog;
use crate::bio::{BackgroundJobs, InlineJobs, Job, JobSubmitter};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ServerConfig};
use ahash::AHashMap;
use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RUN_ID_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Snapshot,
    AofRewrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Running,
    Succeeded,
    Failed,
}

impl SaveStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SaveStatus::Running,
            1 => SaveStatus::Succeeded,
            _ => SaveStatus::Failed,
        }
    }
}

/// Handle to a save running outside the command thread. The engine polls it
/// from cron; whoever performs the save calls `finish`.
#[derive(Debug, Clone)]
pub struct SaveTask {
    kind: SaveKind,
    status: Arc<AtomicU8>,
}

impl SaveTask {
    fn new(kind: SaveKind) -> Self {
        SaveTask {
            kind,
            status: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn kind(&self) -> SaveKind {
        self.kind
    }

    pub fn status(&self) -> SaveStatus {
        SaveStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn finish(&self, ok: bool) {
        self.status.store(if ok { 1 } else { 2 }, Ordering::Release);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub numcommands: u64,
    pub numconnections: u64,
    pub expired_keys: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    /// Active expire cycles cut short by their time budget.
    pub expire_timelimit_exits: u64,
}

/// An operation queued by a handler for propagation after its own command.
struct PendingOp {
    cmd: Rc<CommandDescriptor>,
    dbid: usize,
    argv: Vec<Bytes>,
    targets: PropagateTargets,
}

enum Jobs {
    Threads(BackgroundJobs),
    Inline(InlineJobs),
}

pub struct ServerBuilder {
    config: ServerConfig,
    clock: Option<Box<dyn Clock>>,
    sink: Option<Box<dyn PropagationSink>>,
    publisher: Option<Box<dyn NotificationPublisher>>,
}

impl ServerBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn sink(mut self, sink: impl PropagationSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn publisher(mut self, publisher: impl NotificationPublisher + 'static) -> Self {
        self.publisher = Some(Box::new(publisher));
        self
    }

    pub fn build(self) -> Result<Server, ConfigError> {
        let config = self.config;
        config.validate()?;
        let notify_flags = config.notify_flags()?;

        let mut commands = CommandTable::populate();
        let mut renames: Vec<_> = config.rename_commands.iter().collect();
        renames.sort();
        for (old, new) in renames {
            commands
                .rename(old, new)
                .map_err(|reason| ConfigError::Invalid {
                    field: "rename_commands",
                    reason,
                })?;
        }

        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let run_id = generate_run_id(&mut rng);
        let clock = self.clock.unwrap_or_else(|| Box::new(SystemClock));
        let now_ms = clock.now_ms();
        let jobs = if config.bio_threads {
            Jobs::Threads(BackgroundJobs::start())
        } else {
            Jobs::Inline(InlineJobs)
        };

        Ok(Server {
            dbs: (0..config.databases).map(Database::new).collect(),
            slowlog: Slowlog::new(&config.slowlog),
            commands,
            clients: AHashMap::new(),
            next_client_id: 1,
            current_client: None,
            master: None,
            role: Role::Primary,
            sink: self.sink.unwrap_or_else(|| Box::new(NullSink)),
            publisher: self.publisher.unwrap_or_else(|| Box::new(NullPublisher)),
            notify_flags,
            stats: Stats::default(),
            dirty: 0,
            dirty_before_bgsave: 0,
            also_propagate: Vec::new(),
            call_depth: 0,
            cmd_time_ms: now_ms,
            lru_clock: lru_clock(now_ms),
            loading: false,
            save_task: None,
            last_bgsave_ok: true,
            lastsave_secs: clock.now_secs(),
            aof_last_write_error: None,
            clients_paused_until_ms: 0,
            memory_pressure: false,
            expire_state: expire::ActiveExpireState::default(),
            started_ms: now_ms,
            cronloops: 0,
            run_id,
            rng,
            clock,
            jobs,
            config,
        })
    }
}

pub struct Server {
    config: ServerConfig,
    commands: CommandTable,
    dbs: Vec<Database>,
    clients: AHashMap<ClientId, Client>,
    next_client_id: u64,
    /// Client whose command is executing.
    current_client: Option<ClientId>,
    /// The upstream link when running as a replica.
    master: Option<ClientId>,
    role: Role,
    clock: Box<dyn Clock>,
    rng: ChaCha8Rng,
    sink: Box<dyn PropagationSink>,
    publisher: Box<dyn NotificationPublisher>,
    notify_flags: NotifyFlags,
    slowlog: Slowlog,
    stats: Stats,
    /// Changes since the last successful save.
    dirty: u64,
    dirty_before_bgsave: u64,
    also_propagate: Vec<PendingOp>,
    call_depth: usize,
    /// Time frozen at the start of the outermost `call`.
    cmd_time_ms: i64,
    lru_clock: u32,
    loading: bool,
    save_task: Option<SaveTask>,
    last_bgsave_ok: bool,
    lastsave_secs: u64,
    aof_last_write_error: Option<String>,
    clients_paused_until_ms: i64,
    memory_pressure: bool,
    expire_state: expire::ActiveExpireState,
    started_ms: i64,
    cronloops: u64,
    run_id: String,
    jobs: Jobs,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            clock: None,
            sink: None,
            publisher: None,
        }
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    pub fn create_client(&mut self) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        let authenticated = self.config.requirepass.is_none();
        self.clients
            .insert(id, Client::new(id, authenticated, self.clock.now_ms()));
        self.stats.numconnections += 1;
        debug!(client = %id, "client created");
        id
    }

    pub fn free_client(&mut self, id: ClientId) {
        if !self.clients.contains_key(&id) {
            return;
        }
        self.unwatch_all_keys(id);
        if let Some(client) = self.clients.remove(&id) {
            debug!(client = %id, queued = client.mstate.len(), "client freed");
        }
        if self.master == Some(id) {
            self.master = None;
        }
        if self.current_client == Some(id) {
            self.current_client = None;
        }
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Panics on an unknown id: handlers only ever run for live clients.
    fn client_state(&self, id: ClientId) -> &Client {
        match self.clients.get(&id) {
            Some(client) => client,
            None => panic!("no such client {}", id),
        }
    }

    fn client_state_mut(&mut self, id: ClientId) -> &mut Client {
        match self.clients.get_mut(&id) {
            Some(client) => client,
            None => panic!("no such client {}", id),
        }
    }

    fn selected_db(&self, id: ClientId) -> usize {
        self.client_state(id).db
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn db(&self, id: usize) -> &Database {
        &self.dbs[id]
    }

    pub fn num_dbs(&self) -> usize {
        self.dbs.len()
    }

    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn slowlog(&self) -> &Slowlog {
        &self.slowlog
    }

    pub fn last_bgsave_ok(&self) -> bool {
        self.last_bgsave_ok
    }

    pub fn save_in_progress(&self) -> bool {
        self.save_task
            .as_ref()
            .map_or(false, |t| t.status() == SaveStatus::Running)
    }

    // ------------------------------------------------------------------
    // Collaborator hooks
    // ------------------------------------------------------------------

    /// While loading, expiration is suspended and only load-safe commands run.
    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// `Some(link)` turns this instance into a replica fed by `link`;
    /// `None` promotes it back to primary. An unknown link leaves the
    /// current role and master untouched.
    pub fn set_replica_of(&mut self, link: Option<ClientId>) {
        if let Some(id) = link {
            if !self.clients.contains_key(&id) {
                warn!(link = %id, "replica link is not a connected client; ignoring");
                return;
            }
        }
        if let Some(old) = self.master.take() {
            if let Some(client) = self.clients.get_mut(&old) {
                client.flags.remove(ClientFlags::MASTER);
            }
        }
        match link {
            Some(id) => {
                self.client_state_mut(id).flags.insert(ClientFlags::MASTER);
                self.master = Some(id);
                self.role = Role::Replica;
                info!(master = %id, "now a replica");
            }
            None => {
                self.role = Role::Primary;
                info!("now a primary");
            }
        }
    }

    /// Register a save running elsewhere. Returns `None` if one is already
    /// in flight.
    pub fn start_background_save(&mut self, kind: SaveKind) -> Option<SaveTask> {
        if self.save_in_progress() {
            return None;
        }
        let task = SaveTask::new(kind);
        self.dirty_before_bgsave = self.dirty;
        self.save_task = Some(task.clone());
        info!(?kind, "background save started");
        Some(task)
    }

    pub fn record_aof_write_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(error = %msg, "AOF write failed, refusing writes");
        self.aof_last_write_error = Some(msg);
    }

    pub fn clear_aof_write_error(&mut self) {
        if self.aof_last_write_error.take().is_some() {
            info!("AOF write error cleared");
        }
    }

    pub fn pause_clients(&mut self, until_ms: i64) {
        self.clients_paused_until_ms = self.clients_paused_until_ms.max(until_ms);
    }

    fn clients_are_paused(&mut self) -> bool {
        if self.clients_paused_until_ms != 0 && self.clients_paused_until_ms < self.clock.now_ms() {
            self.clients_paused_until_ms = 0;
        }
        self.clients_paused_until_ms != 0
    }

    pub fn set_memory_pressure(&mut self, pressure: bool) {
        self.memory_pressure = pressure;
    }

    /// Record that some client blocks on `key`. A later add of a list under
    /// that key makes it ready.
    pub fn register_blocking_key(&mut self, db: usize, key: Bytes) {
        self.dbs[db].add_blocking_key(key);
    }

    pub fn unregister_blocking_key(&mut self, db: usize, key: &[u8]) {
        self.dbs[db].remove_blocking_key(key);
    }

    /// Keys that became ready since the last call, as (db, key).
    pub fn take_ready_keys(&mut self) -> Vec<(usize, Bytes)> {
        self.dbs
            .iter_mut()
            .flat_map(|db| {
                let id = db.id;
                db.take_ready_keys().into_iter().map(move |k| (id, k))
            })
            .collect()
    }

    pub fn background_jobs(&self) -> &dyn JobSubmitter {
        match &self.jobs {
            Jobs::Threads(jobs) => jobs,
            Jobs::Inline(jobs) => jobs,
        }
    }

    pub fn submit_background_job(&self, job: Job) {
        self.background_jobs().submit(job);
    }

    /// Stop the background workers, waiting for queued jobs.
    pub fn shutdown(self) {
        if let Jobs::Threads(jobs) = self.jobs {
            jobs.kill_threads();
        }
        info!("server stopped");
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Called `hz` times per second.
    pub fn server_cron(&mut self) {
        let now_ms = self.clock.now_ms();
        self.lru_clock = lru_clock(now_ms);
        self.check_save_task();
        self.databases_cron();
        self.cronloops += 1;
    }

    /// Called once per event loop iteration, before waiting for I/O.
    pub fn before_sleep(&mut self) {
        if self.config.active_expire_enabled && self.role == Role::Primary {
            self.active_expire_cycle(ExpireCycle::Fast);
        }
    }

    fn databases_cron(&mut self) {
        if self.config.active_expire_enabled && self.role == Role::Primary {
            self.active_expire_cycle(ExpireCycle::Slow);
        }
        // Resizing while a save is running would copy every touched page.
        if !self.save_in_progress() {
            for db in &mut self.dbs {
                if db.try_resize() {
                    debug!(db = db.id, keys = db.len(), "database tables shrunk");
                }
            }
        }
    }

    fn check_save_task(&mut self) {
        let Some(task) = &self.save_task else {
            return;
        };
        let kind = task.kind();
        match task.status() {
            SaveStatus::Running => return,
            SaveStatus::Succeeded => {
                if kind == SaveKind::Snapshot {
                    self.dirty = self.dirty.saturating_sub(self.dirty_before_bgsave);
                    self.lastsave_secs = self.clock.now_secs();
                    self.last_bgsave_ok = true;
                }
                info!(?kind, "background save terminated with success");
            }
            SaveStatus::Failed => {
                if kind == SaveKind::Snapshot {
                    self.last_bgsave_ok = false;
                }
                warn!(?kind, "background save failed");
            }
        }
        self.save_task = None;
    }
}

/// 40 hex characters: SHA1 in counter mode over a random seed.
fn generate_run_id(rng: &mut ChaCha8Rng) -> String {
    let mut seed = [0u8; 20];
    rng.fill_bytes(&mut seed);
    let mut out = String::with_capacity(RUN_ID_SIZE);
    let mut counter: u64 = 0;
    while out.len() < RUN_ID_SIZE {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(counter.to_le_bytes());
        for byte in hasher.finalize() {
            let _ = write!(out, "{:02x}", byte);
        }
        counter += 1;
    }
    out.truncate(RUN_ID_SIZE);
    out
}
