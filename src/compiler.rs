// src/compiler.rs
//! Permutation compiler: generated compile units -> cached bytecode, off the
//! interactive thread.
//!
//! - Worker pool fed by a crossbeam channel
//! - At most one backend invocation per `PermutationKey`: the first request registers
//!   a shared promise, later requests attach to it
//! - Per block x target state (`CompileStatus`) with a last-known-good fallback
//! - `BackendUnavailable` retried with exponential backoff
//! - A key the backend rejected fails again without a backend call until the
//!   source changes or a rebuild is forced
//! - Results of superseded requests go to their waiters but are not cached or promoted
//!
//! Usage:
//!  let compiler = PermutationCompiler::new(Arc::new(DxcBackend::new("dxc")), CompilerConfig::default())?;
//!  let ticket = compiler.compile(CompileUnit::new(code), &target);
//!  let artifact = ticket.wait()?;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::artifact_cache::ArtifactCache;
use crate::backend::{BackendError, BackendMessage, BackendRequest, ShaderCompilerBackend};
use crate::binding::{ArtifactLookup, ArtifactSource};
use crate::codegen::GeneratedCode;
use crate::config::CompilerConfig;
use crate::error::{Error, Result};
use crate::line_map::SourceOrigin;
use crate::permutation::{
    CompileDiagnostics, CompileStatus, CompiledPermutation, Diagnostic, PermutationKey, PermutationTarget,
};
use crate::source_model::BlockId;

/// What gets compiled: a generated unit for one block.
#[derive(Debug, Clone)]
pub struct CompileUnit {
    pub block_id: BlockId,
    pub code: Arc<GeneratedCode>,
}

impl CompileUnit {
    pub fn new(code: GeneratedCode) -> Self {
        Self {
            block_id: code.block_id,
            code: Arc::new(code),
        }
    }
}

pub type CompileOutcome = Result<Arc<CompiledPermutation>>;

/// Notifications for the editor (status bar, error list).
#[derive(Debug, Clone)]
pub enum CompileEvent {
    Compiled {
        block: BlockId,
        target: PermutationTarget,
        key: PermutationKey,
    },
    Failed {
        block: BlockId,
        target: PermutationTarget,
        diagnostics: Arc<CompileDiagnostics>,
    },
    /// Finished after a newer request replaced it; result dropped.
    Superseded {
        block: BlockId,
        target: PermutationTarget,
        key: PermutationKey,
    },
}

// ---------- Promise / ticket ----------

#[derive(Default)]
struct Promise {
    result: Mutex<Option<CompileOutcome>>,
    ready: Condvar,
}

impl Promise {
    fn fulfilled(outcome: CompileOutcome) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Some(outcome)),
            ready: Condvar::new(),
        })
    }

    fn fulfil(&self, outcome: CompileOutcome) {
        *self.result.lock() = Some(outcome);
        self.ready.notify_all();
    }
}

/// Handle on a (possibly shared) compile.
#[derive(Clone)]
pub struct CompileTicket {
    key: PermutationKey,
    promise: Arc<Promise>,
}

impl CompileTicket {
    pub fn key(&self) -> &PermutationKey {
        &self.key
    }

    pub fn try_get(&self) -> Option<CompileOutcome> {
        self.promise.result.lock().clone()
    }

    pub fn wait(&self) -> CompileOutcome {
        let mut guard = self.promise.result.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            self.promise.ready.wait(&mut guard);
        }
    }

    /// `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompileOutcome> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.promise.result.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return Some(outcome.clone());
            }
            if self.promise.ready.wait_until(&mut guard, deadline).timed_out() {
                return guard.clone();
            }
        }
    }

    /// Two tickets attached to the same in-flight compile.
    pub fn shares_compile_with(&self, other: &CompileTicket) -> bool {
        Arc::ptr_eq(&self.promise, &other.promise)
    }
}

// ---------- Shared state ----------

#[derive(Default)]
struct TargetState {
    status: Option<CompileStatus>,
    /// Key of the latest request; results for any other key are superseded.
    wanted: Option<PermutationKey>,
    fallback: Option<Arc<CompiledPermutation>>,
    /// Last key the backend rejected, with its diagnostics.
    failed: Option<(PermutationKey, Arc<CompileDiagnostics>)>,
}

impl TargetState {
    fn failure_for(&self, key: &PermutationKey) -> Option<Arc<CompileDiagnostics>> {
        match &self.failed {
            Some((failed, diagnostics)) if failed == key => Some(diagnostics.clone()),
            _ => None,
        }
    }

    fn is_current(&self, key: &PermutationKey) -> bool {
        self.wanted.as_ref() == Some(key)
            && matches!(&self.status, Some(CompileStatus::Compiled(k)) if k == key)
    }
}

struct Job {
    unit: CompileUnit,
    target: PermutationTarget,
    key: PermutationKey,
    promise: Arc<Promise>,
}

struct Inner {
    backend: Arc<dyn ShaderCompilerBackend>,
    config: CompilerConfig,
    compiler_version: RwLock<String>,
    cache: ArtifactCache,
    in_flight: Mutex<HashMap<PermutationKey, Arc<Promise>>>,
    states: RwLock<HashMap<(BlockId, PermutationTarget), TargetState>>,
    subscribers: Mutex<Vec<Sender<CompileEvent>>>,
    backend_calls: AtomicUsize,
    pending: Mutex<usize>,
    idle: Condvar,
}

pub struct PermutationCompiler {
    inner: Arc<Inner>,
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl PermutationCompiler {
    pub fn new(backend: Arc<dyn ShaderCompilerBackend>, config: CompilerConfig) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let threads = config.effective_workers();
        let inner = Arc::new(Inner {
            backend,
            compiler_version: RwLock::new(config.compiler_version.clone()),
            cache: ArtifactCache::new(config.cache_capacity),
            config,
            in_flight: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            backend_calls: AtomicUsize::new(0),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = inner.clone();
            let job_rx: Receiver<Job> = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("hlsl-compile-{i}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let ran = inner.run(&job);
                        inner.finish(job, ran);
                    }
                })?;
            workers.push(handle);
        }
        log::info!(
            "permutation compiler started: backend {}, {} worker(s)",
            inner.backend.name(),
            threads
        );

        Ok(Self {
            inner,
            job_tx: Some(job_tx),
            workers,
        })
    }

    pub fn compiler_version(&self) -> String {
        self.inner.compiler_version.read().clone()
    }

    pub fn key_for(&self, unit: &CompileUnit, target: &PermutationTarget) -> PermutationKey {
        PermutationKey::new(target, self.compiler_version(), unit.code.content_hash)
    }

    /// Request `unit` for `target`. Never blocks on the backend.
    pub fn compile(&self, unit: CompileUnit, target: &PermutationTarget) -> CompileTicket {
        let key = self.key_for(&unit, target);
        let slot = (unit.block_id, target.clone());

        if let Some(artifact) = self.inner.cache.get(&key) {
            return self.cache_hit(&slot, key, artifact);
        }

        {
            let mut states = self.inner.states.write();
            let state = states.entry(slot.clone()).or_default();
            state.wanted = Some(key.clone());
            if let Some(diagnostics) = state.failure_for(&key) {
                log::debug!("{key} already failed for block {}", unit.block_id);
                state.status = Some(CompileStatus::Failed(diagnostics.clone()));
                return CompileTicket {
                    key,
                    promise: Promise::fulfilled(Err(Error::CompileFailure(diagnostics))),
                };
            }
        }

        let mut in_flight = self.inner.in_flight.lock();

        // a worker may have finished this key since the first lookup
        if let Some(artifact) = self.inner.cache.get(&key) {
            drop(in_flight);
            return self.cache_hit(&slot, key, artifact);
        }

        if let Some(promise) = in_flight.get(&key) {
            log::debug!("joining in-flight compile {key}");
            self.set_compiling(&slot, &key);
            return CompileTicket {
                key,
                promise: promise.clone(),
            };
        }

        let promise = Arc::new(Promise::default());
        in_flight.insert(key.clone(), promise.clone());
        self.set_compiling(&slot, &key);
        *self.inner.pending.lock() += 1;

        let job = Job {
            unit,
            target: target.clone(),
            key: key.clone(),
            promise: promise.clone(),
        };
        let sent = self.job_tx.as_ref().map(|tx| tx.send(job));
        if !matches!(sent, Some(Ok(()))) {
            in_flight.remove(&key);
            drop(in_flight);
            let err = Error::BackendUnavailable("compiler is shutting down".into());
            promise.fulfil(Err(err));
            self.inner.done_one();
        }
        CompileTicket { key, promise }
    }

    /// Promote a cached artifact. Takes only shared locks when the slot is already current.
    fn cache_hit(
        &self,
        slot: &(BlockId, PermutationTarget),
        key: PermutationKey,
        artifact: Arc<CompiledPermutation>,
    ) -> CompileTicket {
        log::debug!("cache hit {key} for block {}", slot.0);
        let current = self.inner.states.read().get(slot).is_some_and(|s| s.is_current(&key));
        if !current {
            let mut states = self.inner.states.write();
            let state = states.entry(slot.clone()).or_default();
            state.wanted = Some(key.clone());
            state.status = Some(CompileStatus::Compiled(key.clone()));
            state.fallback = Some(artifact.clone());
        }
        CompileTicket {
            key,
            promise: Promise::fulfilled(Ok(artifact)),
        }
    }

    fn set_compiling(&self, slot: &(BlockId, PermutationTarget), key: &PermutationKey) {
        let mut states = self.inner.states.write();
        let state = states.entry(slot.clone()).or_default();
        if state.wanted.as_ref() == Some(key) {
            state.status = Some(CompileStatus::Compiling);
        }
    }

    /// Drop the cached artifact for this unit and compile it again.
    pub fn force_rebuild(&self, unit: CompileUnit, target: &PermutationTarget) -> CompileTicket {
        let key = self.key_for(&unit, target);
        self.inner.cache.remove(&key);
        if let Some(state) = self.inner.states.write().get_mut(&(unit.block_id, target.clone())) {
            state.failed = None;
        }
        log::debug!("forced rebuild of {key}");
        self.compile(unit, target)
    }

    /// Evict the block's artifacts; fallbacks stay so runtime binding has no gap.
    pub fn invalidate_block(&self, block: BlockId) -> usize {
        let dropped = self.inner.cache.invalidate_block(block);
        let mut states = self.inner.states.write();
        for ((b, _), state) in states.iter_mut() {
            if *b == block {
                state.status = Some(CompileStatus::Uncompiled);
                state.wanted = None;
                state.failed = None;
            }
        }
        dropped
    }

    /// Global invalidation: every key carries the version, so all cached artifacts go.
    pub fn bump_compiler_version(&self, version: impl Into<String>) {
        let version = version.into();
        *self.inner.compiler_version.write() = version.clone();
        let dropped = self.inner.cache.clear();
        for state in self.inner.states.write().values_mut() {
            state.status = Some(CompileStatus::Uncompiled);
            state.wanted = None;
            state.failed = None;
        }
        log::info!("compiler version now {version}, dropped {dropped} artifact(s)");
    }

    /// Reclaim everything owned by a deleted block.
    pub fn remove_block(&self, block: BlockId) {
        self.inner.cache.invalidate_block(block);
        self.inner.states.write().retain(|(b, _), _| *b != block);
    }

    /// Number of block x target slots with tracked state.
    pub fn tracked_slots(&self) -> usize {
        self.inner.states.read().len()
    }

    pub fn status(&self, block: BlockId, target: &PermutationTarget) -> CompileStatus {
        self.inner
            .states
            .read()
            .get(&(block, target.clone()))
            .and_then(|s| s.status.clone())
            .unwrap_or(CompileStatus::Uncompiled)
    }

    pub fn fallback(&self, block: BlockId, target: &PermutationTarget) -> Option<Arc<CompiledPermutation>> {
        self.inner
            .states
            .read()
            .get(&(block, target.clone()))
            .and_then(|s| s.fallback.clone())
    }

    pub fn cached(&self, key: &PermutationKey) -> Option<Arc<CompiledPermutation>> {
        self.inner.cache.get(key)
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    /// Total backend invocations, retries included.
    pub fn backend_calls(&self) -> usize {
        self.inner.backend_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Receiver<CompileEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Block until no compile is queued or running.
    pub fn wait_idle(&self) {
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            self.inner.idle.wait(&mut pending);
        }
    }

    /// `false` on timeout.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            if self.inner.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }
}

impl Drop for PermutationCompiler {
    fn drop(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("compile worker panicked");
            }
        }
    }
}

impl ArtifactSource for PermutationCompiler {
    fn lookup(&self, block: BlockId, target: &PermutationTarget) -> ArtifactLookup {
        let states = self.inner.states.read();
        let Some(state) = states.get(&(block, target.clone())) else {
            return ArtifactLookup::Missing;
        };
        match (&state.status, &state.fallback) {
            (Some(CompileStatus::Compiled(key)), Some(artifact)) if &artifact.key == key => {
                ArtifactLookup::Current(artifact.clone())
            }
            (_, Some(artifact)) => ArtifactLookup::Fallback(artifact.clone()),
            (_, None) => ArtifactLookup::Missing,
        }
    }
}

// ---------- Worker side ----------

impl Inner {
    fn run(&self, job: &Job) -> Ran {
        let request = BackendRequest::new(&job.unit.code, &job.target);
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut attempt = 0u32;

        loop {
            self.backend_calls.fetch_add(1, Ordering::SeqCst);
            let result = match panic::catch_unwind(AssertUnwindSafe(|| self.backend.compile(&request))) {
                Ok(result) => result,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    log::error!("backend {} panicked on {}: {reason}", self.backend.name(), job.key);
                    return Ran::infrastructure(job, format!("shader compiler backend panicked: {reason}"));
                }
            };
            match result {
                Ok(output) => {
                    let warnings = output
                        .messages
                        .iter()
                        .map(|m| map_message(&job.unit.code, m))
                        .collect();
                    return Ran {
                        outcome: Ok(Arc::new(CompiledPermutation {
                            key: job.key.clone(),
                            block_id: job.unit.block_id,
                            bytecode: output.bytecode,
                            warnings,
                        })),
                        rejected: false,
                    };
                }
                Err(BackendError::Rejected(messages)) => {
                    let diagnostics = messages.iter().map(|m| map_message(&job.unit.code, m)).collect();
                    return Ran {
                        outcome: Err(Error::CompileFailure(Arc::new(CompileDiagnostics {
                            block_id: job.unit.block_id,
                            target: job.target.clone(),
                            diagnostics,
                        }))),
                        rejected: true,
                    };
                }
                Err(BackendError::Unavailable(reason)) => {
                    if attempt >= self.config.max_retries {
                        log::error!(
                            "backend unavailable for {} after {} attempt(s): {reason}",
                            job.key,
                            attempt + 1
                        );
                        return Ran::infrastructure(job, format!("shader compiler backend unavailable: {reason}"));
                    }
                    attempt += 1;
                    log::warn!(
                        "backend unavailable for {} ({reason}), retry {attempt}/{} in {:?}",
                        job.key,
                        self.config.max_retries,
                        backoff
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    fn finish(&self, job: Job, ran: Ran) {
        let Ran { outcome, rejected } = ran;
        let block = job.unit.block_id;
        let slot = (block, job.target.clone());

        let event = {
            let mut states = self.states.write();
            // the slot is gone after remove_block; nothing to record
            let state = match states.get_mut(&slot) {
                Some(state) if state.wanted.as_ref() == Some(&job.key) => Some(state),
                _ => None,
            };
            match state {
                None => {
                    log::debug!("discarding superseded result {}", job.key);
                    CompileEvent::Superseded {
                        block,
                        target: job.target.clone(),
                        key: job.key.clone(),
                    }
                }
                Some(state) => match &outcome {
                    Ok(artifact) => {
                        self.cache.insert(artifact.clone());
                        state.status = Some(CompileStatus::Compiled(job.key.clone()));
                        state.fallback = Some(artifact.clone());
                        state.failed = None;
                        log::info!(
                            "compiled block {block} [{}]: {} bytes",
                            job.target,
                            artifact.bytecode.len()
                        );
                        CompileEvent::Compiled {
                            block,
                            target: job.target.clone(),
                            key: job.key.clone(),
                        }
                    }
                    Err(err) => {
                        let diagnostics = match err.root() {
                            Error::CompileFailure(d) => d.clone(),
                            other => Arc::new(CompileDiagnostics::infrastructure(
                                block,
                                job.target.clone(),
                                other.to_string(),
                            )),
                        };
                        state.status = Some(CompileStatus::Failed(diagnostics.clone()));
                        state.failed = rejected.then(|| (job.key.clone(), diagnostics.clone()));
                        if state.fallback.is_some() {
                            log::warn!("block {block} [{}] failed, keeping last good artifact: {diagnostics}", job.target);
                        } else {
                            log::warn!("block {block} [{}] failed, no fallback: {diagnostics}", job.target);
                        }
                        CompileEvent::Failed {
                            block,
                            target: job.target.clone(),
                            diagnostics,
                        }
                    }
                },
            }
        };

        self.in_flight.lock().remove(&job.key);
        job.promise.fulfil(outcome);
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
        self.done_one();
    }

    fn done_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// What one job produced.
struct Ran {
    outcome: CompileOutcome,
    /// The backend refused the source itself, so the key fails the same way next time.
    rejected: bool,
}

impl Ran {
    fn infrastructure(job: &Job, message: String) -> Self {
        Self {
            outcome: Err(Error::CompileFailure(Arc::new(CompileDiagnostics::infrastructure(
                job.unit.block_id,
                job.target.clone(),
                message,
            )))),
            rejected: false,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn map_message(code: &GeneratedCode, m: &BackendMessage) -> Diagnostic {
    let (origin, line, message) = match m.file.as_deref() {
        Some(f) if f != code.unit_file && f != code.block_file => {
            (SourceOrigin::Generated, m.line, format!("{f}: {}", m.message))
        }
        file => {
            let (origin, line) = code.map_position(file, m.line);
            (origin, line, m.message.clone())
        }
    };
    Diagnostic {
        origin,
        line,
        column: m.column,
        severity: m.severity,
        message,
    }
}
