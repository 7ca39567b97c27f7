// src/session.rs
//! Editing session: one material's custom-expression blocks, wired end to end.
//!
//! source model -> extractor -> resolver -> codegen -> compiler -> runtime binding
//!
//! Edits run synchronously on the caller's thread up to code generation; compiles
//! are queued on the compiler's worker pool. An authoring error (bad interface,
//! include cycle, missing snippet) stops that block before compilation and leaves
//! its previous bindings and artifacts in place.
//!
//! Usage:
//!  let mut session = EditorSession::new(Arc::new(DxcBackend::new("dxc")), BridgeConfig::default())?;
//!  session.set_required_targets(vec![target]);
//!  let id = session.add_block("Shade", "return Normal * Roughness;", inputs, vec![])?;
//!  session.wait_idle();
//!  let bound = session.bind(id, &instance, &target)?;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::backend::ShaderCompilerBackend;
use crate::binding::{ArtifactLookup, ArtifactSource, BoundMaterial, MaterialInstance, RuntimeBinder};
use crate::codegen::{generate, CodegenOptions, GeneratedCode};
use crate::compiler::{CompileEvent, CompileUnit, PermutationCompiler};
use crate::config::BridgeConfig;
use crate::cook::CookedLibrary;
use crate::dependency::DependencyResolver;
use crate::error::{Error, Result};
use crate::parameters::{extract_with_globals, GlobalParameterTable, ParameterBinding};
use crate::permutation::{CompileStatus, PermutationTarget};
use crate::snippets::{SnippetId, SnippetStore};
use crate::source_model::{BlockId, Declaration, ShaderSourceBlock, ShaderType, SourceModel};
use crate::watcher::SnippetEvent;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Block regenerated and queued for compilation.
    Refreshed(BlockId),
    /// Block stopped at an authoring error; the previous state stays active.
    AuthoringError { block: BlockId, error: Error },
    Removed(BlockId),
}

pub struct EditorSession {
    config: BridgeConfig,
    model: SourceModel,
    resolver: DependencyResolver,
    compiler: PermutationCompiler,
    binder: RuntimeBinder,
    globals: GlobalParameterTable,
    targets: Vec<PermutationTarget>,
    /// Last valid binding table per block.
    bindings: HashMap<BlockId, Arc<Vec<ParameterBinding>>>,
    generated: HashMap<BlockId, Arc<GeneratedCode>>,
    authoring_errors: HashMap<BlockId, Error>,
    subscribers: Vec<Sender<SessionEvent>>,
}

impl EditorSession {
    pub fn new(backend: Arc<dyn ShaderCompilerBackend>, config: BridgeConfig) -> Result<Self> {
        let compiler = PermutationCompiler::new(backend, config.compiler.clone())?;
        Ok(Self {
            resolver: DependencyResolver::new(config.resolver.clone()),
            binder: RuntimeBinder::new(config.binding.clone()),
            compiler,
            model: SourceModel::new(),
            globals: GlobalParameterTable::new(),
            targets: Vec::new(),
            bindings: HashMap::new(),
            generated: HashMap::new(),
            authoring_errors: HashMap::new(),
            subscribers: Vec::new(),
            config,
        })
    }

    pub fn model(&self) -> &SourceModel {
        &self.model
    }

    pub fn compiler(&self) -> &PermutationCompiler {
        &self.compiler
    }

    pub fn snippets(&self) -> &SnippetStore {
        self.resolver.snippets()
    }

    pub fn required_targets(&self) -> &[PermutationTarget] {
        &self.targets
    }

    // ---------- Blocks ----------

    pub fn add_block(
        &mut self,
        name: impl Into<String>,
        source_text: impl Into<String>,
        inputs: Vec<Declaration>,
        outputs: Vec<Declaration>,
    ) -> Result<BlockId> {
        let id = self.model.add_block(name, source_text, inputs, outputs)?;
        self.refresh(id)?;
        Ok(id)
    }

    /// Add a block built elsewhere (loading a saved material, cook manifests).
    /// The block is kept even when it resolves with an authoring error.
    pub fn insert_block(&mut self, block: ShaderSourceBlock) -> Result<BlockId> {
        let id = block.id();
        self.model.insert_block(block)?;
        self.refresh(id)?;
        Ok(id)
    }

    /// Atomic edit of a block's code and interface.
    pub fn update_source(
        &mut self,
        id: BlockId,
        text: impl Into<String>,
        inputs: Vec<Declaration>,
        outputs: Vec<Declaration>,
    ) -> Result<()> {
        if let Err(e) = self.model.update_source(id, text, inputs, outputs) {
            if e.is_authoring() {
                self.record_authoring_error(id, e.clone());
            }
            return Err(e);
        }
        self.refresh(id)
    }

    pub fn set_result_type(&mut self, id: BlockId, ty: ShaderType) -> Result<()> {
        self.model.set_result_type(id, ty)?;
        self.refresh(id)
    }

    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        self.model.remove_block(id)?;
        self.resolver.forget_block(id);
        self.compiler.remove_block(id);
        self.bindings.remove(&id);
        self.generated.remove(&id);
        self.authoring_errors.remove(&id);
        self.emit(SessionEvent::Removed(id));
        Ok(())
    }

    /// Extract, resolve and generate `id`, then queue it for every required target.
    fn refresh(&mut self, id: BlockId) -> Result<()> {
        let block = self.model.block(id).ok_or(Error::UnknownBlock(id))?;
        let prepared = extract_with_globals(block, &self.globals).and_then(|bindings| {
            let resolved = self.resolver.resolve(block)?;
            let options = CodegenOptions {
                accurate_errors: self.config.compiler.accurate_errors,
            };
            Ok((bindings, generate(block, &resolved, options)))
        });

        let (bindings, code) = match prepared {
            Ok(ok) => ok,
            Err(e) => {
                self.record_authoring_error(id, e.clone());
                return Err(e);
            }
        };

        self.authoring_errors.remove(&id);
        self.bindings.insert(id, Arc::new(bindings));
        let code = Arc::new(code);
        self.generated.insert(id, code.clone());
        self.queue_compiles(&code, &self.targets);
        self.emit(SessionEvent::Refreshed(id));
        Ok(())
    }

    fn queue_compiles(&self, code: &Arc<GeneratedCode>, targets: &[PermutationTarget]) {
        for target in targets {
            let unit = CompileUnit {
                block_id: code.block_id,
                code: code.clone(),
            };
            self.compiler.compile(unit, target);
        }
    }

    fn record_authoring_error(&mut self, block: BlockId, error: Error) {
        log::warn!("block {block}: {error}");
        self.authoring_errors.insert(block, error.clone());
        self.emit(SessionEvent::AuthoringError { block, error });
    }

    /// Re-run every block in `blocks`; failures are recorded, not returned.
    fn refresh_all(&mut self, blocks: impl IntoIterator<Item = BlockId>) {
        for id in blocks {
            if self.model.block(id).is_none() {
                continue;
            }
            // recorded by refresh
            let _ = self.refresh(id);
        }
    }

    // ---------- Snippets ----------

    /// Insert or replace a snippet. Returns the blocks that were regenerated.
    pub fn update_snippet(&mut self, id: SnippetId, text: impl Into<String>) -> BTreeSet<BlockId> {
        let affected = self.resolver.update_snippet(id, text);
        self.invalidate_and_refresh(&affected);
        affected
    }

    pub fn remove_snippet(&mut self, id: &SnippetId) -> BTreeSet<BlockId> {
        let affected = self.resolver.remove_snippet(id);
        self.invalidate_and_refresh(&affected);
        affected
    }

    fn invalidate_and_refresh(&mut self, affected: &BTreeSet<BlockId>) {
        for block in affected {
            self.compiler.invalidate_block(*block);
        }
        self.refresh_all(affected.iter().copied());
    }

    /// Load every snippet under `root`, mounted at `virtual_prefix`.
    pub fn load_snippet_dir(&mut self, root: &Path, virtual_prefix: &str) -> Result<BTreeSet<BlockId>> {
        let mut store = SnippetStore::new();
        let ids = store.load_dir(root, virtual_prefix)?;
        let mut affected = BTreeSet::new();
        for id in ids {
            if let Some(asset) = store.get(&id) {
                affected.extend(self.resolver.update_snippet(id.clone(), asset.text.clone()));
            }
        }
        self.invalidate_and_refresh(&affected);
        Ok(affected)
    }

    /// Apply settled file-watcher events.
    pub fn apply_snippet_events(&mut self, events: impl IntoIterator<Item = SnippetEvent>) -> BTreeSet<BlockId> {
        let mut affected = BTreeSet::new();
        for event in events {
            match event {
                SnippetEvent::Changed { id, text } => affected.extend(self.resolver.update_snippet(id, text)),
                SnippetEvent::Removed { id } => affected.extend(self.resolver.remove_snippet(&id)),
            }
        }
        self.invalidate_and_refresh(&affected);
        affected
    }

    // ---------- Material-wide settings ----------

    /// Targets the material shader generator needs. Newly required targets are compiled
    /// for every block with generated code.
    pub fn set_required_targets(&mut self, targets: Vec<PermutationTarget>) {
        let added: Vec<PermutationTarget> = targets
            .iter()
            .filter(|t| !self.targets.contains(t))
            .cloned()
            .collect();
        self.targets = targets;
        if added.is_empty() {
            return;
        }
        for code in self.generated.values() {
            self.queue_compiles(code, &added);
        }
    }

    pub fn set_globals(&mut self, globals: GlobalParameterTable) {
        self.globals = globals;
        let ids: Vec<BlockId> = self.model.blocks().map(|b| b.id()).collect();
        self.refresh_all(ids);
    }

    /// Invalidate every artifact and recompile all blocks under the new version.
    pub fn bump_compiler_version(&mut self, version: impl Into<String>) {
        self.compiler.bump_compiler_version(version);
        for code in self.generated.values() {
            self.queue_compiles(code, &self.targets);
        }
    }

    // ---------- Queries ----------

    /// Last valid binding table. Still present while the block has an authoring error.
    pub fn bindings(&self, id: BlockId) -> Option<&[ParameterBinding]> {
        self.bindings.get(&id).map(|b| b.as_slice())
    }

    pub fn authoring_error(&self, id: BlockId) -> Option<&Error> {
        self.authoring_errors.get(&id)
    }

    pub fn generated_code(&self, id: BlockId) -> Option<&GeneratedCode> {
        self.generated.get(&id).map(|c| c.as_ref())
    }

    pub fn compile_status(&self, id: BlockId, target: &PermutationTarget) -> CompileStatus {
        self.compiler.status(id, target)
    }

    /// Bind instance values for `id`. Never compiles; uses whatever artifact exists.
    pub fn bind(&self, id: BlockId, instance: &MaterialInstance, target: &PermutationTarget) -> Result<BoundMaterial> {
        let bindings = self.bindings.get(&id).ok_or(Error::UnknownBlock(id))?;
        Ok(self.binder.bind_from(instance, &self.compiler, id, target, bindings))
    }

    pub fn wait_idle(&self) {
        self.compiler.wait_idle();
    }

    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        self.compiler.wait_idle_timeout(timeout)
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn compile_events(&self) -> Receiver<CompileEvent> {
        self.compiler.subscribe()
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ---------- Cooking ----------

    /// Wait for outstanding compiles and collect current artifacts for every block and
    /// required target. Blocks without a current artifact are reported, not cooked.
    pub fn cook(&self) -> (CookedLibrary, Vec<Error>) {
        self.wait_idle();
        let mut library = CookedLibrary::new(self.compiler.compiler_version());
        let mut failures = Vec::new();
        for block in self.model.blocks() {
            let id = block.id();
            if let Some(e) = self.authoring_errors.get(&id) {
                failures.push(e.clone().context(format!("block {id} ({})", block.name())));
                continue;
            }
            for target in &self.targets {
                let failure = match (self.compiler.lookup(id, target), self.compiler.status(id, target)) {
                    (ArtifactLookup::Current(artifact), _) => match library.insert(artifact) {
                        Ok(()) => continue,
                        Err(e) => e,
                    },
                    (_, CompileStatus::Failed(diagnostics)) => Error::CompileFailure(diagnostics),
                    (_, status) => Error::format(format_args!("no artifact ({status:?})")),
                };
                failures.push(failure.context(format!("block {id} ({}) [{target}]", block.name())));
            }
        }
        (library, failures)
    }
}
