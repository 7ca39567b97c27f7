// src/dependency.rs
//! Dependency resolver: expands `#include` directives of a block against the snippet
//! store, tracks which blocks depend on which snippets, and caches expansions.
//!
//! - Snippet graph kept as an explicit adjacency index (snippet -> direct includes)
//! - Cycles found by DFS with a visiting path before any expansion happens
//! - Include-once: a snippet reached twice (diamond) is expanded at its first occurrence
//! - Reverse index snippet -> dependent blocks (transitive) answers "who is stale?"
//!
//! Usage:
//!  let mut resolver = DependencyResolver::new(ResolverConfig::default());
//!  resolver.update_snippet("/Project/noise.ush".into(), text);
//!  let resolved = resolver.resolve(&block)?;
//!  let stale = resolver.update_snippet("/Project/noise.ush".into(), new_text);

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::line_map::{LineMap, SourceOrigin};
use crate::snippets::{parse_include_directives, parse_include_line, SnippetId, SnippetStore};
use crate::source_model::{BlockId, ShaderSourceBlock};

/// Fully expanded block text.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub block_id: BlockId,
    pub block_version: u64,
    pub text: String,
    /// xxh3-64 of `text`.
    pub content_hash: u64,
    pub line_map: LineMap,
    /// Snippets expanded into `text`.
    pub snippets: BTreeSet<SnippetId>,
}

struct CachedResolve {
    block_version: u64,
    snippet_versions: Vec<(SnippetId, u64)>,
    resolved: Arc<ResolvedSource>,
}

pub struct DependencyResolver {
    config: ResolverConfig,
    store: SnippetStore,
    /// snippet -> snippets it includes directly (passthrough includes excluded)
    adjacency: HashMap<SnippetId, Vec<SnippetId>>,
    /// block -> its own `#include` targets
    block_roots: HashMap<BlockId, Vec<SnippetId>>,
    /// block -> snippets reachable from it, including ones that do not exist yet
    block_deps: HashMap<BlockId, BTreeSet<SnippetId>>,
    /// snippet -> blocks that reach it
    dependents: HashMap<SnippetId, BTreeSet<BlockId>>,
    cache: LruCache<BlockId, CachedResolve>,
}

impl DependencyResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            store: SnippetStore::new(),
            adjacency: HashMap::new(),
            block_roots: HashMap::new(),
            block_deps: HashMap::new(),
            dependents: HashMap::new(),
            cache: LruCache::new(capacity),
        }
    }

    /// Start from an already populated store (e.g. `SnippetStore::load_dir`).
    pub fn with_store(config: ResolverConfig, store: SnippetStore) -> Self {
        let mut resolver = Self::new(config);
        let ids: Vec<SnippetId> = store.ids().cloned().collect();
        resolver.store = store;
        for id in ids {
            resolver.index_snippet(&id);
        }
        resolver
    }

    pub fn snippets(&self) -> &SnippetStore {
        &self.store
    }

    fn is_passthrough(&self, id: &SnippetId) -> bool {
        self.config
            .passthrough_prefixes
            .iter()
            .any(|p| id.as_str().starts_with(p.as_str()))
    }

    fn index_snippet(&mut self, id: &SnippetId) {
        let Some(asset) = self.store.get(id) else {
            self.adjacency.remove(id);
            return;
        };
        let children: Vec<SnippetId> = parse_include_directives(&asset.text)
            .into_iter()
            .map(|d| d.target)
            .filter(|t| !self.is_passthrough(t))
            .collect();
        self.adjacency.insert(id.clone(), children);
    }

    fn direct_includes(&self, block: &ShaderSourceBlock) -> Vec<SnippetId> {
        block
            .include_refs()
            .iter()
            .filter(|id| !self.is_passthrough(id))
            .cloned()
            .collect()
    }

    /// Every snippet reachable from `roots` through the adjacency index.
    fn reachable(&self, roots: &[SnippetId]) -> BTreeSet<SnippetId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<SnippetId> = roots.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(children) = self.adjacency.get(&id) {
                queue.extend(children.iter().filter(|c| !seen.contains(*c)).cloned());
            }
        }
        seen
    }

    fn reindex_block(&mut self, id: BlockId, deps: BTreeSet<SnippetId>) {
        if let Some(old) = self.block_deps.remove(&id) {
            for snippet in old {
                if let Some(set) = self.dependents.get_mut(&snippet) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.dependents.remove(&snippet);
                    }
                }
            }
        }
        for snippet in &deps {
            self.dependents.entry(snippet.clone()).or_default().insert(id);
        }
        self.block_deps.insert(id, deps);
    }

    /// First cycle reachable from `roots`, as a path that starts and ends on the same snippet.
    fn find_cycle(&self, roots: &[SnippetId]) -> Option<Vec<SnippetId>> {
        let mut done = HashSet::new();
        let mut path = Vec::new();
        roots
            .iter()
            .find_map(|root| self.visit_for_cycle(root, &mut path, &mut done))
    }

    fn visit_for_cycle(
        &self,
        node: &SnippetId,
        path: &mut Vec<SnippetId>,
        done: &mut HashSet<SnippetId>,
    ) -> Option<Vec<SnippetId>> {
        if let Some(pos) = path.iter().position(|p| p == node) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(node.clone());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        path.push(node.clone());
        if let Some(children) = self.adjacency.get(node) {
            for child in children {
                if let Some(cycle) = self.visit_for_cycle(child, path, done) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(node.clone());
        None
    }

    // ---------- Resolution ----------

    /// Expand the block's includes. Cached per (block version, snippet versions).
    pub fn resolve(&mut self, block: &ShaderSourceBlock) -> Result<Arc<ResolvedSource>> {
        let id = block.id();
        let roots = self.direct_includes(block);
        let deps = self.reachable(&roots);
        self.reindex_block(id, deps);
        self.block_roots.insert(id, roots.clone());

        if let Some(cached) = self.cache.get(&id) {
            let fresh = cached.block_version == block.version()
                && cached
                    .snippet_versions
                    .iter()
                    .all(|(s, v)| self.store.version(s) == Some(*v));
            if fresh {
                log::debug!("resolver cache hit for block {id}");
                return Ok(cached.resolved.clone());
            }
        }

        if let Some(cycle) = self.find_cycle(&roots) {
            self.cache.pop(&id);
            return Err(Error::CyclicInclude { cycle });
        }

        let mut expansion = Expansion::default();
        let origin = SourceOrigin::Block(id);
        if let Err(e) = self.expand(&origin, block.source_text(), &mut expansion) {
            self.cache.pop(&id);
            return Err(e);
        }
        if !block.source_text().ends_with('\n') {
            expansion.trim_final_newline();
        }

        let resolved = Arc::new(ResolvedSource {
            block_id: id,
            block_version: block.version(),
            content_hash: xxh3_64(expansion.text.as_bytes()),
            text: expansion.text,
            line_map: expansion.line_map,
            snippets: expansion.emitted.iter().cloned().collect(),
        });
        let snippet_versions = expansion
            .emitted
            .into_iter()
            .filter_map(|s| self.store.version(&s).map(|v| (s, v)))
            .collect();
        self.cache.put(
            id,
            CachedResolve {
                block_version: block.version(),
                snippet_versions,
                resolved: resolved.clone(),
            },
        );
        log::debug!(
            "resolved block {id}: {} lines, {} snippets, hash {:016x}",
            resolved.line_map.len(),
            resolved.snippets.len(),
            resolved.content_hash
        );
        Ok(resolved)
    }

    fn expand(&self, origin: &SourceOrigin, text: &str, out: &mut Expansion) -> Result<()> {
        // lines keep their own terminator so CRLF sources expand byte for byte
        for (i, line) in text.split_inclusive('\n').enumerate() {
            let line_no = i as u32 + 1;
            let Some(target) = parse_include_line(line) else {
                out.push(line, origin.clone(), line_no);
                continue;
            };
            if self.is_passthrough(&target) {
                out.push(line, origin.clone(), line_no);
                continue;
            }
            if out.emitted.contains(&target) {
                continue;
            }
            let asset = self.store.get(&target).ok_or_else(|| Error::UnresolvedInclude {
                include: target.clone(),
                from: origin.clone(),
                line: line_no,
            })?;
            out.emitted.push(target.clone());
            self.expand(&SourceOrigin::Snippet(target), &asset.text, out)?;
        }
        Ok(())
    }

    // ---------- Invalidation ----------

    /// Blocks that currently depend (transitively) on `snippet`.
    pub fn dependents_of(&self, snippet: &SnippetId) -> BTreeSet<BlockId> {
        self.dependents.get(snippet).cloned().unwrap_or_default()
    }

    fn invalidate_dependents(&mut self, snippet: &SnippetId) -> BTreeSet<BlockId> {
        let affected = self.dependents_of(snippet);
        for block in &affected {
            self.cache.pop(block);
            let roots = self.block_roots.get(block).cloned().unwrap_or_default();
            let deps = self.reachable(&roots);
            self.reindex_block(*block, deps);
        }
        affected
    }

    /// Insert or replace a snippet. Returns the blocks whose expansion is now stale.
    pub fn update_snippet(&mut self, id: SnippetId, text: impl Into<String>) -> BTreeSet<BlockId> {
        let before = self.store.version(&id);
        let after = self.store.upsert(id.clone(), text);
        self.index_snippet(&id);
        if before == Some(after) {
            return BTreeSet::new();
        }
        let affected = self.invalidate_dependents(&id);
        log::debug!("snippet {id} v{after}: {} dependent block(s)", affected.len());
        affected
    }

    /// Remove a snippet. Dependent blocks now fail with `UnresolvedInclude` until it returns.
    pub fn remove_snippet(&mut self, id: &SnippetId) -> BTreeSet<BlockId> {
        if self.store.remove(id).is_none() {
            return BTreeSet::new();
        }
        self.index_snippet(id);
        let affected = self.invalidate_dependents(id);
        log::debug!("snippet {id} removed: {} dependent block(s)", affected.len());
        affected
    }

    /// Drop everything known about a block.
    pub fn forget_block(&mut self, id: BlockId) {
        self.cache.pop(&id);
        self.reindex_block(id, BTreeSet::new());
        self.block_deps.remove(&id);
        self.block_roots.remove(&id);
        log::debug!("resolver forgot block {id}");
    }
}

#[derive(Default)]
struct Expansion {
    text: String,
    line_map: LineMap,
    emitted: Vec<SnippetId>,
    added_newline: bool,
}

impl Expansion {
    fn push(&mut self, line: &str, origin: SourceOrigin, line_no: u32) {
        self.text.push_str(line);
        self.added_newline = !line.ends_with('\n');
        if self.added_newline {
            self.text.push('\n');
        }
        self.line_map.push(origin, line_no);
    }

    /// Drop the terminator of the last emitted line.
    fn trim_final_newline(&mut self) {
        if self.added_newline {
            self.text.pop();
        } else if let Some(rest) = self.text.strip_suffix('\n') {
            let rest = rest.strip_suffix('\r').unwrap_or(rest);
            self.text.truncate(rest.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_model::Declaration;

    fn block(id: u64, text: &str) -> ShaderSourceBlock {
        ShaderSourceBlock::new(BlockId(id), format!("B{id}"), text, Vec::<Declaration>::new(), vec![])
    }

    fn resolver() -> DependencyResolver {
        DependencyResolver::new(ResolverConfig::default())
    }

    #[test]
    fn test_identity_without_includes() {
        let mut r = resolver();
        let text = "float3 n = normalize(Normal);\nreturn n * Roughness;";
        let resolved = r.resolve(&block(1, text)).unwrap();
        assert_eq!(resolved.text, text);
        assert_eq!(resolved.content_hash, xxh3_64(text.as_bytes()));
        assert_eq!(resolved.line_map.len(), 2);
        assert_eq!(
            resolved.line_map.lookup(2).unwrap().origin,
            SourceOrigin::Block(BlockId(1))
        );
    }

    #[test]
    fn test_crlf_source_is_unchanged() {
        let mut r = resolver();
        for (id, text) in [(1, "float3 n = Normal;\r\nreturn n;"), (3, "float3 n = Normal;\r\nreturn n;\r\n")] {
            let resolved = r.resolve(&block(id, text)).unwrap();
            assert_eq!(resolved.text, text);
            assert_eq!(resolved.content_hash, xxh3_64(text.as_bytes()));
            assert_eq!(resolved.line_map.len(), 2);
        }

        r.update_snippet("a.ush".into(), "float a;\r\nfloat b;\r\n");
        let resolved = r.resolve(&block(2, "#include \"a.ush\"\r\nreturn a;\r\n")).unwrap();
        assert_eq!(resolved.text, "float a;\r\nfloat b;\r\nreturn a;\r\n");
        assert_eq!(resolved.line_map.lookup(3).unwrap().origin, SourceOrigin::Block(BlockId(2)));
    }

    #[test]
    fn test_expansion_and_line_map() {
        let mut r = resolver();
        r.update_snippet("a.ush".into(), "float a() { return 1; }\nfloat a2() { return 2; }");
        let resolved = r
            .resolve(&block(1, "// head\n#include \"a.ush\"\nreturn a();\n"))
            .unwrap();
        assert_eq!(
            resolved.text,
            "// head\nfloat a() { return 1; }\nfloat a2() { return 2; }\nreturn a();\n"
        );
        let third = resolved.line_map.lookup(3).unwrap();
        assert_eq!(third.origin, SourceOrigin::Snippet("a.ush".into()));
        assert_eq!(third.line, 2);
        let fourth = resolved.line_map.lookup(4).unwrap();
        assert_eq!(fourth.origin, SourceOrigin::Block(BlockId(1)));
        assert_eq!(fourth.line, 3);
    }

    #[test]
    fn test_cycle_names_both_snippets() {
        let mut r = resolver();
        r.update_snippet("A.ush".into(), "#include \"B.ush\"\nfloat a;");
        r.update_snippet("B.ush".into(), "#include \"A.ush\"\nfloat b;");
        let err = r.resolve(&block(1, "#include \"A.ush\"")).unwrap_err();
        match err {
            Error::CyclicInclude { cycle } => {
                assert_eq!(cycle, vec![SnippetId::new("A.ush"), SnippetId::new("B.ush"), SnippetId::new("A.ush")]);
            }
            other => panic!("expected CyclicInclude, got {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_include_reports_position() {
        let mut r = resolver();
        r.update_snippet("a.ush".into(), "float a;\n#include \"gone.ush\"");
        let err = r.resolve(&block(4, "#include \"a.ush\"")).unwrap_err();
        match err {
            Error::UnresolvedInclude { include, from, line } => {
                assert_eq!(include, SnippetId::new("gone.ush"));
                assert_eq!(from, SourceOrigin::Snippet("a.ush".into()));
                assert_eq!(line, 2);
            }
            other => panic!("expected UnresolvedInclude, got {other:?}"),
        }
        // the missing snippet showing up makes the block stale
        assert_eq!(r.update_snippet("gone.ush".into(), "float g;"), BTreeSet::from([BlockId(4)]));
        assert!(r.resolve(&block(4, "#include \"a.ush\"")).is_ok());
    }

    #[test]
    fn test_diamond_is_included_once() {
        let mut r = resolver();
        r.update_snippet("common.ush".into(), "float common;");
        r.update_snippet("l.ush".into(), "#include \"common.ush\"\nfloat l;");
        r.update_snippet("r.ush".into(), "#include \"common.ush\"\nfloat r;");
        let resolved = r
            .resolve(&block(1, "#include \"l.ush\"\n#include \"r.ush\"\n"))
            .unwrap();
        assert_eq!(resolved.text.matches("float common;").count(), 1);
        assert_eq!(resolved.snippets.len(), 3);
    }

    #[test]
    fn test_passthrough_left_verbatim() {
        let mut r = resolver();
        let text = "#include \"/Engine/Private/Common.ush\"\nreturn 1;";
        let resolved = r.resolve(&block(1, text)).unwrap();
        assert_eq!(resolved.text, text);
        assert!(resolved.snippets.is_empty());
    }

    #[test]
    fn test_snippet_edit_invalidates_exact_dependents() {
        let mut r = resolver();
        r.update_snippet("S.ush".into(), "float s;");
        r.update_snippet("T.ush".into(), "#include \"S.ush\"\nfloat t;");
        r.update_snippet("U.ush".into(), "float u;");

        let x = block(1, "#include \"S.ush\"\nreturn s;");
        let y = block(2, "#include \"T.ush\"\nreturn t;");
        let z = block(3, "#include \"U.ush\"\nreturn u;");
        for b in [&x, &y, &z] {
            r.resolve(b).unwrap();
        }

        let stale = r.update_snippet("S.ush".into(), "float s = 2;");
        assert_eq!(stale, BTreeSet::from([BlockId(1), BlockId(2)]));

        // unchanged content is not an edit
        assert!(r.update_snippet("S.ush".into(), "float s = 2;").is_empty());

        let removed = r.remove_snippet(&"U.ush".into());
        assert_eq!(removed, BTreeSet::from([BlockId(3)]));
        assert!(matches!(r.resolve(&z), Err(Error::UnresolvedInclude { .. })));
    }

    #[test]
    fn test_cache_hit_and_version_miss() {
        let mut r = resolver();
        r.update_snippet("a.ush".into(), "float a;");
        let b = block(1, "#include \"a.ush\"");
        let first = r.resolve(&b).unwrap();
        let second = r.resolve(&b).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        r.update_snippet("a.ush".into(), "float a = 1;");
        let third = r.resolve(&b).unwrap();
        assert_ne!(first.content_hash, third.content_hash);
    }

    #[test]
    fn test_forget_block() {
        let mut r = resolver();
        r.update_snippet("a.ush".into(), "float a;");
        r.resolve(&block(1, "#include \"a.ush\"")).unwrap();
        r.forget_block(BlockId(1));
        assert!(r.dependents_of(&"a.ush".into()).is_empty());
    }
}
