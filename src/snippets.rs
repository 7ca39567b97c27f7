// src/snippets.rs
//! Reusable HLSL snippets owned by the asset system, plus `#include` directive parsing.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Virtual path of a snippet (`/Project/Noise.ush`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnippetId(String);

impl SnippetId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnippetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnippetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One `#include` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    pub target: SnippetId,
    /// 1-based line in the including text.
    pub line: u32,
}

/// Parse `#include "path"` / `#include <path>` into a directive target.
pub fn parse_include_line(line: &str) -> Option<SnippetId> {
    let rest = line.trim_start().strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("include")?.trim();
    let inner = if let Some(r) = rest.strip_prefix('"') {
        r.split_once('"')?.0
    } else if let Some(r) = rest.strip_prefix('<') {
        r.split_once('>')?.0
    } else {
        return None;
    };
    let inner = inner.trim();
    if inner.is_empty() {
        None
    } else {
        Some(SnippetId::new(inner))
    }
}

/// All include directives of a text, in order.
pub fn parse_include_directives(text: &str) -> Vec<IncludeDirective> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            parse_include_line(line).map(|target| IncludeDirective {
                target,
                line: i as u32 + 1,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnippetAsset {
    pub id: SnippetId,
    pub text: String,
    /// Bumped on every content change.
    pub version: u64,
}

impl SnippetAsset {
    pub fn includes(&self) -> Vec<IncludeDirective> {
        parse_include_directives(&self.text)
    }
}

/// In-memory snippet registry fed by the asset system or by [`SnippetStore::load_dir`].
#[derive(Debug, Default, Clone)]
pub struct SnippetStore {
    snippets: HashMap<SnippetId, SnippetAsset>,
}

/// Extensions picked up when loading snippet directories.
const SNIPPET_EXTENSIONS: &[&str] = &["ush", "usf", "hlsl", "hlsli"];

impl SnippetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the new version (unchanged text keeps the version).
    pub fn upsert(&mut self, id: SnippetId, text: impl Into<String>) -> u64 {
        let text = text.into();
        match self.snippets.get_mut(&id) {
            Some(existing) => {
                if existing.text != text {
                    existing.text = text;
                    existing.version += 1;
                }
                existing.version
            }
            None => {
                self.snippets.insert(
                    id.clone(),
                    SnippetAsset {
                        id,
                        text,
                        version: 1,
                    },
                );
                1
            }
        }
    }

    pub fn remove(&mut self, id: &SnippetId) -> Option<SnippetAsset> {
        self.snippets.remove(id)
    }

    pub fn get(&self, id: &SnippetId) -> Option<&SnippetAsset> {
        self.snippets.get(id)
    }

    pub fn contains(&self, id: &SnippetId) -> bool {
        self.snippets.contains_key(id)
    }

    pub fn version(&self, id: &SnippetId) -> Option<u64> {
        self.snippets.get(id).map(|s| s.version)
    }

    pub fn ids(&self) -> impl Iterator<Item = &SnippetId> {
        self.snippets.keys()
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// Recursively load every snippet file under `root`, mounted at `virtual_prefix`
    /// (`/Project`). Returns the loaded ids.
    pub fn load_dir(&mut self, root: &Path, virtual_prefix: &str) -> Result<Vec<SnippetId>> {
        let mut loaded = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| Error::from(e).context(format!("reading snippet dir {}", dir.display())))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(id) = snippet_id_for(root, virtual_prefix, &path) else {
                    continue;
                };
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| Error::from(e).context(format!("reading snippet {}", path.display())))?;
                self.upsert(id.clone(), text);
                loaded.push(id);
            }
        }
        loaded.sort();
        log::info!("loaded {} snippets from {}", loaded.len(), root.display());
        Ok(loaded)
    }
}

/// Map a file under `root` to its virtual snippet id. `None` for non-snippet files.
pub fn snippet_id_for(root: &Path, virtual_prefix: &str, path: &Path) -> Option<SnippetId> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !SNIPPET_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let prefix = virtual_prefix.trim_end_matches('/');
    Some(SnippetId::new(format!("{prefix}/{rel}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_include_line() {
        assert_eq!(
            parse_include_line("  #include \"/Project/a.ush\" // noise"),
            Some(SnippetId::new("/Project/a.ush"))
        );
        assert_eq!(parse_include_line("# include <Common.ush>"), Some(SnippetId::new("Common.ush")));
        assert_eq!(parse_include_line("#include"), None);
        assert_eq!(parse_include_line("#define X 1"), None);
        assert_eq!(parse_include_line("float x; // #include \"a\""), None);
    }

    #[test]
    fn test_directive_lines() {
        let text = "float a;\n#include \"x.ush\"\n\n#include \"y.ush\"\n";
        let dirs = parse_include_directives(text);
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].line, 2);
        assert_eq!(dirs[1].target, SnippetId::new("y.ush"));
        assert_eq!(dirs[1].line, 4);
    }

    #[test]
    fn test_upsert_versions() {
        let mut store = SnippetStore::new();
        let id = SnippetId::new("a.ush");
        assert_eq!(store.upsert(id.clone(), "float a;"), 1);
        assert_eq!(store.upsert(id.clone(), "float a;"), 1);
        assert_eq!(store.upsert(id.clone(), "float b;"), 2);
        assert!(store.remove(&id).is_some());
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("hlsl_snippets_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("noise")).unwrap();
        std::fs::write(dir.join("noise").join("perlin.ush"), "float perlin(float2 p) { return 0; }").unwrap();
        std::fs::write(dir.join("readme.txt"), "not a snippet").unwrap();

        let mut store = SnippetStore::new();
        let ids = store.load_dir(&dir, "/Project/").unwrap();
        assert_eq!(ids, vec![SnippetId::new("/Project/noise/perlin.ush")]);
        assert!(store.get(&ids[0]).unwrap().text.contains("perlin"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
