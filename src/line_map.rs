// src/line_map.rs
//! Maps lines of expanded/generated text back to where they were authored.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snippets::SnippetId;
use crate::source_model::BlockId;

/// Where a line came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Block(BlockId),
    Snippet(SnippetId),
    /// Emitted by the code generator (signature, local re-declarations, markers).
    Generated,
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOrigin::Block(id) => write!(f, "block {id}"),
            SourceOrigin::Snippet(id) => write!(f, "{id}"),
            SourceOrigin::Generated => f.write_str("<generated>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineOrigin {
    pub origin: SourceOrigin,
    /// 1-based line in the origin's own text.
    pub line: u32,
}

/// One entry per line of the mapped text; index 0 is line 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMap {
    lines: Vec<LineOrigin>,
}

impl LineMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, origin: SourceOrigin, line: u32) {
        self.lines.push(LineOrigin { origin, line });
    }

    /// Origin of 1-based `line`, if it is in range.
    pub fn lookup(&self, line: u32) -> Option<&LineOrigin> {
        if line == 0 {
            return None;
        }
        self.lines.get(line as usize - 1)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineOrigin> {
        self.lines.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_one_based() {
        let mut map = LineMap::new();
        map.push(SourceOrigin::Block(BlockId(1)), 1);
        map.push(SourceOrigin::Snippet(SnippetId::new("a.ush")), 3);
        assert!(map.lookup(0).is_none());
        assert_eq!(map.lookup(2).unwrap().line, 3);
        assert!(map.lookup(3).is_none());
    }
}
