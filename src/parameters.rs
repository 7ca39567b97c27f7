// src/parameters.rs
//! Parameter extraction: declared interface -> ordered binding table.
//!
//! Bindings are derived data. They are regenerated from the block on every
//! declaration change and never persisted on their own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::meta_tags::MetaTag;
use crate::source_model::{BlockId, Declaration, ShaderSourceBlock, ShaderType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Declared on the block.
    Local,
    /// Material-wide parameter referenced by the block's code.
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub name: String,
    pub ty: ShaderType,
    pub slot_index: u32,
    pub source_block_id: BlockId,
    pub direction: Direction,
    pub scope: Scope,
    pub default_value: Option<[f32; 4]>,
    pub meta: Vec<MetaTag>,
}

impl ParameterBinding {
    fn from_declaration(block: BlockId, decl: &Declaration, slot: u32, direction: Direction) -> Self {
        Self {
            name: decl.name.clone(),
            ty: decl.ty,
            slot_index: slot,
            source_block_id: block,
            direction,
            scope: Scope::Local,
            default_value: decl.default_value,
            meta: decl.meta.clone(),
        }
    }

    /// Inputs (local or global) receive values at bind time; outputs do not.
    #[inline]
    pub fn is_bindable(&self) -> bool {
        self.direction == Direction::Input
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameter {
    pub name: String,
    pub ty: ShaderType,
    #[serde(default)]
    pub default_value: Option<[f32; 4]>,
}

/// Material-wide parameters, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameterTable {
    entries: Vec<GlobalParameter>,
}

impl GlobalParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a global. Names are unique case-insensitively; re-registering replaces.
    pub fn register(&mut self, name: impl Into<String>, ty: ShaderType, default_value: Option<[f32; 4]>) {
        let name = name.into();
        let entry = GlobalParameter {
            name,
            ty,
            default_value,
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(&entry.name))
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobalParameter> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Binding table for a block: inputs then outputs, slots in declaration order.
///
/// Pure and deterministic. Two parameters whose names collide ignoring ASCII case
/// (across inputs and outputs) fail with `DuplicateParameterName`.
pub fn extract(block: &ShaderSourceBlock) -> Result<Vec<ParameterBinding>> {
    let id = block.id();
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut out = Vec::with_capacity(block.declared_inputs().len() + block.declared_outputs().len());

    let declared = block
        .declared_inputs()
        .iter()
        .map(|d| (d, Direction::Input))
        .chain(block.declared_outputs().iter().map(|d| (d, Direction::Output)));

    for (slot, (decl, direction)) in declared.enumerate() {
        if let Some(existing) = seen.insert(decl.name.to_ascii_lowercase(), &decl.name) {
            return Err(Error::DuplicateParameterName {
                block: id,
                name: decl.name.clone(),
                existing: existing.to_string(),
            });
        }
        out.push(ParameterBinding::from_declaration(id, decl, slot as u32, direction));
    }
    Ok(out)
}

/// [`extract`], then one `Global` binding per table entry referenced by the block text.
pub fn extract_with_globals(
    block: &ShaderSourceBlock,
    globals: &GlobalParameterTable,
) -> Result<Vec<ParameterBinding>> {
    let mut out = extract(block)?;
    for global in globals.iter() {
        if !references_identifier(block.source_text(), &global.name) {
            continue;
        }
        if let Some(local) = out.iter().find(|b| b.name.eq_ignore_ascii_case(&global.name)) {
            return Err(Error::DuplicateParameterName {
                block: block.id(),
                name: global.name.clone(),
                existing: local.name.clone(),
            });
        }
        out.push(ParameterBinding {
            name: global.name.clone(),
            ty: global.ty,
            slot_index: out.len() as u32,
            source_block_id: block.id(),
            direction: Direction::Input,
            scope: Scope::Global,
            default_value: global.default_value,
            meta: Vec::new(),
        });
    }
    Ok(out)
}

#[inline]
fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whole-identifier occurrence of `name` in `text`.
pub fn references_identifier(text: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    text.match_indices(name).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + name.len()..].chars().next();
        !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(inputs: Vec<Declaration>, outputs: Vec<Declaration>, text: &str) -> ShaderSourceBlock {
        ShaderSourceBlock::new(BlockId(3), "B", text, inputs, outputs)
    }

    #[test]
    fn test_extract_is_idempotent_and_ordered() {
        let b = block(
            vec![
                Declaration::new("Normal", ShaderType::Float3),
                Declaration::new("Roughness", ShaderType::Float),
            ],
            vec![Declaration::new("Mask", ShaderType::Float)],
            "return 0;",
        );
        let first = extract(&b).unwrap();
        let second = extract(&b).unwrap();
        assert_eq!(first, second);

        let slots: Vec<_> = first.iter().map(|p| (p.name.as_str(), p.slot_index, p.direction)).collect();
        assert_eq!(
            slots,
            [
                ("Normal", 0, Direction::Input),
                ("Roughness", 1, Direction::Input),
                ("Mask", 2, Direction::Output),
            ]
        );
        assert!(first.iter().all(|p| p.source_block_id == BlockId(3)));
    }

    #[test]
    fn test_case_insensitive_collision() {
        let b = block(
            vec![Declaration::new("Albedo", ShaderType::Float3)],
            vec![Declaration::new("albedo", ShaderType::Float3)],
            "",
        );
        match extract(&b) {
            Err(Error::DuplicateParameterName { name, existing, .. }) => {
                assert_eq!(name, "albedo");
                assert_eq!(existing, "Albedo");
            }
            other => panic!("expected DuplicateParameterName, got {other:?}"),
        }
    }

    #[test]
    fn test_globals_only_when_referenced() {
        let mut globals = GlobalParameterTable::new();
        globals.register("Time", ShaderType::Float, None);
        globals.register("WindDir", ShaderType::Float2, Some([1.0, 0.0, 0.0, 0.0]));

        let b = block(
            vec![Declaration::new("Speed", ShaderType::Float)],
            vec![],
            "return sin(Time * Speed) + TimeScale;",
        );
        let bindings = extract_with_globals(&b, &globals).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].name, "Time");
        assert_eq!(bindings[1].scope, Scope::Global);
        assert_eq!(bindings[1].slot_index, 1);
    }

    #[test]
    fn test_global_collision() {
        let mut globals = GlobalParameterTable::new();
        globals.register("time", ShaderType::Float, None);
        let b = block(vec![Declaration::new("Time", ShaderType::Float)], vec![], "return time;");
        assert!(matches!(
            extract_with_globals(&b, &globals),
            Err(Error::DuplicateParameterName { .. })
        ));
    }

    #[test]
    fn test_references_identifier() {
        assert!(references_identifier("a = Time;", "Time"));
        assert!(!references_identifier("a = TimeScale;", "Time"));
        assert!(!references_identifier("a = GameTime;", "Time"));
        assert!(references_identifier("Time", "Time"));
    }
}
