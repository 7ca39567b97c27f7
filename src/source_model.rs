// src/source_model.rs
//! Authored HLSL blocks and their declared interfaces.
//!
//! - `ShaderSourceBlock`: one custom node (text, inputs, outputs, derived include refs)
//! - `SourceModel`: the set of blocks owned by a material, with atomic updates and
//!   `SourceEvent` notifications
//!
//! Usage:
//!  let mut model = SourceModel::new();
//!  let id = model.add_block("Tint", "return Color * Amount;", inputs, vec![])?;
//!  let rx = model.subscribe();
//!  model.update_source(id, new_text, new_inputs, new_outputs)?; // -> SourceEvent::Dirty(id)

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::interface::OutputSemantic;
use crate::meta_tags::{validate_tags, MetaTag};
use crate::snippets::{parse_include_directives, SnippetId};

// ---------- Identifiers & types ----------

/// Stable block identifier. Never changes across edits or graph reorders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderType {
    Float,
    Float2,
    Float3,
    Float4,
    Texture2D,
    TextureCube,
    Sampler,
}

impl ShaderType {
    /// HLSL spelling used in generated code.
    pub fn hlsl_name(self) -> &'static str {
        match self {
            ShaderType::Float => "float",
            ShaderType::Float2 => "float2",
            ShaderType::Float3 => "float3",
            ShaderType::Float4 => "float4",
            ShaderType::Texture2D => "Texture2D",
            ShaderType::TextureCube => "TextureCube",
            ShaderType::Sampler => "SamplerState",
        }
    }

    /// Accepts HLSL spellings case-insensitively (`float3`, `Texture2D`, `SamplerState`, `sampler`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" | "half" => Some(ShaderType::Float),
            "float2" | "half2" => Some(ShaderType::Float2),
            "float3" | "half3" => Some(ShaderType::Float3),
            "float4" | "half4" => Some(ShaderType::Float4),
            "texture2d" => Some(ShaderType::Texture2D),
            "texturecube" => Some(ShaderType::TextureCube),
            "sampler" | "samplerstate" => Some(ShaderType::Sampler),
            _ => None,
        }
    }

    /// Number of float components; `None` for resources.
    pub fn components(self) -> Option<u32> {
        match self {
            ShaderType::Float => Some(1),
            ShaderType::Float2 => Some(2),
            ShaderType::Float3 => Some(3),
            ShaderType::Float4 => Some(4),
            _ => None,
        }
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        self.components().is_some()
    }

    #[inline]
    pub fn is_texture(self) -> bool {
        matches!(self, ShaderType::Texture2D | ShaderType::TextureCube)
    }

    #[inline]
    pub fn is_resource(self) -> bool {
        !self.is_numeric()
    }
}

impl fmt::Display for ShaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hlsl_name())
    }
}

// ---------- Declarations ----------

/// One declared input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub ty: ShaderType,
    /// Default for scalar/vector inputs. Unused components are zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<[f32; 4]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<MetaTag>,
    /// Material attribute driven by an output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<OutputSemantic>,
}

impl Declaration {
    pub fn new(name: impl Into<String>, ty: ShaderType) -> Self {
        Self {
            name: name.into(),
            ty,
            default_value: None,
            meta: Vec::new(),
            semantic: None,
        }
    }

    pub fn with_default(mut self, value: [f32; 4]) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_meta(mut self, meta: Vec<MetaTag>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_semantic(mut self, semantic: OutputSemantic) -> Self {
        self.semantic = Some(semantic);
        self
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------- Block ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderSourceBlock {
    id: BlockId,
    name: String,
    source_text: String,
    declared_inputs: Vec<Declaration>,
    declared_outputs: Vec<Declaration>,
    #[serde(default = "default_result_type")]
    result_type: ShaderType,
    #[serde(skip)]
    include_refs: BTreeSet<SnippetId>,
    #[serde(skip, default = "initial_version")]
    version: u64,
}

fn default_result_type() -> ShaderType {
    ShaderType::Float4
}

fn initial_version() -> u64 {
    1
}

impl ShaderSourceBlock {
    /// Build an unvalidated block. [`SourceModel`] validates on insertion.
    pub fn new(
        id: BlockId,
        name: impl Into<String>,
        source_text: impl Into<String>,
        declared_inputs: Vec<Declaration>,
        declared_outputs: Vec<Declaration>,
    ) -> Self {
        let mut block = Self {
            id,
            name: name.into(),
            source_text: source_text.into(),
            declared_inputs,
            declared_outputs,
            result_type: ShaderType::Float4,
            include_refs: BTreeSet::new(),
            version: 1,
        };
        block.refresh_include_refs();
        block
    }

    pub fn with_result_type(mut self, ty: ShaderType) -> Self {
        self.result_type = ty;
        self
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn declared_inputs(&self) -> &[Declaration] {
        &self.declared_inputs
    }

    pub fn declared_outputs(&self) -> &[Declaration] {
        &self.declared_outputs
    }

    pub fn result_type(&self) -> ShaderType {
        self.result_type
    }

    pub fn include_refs(&self) -> &BTreeSet<SnippetId> {
        &self.include_refs
    }

    /// Content version, bumped on every successful update.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn refresh_include_refs(&mut self) {
        self.include_refs = parse_include_directives(&self.source_text)
            .into_iter()
            .map(|d| d.target)
            .collect();
    }

    /// Structural validation of the declared interface.
    pub fn validate(&self) -> Result<()> {
        validate_interface(
            self.id,
            &self.declared_inputs,
            &self.declared_outputs,
            self.result_type,
        )
    }
}

fn validate_interface(
    block: BlockId,
    inputs: &[Declaration],
    outputs: &[Declaration],
    result_type: ShaderType,
) -> Result<()> {
    if !result_type.is_numeric() {
        return Err(Error::invalid_interface(
            block,
            format!("result type {result_type} is not a scalar or vector type"),
        ));
    }

    for (kind, decls, earlier) in [("input", inputs, &[][..]), ("output", outputs, inputs)] {
        for (i, decl) in decls.iter().enumerate() {
            if decl.name.is_empty() {
                return Err(Error::invalid_interface(block, format!("{kind} {i} has an empty name")));
            }
            if !is_identifier(&decl.name) {
                return Err(Error::invalid_interface(
                    block,
                    format!("{kind} `{}` is not a valid identifier", decl.name),
                ));
            }
            // HLSL names are case-sensitive, parameter slots are not
            if let Some(other) = earlier
                .iter()
                .chain(&decls[..i])
                .find(|d| d.name.eq_ignore_ascii_case(&decl.name))
            {
                return Err(Error::invalid_interface(
                    block,
                    format!("{kind} `{}` collides with `{}`", decl.name, other.name),
                ));
            }
            if decl.default_value.is_some() && decl.ty.is_resource() {
                return Err(Error::invalid_interface(
                    block,
                    format!("{kind} `{}` of type {} cannot have a default value", decl.name, decl.ty),
                ));
            }
            if let Some(semantic) = decl.semantic {
                if kind == "input" {
                    return Err(Error::invalid_interface(
                        block,
                        format!("input `{}` cannot carry output semantic {semantic:?}", decl.name),
                    ));
                }
                if decl.ty.is_resource() {
                    return Err(Error::invalid_interface(
                        block,
                        format!("output `{}` of type {} cannot drive {semantic:?}", decl.name, decl.ty),
                    ));
                }
            }
            if kind == "output" && decl.ty.is_resource() {
                return Err(Error::invalid_interface(
                    block,
                    format!("output `{}` must be a scalar or vector, got {}", decl.name, decl.ty),
                ));
            }
            validate_tags(&decl.meta, decl.ty).map_err(|reason| {
                Error::invalid_interface(block, format!("{kind} `{}`: {reason}", decl.name))
            })?;
        }
    }
    Ok(())
}

// ---------- Model ----------

/// Notifications for the graph editor and the editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    Added(BlockId),
    Dirty(BlockId),
    Removed(BlockId),
}

#[derive(Serialize, Deserialize)]
struct PersistedModel {
    blocks: Vec<ShaderSourceBlock>,
}

/// All blocks of one material.
#[derive(Default)]
pub struct SourceModel {
    blocks: BTreeMap<BlockId, ShaderSourceBlock>,
    next_id: u64,
    subscribers: Vec<Sender<SourceEvent>>,
}

impl SourceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a block with a fresh id.
    pub fn add_block(
        &mut self,
        name: impl Into<String>,
        source_text: impl Into<String>,
        inputs: Vec<Declaration>,
        outputs: Vec<Declaration>,
    ) -> Result<BlockId> {
        let id = BlockId(self.next_id.max(1));
        let block = ShaderSourceBlock::new(id, name, source_text, inputs, outputs);
        self.insert_block(block)?;
        Ok(id)
    }

    /// Insert a fully built block (loading, result type overrides). Fails if the id is taken.
    pub fn insert_block(&mut self, mut block: ShaderSourceBlock) -> Result<()> {
        if self.blocks.contains_key(&block.id) {
            return Err(Error::invalid_interface(block.id, "block id already in use"));
        }
        block.validate()?;
        block.refresh_include_refs();
        let id = block.id;
        self.next_id = self.next_id.max(id.0 + 1);
        self.blocks.insert(id, block);
        log::debug!("source block {id} added");
        self.emit(SourceEvent::Added(id));
        Ok(())
    }

    /// Replace the block's content. Either fully applied (and `Dirty` emitted) or
    /// rejected with the previous content untouched.
    pub fn update_source(
        &mut self,
        id: BlockId,
        new_text: impl Into<String>,
        new_inputs: Vec<Declaration>,
        new_outputs: Vec<Declaration>,
    ) -> Result<()> {
        let current = self.blocks.get(&id).ok_or(Error::UnknownBlock(id))?;
        validate_interface(id, &new_inputs, &new_outputs, current.result_type)?;

        let block = self.blocks.get_mut(&id).ok_or(Error::UnknownBlock(id))?;
        block.source_text = new_text.into();
        block.declared_inputs = new_inputs;
        block.declared_outputs = new_outputs;
        block.refresh_include_refs();
        block.version += 1;
        log::debug!("source block {id} updated to v{}", block.version);
        self.emit(SourceEvent::Dirty(id));
        Ok(())
    }

    pub fn set_result_type(&mut self, id: BlockId, ty: ShaderType) -> Result<()> {
        let block = self.blocks.get(&id).ok_or(Error::UnknownBlock(id))?;
        validate_interface(id, &block.declared_inputs, &block.declared_outputs, ty)?;
        let block = self.blocks.get_mut(&id).ok_or(Error::UnknownBlock(id))?;
        if block.result_type != ty {
            block.result_type = ty;
            block.version += 1;
            self.emit(SourceEvent::Dirty(id));
        }
        Ok(())
    }

    pub fn remove_block(&mut self, id: BlockId) -> Result<ShaderSourceBlock> {
        let block = self.blocks.remove(&id).ok_or(Error::UnknownBlock(id))?;
        log::debug!("source block {id} removed");
        self.emit(SourceEvent::Removed(id));
        Ok(block)
    }

    pub fn block(&self, id: BlockId) -> Option<&ShaderSourceBlock> {
        self.blocks.get(&id)
    }

    /// Blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &ShaderSourceBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn subscribe(&mut self) -> Receiver<SourceEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: SourceEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    // ---------- Persistence ----------

    pub fn to_json(&self) -> Result<String> {
        let persisted = PersistedModel {
            blocks: self.blocks.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&persisted)?)
    }

    /// Load a block set. Every block is validated; include refs are re-derived.
    pub fn from_json(json: &str) -> Result<Self> {
        let persisted: PersistedModel = serde_json::from_str(json)?;
        let mut model = SourceModel::new();
        for block in persisted.blocks {
            model
                .insert_block(block)
                .map_err(|e| e.context("loading persisted blocks"))?;
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> Vec<Declaration> {
        vec![
            Declaration::new("Color", ShaderType::Float3),
            Declaration::new("Amount", ShaderType::Float).with_default([0.5, 0.0, 0.0, 0.0]),
        ]
    }

    #[test]
    fn test_add_and_update() {
        let mut model = SourceModel::new();
        let id = model.add_block("Tint", "return Color * Amount;", inputs(), vec![]).unwrap();
        let rx = model.subscribe();

        model
            .update_source(id, "#include \"/Project/noise.ush\"\nreturn Color;", inputs(), vec![])
            .unwrap();

        let block = model.block(id).unwrap();
        assert_eq!(block.version(), 2);
        assert!(block.include_refs().contains(&SnippetId::new("/Project/noise.ush")));
        assert_eq!(rx.try_recv().unwrap(), SourceEvent::Dirty(id));
    }

    #[test]
    fn test_rejected_update_keeps_previous_content() {
        let mut model = SourceModel::new();
        let id = model.add_block("Tint", "return Color;", inputs(), vec![]).unwrap();
        let rx = model.subscribe();

        let dup = vec![
            Declaration::new("A", ShaderType::Float),
            Declaration::new("A", ShaderType::Float2),
        ];
        let err = model.update_source(id, "return A;", dup, vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidInterface { .. }));

        let block = model.block(id).unwrap();
        assert_eq!(block.source_text(), "return Color;");
        assert_eq!(block.declared_inputs(), inputs().as_slice());
        assert_eq!(block.version(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_interface_validation() {
        let mut model = SourceModel::new();
        let id = model.add_block("B", "", vec![], vec![]).unwrap();

        let bad_name = vec![Declaration::new("2x", ShaderType::Float)];
        assert!(model.update_source(id, "", bad_name, vec![]).is_err());

        let tex_default = vec![Declaration::new("Tex", ShaderType::Texture2D).with_default([1.0; 4])];
        assert!(model.update_source(id, "", tex_default, vec![]).is_err());

        let bad_output = vec![Declaration::new("Out", ShaderType::Sampler)];
        assert!(model.update_source(id, "", vec![], bad_output).is_err());

        let both = vec![Declaration::new("X", ShaderType::Float)];
        assert!(model.update_source(id, "", both.clone(), both).is_err());
    }

    #[test]
    fn test_duplicate_names_ignore_case() {
        let mut model = SourceModel::new();
        let id = model.add_block("B", "", vec![], vec![]).unwrap();

        let inputs = vec![
            Declaration::new("Albedo", ShaderType::Float3),
            Declaration::new("albedo", ShaderType::Float3),
        ];
        let err = model.update_source(id, "", inputs, vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidInterface { .. }));

        let err = model
            .update_source(
                id,
                "",
                vec![Declaration::new("Mask", ShaderType::Float)],
                vec![Declaration::new("MASK", ShaderType::Float)],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInterface { .. }));
        assert_eq!(model.block(id).unwrap().version(), 1);
    }

    #[test]
    fn test_ids_are_stable_and_unique() {
        let mut model = SourceModel::new();
        let a = model.add_block("A", "", vec![], vec![]).unwrap();
        let b = model.add_block("B", "", vec![], vec![]).unwrap();
        assert_ne!(a, b);
        model.remove_block(a).unwrap();
        let c = model.add_block("C", "", vec![], vec![]).unwrap();
        assert_ne!(c, b);
        assert_ne!(c, a);
        assert!(matches!(model.remove_block(a), Err(Error::UnknownBlock(_))));
    }

    #[test]
    fn test_json_roundtrip_rederives_includes() {
        let mut model = SourceModel::new();
        let id = model
            .add_block("N", "#include \"/Project/a.ush\"\nreturn 1;", inputs(), vec![])
            .unwrap();
        let json = model.to_json().unwrap();

        let loaded = SourceModel::from_json(&json).unwrap();
        let block = loaded.block(id).unwrap();
        assert_eq!(block.name(), "N");
        assert_eq!(block.include_refs().len(), 1);
        assert_eq!(block.result_type(), ShaderType::Float4);
    }

    #[test]
    fn test_shader_type_parse() {
        assert_eq!(ShaderType::parse("Texture2D"), Some(ShaderType::Texture2D));
        assert_eq!(ShaderType::parse("texture2D"), Some(ShaderType::Texture2D));
        assert_eq!(ShaderType::parse("SamplerState"), Some(ShaderType::Sampler));
        assert_eq!(ShaderType::parse("float3"), Some(ShaderType::Float3));
        assert_eq!(ShaderType::parse("int"), None);
    }
}
