// src/binding.rs
//! Runtime binding: material-instance values + compiled artifact -> bound material.
//!
//! Never compiles and never aborts. A value whose type disagrees with the declared
//! parameter is reported as `TypeMismatch` and the slot falls back to its default
//! (or zero). A missing artifact falls back to the last good one, or to neutral.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::BindingConfig;
use crate::error::Error;
use crate::meta_tags::range_of;
use crate::parameters::ParameterBinding;
use crate::permutation::{CompiledPermutation, PermutationTarget};
use crate::source_model::{BlockId, ShaderType};

// ---------- Values ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub u64);

/// A value supplied by a material instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    Scalar(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Texture2D(TextureHandle),
    TextureCube(TextureHandle),
    Sampler(SamplerHandle),
}

impl ParameterValue {
    pub fn shader_type(&self) -> ShaderType {
        match self {
            ParameterValue::Scalar(_) => ShaderType::Float,
            ParameterValue::Vec2(_) => ShaderType::Float2,
            ParameterValue::Vec3(_) => ShaderType::Float3,
            ParameterValue::Vec4(_) => ShaderType::Float4,
            ParameterValue::Texture2D(_) => ShaderType::Texture2D,
            ParameterValue::TextureCube(_) => ShaderType::TextureCube,
            ParameterValue::Sampler(_) => ShaderType::Sampler,
        }
    }

    fn components(&self) -> Option<[f32; 4]> {
        match *self {
            ParameterValue::Scalar(x) => Some([x, 0.0, 0.0, 0.0]),
            ParameterValue::Vec2(v) => Some([v.x, v.y, 0.0, 0.0]),
            ParameterValue::Vec3(v) => Some([v.x, v.y, v.z, 0.0]),
            ParameterValue::Vec4(v) => Some(v.to_array()),
            _ => None,
        }
    }
}

/// Parameter values of one material instance, by name.
#[derive(Debug, Clone, Default)]
pub struct MaterialInstance {
    values: HashMap<String, ParameterValue>,
}

impl MaterialInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParameterValue) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn clear(&mut self, name: &str) {
        self.values.remove(name);
    }
}

// ---------- Artifacts ----------

#[derive(Debug, Clone)]
pub enum ArtifactLookup {
    /// Compiled from the current content.
    Current(Arc<CompiledPermutation>),
    /// Last known good artifact; current content failed or is still compiling.
    Fallback(Arc<CompiledPermutation>),
    Missing,
}

/// Where runtime binding gets bytecode from: the compiler in editor builds, a
/// cooked library otherwise.
pub trait ArtifactSource {
    fn lookup(&self, block: BlockId, target: &PermutationTarget) -> ArtifactLookup;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Current,
    Fallback,
    /// No bytecode; the host substitutes its neutral expression.
    Neutral,
}

// ---------- Constant buffer layout ----------

/// One 16-byte constant register.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Register {
    pub xyzw: [f32; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbufferEntry {
    pub name: String,
    pub slot_index: u32,
    /// Byte offset.
    pub offset: u32,
    pub components: u32,
}

/// HLSL constant packing: 4-byte components, no value straddles a 16-byte register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CbufferLayout {
    pub entries: Vec<CbufferEntry>,
    /// Size in bytes, multiple of 16.
    pub size: u32,
}

impl CbufferLayout {
    pub fn from_bindings(bindings: &[ParameterBinding]) -> Self {
        let mut entries = Vec::new();
        let mut cursor = 0u32;
        for binding in bindings.iter().filter(|b| b.is_bindable()) {
            let Some(components) = binding.ty.components() else {
                continue;
            };
            let bytes = components * 4;
            if cursor % 16 + bytes > 16 {
                cursor = cursor.next_multiple_of(16);
            }
            entries.push(CbufferEntry {
                name: binding.name.clone(),
                slot_index: binding.slot_index,
                offset: cursor,
                components,
            });
            cursor += bytes;
        }
        Self {
            entries,
            size: cursor.next_multiple_of(16),
        }
    }

    fn entry_for_slot(&self, slot: u32) -> Option<&CbufferEntry> {
        self.entries.iter().find(|e| e.slot_index == slot)
    }
}

fn table_hash(bindings: &[ParameterBinding]) -> u64 {
    let mut desc = String::new();
    for b in bindings.iter().filter(|b| b.is_bindable()) {
        desc.push_str(&format!("{}:{}:{};", b.slot_index, b.ty, b.name));
    }
    xxh3_64(desc.as_bytes())
}

// ---------- Bound material ----------

#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Constant([f32; 4]),
    Texture {
        register: u32,
        sampler_register: u32,
        handle: Option<TextureHandle>,
    },
    Sampler {
        register: u32,
        handle: Option<SamplerHandle>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundSlot {
    pub name: String,
    pub slot_index: u32,
    pub value: SlotValue,
}

#[derive(Debug, Clone)]
pub struct BoundMaterial {
    pub artifact: Option<Arc<CompiledPermutation>>,
    pub artifact_state: ArtifactState,
    pub slots: Vec<BoundSlot>,
    pub layout: Arc<CbufferLayout>,
    pub constants: Vec<Register>,
    /// Type mismatches found while binding. Affected slots hold their default.
    pub errors: Vec<Error>,
}

impl BoundMaterial {
    pub fn slot(&self, name: &str) -> Option<&BoundSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn bytecode(&self) -> Option<&[u8]> {
        self.artifact.as_deref().map(|a| a.bytecode.as_slice())
    }

    pub fn constant_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.constants)
    }
}

// ---------- Binder ----------

pub struct RuntimeBinder {
    config: BindingConfig,
    layouts: Mutex<LruCache<u64, Arc<CbufferLayout>>>,
    layout_builds: AtomicUsize,
}

impl RuntimeBinder {
    pub fn new(config: BindingConfig) -> Self {
        let capacity = NonZeroUsize::new(config.layout_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            layouts: Mutex::new(LruCache::new(capacity)),
            layout_builds: AtomicUsize::new(0),
        }
    }

    /// Layouts computed so far (cache misses).
    pub fn layout_builds(&self) -> usize {
        self.layout_builds.load(Ordering::Relaxed)
    }

    fn layout_for(&self, bindings: &[ParameterBinding]) -> Arc<CbufferLayout> {
        let hash = table_hash(bindings);
        let mut layouts = self.layouts.lock();
        if let Some(layout) = layouts.get(&hash) {
            return layout.clone();
        }
        self.layout_builds.fetch_add(1, Ordering::Relaxed);
        let layout = Arc::new(CbufferLayout::from_bindings(bindings));
        layouts.put(hash, layout.clone());
        layout
    }

    /// Look the artifact up in `source`, then [`RuntimeBinder::bind`].
    pub fn bind_from(
        &self,
        instance: &MaterialInstance,
        source: &dyn ArtifactSource,
        block: BlockId,
        target: &PermutationTarget,
        bindings: &[ParameterBinding],
    ) -> BoundMaterial {
        self.bind(instance, source.lookup(block, target), bindings)
    }

    pub fn bind(
        &self,
        instance: &MaterialInstance,
        artifact: ArtifactLookup,
        bindings: &[ParameterBinding],
    ) -> BoundMaterial {
        let (artifact, artifact_state) = match artifact {
            ArtifactLookup::Current(a) => (Some(a), ArtifactState::Current),
            ArtifactLookup::Fallback(a) => {
                log::warn!("binding block {} with fallback artifact {}", a.block_id, a.key);
                (Some(a), ArtifactState::Fallback)
            }
            ArtifactLookup::Missing => (None, ArtifactState::Neutral),
        };

        let layout = self.layout_for(bindings);
        let mut constants = vec![Register::zeroed(); layout.size as usize / 16];
        let mut slots = Vec::new();
        let mut errors = Vec::new();
        let mut texture_register = 0u32;
        let mut sampler_register = 0u32;

        for binding in bindings.iter().filter(|b| b.is_bindable()) {
            let supplied = instance.get(&binding.name).copied();
            let supplied = match supplied {
                Some(value) if value.shader_type() != binding.ty => {
                    let err = Error::TypeMismatch {
                        name: binding.name.clone(),
                        expected: binding.ty,
                        got: value.shader_type(),
                    };
                    log::warn!("{err}; using default");
                    errors.push(err);
                    None
                }
                other => other,
            };

            let value = match binding.ty {
                ShaderType::Texture2D | ShaderType::TextureCube => {
                    let handle = match supplied {
                        Some(ParameterValue::Texture2D(h)) | Some(ParameterValue::TextureCube(h)) => Some(h),
                        _ => None,
                    };
                    let value = SlotValue::Texture {
                        register: texture_register,
                        sampler_register,
                        handle,
                    };
                    texture_register += 1;
                    sampler_register += 1;
                    value
                }
                ShaderType::Sampler => {
                    let handle = match supplied {
                        Some(ParameterValue::Sampler(h)) => Some(h),
                        _ => None,
                    };
                    let value = SlotValue::Sampler {
                        register: sampler_register,
                        handle,
                    };
                    sampler_register += 1;
                    value
                }
                _ => {
                    let mut v = supplied
                        .and_then(|s| s.components())
                        .or(binding.default_value)
                        .unwrap_or([0.0; 4]);
                    if self.config.clamp_to_range && binding.ty == ShaderType::Float {
                        if let Some((min, max)) = range_of(&binding.meta) {
                            v[0] = v[0].clamp(min, max);
                        }
                    }
                    if let Some(entry) = layout.entry_for_slot(binding.slot_index) {
                        write_constant(&mut constants, entry, &v);
                    }
                    SlotValue::Constant(v)
                }
            };

            slots.push(BoundSlot {
                name: binding.name.clone(),
                slot_index: binding.slot_index,
                value,
            });
        }

        BoundMaterial {
            artifact,
            artifact_state,
            slots,
            layout,
            constants,
            errors,
        }
    }
}

fn write_constant(constants: &mut [Register], entry: &CbufferEntry, value: &[f32; 4]) {
    let floats: &mut [f32] = bytemuck::cast_slice_mut(constants);
    let start = entry.offset as usize / 4;
    let n = entry.components as usize;
    floats[start..start + n].copy_from_slice(&value[..n]);
}
