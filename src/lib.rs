// src/lib.rs
//! HLSL custom-node material bridge.
//!
//! Lets material authors write raw HLSL inside a node graph and get it compiled,
//! cached and bound like any generated node:
//!
//! - `source_model`, `interface`, `meta_tags`: authored blocks and their declared interface
//! - `parameters`: declared interface -> ordered binding table
//! - `snippets`, `dependency`: shared `#include` snippets, expansion and invalidation
//! - `codegen`, `intrinsics`: the custom-expression function spliced into the material shader
//! - `compiler`, `backend`, `artifact_cache`: permutation compiles off the editing thread
//! - `binding`, `cook`: runtime binding against live or cooked artifacts
//! - `session`, `watcher`: the editor-side wiring
//!
//! The compiler half sits behind the `editor` feature (default on). Runtime-only
//! builds bind against a [`cook::CookedLibrary`].

pub mod binding;
pub mod codegen;
pub mod config;
pub mod cook;
pub mod dependency;
pub mod error;
pub mod interface;
pub mod intrinsics;
pub mod line_map;
pub mod meta_tags;
pub mod parameters;
pub mod permutation;
pub mod snippets;
pub mod source_model;

#[cfg(feature = "editor")]
pub mod artifact_cache;
#[cfg(feature = "editor")]
pub mod backend;
#[cfg(feature = "editor")]
pub mod compiler;
#[cfg(feature = "editor")]
pub mod session;
#[cfg(feature = "editor")]
pub mod watcher;

pub use error::{Error, Result};
