// src/codegen.rs
//! Turns a resolved block into the custom-expression function spliced into the
//! generated material shader.
//!
//! Layout:
//!  // START <name>
//!  <snippet code, global scope>
//!  <result> CustomExpression<id>(<type> INTERNAL_IN_<input>, ..., out <type> <output>, ...)
//!  {
//!  <type> <input> = <type>(INTERNAL_IN_<input>);      textures also get <input>Sampler
//!  #line <n> "<block file>"                          accurate errors only
//!  <block code>
//!  }
//!  // END <name>
//!  // HLSL Hash: <hex>

use xxhash_rust::xxh3::xxh3_64;

use crate::dependency::ResolvedSource;
use crate::intrinsics::RequiredIntrinsics;
use crate::line_map::{LineMap, SourceOrigin};
use crate::snippets::parse_include_line;
use crate::source_model::{BlockId, ShaderSourceBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Emit `#line` directives so backend positions refer to authored block lines.
    pub accurate_errors: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self { accurate_errors: true }
    }
}

/// One compile unit.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    pub block_id: BlockId,
    pub entry_point: String,
    pub text: String,
    /// Generated line -> authored origin.
    pub line_map: LineMap,
    /// xxh3-64 of the unit (hash comment excluded). Content half of the permutation key.
    pub content_hash: u64,
    /// File name the unit is compiled under.
    pub unit_file: String,
    /// File name used in `#line` directives for block lines.
    pub block_file: String,
    pub intrinsics: RequiredIntrinsics,
}

impl GeneratedCode {
    /// Map a backend position back to where it was authored. `file` is the name the
    /// backend printed, if any.
    pub fn map_position(&self, file: Option<&str>, line: u32) -> (SourceOrigin, u32) {
        if file == Some(self.block_file.as_str()) {
            return (SourceOrigin::Block(self.block_id), line);
        }
        match self.line_map.lookup(line) {
            Some(entry) => (entry.origin.clone(), entry.line),
            None => (SourceOrigin::Generated, line),
        }
    }
}

struct Writer {
    text: String,
    line_map: LineMap,
}

impl Writer {
    fn line(&mut self, text: &str, origin: SourceOrigin, line: u32) {
        self.text.push_str(text);
        self.text.push('\n');
        self.line_map.push(origin, line);
    }

    fn generated(&mut self, text: &str) {
        let next = self.line_map.len() as u32 + 1;
        self.line(text, SourceOrigin::Generated, next);
    }

    fn next_line(&self) -> u32 {
        self.line_map.len() as u32 + 1
    }
}

pub fn entry_point_name(block: &ShaderSourceBlock) -> String {
    format!("CustomExpression{}", block.id().0)
}

fn parameter_list(block: &ShaderSourceBlock) -> String {
    let mut params = Vec::new();
    for input in block.declared_inputs() {
        params.push(format!("{} INTERNAL_IN_{}", input.ty, input.name));
        if input.ty.is_texture() {
            params.push(format!("SamplerState INTERNAL_IN_{}Sampler", input.name));
        }
    }
    for output in block.declared_outputs() {
        params.push(format!("out {} {}", output.ty, output.name));
    }
    params.join(", ")
}

fn local_declarations(block: &ShaderSourceBlock) -> Vec<String> {
    let mut out = Vec::new();
    for input in block.declared_inputs() {
        if input.ty.is_texture() {
            out.push(format!(
                "SamplerState {0}Sampler = INTERNAL_IN_{0}Sampler;",
                input.name
            ));
        }
        if input.ty.is_numeric() {
            out.push(format!("{0} {1} = {0}(INTERNAL_IN_{1});", input.ty, input.name));
        } else {
            out.push(format!("{} {} = INTERNAL_IN_{};", input.ty, input.name, input.name));
        }
    }
    out
}

/// Build the compile unit for `block` from its resolved text.
pub fn generate(block: &ShaderSourceBlock, resolved: &ResolvedSource, options: CodegenOptions) -> GeneratedCode {
    let id = block.id();
    let entry_point = entry_point_name(block);
    let unit_file = format!("CustomExpression{}.usf", id.0);
    let block_file = format!("HLSLBlock{}", id.0);

    let mut w = Writer {
        text: String::new(),
        line_map: LineMap::new(),
    };

    // partition resolved lines: snippet code and includes go to global scope
    let mut global = Vec::new();
    let mut body = Vec::new();
    for (text, origin) in resolved.text.lines().zip(resolved.line_map.iter()) {
        let to_global = matches!(origin.origin, SourceOrigin::Snippet(_)) || parse_include_line(text).is_some();
        if to_global {
            global.push((text, origin));
        } else {
            body.push((text, origin));
        }
    }

    w.generated(&format!("// START {}", block.name()));
    for (text, origin) in &global {
        w.line(text, origin.origin.clone(), origin.line);
    }
    w.generated(&format!(
        "{} {}({})",
        block.result_type(),
        entry_point,
        parameter_list(block)
    ));
    w.generated("{");
    for decl in local_declarations(block) {
        w.generated(&decl);
    }

    let mut expected: Option<u32> = None;
    for (text, origin) in &body {
        if options.accurate_errors && expected != Some(origin.line) {
            w.generated(&format!("#line {} \"{}\"", origin.line, block_file));
        }
        w.line(text, origin.origin.clone(), origin.line);
        expected = Some(origin.line + 1);
    }
    if options.accurate_errors && !body.is_empty() {
        let next = w.next_line() + 1;
        w.generated(&format!("#line {} \"{}\"", next, unit_file));
    }
    if body.is_empty() {
        w.generated(&format!("return ({})0;", block.result_type()));
    }
    w.generated("}");
    w.generated(&format!("// END {}", block.name()));

    let content_hash = xxh3_64(w.text.as_bytes());
    w.generated(&format!("// HLSL Hash: {content_hash:016x}"));

    let intrinsics = RequiredIntrinsics::scan(&resolved.text);

    GeneratedCode {
        block_id: id,
        entry_point,
        text: w.text,
        line_map: w.line_map,
        content_hash,
        unit_file,
        block_file,
        intrinsics,
    }
}
