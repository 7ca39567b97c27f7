// src/main.rs
//! hlsl-cook: compile every custom-expression block of a manifest for every target
//! and write a cooked artifact library.
//!
//! Usage:
//!  hlsl-cook <manifest.json> <out.json> [--config bridge.json]
//!
//! Manifest:
//!  {
//!    "snippet_roots": [{ "path": "shaders", "prefix": "/Project" }],
//!    "targets": [{ "feature_level": "sm5", "quality_level": "low", "platform": "PlatformA" }],
//!    "blocks": [{ "name": "Shade", "code": "return Normal * Roughness;",
//!                 "inputs": "float3 Normal;\nfloat Roughness;", "result_type": "float3" }]
//!  }

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use serde::Deserialize;

use hlsl_material_bridge::backend::DxcBackend;
use hlsl_material_bridge::config::BridgeConfig;
use hlsl_material_bridge::interface::{parse_inputs, parse_outputs};
use hlsl_material_bridge::permutation::PermutationTarget;
use hlsl_material_bridge::session::EditorSession;
use hlsl_material_bridge::source_model::{BlockId, ShaderSourceBlock, ShaderType};

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    snippet_roots: Vec<SnippetRoot>,
    targets: Vec<PermutationTarget>,
    blocks: Vec<ManifestBlock>,
}

#[derive(Deserialize)]
struct SnippetRoot {
    path: PathBuf,
    prefix: String,
}

#[derive(Deserialize)]
struct ManifestBlock {
    name: String,
    code: String,
    #[serde(default)]
    inputs: String,
    #[serde(default)]
    outputs: String,
    #[serde(default)]
    result_type: Option<ShaderType>,
}

/// Cook every custom-expression block of a manifest into an artifact library.
#[derive(Parser, Debug)]
#[command(name = "hlsl-cook", version)]
struct Args {
    /// Manifest listing snippet roots, targets and blocks.
    manifest: PathBuf,

    /// Where the cooked library is written.
    output: PathBuf,

    /// Bridge configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    init_logging();

    let args = Args::parse();
    let code = match run(&args) {
        Ok(failures) if failures == 0 => 0,
        Ok(failures) => {
            error!("{failures} permutation(s) failed to cook");
            2
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("hlsl-cook: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

/// Returns the number of permutations that could not be cooked.
fn run(args: &Args) -> Result<usize> {
    let config = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };
    let text = std::fs::read_to_string(&args.manifest)
        .with_context(|| format!("reading manifest {}", args.manifest.display()))?;
    let manifest: Manifest =
        serde_json::from_str(&text).with_context(|| format!("parsing manifest {}", args.manifest.display()))?;
    if manifest.targets.is_empty() {
        bail!("manifest lists no targets");
    }
    let base = args.manifest.parent().unwrap_or_else(|| Path::new("."));

    let backend = Arc::new(DxcBackend::new(config.compiler.dxc_path.clone()));
    let mut session = EditorSession::new(backend, config)?;
    session.set_required_targets(manifest.targets);

    for root in &manifest.snippet_roots {
        session.load_snippet_dir(&base.join(&root.path), &root.prefix)?;
    }

    let mut rejected = 0;
    for (i, entry) in manifest.blocks.iter().enumerate() {
        let id = BlockId(i as u64 + 1);
        let inputs = parse_inputs(id, &entry.inputs).with_context(|| format!("inputs of `{}`", entry.name))?;
        let outputs = parse_outputs(id, &entry.outputs).with_context(|| format!("outputs of `{}`", entry.name))?;
        let mut block = ShaderSourceBlock::new(id, &entry.name, &entry.code, inputs, outputs);
        if let Some(ty) = entry.result_type {
            block = block.with_result_type(ty);
        }
        if let Err(e) = session.insert_block(block) {
            if !e.is_authoring() {
                return Err(e).with_context(|| format!("adding block `{}`", entry.name));
            }
            // blocks that made it into the model are reported again by cook()
            if session.model().block(id).is_none() {
                error!("block `{}`: {e}", entry.name);
                rejected += 1;
            }
        }
    }
    info!(
        "compiling {} block(s) x {} target(s)",
        session.model().len(),
        session.required_targets().len()
    );

    let (library, failures) = session.cook();
    for failure in &failures {
        error!("{failure}");
    }
    library.save(&args.output)?;
    info!("wrote {} artifact(s) to {}", library.len(), args.output.display());
    Ok(failures.len() + rejected)
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();
}
