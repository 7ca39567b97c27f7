// src/cook.rs
//! Cooked artifact library: compiled permutations shipped to runtime-only builds.
//!
//! Derived data. Anything in here can be rebuilt by recompiling the blocks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::binding::{ArtifactLookup, ArtifactSource};
use crate::error::{Error, Result};
use crate::permutation::{CompiledPermutation, PermutationTarget};
use crate::source_model::BlockId;

#[derive(Serialize, Deserialize)]
struct PersistedLibrary {
    compiler_version: String,
    artifacts: Vec<CompiledPermutation>,
}

#[derive(Debug, Clone, Default)]
pub struct CookedLibrary {
    compiler_version: String,
    artifacts: BTreeMap<(BlockId, PermutationTarget), Arc<CompiledPermutation>>,
}

impl CookedLibrary {
    pub fn new(compiler_version: impl Into<String>) -> Self {
        Self {
            compiler_version: compiler_version.into(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn compiler_version(&self) -> &str {
        &self.compiler_version
    }

    /// Add an artifact, replacing any previous one for the same block and target.
    /// Artifacts built by another compiler version are refused.
    pub fn insert(&mut self, artifact: Arc<CompiledPermutation>) -> Result<()> {
        if artifact.key.compiler_version != self.compiler_version {
            return Err(Error::format(format_args!(
                "artifact {} built by compiler `{}`, library is `{}`",
                artifact.key, artifact.key.compiler_version, self.compiler_version
            )));
        }
        self.artifacts
            .insert((artifact.block_id, artifact.key.target()), artifact);
        Ok(())
    }

    pub fn get(&self, block: BlockId, target: &PermutationTarget) -> Option<&Arc<CompiledPermutation>> {
        self.artifacts.get(&(block, target.clone()))
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        let mut last = None;
        self.artifacts.keys().filter_map(move |(block, _)| {
            if last == Some(*block) {
                None
            } else {
                last = Some(*block);
                last
            }
        })
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        let persisted = PersistedLibrary {
            compiler_version: self.compiler_version.clone(),
            artifacts: self.artifacts.values().map(|a| (**a).clone()).collect(),
        };
        Ok(serde_json::to_string_pretty(&persisted)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let persisted: PersistedLibrary = serde_json::from_str(json)?;
        let mut library = CookedLibrary::new(persisted.compiler_version);
        for artifact in persisted.artifacts {
            library.insert(Arc::new(artifact))?;
        }
        Ok(library)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|e| Error::from(e).context(format!("writing {}", path.display())))?;
        log::info!("cooked {} artifacts to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
        Self::from_json(&text).map_err(|e| e.context(format!("loading {}", path.display())))
    }
}

impl ArtifactSource for CookedLibrary {
    fn lookup(&self, block: BlockId, target: &PermutationTarget) -> ArtifactLookup {
        match self.get(block, target) {
            Some(artifact) => ArtifactLookup::Current(artifact.clone()),
            None => ArtifactLookup::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::{FeatureLevel, PermutationKey, QualityLevel};

    fn target(platform: &str) -> PermutationTarget {
        PermutationTarget::new(FeatureLevel::Sm5, QualityLevel::Low, platform)
    }

    fn artifact(block: u64, platform: &str, version: &str) -> Arc<CompiledPermutation> {
        Arc::new(CompiledPermutation {
            key: PermutationKey::new(&target(platform), version, block * 100),
            block_id: BlockId(block),
            bytecode: vec![block as u8; 4],
            warnings: vec![],
        })
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut lib = CookedLibrary::new("dxc-1");
        lib.insert(artifact(1, "PlatformA", "dxc-1")).unwrap();
        lib.insert(artifact(1, "PlatformB", "dxc-1")).unwrap();
        lib.insert(artifact(2, "PlatformA", "dxc-1")).unwrap();

        assert_eq!(lib.len(), 3);
        assert_eq!(lib.blocks().collect::<Vec<_>>(), [BlockId(1), BlockId(2)]);
        assert!(matches!(
            lib.lookup(BlockId(2), &target("PlatformA")),
            ArtifactLookup::Current(a) if a.bytecode == vec![2; 4]
        ));
        assert!(matches!(lib.lookup(BlockId(2), &target("PlatformB")), ArtifactLookup::Missing));
    }

    #[test]
    fn test_rejects_other_compiler_version() {
        let mut lib = CookedLibrary::new("dxc-2");
        assert!(lib.insert(artifact(1, "PlatformA", "dxc-1")).is_err());
        assert!(lib.is_empty());
    }

    #[test]
    fn test_save_load() {
        let mut lib = CookedLibrary::new("dxc-1");
        lib.insert(artifact(4, "PlatformA", "dxc-1")).unwrap();

        let path = std::env::temp_dir().join(format!("hlsl_cook_test_{}.json", std::process::id()));
        lib.save(&path).unwrap();
        let loaded = CookedLibrary::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.compiler_version(), "dxc-1");
        assert_eq!(
            loaded.get(BlockId(4), &target("PlatformA")).map(|a| a.bytecode.clone()),
            Some(vec![4; 4])
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = CookedLibrary::load("/nonexistent/cooked.json").unwrap_err();
        assert!(matches!(err.root(), Error::Io(_)));
    }
}
