// src/permutation.rs
//! Permutation identity and compile results.
//!
//! A permutation is one (feature level, quality level, platform) variant of a block.
//! `PermutationKey` adds the compiler version and the content hash of the generated
//! compile unit, so it names exactly one artifact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::line_map::SourceOrigin;
use crate::source_model::BlockId;

// ---------- Targets ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureLevel {
    #[serde(rename = "es3_1")]
    Es3_1,
    #[serde(rename = "sm5")]
    Sm5,
    #[serde(rename = "sm6")]
    Sm6,
}

impl FeatureLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "es3_1" | "es31" => Some(FeatureLevel::Es3_1),
            "sm5" => Some(FeatureLevel::Sm5),
            "sm6" => Some(FeatureLevel::Sm6),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureLevel::Es3_1 => "ES3_1",
            FeatureLevel::Sm5 => "SM5",
            FeatureLevel::Sm6 => "SM6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
    Epic,
}

impl QualityLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(QualityLevel::Low),
            "medium" => Some(QualityLevel::Medium),
            "high" => Some(QualityLevel::High),
            "epic" => Some(QualityLevel::Epic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityLevel::Low => "Low",
            QualityLevel::Medium => "Medium",
            QualityLevel::High => "High",
            QualityLevel::Epic => "Epic",
        }
    }
}

/// Opaque platform name supplied by the host (`"PlatformA"`, `"PCD3D_SM5"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(pub String);

impl Platform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the material shader generator asks for: a key minus content identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermutationTarget {
    pub feature_level: FeatureLevel,
    pub quality_level: QualityLevel,
    pub platform: Platform,
}

impl PermutationTarget {
    pub fn new(feature_level: FeatureLevel, quality_level: QualityLevel, platform: impl Into<String>) -> Self {
        Self {
            feature_level,
            quality_level,
            platform: Platform::new(platform),
        }
    }
}

impl fmt::Display for PermutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.feature_level.as_str(),
            self.quality_level.as_str(),
            self.platform.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermutationKey {
    pub feature_level: FeatureLevel,
    pub quality_level: QualityLevel,
    pub platform: Platform,
    pub compiler_version: String,
    /// xxh3-64 of the generated compile unit.
    pub content_hash: u64,
}

impl PermutationKey {
    pub fn new(target: &PermutationTarget, compiler_version: impl Into<String>, content_hash: u64) -> Self {
        Self {
            feature_level: target.feature_level,
            quality_level: target.quality_level,
            platform: target.platform.clone(),
            compiler_version: compiler_version.into(),
            content_hash,
        }
    }

    pub fn target(&self) -> PermutationTarget {
        PermutationTarget {
            feature_level: self.feature_level,
            quality_level: self.quality_level,
            platform: self.platform.clone(),
        }
    }
}

impl fmt::Display for PermutationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}#{:016x}",
            self.feature_level.as_str(),
            self.quality_level.as_str(),
            self.platform.as_str(),
            self.compiler_version,
            self.content_hash
        )
    }
}

// ---------- Results ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPermutation {
    pub key: PermutationKey,
    pub block_id: BlockId,
    pub bytecode: Vec<u8>,
    #[serde(default)]
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        })
    }
}

/// Backend message tied to the authored position it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub origin: SourceOrigin,
    /// 1-based; 0 when the backend gave no position.
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.origin, self.line, self.column, self.severity, self.message
        )
    }
}

/// Everything the backend said about a failed compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDiagnostics {
    pub block_id: BlockId,
    pub target: PermutationTarget,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileDiagnostics {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error)
    }

    /// Diagnostics for a failure with no source position (backend gone, crash).
    pub fn infrastructure(block_id: BlockId, target: PermutationTarget, message: impl Into<String>) -> Self {
        Self {
            block_id,
            target,
            diagnostics: vec![Diagnostic {
                origin: SourceOrigin::Generated,
                line: 0,
                column: 0,
                severity: Severity::Error,
                message: message.into(),
            }],
        }
    }
}

impl fmt::Display for CompileDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} [{}]", self.block_id, self.target)?;
        let mut errors = self.errors();
        match errors.next() {
            Some(first) => {
                write!(f, " {first}")?;
                let rest = errors.count();
                if rest > 0 {
                    write!(f, " (+{rest} more)")?;
                }
                Ok(())
            }
            None => f.write_str(" failed without diagnostics"),
        }
    }
}

/// Per block x target state.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileStatus {
    Uncompiled,
    Compiling,
    Compiled(PermutationKey),
    Failed(std::sync::Arc<CompileDiagnostics>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_target() {
        let target = PermutationTarget::new(FeatureLevel::Sm5, QualityLevel::Low, "PlatformA");
        let key = PermutationKey::new(&target, "dxc-1", 0xabc);
        assert_eq!(key.to_string(), "SM5/Low/PlatformA@dxc-1#0000000000000abc");
        assert_eq!(key.target(), target);
    }

    #[test]
    fn test_diagnostics_display() {
        let target = PermutationTarget::new(FeatureLevel::Sm6, QualityLevel::Epic, "P");
        let diags = CompileDiagnostics {
            block_id: BlockId(2),
            target,
            diagnostics: vec![
                Diagnostic {
                    origin: SourceOrigin::Block(BlockId(2)),
                    line: 3,
                    column: 7,
                    severity: Severity::Error,
                    message: "undeclared identifier 'x'".into(),
                },
                Diagnostic {
                    origin: SourceOrigin::Block(BlockId(2)),
                    line: 4,
                    column: 1,
                    severity: Severity::Error,
                    message: "expected ';'".into(),
                },
            ],
        };
        assert_eq!(
            diags.to_string(),
            "block #2 [SM6/Epic/P] block #2:3:7: error: undeclared identifier 'x' (+1 more)"
        );
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!(FeatureLevel::parse("SM5"), Some(FeatureLevel::Sm5));
        assert_eq!(FeatureLevel::parse("es3_1"), Some(FeatureLevel::Es3_1));
        assert_eq!(QualityLevel::parse("Epic"), Some(QualityLevel::Epic));
        assert_eq!(QualityLevel::parse("ultra"), None);
    }
}
