// src/backend.rs
//! Host shader compiler backend.
//!
//! - `ShaderCompilerBackend`: the seam the permutation compiler calls through
//! - `DxcBackend`: shells out to a `dxc` executable
//! - `parse_compiler_output`: `file:line:col: severity: message` lines -> `BackendMessage`

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::codegen::GeneratedCode;
use crate::permutation::{FeatureLevel, PermutationTarget, Severity};
use crate::source_model::BlockId;

/// Everything a backend needs to compile one permutation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub block_id: BlockId,
    pub source: String,
    pub file_name: String,
    pub entry_point: String,
    pub profile: String,
    pub defines: Vec<(String, String)>,
    pub target: PermutationTarget,
}

impl BackendRequest {
    pub fn new(code: &GeneratedCode, target: &PermutationTarget) -> Self {
        let mut defines = vec![
            ("FEATURE_LEVEL".to_string(), feature_level_number(target.feature_level).to_string()),
            ("QUALITY_LEVEL".to_string(), (target.quality_level as u32).to_string()),
            (format!("PLATFORM_{}", define_safe(target.platform.as_str())), "1".to_string()),
        ];
        defines.extend(code.intrinsics.defines());
        Self {
            block_id: code.block_id,
            source: code.text.clone(),
            file_name: code.unit_file.clone(),
            entry_point: code.entry_point.clone(),
            profile: profile_for(target.feature_level).to_string(),
            defines,
            target: target.clone(),
        }
    }
}

/// DXIL library profile per feature level. The unit is a plain function with no
/// stage semantics, so it compiles as a library; SM5 and ES3_1 are up-leveled.
pub fn profile_for(level: FeatureLevel) -> &'static str {
    match level {
        FeatureLevel::Es3_1 | FeatureLevel::Sm5 => "lib_6_3",
        FeatureLevel::Sm6 => "lib_6_6",
    }
}

fn feature_level_number(level: FeatureLevel) -> u32 {
    match level {
        FeatureLevel::Es3_1 => 3,
        FeatureLevel::Sm5 => 5,
        FeatureLevel::Sm6 => 6,
    }
}

fn define_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// One message as the backend printed it, position still in backend terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub bytecode: Vec<u8>,
    /// Warnings and notes of a successful compile.
    pub messages: Vec<BackendMessage>,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Backend not reachable or misconfigured. Worth retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The source was rejected.
    #[error("compilation rejected with {} message(s)", .0.len())]
    Rejected(Vec<BackendMessage>),
}

pub trait ShaderCompilerBackend: Send + Sync {
    fn name(&self) -> &str;
    fn compile(&self, request: &BackendRequest) -> std::result::Result<BackendOutput, BackendError>;
}

// ---------- Output parsing ----------

const SEVERITIES: &[(&str, Severity)] = &[
    (": error: ", Severity::Error),
    (": fatal error: ", Severity::Error),
    (": warning: ", Severity::Warning),
    (": note: ", Severity::Note),
];

/// Parse one `file:line:col: severity: message` line. Windows drive letters in
/// the file part are fine since positions are split off from the right.
pub fn parse_compiler_line(line: &str) -> Option<BackendMessage> {
    let (idx, marker, severity) = SEVERITIES
        .iter()
        .filter_map(|(marker, sev)| line.find(marker).map(|i| (i, *marker, *sev)))
        .min_by_key(|(i, _, _)| *i)?;
    let location = &line[..idx];
    let message = line[idx + marker.len()..].trim().to_string();

    let mut parts = location.rsplitn(3, ':');
    let last = parts.next()?;
    let (file, line_no, column) = match (last.trim().parse::<u32>(), parts.next(), parts.next()) {
        (Ok(col), Some(l), Some(file)) => match l.trim().parse::<u32>() {
            Ok(l) => (file.to_string(), l, col),
            Err(_) => (format!("{file}:{l}"), col, 0),
        },
        (Ok(l), Some(file), None) => (file.to_string(), l, 0),
        _ => (location.to_string(), 0, 0),
    };
    let file = file.trim();
    Some(BackendMessage {
        file: (!file.is_empty()).then(|| file.to_string()),
        line: line_no,
        column,
        severity,
        message,
    })
}

pub fn parse_compiler_output(output: &str) -> Vec<BackendMessage> {
    output.lines().filter_map(parse_compiler_line).collect()
}

// ---------- DXC ----------

/// Runs `dxc` on a temp file per request.
pub struct DxcBackend {
    executable: PathBuf,
    work_dir: PathBuf,
    counter: AtomicU64,
}

impl DxcBackend {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let work_dir = std::env::temp_dir().join(format!("hlsl_bridge_{}", std::process::id()));
        Self {
            executable: executable.into(),
            work_dir,
            counter: AtomicU64::new(0),
        }
    }

    fn scratch_dir(&self) -> std::result::Result<PathBuf, BackendError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let dir = self.work_dir.join(n.to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| BackendError::Unavailable(format!("cannot create {}: {e}", dir.display())))?;
        Ok(dir)
    }
}

impl ShaderCompilerBackend for DxcBackend {
    fn name(&self) -> &str {
        "dxc"
    }

    fn compile(&self, request: &BackendRequest) -> std::result::Result<BackendOutput, BackendError> {
        let dir = self.scratch_dir()?;
        let result = self.run(request, &dir);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            log::warn!("failed to clean {}: {e}", dir.display());
        }
        result
    }
}

impl DxcBackend {
    fn run(&self, request: &BackendRequest, dir: &Path) -> std::result::Result<BackendOutput, BackendError> {
        let source_path = dir.join(&request.file_name);
        let object_path = dir.join("out.bin");
        std::fs::write(&source_path, &request.source)
            .map_err(|e| BackendError::Unavailable(format!("cannot write {}: {e}", source_path.display())))?;

        let mut cmd = Command::new(&self.executable);
        cmd.args(dxc_args(request, &source_path, &object_path));

        log::debug!("dxc: {:?}", cmd);
        let output = cmd.output().map_err(|e| {
            BackendError::Unavailable(format!("failed to run {}: {e}", self.executable.display()))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut messages = parse_compiler_output(&stderr);
        let source_name = source_path.to_string_lossy().to_string();
        for m in &mut messages {
            if m.file.as_deref() == Some(source_name.as_str()) {
                m.file = Some(request.file_name.clone());
            }
        }

        if output.status.success() {
            return std::fs::read(&object_path)
                .map(|bytecode| BackendOutput { bytecode, messages })
                .map_err(|e| BackendError::Unavailable(format!("dxc produced no object: {e}")));
        }
        if !messages.iter().any(|m| m.severity == Severity::Error) {
            messages.push(BackendMessage {
                file: None,
                line: 0,
                column: 0,
                severity: Severity::Error,
                message: format!("dxc exited with {}: {}", output.status, stderr.trim()),
            });
        }
        Err(BackendError::Rejected(messages))
    }
}

/// Command line for one request. Library profiles take no entry point; the
/// custom-expression function is exported instead.
pub fn dxc_args(request: &BackendRequest, source_path: &Path, object_path: &Path) -> Vec<OsString> {
    let mut args = vec![OsString::from("-T"), OsString::from(&request.profile)];
    if request.profile.starts_with("lib_") {
        args.push("-default-linkage".into());
        args.push("external".into());
    } else {
        args.push("-E".into());
        args.push(OsString::from(&request.entry_point));
    }
    args.push("-Fo".into());
    args.push(object_path.as_os_str().to_os_string());
    for (name, value) in &request.defines {
        args.push("-D".into());
        args.push(format!("{name}={value}").into());
    }
    args.push(source_path.as_os_str().to_os_string());
    args
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend shared by compiler and session tests.

    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use xxhash_rust::xxh3::xxh3_64;

    use super::*;

    /// Rejects units containing `#error`, reports the line it is on.
    /// Fails with `Unavailable` for the first `unavailable_for` calls.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub calls: AtomicUsize,
        pub unavailable_for: AtomicU32,
        pub delay: Duration,
    }

    impl ScriptedBackend {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ShaderCompilerBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn compile(&self, request: &BackendRequest) -> std::result::Result<BackendOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let remaining = self.unavailable_for.load(Ordering::SeqCst);
            if remaining > 0 {
                self.unavailable_for.store(remaining - 1, Ordering::SeqCst);
                return Err(BackendError::Unavailable("scripted outage".into()));
            }
            if let Some(idx) = request.source.lines().position(|l| l.contains("#error")) {
                return Err(BackendError::Rejected(vec![BackendMessage {
                    file: Some(request.file_name.clone()),
                    line: idx as u32 + 1,
                    column: 1,
                    severity: Severity::Error,
                    message: "#error directive".into(),
                }]));
            }
            let mut bytecode = b"DXBC".to_vec();
            bytecode.extend_from_slice(&xxh3_64(request.source.as_bytes()).to_le_bytes());
            Ok(BackendOutput {
                bytecode,
                messages: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::QualityLevel;

    #[test]
    fn test_parse_compiler_line() {
        let m = parse_compiler_line("CustomExpression1.usf:12:5: error: use of undeclared identifier 'x'").unwrap();
        assert_eq!(m.file.as_deref(), Some("CustomExpression1.usf"));
        assert_eq!((m.line, m.column), (12, 5));
        assert_eq!(m.severity, Severity::Error);
        assert_eq!(m.message, "use of undeclared identifier 'x'");

        let w = parse_compiler_line("C:\\tmp\\unit.usf:3:1: warning: implicit truncation").unwrap();
        assert_eq!(w.file.as_deref(), Some("C:\\tmp\\unit.usf"));
        assert_eq!(w.line, 3);
        assert_eq!(w.severity, Severity::Warning);

        assert!(parse_compiler_line("compilation succeeded").is_none());
    }

    #[test]
    fn test_parse_output_keeps_order() {
        let out = "a.usf:1:1: error: first\n    x = 1;\n    ^\na.usf:2:3: note: second\n";
        let msgs = parse_compiler_output(out);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].severity, Severity::Note);
    }

    #[test]
    fn test_profiles() {
        assert_eq!(profile_for(FeatureLevel::Es3_1), "lib_6_3");
        assert_eq!(profile_for(FeatureLevel::Sm5), "lib_6_3");
        assert_eq!(profile_for(FeatureLevel::Sm6), "lib_6_6");
        assert_eq!(define_safe("Platform-A"), "PLATFORM_A");
    }

    fn request_for(level: FeatureLevel) -> BackendRequest {
        let target = PermutationTarget::new(level, QualityLevel::High, "Platform-A");
        BackendRequest {
            block_id: BlockId(3),
            source: "float3 CustomExpression3(float3 INTERNAL_IN_N) { return INTERNAL_IN_N; }".into(),
            file_name: "CustomExpression3.usf".into(),
            entry_point: "CustomExpression3".into(),
            profile: profile_for(level).into(),
            defines: vec![("QUALITY_LEVEL".into(), "2".into())],
            target,
        }
    }

    #[test]
    fn test_dxc_args_per_feature_level() {
        let src = Path::new("/tmp/w/CustomExpression3.usf");
        let obj = Path::new("/tmp/w/out.bin");
        for (level, profile) in [
            (FeatureLevel::Es3_1, "lib_6_3"),
            (FeatureLevel::Sm5, "lib_6_3"),
            (FeatureLevel::Sm6, "lib_6_6"),
        ] {
            let args = dxc_args(&request_for(level), src, obj);
            let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
            assert_eq!(
                args,
                [
                    "-T",
                    profile,
                    "-default-linkage",
                    "external",
                    "-Fo",
                    "/tmp/w/out.bin",
                    "-D",
                    "QUALITY_LEVEL=2",
                    "/tmp/w/CustomExpression3.usf",
                ],
                "{level:?}"
            );
            assert!(!args.iter().any(|a| a == "-E"));
        }
    }

    #[test]
    fn test_stage_profile_passes_entry_point() {
        let mut request = request_for(FeatureLevel::Sm6);
        request.profile = "ps_6_0".into();
        let args = dxc_args(&request, Path::new("u.usf"), Path::new("o.bin"));
        assert_eq!(args[..4], ["-T", "ps_6_0", "-E", "CustomExpression3"].map(OsString::from));
    }

    #[test]
    fn test_missing_executable_is_unavailable() {
        let backend = DxcBackend::new("/definitely/not/a/dxc");
        let request = BackendRequest {
            block_id: BlockId(1),
            source: "float4 f() { return 0; }".into(),
            file_name: "unit.usf".into(),
            entry_point: "f".into(),
            profile: "lib_6_6".into(),
            defines: vec![],
            target: PermutationTarget::new(FeatureLevel::Sm6, QualityLevel::Low, "P"),
        };
        assert!(matches!(backend.compile(&request), Err(BackendError::Unavailable(_))));
    }
}
