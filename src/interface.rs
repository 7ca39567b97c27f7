// src/interface.rs
//! Text form of a block interface, as typed into the node's input/output panels.
//!
//! Inputs:   `[Range(0, 1), Group(Surface)] float Roughness = 0.5f;`
//! Outputs:  `float3 Color : BaseColor;`

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::meta_tags::parse_meta_tags;
use crate::source_model::{BlockId, Declaration, ShaderType};

/// Material attribute an output drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSemantic {
    BaseColor,
    Metallic,
    Specular,
    Roughness,
    Anisotropy,
    Emissive,
    Opacity,
    OpacityMask,
    Normal,
    Tangent,
    VertexOffset,
    Subsurface,
    Refraction,
    PixelDepthOffset,
}

impl OutputSemantic {
    pub fn parse(s: &str) -> Option<Self> {
        let semantic = match s.trim().to_ascii_lowercase().as_str() {
            "basecolor" => OutputSemantic::BaseColor,
            "metallic" => OutputSemantic::Metallic,
            "specular" => OutputSemantic::Specular,
            "roughness" => OutputSemantic::Roughness,
            "anisotropy" => OutputSemantic::Anisotropy,
            "emissive" => OutputSemantic::Emissive,
            "opacity" => OutputSemantic::Opacity,
            "opacitymask" => OutputSemantic::OpacityMask,
            "normal" => OutputSemantic::Normal,
            "tangent" => OutputSemantic::Tangent,
            "vertexoffset" => OutputSemantic::VertexOffset,
            "subsurface" => OutputSemantic::Subsurface,
            "refraction" => OutputSemantic::Refraction,
            "pixeldepthoffset" => OutputSemantic::PixelDepthOffset,
            _ => return None,
        };
        Some(semantic)
    }
}

/// Drop `//` and `/* */` comments, keeping newlines.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    for n in chars.by_ref() {
                        if n == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for n in chars.by_ref() {
                        if n == '\n' {
                            out.push('\n');
                        }
                        if prev == '*' && n == '/' {
                            break;
                        }
                        prev = n;
                    }
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

/// Split on `;`, ignoring semicolons inside brackets/parentheses.
fn statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    for c in text.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            ';' if depth <= 0 => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Split a leading `[ ... ]` meta block off a statement.
fn split_meta(stmt: &str) -> std::result::Result<(Option<&str>, &str), String> {
    let Some(rest) = stmt.strip_prefix('[') else {
        return Ok((None, stmt));
    };
    let mut depth = 1;
    for (i, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((Some(&rest[..i]), rest[i + 1..].trim()));
                }
            }
            _ => {}
        }
    }
    Err(format!("unterminated meta block in `{stmt}`"))
}

fn parse_number(s: &str) -> Option<f32> {
    let s = s.trim();
    let s = s
        .strip_suffix('f')
        .or_else(|| s.strip_suffix('F'))
        .or_else(|| s.strip_suffix('h'))
        .unwrap_or(s);
    s.parse::<f32>().ok()
}

/// Parse a default value for `ty`: a scalar (splatted) or a `floatN(...)` constructor.
fn parse_default(ty: ShaderType, text: &str) -> std::result::Result<[f32; 4], String> {
    let n = ty
        .components()
        .ok_or_else(|| format!("type {ty} cannot have a default value"))? as usize;
    let text = text.trim();
    let mut value = [0.0f32; 4];

    if let Some(open) = text.find('(') {
        let ctor = text[..open].trim();
        let Some(ctor_ty) = ShaderType::parse(ctor).filter(|t| t.is_numeric()) else {
            return Err(format!("`{ctor}` is not a vector constructor"));
        };
        let inner = text[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| format!("unterminated constructor `{text}`"))?;
        let args = inner
            .split(',')
            .map(|a| parse_number(a).ok_or_else(|| format!("`{}` is not a number", a.trim())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ctor_n = ctor_ty.components().unwrap_or(1) as usize;
        if ctor_n != n {
            return Err(format!("default `{text}` does not match type {ty}"));
        }
        match args.len() {
            1 => value[..n].fill(args[0]),
            len if len == n => value[..n].copy_from_slice(&args),
            len => return Err(format!("{ctor} constructor takes {n} values, got {len}")),
        }
        return Ok(value);
    }

    let scalar = parse_number(text).ok_or_else(|| format!("`{text}` is not a number"))?;
    value[..n].fill(scalar);
    Ok(value)
}

/// `type name` with nothing else.
fn parse_type_and_name(text: &str) -> std::result::Result<(ShaderType, String), String> {
    let mut parts = text.split_whitespace();
    let (Some(ty), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected `<type> <name>`, got `{text}`"));
    };
    let ty = ShaderType::parse(ty).ok_or_else(|| format!("unsupported type `{ty}`"))?;
    Ok((ty, name.to_string()))
}

/// Parse the inputs panel text. Auto-named samplers (`<Texture>Sampler`) are skipped.
pub fn parse_inputs(block: BlockId, text: &str) -> Result<Vec<Declaration>> {
    let fail = |reason: String| Error::invalid_interface(block, reason);
    let mut decls = Vec::new();

    for stmt in statements(&strip_comments(text)) {
        let (meta, rest) = split_meta(&stmt).map_err(fail)?;
        let (decl_part, default) = match rest.split_once('=') {
            Some((d, v)) => (d.trim(), Some(v.trim())),
            None => (rest.trim(), None),
        };
        let (ty, name) = parse_type_and_name(decl_part).map_err(fail)?;
        let mut decl = Declaration::new(name, ty);
        if let Some(meta) = meta {
            decl.meta = parse_meta_tags(meta).map_err(|e| fail(format!("input `{}`: {e}", decl.name)))?;
        }
        if let Some(default) = default {
            decl.default_value =
                Some(parse_default(ty, default).map_err(|e| fail(format!("input `{}`: {e}", decl.name)))?);
        }
        decls.push(decl);
    }

    let textures: Vec<String> = decls
        .iter()
        .filter(|d| d.ty.is_texture())
        .map(|d| format!("{}Sampler", d.name))
        .collect();
    decls.retain(|d| !(d.ty == ShaderType::Sampler && textures.contains(&d.name)));
    Ok(decls)
}

/// Parse the outputs panel text. Semantics are optional.
pub fn parse_outputs(block: BlockId, text: &str) -> Result<Vec<Declaration>> {
    let fail = |reason: String| Error::invalid_interface(block, reason);
    let mut decls = Vec::new();

    for stmt in statements(&strip_comments(text)) {
        let (decl_part, semantic) = match stmt.split_once(':') {
            Some((d, s)) => (d.trim(), Some(s.trim())),
            None => (stmt.trim(), None),
        };
        let (ty, name) = parse_type_and_name(decl_part).map_err(fail)?;
        let mut decl = Declaration::new(name, ty);
        if let Some(semantic) = semantic {
            let parsed = OutputSemantic::parse(semantic)
                .ok_or_else(|| fail(format!("output `{}`: unknown semantic `{semantic}`", decl.name)))?;
            decl.semantic = Some(parsed);
        }
        decls.push(decl);
    }
    Ok(decls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_tags::MetaTag;

    const B: BlockId = BlockId(1);

    #[test]
    fn test_parse_inputs_with_meta_and_defaults() {
        let text = r#"
            [Range(0, 1), Group(Surface)] float Roughness = 0.5f;
            float3 Tint = float3(1, 0.5, 0); // warm
            float4 Splat = 2.;
            Texture2D Mask;
            SamplerState MaskSampler;
            SamplerState Shared;
        "#;
        let inputs = parse_inputs(B, text).unwrap();
        let names: Vec<_> = inputs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Roughness", "Tint", "Splat", "Mask", "Shared"]);

        assert_eq!(inputs[0].default_value, Some([0.5, 0.0, 0.0, 0.0]));
        assert_eq!(inputs[0].meta[0], MetaTag::Range { min: 0.0, max: 1.0 });
        assert_eq!(inputs[1].default_value, Some([1.0, 0.5, 0.0, 0.0]));
        assert_eq!(inputs[2].default_value, Some([2.0; 4]));
        assert_eq!(inputs[3].ty, ShaderType::Texture2D);
        assert_eq!(inputs[4].ty, ShaderType::Sampler);
    }

    #[test]
    fn test_parse_inputs_errors() {
        assert!(parse_inputs(B, "int Count;").is_err());
        assert!(parse_inputs(B, "float3 V = float2(1, 2);").is_err());
        assert!(parse_inputs(B, "float3 V = float3(1, 2);").is_err());
        assert!(parse_inputs(B, "[Range(0, 1) float X;").is_err());
        assert!(parse_inputs(B, "[Wobble] float X;").is_err());
        assert!(parse_inputs(B, "float").is_err());
    }

    #[test]
    fn test_parse_outputs() {
        let outputs = parse_outputs(B, "float3 Color : basecolor;\nfloat Extra;").unwrap();
        assert_eq!(outputs[0].semantic, Some(OutputSemantic::BaseColor));
        assert_eq!(outputs[1].semantic, None);

        let err = parse_outputs(B, "float3 Color : Sparkle;").unwrap_err();
        assert!(matches!(err, Error::InvalidInterface { .. }));
    }
}
