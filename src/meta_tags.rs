// src/meta_tags.rs
//! Parameter meta tags: the `[Range(0, 1), Group(Surface)]` prefix on an input declaration.
//!
//! Tags are editor/binding metadata. Only `Range` affects runtime behaviour (values are
//! clamped at bind time); the others travel with the binding for the graph UI.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::source_model::ShaderType;

/// How a texture parameter should be sampled by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Color,
    Grayscale,
    Alpha,
    Normal,
    Masks,
    LinearColor,
    LinearGrayscale,
}

impl SamplerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "color" => Some(Self::Color),
            "grayscale" => Some(Self::Grayscale),
            "alpha" => Some(Self::Alpha),
            "normal" => Some(Self::Normal),
            "masks" => Some(Self::Masks),
            "linear_color" => Some(Self::LinearColor),
            "linear_grayscale" => Some(Self::LinearGrayscale),
            _ => None,
        }
    }
}

/// A validated meta tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum MetaTag {
    /// UI group the parameter is listed under.
    Group { name: String },
    /// Display names for the vector channels (up to four).
    Channels { names: Vec<String> },
    /// Parameter is fed from custom primitive data at `index`.
    PrimitiveData { index: u8 },
    /// Slider range; values are clamped to it at bind time.
    Range { min: f32, max: f32 },
    SamplerType { kind: SamplerKind },
}

impl MetaTag {
    pub fn tag_name(&self) -> &'static str {
        match self {
            MetaTag::Group { .. } => "group",
            MetaTag::Channels { .. } => "channels",
            MetaTag::PrimitiveData { .. } => "primitivedata",
            MetaTag::Range { .. } => "range",
            MetaTag::SamplerType { .. } => "samplertype",
        }
    }

    /// Check the tag is allowed on a parameter of type `ty`.
    pub fn validate_for(&self, ty: ShaderType) -> Result<(), String> {
        match self {
            MetaTag::Group { .. } => Ok(()),
            MetaTag::Channels { names } => match ty.components() {
                Some(n) if n >= 2 => {
                    if names.len() as u32 > n {
                        Err(format!("channels: {} names given for a {} parameter", names.len(), ty))
                    } else {
                        Ok(())
                    }
                }
                _ => Err("channels: meta tag requires a float2/3/4 parameter".into()),
            },
            MetaTag::PrimitiveData { .. } => {
                if ty.is_numeric() {
                    Ok(())
                } else {
                    Err("primitivedata: meta tag requires a scalar or vector parameter".into())
                }
            }
            MetaTag::Range { min, max } => {
                if ty != ShaderType::Float {
                    Err("range: meta tag expects a scalar parameter".into())
                } else if !(min.is_finite() && max.is_finite() && min <= max) {
                    Err(format!("range: [{min}, {max}] is not a valid range"))
                } else {
                    Ok(())
                }
            }
            MetaTag::SamplerType { .. } => {
                if ty == ShaderType::Texture2D {
                    Ok(())
                } else {
                    Err("samplertype: meta tag is only valid on Texture2D inputs".into())
                }
            }
        }
    }
}

impl fmt::Display for MetaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaTag::Group { name } => write!(f, "Group({name})"),
            MetaTag::Channels { names } => write!(f, "Channels({})", names.join(", ")),
            MetaTag::PrimitiveData { index } => write!(f, "PrimitiveData({index})"),
            MetaTag::Range { min, max } => write!(f, "Range({min}, {max})"),
            MetaTag::SamplerType { kind } => write!(f, "SamplerType({kind:?})"),
        }
    }
}

/// Raw tag as written: name plus comma-separated parameters (nested parentheses kept).
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawTag {
    name: String,
    parameters: Vec<String>,
}

/// Split a meta string (`Range(0, 1), Group(Surface)`) into raw tags.
fn split_raw_tags(meta: &str) -> Result<Vec<RawTag>, String> {
    let mut tags = Vec::new();
    let mut chars = meta.chars().filter(|c| *c != '\r' && *c != '\n').peekable();

    loop {
        // tag name
        let mut name = String::new();
        let mut opened = false;
        while let Some(c) = chars.next() {
            if c == '(' {
                opened = true;
                break;
            }
            if c == ',' {
                if name.is_empty() {
                    continue;
                }
                break;
            }
            if !c.is_whitespace() {
                name.push(c);
            }
        }

        if name.is_empty() && !opened {
            break;
        }
        if name.is_empty() {
            return Err(format!("failed to parse meta tag [{meta}]: missing tag name"));
        }

        let mut parameters = Vec::new();
        if opened {
            let mut depth = 1;
            let mut current = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                match c {
                    '(' => {
                        depth += 1;
                        current.push(c);
                    }
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            closed = true;
                            break;
                        }
                        current.push(c);
                    }
                    ',' if depth == 1 => {
                        parameters.push(current.trim().to_string());
                        current.clear();
                    }
                    _ => current.push(c),
                }
            }
            if !closed {
                return Err(format!("failed to parse meta tag [{meta}]"));
            }
            if !current.trim().is_empty() || !parameters.is_empty() {
                parameters.push(current.trim().to_string());
            }
        }

        tags.push(RawTag { name, parameters });

        if chars.peek().is_none() {
            break;
        }
    }

    Ok(tags)
}

fn expect_arity(raw: &RawTag, allowed: &[usize]) -> Result<(), String> {
    if allowed.contains(&raw.parameters.len()) {
        Ok(())
    } else {
        Err(format!("{}: invalid parameters count", raw.name.to_ascii_lowercase()))
    }
}

fn typed(raw: RawTag) -> Result<MetaTag, String> {
    let lower = raw.name.to_ascii_lowercase();
    match lower.as_str() {
        "group" => {
            expect_arity(&raw, &[1])?;
            Ok(MetaTag::Group {
                name: raw.parameters[0].clone(),
            })
        }
        "channels" => {
            expect_arity(&raw, &[1, 2, 3, 4])?;
            Ok(MetaTag::Channels {
                names: raw.parameters,
            })
        }
        "primitivedata" => {
            expect_arity(&raw, &[1])?;
            let index = raw.parameters[0]
                .parse::<u8>()
                .map_err(|_| format!("primitivedata: `{}` is not a valid index", raw.parameters[0]))?;
            Ok(MetaTag::PrimitiveData { index })
        }
        "range" => {
            expect_arity(&raw, &[2])?;
            let parse = |s: &str| {
                s.trim_end_matches('f')
                    .parse::<f32>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| format!("range: `{s}` is not a number"))
            };
            let min = parse(&raw.parameters[0])?;
            let max = parse(&raw.parameters[1])?;
            if min > max {
                return Err(format!("range: min {min} is greater than max {max}"));
            }
            Ok(MetaTag::Range { min, max })
        }
        "samplertype" => {
            expect_arity(&raw, &[1])?;
            let kind = SamplerKind::parse(&raw.parameters[0])
                .ok_or_else(|| format!("samplertype: unrecognized sampler type [{}]", raw.parameters[0]))?;
            Ok(MetaTag::SamplerType { kind })
        }
        _ => Err(format!("{lower}: given meta tag not supported")),
    }
}

/// Parse and type a meta string. Does not check the parameter type; see [`validate_tags`].
pub fn parse_meta_tags(meta: &str) -> Result<Vec<MetaTag>, String> {
    split_raw_tags(meta)?.into_iter().map(typed).collect()
}

/// Validate a tag list against the parameter type, rejecting repeated tags.
pub fn validate_tags(tags: &[MetaTag], ty: ShaderType) -> Result<(), String> {
    for (i, tag) in tags.iter().enumerate() {
        if tags[..i].iter().any(|t| t.tag_name() == tag.tag_name()) {
            return Err(format!("{}: meta tag given more than once", tag.tag_name()));
        }
        tag.validate_for(ty)?;
    }
    Ok(())
}

/// Clamp range declared by the tags, if any. Ranges that are not finite or
/// have `min > max` are ignored.
pub fn range_of(tags: &[MetaTag]) -> Option<(f32, f32)> {
    tags.iter().find_map(|t| match *t {
        MetaTag::Range { min, max } if min.is_finite() && max.is_finite() && min <= max => Some((min, max)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple_tags() {
        let tags = parse_meta_tags("Range(0, 1.5f), Group(Surface Detail)").unwrap();
        assert_eq!(
            tags,
            vec![
                MetaTag::Range { min: 0.0, max: 1.5 },
                MetaTag::Group {
                    name: "Surface Detail".into()
                },
            ]
        );
        assert!(validate_tags(&tags, ShaderType::Float).is_ok());
        assert_eq!(range_of(&tags), Some((0.0, 1.5)));
    }

    #[test]
    fn test_tag_names_are_case_insensitive() {
        let tags = parse_meta_tags("samplertype(Normal)").unwrap();
        assert_eq!(
            tags,
            vec![MetaTag::SamplerType {
                kind: SamplerKind::Normal
            }]
        );
        assert!(validate_tags(&tags, ShaderType::Texture2D).is_ok());
        assert!(validate_tags(&tags, ShaderType::TextureCube).is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_meta_tags("Range(0, 1").is_err());
        assert!(parse_meta_tags("Range(0)").is_err());
        assert!(parse_meta_tags("Wobble(3)").is_err());
        assert!(parse_meta_tags("Range(2, 1)").is_err());
        assert!(parse_meta_tags("PrimitiveData(300)").is_err());
    }

    #[test]
    fn test_range_must_be_finite() {
        assert!(parse_meta_tags("Range(NaN, 1)").is_err());
        assert!(parse_meta_tags("Range(0, nan)").is_err());
        assert!(parse_meta_tags("Range(inf, inf)").is_err());
        assert!(parse_meta_tags("Range(-inf, 1)").is_err());

        // tags deserialized from a saved material skip the parser
        let loaded = [MetaTag::Range { min: f32::NAN, max: 1.0 }];
        assert!(validate_tags(&loaded, ShaderType::Float).is_err());
    }

    #[test]
    fn test_type_validation() {
        let range = parse_meta_tags("Range(0, 1)").unwrap();
        assert!(validate_tags(&range, ShaderType::Float3).is_err());

        let channels = parse_meta_tags("Channels(R, G, B)").unwrap();
        assert!(validate_tags(&channels, ShaderType::Float3).is_ok());
        assert!(validate_tags(&channels, ShaderType::Float2).is_err());
        assert!(validate_tags(&channels, ShaderType::Float).is_err());

        let twice = parse_meta_tags("Group(A), Group(B)").unwrap();
        assert!(validate_tags(&twice, ShaderType::Float).is_err());
    }

    #[test]
    fn test_empty_meta() {
        assert!(parse_meta_tags("").unwrap().is_empty());
        assert!(parse_meta_tags("   ").unwrap().is_empty());
    }
}
