// src/intrinsics.rs
//! Host intrinsics a block body relies on. Each one needs the material shader to
//! provide some interpolator or pass, which the backend learns through defines.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequiredIntrinsics {
    /// Highest `Parameters.TexCoords[N]` index used, plus one.
    pub tex_coords: u32,
    pub vertex_color: bool,
    pub scene_textures: bool,
    pub world_position_excluding_offsets: bool,
    pub sky_atmosphere: bool,
}

const TEX_COORDS: &str = "Parameters.TexCoords[";

impl RequiredIntrinsics {
    /// Scan (already expanded) code for intrinsic usage. Matching is case-sensitive.
    pub fn scan(code: &str) -> Self {
        let mut tex_coords = 0;
        for (start, _) in code.match_indices(TEX_COORDS) {
            let rest = &code[start + TEX_COORDS.len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() || !rest[digits.len()..].starts_with(']') {
                continue;
            }
            if let Ok(index) = digits.parse::<u32>() {
                tex_coords = tex_coords.max(index.saturating_add(1));
            }
        }

        Self {
            tex_coords,
            vertex_color: code.contains("Parameters.VertexColor"),
            scene_textures: code.contains("SceneTextureLookup"),
            world_position_excluding_offsets: code.contains("GetWorldPosition_NoMaterialOffsets"),
            sky_atmosphere: code.contains("MaterialExpressionSkyAtmosphere"),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Backend defines, in a fixed order.
    pub fn defines(&self) -> Vec<(String, String)> {
        let mut defines = Vec::new();
        if self.tex_coords > 0 {
            defines.push(("NUM_TEX_COORD_INTERPOLATORS".to_string(), self.tex_coords.to_string()));
        }
        let flags = [
            (self.vertex_color, "INTERPOLATE_VERTEX_COLOR"),
            (self.scene_textures, "NEEDS_SCENE_TEXTURES"),
            (
                self.world_position_excluding_offsets,
                "NEEDS_WORLD_POSITION_EXCLUDING_SHADER_OFFSETS",
            ),
            (self.sky_atmosphere, "MATERIAL_SKY_ATMOSPHERE"),
        ];
        for (enabled, name) in flags {
            if enabled {
                defines.push((name.to_string(), "1".to_string()));
            }
        }
        defines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_tex_coords() {
        let code = "float2 uv = Parameters.TexCoords[0].xy + Parameters.TexCoords[3].xy;";
        let req = RequiredIntrinsics::scan(code);
        assert_eq!(req.tex_coords, 4);
        assert_eq!(
            req.defines(),
            vec![("NUM_TEX_COORD_INTERPOLATORS".to_string(), "4".to_string())]
        );
    }

    #[test]
    fn test_scan_flags() {
        let code = "float4 c = Parameters.VertexColor; float3 wp = GetWorldPosition_NoMaterialOffsets(Parameters);";
        let req = RequiredIntrinsics::scan(code);
        assert!(req.vertex_color);
        assert!(req.world_position_excluding_offsets);
        assert!(!req.scene_textures);
        assert_eq!(req.defines().len(), 2);
    }

    #[test]
    fn test_plain_code_needs_nothing() {
        let req = RequiredIntrinsics::scan("return Normal * Roughness; // TexCoords[i]");
        assert!(req.is_empty());
        assert!(req.defines().is_empty());
        assert_eq!(RequiredIntrinsics::scan("Parameters.TexCoords[i]").tex_coords, 0);
    }
}
