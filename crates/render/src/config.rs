//! Demo configuration, loadable from JSON.
//!
//! Every field has a default, so an empty object (or no file at all)
//! reproduces the stock demos.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use ssbo_compute::layout::LOCAL_SIZE;
use ssbo_compute::{PointVertex, ShaderLanguage, UniformPolicy};

/// Names of the assets each demo loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetNames {
    pub point_circle: String,
    pub invocation_probe: String,
    pub group_conv: String,
    pub point_vertex: String,
    pub point_fragment: String,
    pub image: String,
}

impl Default for AssetNames {
    fn default() -> Self {
        Self::glsl()
    }
}

impl AssetNames {
    /// GLSL ES sources, as shipped for OpenGL ES devices.
    #[must_use]
    pub fn glsl() -> Self {
        Self {
            point_circle: "computer_shader.vs".into(),
            invocation_probe: "invocation_probe.vs".into(),
            group_conv: "conv1_group.vs".into(),
            point_vertex: "point_vertex.vs".into(),
            point_fragment: "point_fragment.fs".into(),
            image: "img_y.bin".into(),
        }
    }

    /// The WGSL twins of [`AssetNames::glsl`].
    #[must_use]
    pub fn wgsl() -> Self {
        Self {
            point_circle: "computer_shader.wgsl".into(),
            invocation_probe: "invocation_probe.wgsl".into(),
            group_conv: "conv1_group.wgsl".into(),
            point_vertex: "point_vertex.wgsl".into(),
            point_fragment: "point_fragment.wgsl".into(),
            ..Self::glsl()
        }
    }

    #[must_use]
    pub fn for_language(language: ShaderLanguage) -> Self {
        match language {
            ShaderLanguage::GlslEs => Self::glsl(),
            ShaderLanguage::Wgsl => Self::wgsl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircleConfig {
    pub groups: [u32; 3],
    /// Points drawn per frame; all of them when unset.
    pub draw_count: Option<u32>,
}

impl Default for CircleConfig {
    fn default() -> Self {
        Self {
            groups: [2, 2, 1],
            draw_count: None,
        }
    }
}

impl CircleConfig {
    /// One vertex per invocation of the 2D dispatch, or `None` when the
    /// grid holds more than `u32::MAX` invocations.
    #[must_use]
    pub fn vertex_count(&self) -> Option<u32> {
        (LOCAL_SIZE[0] * LOCAL_SIZE[1])
            .checked_mul(self.groups[0])?
            .checked_mul(self.groups[1])
    }

    /// Size of the vertex buffer in bytes.
    #[must_use]
    pub fn byte_len(&self) -> Option<usize> {
        usize::try_from(self.vertex_count()?)
            .ok()?
            .checked_mul(std::mem::size_of::<PointVertex>())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    /// Weight assets, one per layer, applied in order.
    pub layers: Vec<String>,
    pub width: u32,
    pub height: u32,
    /// Compare the final planes with the CPU reference every frame.
    pub verify: bool,
    pub tolerance: f32,
    pub log_width: usize,
    pub log_rows: usize,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            layers: vec![
                "model_param_conv1.bin".into(),
                "model_param_conv3.bin".into(),
            ],
            width: 160,
            height: 240,
            verify: true,
            tolerance: 1e-3,
            log_width: 8,
            log_rows: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub groups: [u32; 3],
    /// Capacity of the record buffer, in records.
    pub records: u32,
    pub log_rows: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            groups: [4, 4, 1],
            records: 256,
            log_rows: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub uniform_policy: UniformPolicy,
    pub viewport: [u32; 2],
    /// Asset names; chosen from the backend's shader language when unset.
    pub assets: Option<AssetNames>,
    pub circle: CircleConfig,
    pub conv: ConvConfig,
    pub probe: ProbeConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            uniform_policy: UniformPolicy::Strict,
            viewport: [640, 480],
            assets: None,
            circle: CircleConfig::default(),
            conv: ConvConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl DemoConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("parsing config {}", path.display()))
    }

    /// The configured asset names, or the defaults for `language`.
    #[must_use]
    pub fn asset_names(&self, language: ShaderLanguage) -> AssetNames {
        self.assets
            .clone()
            .unwrap_or_else(|| AssetNames::for_language(language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_the_stock_demos() {
        let config = DemoConfig::from_json_str("{}").unwrap();
        assert_eq!(config, DemoConfig::default());
        assert_eq!(config.circle.vertex_count(), Some(256));
        assert_eq!(config.circle.byte_len(), Some(256 * 32));
        assert_eq!(config.conv.layers.len(), 2);
        assert_eq!(config.probe.groups, [4, 4, 1]);
    }

    #[test]
    fn partial_sections_keep_their_other_defaults() {
        let config = DemoConfig::from_json_str(
            r#"{
                "uniform_policy": "lenient",
                "circle": { "draw_count": 16 },
                "conv": { "layers": ["model_param.bin"], "verify": false }
            }"#,
        )
        .unwrap();
        assert_eq!(config.uniform_policy, UniformPolicy::Lenient);
        assert_eq!(config.circle.groups, [2, 2, 1]);
        assert_eq!(config.circle.draw_count, Some(16));
        assert_eq!(config.conv.layers, vec!["model_param.bin".to_string()]);
        assert_eq!(config.conv.width, 160);
        assert!(!config.conv.verify);
    }

    #[test]
    fn circle_grid_past_u32_has_no_vertex_count() {
        let config =
            DemoConfig::from_json_str(r#"{ "circle": { "groups": [65535, 65535, 1] } }"#).unwrap();
        assert_eq!(config.circle.vertex_count(), None);
        assert_eq!(config.circle.byte_len(), None);
    }

    #[test]
    fn asset_names_follow_the_backend_language() {
        let config = DemoConfig::default();
        assert_eq!(
            config.asset_names(ShaderLanguage::Wgsl).group_conv,
            "conv1_group.wgsl"
        );
        assert_eq!(
            config.asset_names(ShaderLanguage::GlslEs).point_fragment,
            "point_fragment.fs"
        );
        assert_eq!(AssetNames::wgsl().image, "img_y.bin");

        let pinned = DemoConfig {
            assets: Some(AssetNames::glsl()),
            ..DemoConfig::default()
        };
        assert_eq!(
            pinned.asset_names(ShaderLanguage::Wgsl).point_circle,
            "computer_shader.vs"
        );
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(DemoConfig::from_json_str(r#"{"uniform_policy": "sloppy"}"#).is_err());
    }
}
