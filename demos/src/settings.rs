//! Demo settings loaded from TOML.
//!
//! ```toml
//! [context]
//! backend = "dummy"
//! frames_in_flight = 3
//!
//! [scene]
//! frames = 600
//! bindless = true
//! ```

use serde::Deserialize;

use gpuframe_graphics::{ContextConfig, GraphicsError};

/// Scene-level settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SceneSettings {
    /// Frames to render before exiting.
    pub frames: u64,
    /// Start on the bindless path.
    pub bindless: bool,
    /// Switch binding paths every N frames (0 disables switching).
    pub toggle_every: u64,
    /// Edge length of the generated texture.
    pub texture_size: u32,
    /// Camera rotation speed in radians per second.
    pub spin_speed: f32,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            frames: 300,
            bindless: false,
            toggle_every: 0,
            texture_size: 256,
            spin_speed: 0.8,
        }
    }
}

/// Everything a demo run needs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    pub context: ContextConfig,
    pub scene: SceneSettings,
}

impl DemoSettings {
    /// Parse settings from TOML text and validate the context section.
    pub fn from_toml_str(text: &str) -> Result<Self, GraphicsError> {
        let settings: Self = toml::from_str(text)
            .map_err(|e| GraphicsError::InvalidParameter(format!("demo settings: {e}")))?;
        settings.context.validate()?;
        if !settings.scene.texture_size.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "texture_size {} is not a power of two",
                settings.scene.texture_size
            )));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuframe_graphics::BackendKind;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings = DemoSettings::from_toml_str("").unwrap();
        assert_eq!(settings, DemoSettings::default());
    }

    #[test]
    fn test_sections_parse() {
        let settings = DemoSettings::from_toml_str(
            r#"
            [context]
            backend = "dummy"
            frames_in_flight = 3

            [scene]
            frames = 10
            bindless = true
            "#,
        )
        .unwrap();
        assert_eq!(settings.context.backend, BackendKind::Dummy);
        assert_eq!(settings.context.frames_in_flight, 3);
        assert_eq!(settings.scene.frames, 10);
        assert!(settings.scene.bindless);
        assert_eq!(settings.scene.texture_size, 256);
    }

    #[test]
    fn test_invalid_context_rejected() {
        let result = DemoSettings::from_toml_str("[context]\nframes_in_flight = 1\n");
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_texture_size_must_be_power_of_two() {
        assert!(DemoSettings::from_toml_str("[scene]\ntexture_size = 100\n").is_err());
    }
}
