//! Shader bytecode.
//!
//! Pipelines are built from precompiled SPIR-V. The orchestration layer does
//! not parse shaders; it only checks that a blob plausibly is SPIR-V before
//! handing it to the backend. [`ShaderBytecode::compile_wgsl`] exists for
//! shaders that ship as WGSL source (the mipmap kernel, the demo shaders) and
//! is a thin wrapper around naga.

use std::path::Path;

use crate::error::GraphicsError;

/// SPIR-V magic number (first word of every module).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader.
    Vertex,
    /// Fragment shader.
    Fragment,
    /// Compute shader.
    Compute,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            Self::Vertex => naga::ShaderStage::Vertex,
            Self::Fragment => naga::ShaderStage::Fragment,
            Self::Compute => naga::ShaderStage::Compute,
        }
    }
}

/// Validated SPIR-V for one shader stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBytecode {
    stage: ShaderStage,
    entry_point: String,
    words: Vec<u32>,
}

impl ShaderBytecode {
    /// Wrap a SPIR-V blob.
    ///
    /// Fails with [`GraphicsError::ShaderLoadError`] if the blob is empty, not a
    /// whole number of 32-bit words, or does not start with the SPIR-V magic.
    pub fn from_spirv(
        stage: ShaderStage,
        bytes: &[u8],
        entry_point: impl Into<String>,
    ) -> Result<Self, GraphicsError> {
        if bytes.is_empty() {
            return Err(GraphicsError::ShaderLoadError(
                "shader bytecode is empty".to_string(),
            ));
        }
        if bytes.len() % 4 != 0 {
            return Err(GraphicsError::ShaderLoadError(format!(
                "shader bytecode length {} is not a multiple of 4",
                bytes.len()
            )));
        }

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_words(stage, words, entry_point)
    }

    /// Wrap SPIR-V words.
    pub fn from_words(
        stage: ShaderStage,
        words: Vec<u32>,
        entry_point: impl Into<String>,
    ) -> Result<Self, GraphicsError> {
        match words.first() {
            None => Err(GraphicsError::ShaderLoadError(
                "shader bytecode is empty".to_string(),
            )),
            Some(&magic) if magic != SPIRV_MAGIC => Err(GraphicsError::ShaderLoadError(format!(
                "bad SPIR-V magic {:#010x}",
                magic
            ))),
            Some(_) => Ok(Self {
                stage,
                entry_point: entry_point.into(),
                words,
            }),
        }
    }

    /// Load a SPIR-V file.
    pub fn from_file(
        stage: ShaderStage,
        path: impl AsRef<Path>,
        entry_point: impl Into<String>,
    ) -> Result<Self, GraphicsError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            GraphicsError::ShaderLoadError(format!("failed to read {}: {e}", path.display()))
        })?;
        log::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
        Self::from_spirv(stage, &bytes, entry_point)
    }

    /// Compile one entry point of a WGSL module to SPIR-V.
    pub fn compile_wgsl(
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<Self, GraphicsError> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| {
            GraphicsError::ShaderLoadError(format!(
                "WGSL parse error: {}",
                e.emit_to_string(source)
            ))
        })?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        let info = validator
            .validate(&module)
            .map_err(|e| GraphicsError::ShaderLoadError(format!("Validation error: {e}")))?;

        let naga_stage = stage.to_naga();
        if !module
            .entry_points
            .iter()
            .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
        {
            return Err(GraphicsError::ShaderLoadError(format!(
                "Entry point '{}' not found for stage {:?}",
                entry_point, stage
            )));
        }

        let options = naga::back::spv::Options {
            lang_version: (1, 3),
            ..Default::default()
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: naga_stage,
            entry_point: entry_point.to_string(),
        };

        let words = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|e| GraphicsError::ShaderLoadError(format!("SPIR-V generation error: {e}")))?;

        log::trace!(
            "Compiled WGSL entry point '{}' ({:?}) to {} SPIR-V words",
            entry_point,
            stage,
            words.len()
        );
        Self::from_words(stage, words, entry_point)
    }

    /// The shader stage.
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// The entry point name.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// SPIR-V words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPUTE_WGSL: &str = r#"
@compute @workgroup_size(1)
fn main() {}
"#;

    #[test]
    fn test_rejects_corrupt_blobs() {
        let empty = ShaderBytecode::from_spirv(ShaderStage::Vertex, &[], "main");
        assert!(matches!(empty, Err(GraphicsError::ShaderLoadError(_))));

        let truncated = ShaderBytecode::from_spirv(ShaderStage::Vertex, &[0x03, 0x02, 0x23], "main");
        assert!(matches!(truncated, Err(GraphicsError::ShaderLoadError(_))));

        let wrong_magic =
            ShaderBytecode::from_spirv(ShaderStage::Vertex, &[0, 0, 0, 0, 1, 0, 0, 0], "main");
        assert!(matches!(wrong_magic, Err(GraphicsError::ShaderLoadError(_))));
    }

    #[test]
    fn test_accepts_magic() {
        let bytes = SPIRV_MAGIC.to_le_bytes();
        let shader = ShaderBytecode::from_spirv(ShaderStage::Fragment, &bytes, "fs_main").unwrap();
        assert_eq!(shader.stage(), ShaderStage::Fragment);
        assert_eq!(shader.entry_point(), "fs_main");
        assert_eq!(shader.words(), &[SPIRV_MAGIC]);
    }

    #[test]
    fn test_missing_file() {
        let result =
            ShaderBytecode::from_file(ShaderStage::Vertex, "/nonexistent/shader.spv", "main");
        assert!(matches!(result, Err(GraphicsError::ShaderLoadError(_))));
    }

    #[test]
    fn test_compile_wgsl() {
        let shader = ShaderBytecode::compile_wgsl(ShaderStage::Compute, COMPUTE_WGSL, "main")
            .unwrap();
        assert_eq!(shader.words()[0], SPIRV_MAGIC);

        let wrong_stage = ShaderBytecode::compile_wgsl(ShaderStage::Vertex, COMPUTE_WGSL, "main");
        assert!(wrong_stage.is_err());
        assert!(ShaderBytecode::compile_wgsl(ShaderStage::Compute, "fn (", "main").is_err());
    }
}
