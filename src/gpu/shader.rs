//! Shader preprocessing and compilation.
//!
//! WGSL sources live under `src/shaders` and are embedded with `rust-embed`.
//! They are minijinja templates (block delimiters `{$ $}`, line statements
//! prefixed by `$$`) rendered against the renderer's fixed constants, such as
//! the cascade count and the bindless array lengths.
//!
//! The environment is built once per renderer and shared through an
//! [`Arc<ShaderCompiler>`] with every pass that builds pipelines. It is
//! dropped together with the owning renderer.

use std::sync::Arc;

use log::{debug, warn};
use minijinja::{Environment, Value, context, syntax::SyntaxConfig};
use parking_lot::Mutex;
use rust_embed::RustEmbed;
use rustc_hash::FxHashMap;

use super::device::{GpuDevice, ShaderSource};
use super::types::ShaderModuleHandle;
use crate::errors::{RenderError, Result};
use crate::settings::{RendererSettings, SHADOW_CASCADE_COUNT};

#[derive(RustEmbed)]
#[folder = "src/shaders"]
struct ShaderAssets;

fn shader_loader(name: &str) -> std::result::Result<Option<String>, minijinja::Error> {
    let filename = if name.ends_with(".wgsl") {
        name.to_string()
    } else {
        format!("{name}.wgsl")
    };
    Ok(ShaderAssets::get(&filename)
        .and_then(|file| std::str::from_utf8(file.data.as_ref()).ok().map(str::to_string)))
}

pub struct ShaderCompiler {
    env: Environment<'static>,
    constants: Value,
    /// Template name → rendered WGSL.
    rendered: Mutex<FxHashMap<String, Arc<str>>>,
}

impl ShaderCompiler {
    pub fn new(settings: &RendererSettings, clip_y_down: bool) -> Result<Arc<Self>> {
        let mut env = Environment::new();
        let syntax = SyntaxConfig::builder()
            .block_delimiters("{$", "$}")
            .variable_delimiters("{{", "}}")
            .line_statement_prefix("$$")
            .build()
            .map_err(|e| RenderError::InvalidAsset(format!("shader template syntax: {e}")))?;
        env.set_syntax(syntax);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env.set_loader(shader_loader);

        let constants = context! {
            cascade_count => SHADOW_CASCADE_COUNT,
            max_textures => settings.max_textures,
            max_shadow_maps => settings.max_shadow_maps,
            max_fonts => settings.max_fonts,
            max_ui_textures => settings.max_ui_textures,
            clip_y_down => clip_y_down,
        };

        Ok(Arc::new(Self {
            env,
            constants,
            rendered: Mutex::new(FxHashMap::default()),
        }))
    }

    /// Renders a template. Failures are logged and yield `None`.
    pub fn preprocess(&self, template: &str) -> Option<Arc<str>> {
        if let Some(source) = self.rendered.lock().get(template) {
            return Some(source.clone());
        }
        let rendered = self
            .env
            .get_template(template)
            .and_then(|t| t.render(&self.constants));
        match rendered {
            Ok(source) => {
                let source: Arc<str> = source.into();
                self.rendered
                    .lock()
                    .insert(template.to_string(), source.clone());
                debug!("Preprocessed shader '{template}' ({} bytes)", source.len());
                Some(source)
            }
            Err(e) => {
                warn!("Shader template '{template}' failed to preprocess: {e:#}");
                None
            }
        }
    }

    /// Preprocesses `template` and compiles it on `device`.
    pub fn compile<D: GpuDevice + ?Sized>(
        &self,
        device: &mut D,
        template: &str,
        entry_points: &[&str],
    ) -> Option<ShaderModuleHandle> {
        let source = self.preprocess(template)?;
        device.compile_shader(&ShaderSource {
            label: template,
            wgsl: source.as_ref().into(),
            entry_points,
        })
    }

    #[must_use]
    pub fn cached_sources(&self) -> usize {
        self.rendered.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn constants_are_substituted() {
        let compiler = ShaderCompiler::new(&RendererSettings::default(), true).unwrap();
        let source = compiler.preprocess("shadow").unwrap();
        assert!(source.contains(&format!("CASCADE_COUNT: u32 = {}u", SHADOW_CASCADE_COUNT)));
        assert!(!source.contains("{{"));
    }

    #[test]
    fn rendered_sources_are_cached() {
        let compiler = ShaderCompiler::new(&RendererSettings::default(), true).unwrap();
        compiler.preprocess("tone_mapping").unwrap();
        compiler.preprocess("tone_mapping").unwrap();
        assert_eq!(compiler.cached_sources(), 1);
    }

    #[test]
    fn missing_template_fails_soft() {
        let compiler = ShaderCompiler::new(&RendererSettings::default(), true).unwrap();
        let mut device = HeadlessDevice::new();
        assert!(compiler.compile(&mut device, "does_not_exist", &["vs_main"]).is_none());
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn every_embedded_shader_compiles() {
        let compiler = ShaderCompiler::new(&RendererSettings::default(), true).unwrap();
        let mut device = HeadlessDevice::new();
        for (name, entries) in [
            ("shadow", &["vs_main"][..]),
            ("main", &["vs_main", "fs_main"][..]),
            ("tone_mapping", &["vs_main", "fs_main"][..]),
            ("ui", &["vs_text", "fs_text", "vs_line", "vs_image", "fs_color", "fs_image"][..]),
        ] {
            assert!(compiler.compile(&mut device, name, entries).is_some(), "{name}");
        }
    }
}
