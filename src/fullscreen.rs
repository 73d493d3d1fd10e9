//! Full-screen drawing primitive
//!
//! A single oversized triangle covers the whole viewport without the
//! diagonal seam of a two-triangle quad. The triangle is generated from the
//! vertex index alone, so there is no vertex buffer to manage.

use crate::material::ShaderMaterial;
use crate::renderer::traits::{Renderer, RendererError, RendererResult};

/// The shared vertex stage for every full-screen pass shader.
pub const FULLSCREEN_VERTEX_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    var output: VertexOutput;
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    output.position = vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
    output.uv = vec2<f32>(x, 1.0 - y);
    return output;
}
"#;

/// Build a complete pass shader from a fragment stage.
pub fn fullscreen_shader(fragment: &str) -> String {
    format!("{FULLSCREEN_VERTEX_SHADER}\n{fragment}")
}

/// Draws an assigned material across the entire output with one draw call.
#[derive(Debug)]
pub struct FullScreenQuad {
    material: Option<ShaderMaterial>,
}

impl FullScreenQuad {
    pub fn new(material: ShaderMaterial) -> Self {
        Self {
            material: Some(material),
        }
    }

    /// A quad with no material assigned yet, for passes that swap between
    /// several materials via [`render_with`](Self::render_with).
    pub fn empty() -> Self {
        Self { material: None }
    }

    /// Swap the active material without touching the geometry, returning
    /// the previous one.
    pub fn set_material(&mut self, material: ShaderMaterial) -> Option<ShaderMaterial> {
        self.material.replace(material)
    }

    pub fn material(&self) -> Option<&ShaderMaterial> {
        self.material.as_ref()
    }

    pub fn material_mut(&mut self) -> Option<&mut ShaderMaterial> {
        self.material.as_mut()
    }

    /// Draw the assigned material. Rendering without a material is a caller
    /// error.
    pub fn render(&mut self, renderer: &mut dyn Renderer) -> RendererResult<()> {
        let material = self.material.as_mut().ok_or_else(|| {
            RendererError::InvalidHandle("full-screen quad has no material assigned".to_string())
        })?;
        renderer.draw_fullscreen(material)
    }

    /// Draw an externally owned material through this quad.
    pub fn render_with(
        &self,
        renderer: &mut dyn Renderer,
        material: &mut ShaderMaterial,
    ) -> RendererResult<()> {
        renderer.draw_fullscreen(material)
    }

    /// Release GPU state compiled for the assigned material.
    pub fn dispose(&mut self, renderer: &mut dyn Renderer) {
        if let Some(material) = &self.material {
            renderer.destroy_material(material.id());
        }
    }
}
