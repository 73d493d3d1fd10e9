//! Generic full-screen shader pass

use crate::fullscreen::{fullscreen_shader, FullScreenQuad};
use crate::material::{ShaderMaterial, UniformValue};
use crate::pass::{Pass, PassState};
use crate::renderer::traits::{Renderer, RendererResult};
use crate::target::RenderTarget;
use std::any::Any;

/// Fragment stage of the copy blit. Bindings follow the material layout
/// convention: params, then the input texture, then the shared sampler.
pub const COPY_FRAGMENT_SHADER: &str = r#"
struct CopyParams {
    opacity: f32,
}

@group(0) @binding(0) var<uniform> params: CopyParams;
@group(0) @binding(1) var t_diffuse: texture_2d<f32>;
@group(0) @binding(2) var s_diffuse: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSample(t_diffuse, s_diffuse, input.uv);
    return params.opacity * texel;
}
"#;

/// Runs an arbitrary material over the read buffer and writes the result
/// into the write buffer (or the screen).
pub struct ShaderPass {
    state: PassState,
    material: ShaderMaterial,
    quad: FullScreenQuad,
    input_uniform: String,
}

impl ShaderPass {
    /// Wrap a material whose input texture uniform is named `t_diffuse`.
    pub fn new(material: ShaderMaterial) -> Self {
        Self::with_input_uniform(material, "t_diffuse")
    }

    /// Wrap a material with a custom name for the input texture uniform.
    pub fn with_input_uniform(mut material: ShaderMaterial, input_uniform: &str) -> Self {
        if material.uniform(input_uniform).is_none() {
            material.set_uniform(input_uniform, UniformValue::Texture(None));
        }
        Self {
            state: PassState::default(),
            material,
            quad: FullScreenQuad::empty(),
            input_uniform: input_uniform.to_string(),
        }
    }

    /// The stock copy pass: blits the read buffer, scaled by an `opacity`
    /// uniform.
    pub fn copy() -> Self {
        let material = ShaderMaterial::new("postfx.copy", &fullscreen_shader(COPY_FRAGMENT_SHADER))
            .with_uniform("opacity", UniformValue::Float(1.0))
            .with_uniform("t_diffuse", UniformValue::Texture(None));
        Self::new(material)
    }

    pub fn material(&self) -> &ShaderMaterial {
        &self.material
    }

    pub fn material_mut(&mut self) -> &mut ShaderMaterial {
        &mut self.material
    }
}

impl Pass for ShaderPass {
    fn name(&self) -> &str {
        "Shader"
    }

    fn state(&self) -> &PassState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PassState {
        &mut self.state
    }

    fn render(
        &mut self,
        renderer: &mut dyn Renderer,
        write: &RenderTarget,
        read: &RenderTarget,
        _delta_seconds: f32,
        _mask_active: bool,
    ) -> RendererResult<()> {
        let texture = read.texture();
        self.material
            .set_uniform(&self.input_uniform, UniformValue::Texture(Some(texture)));

        if self.state.render_to_screen {
            renderer.set_render_target(None);
        } else {
            renderer.set_render_target(Some(write.handle()));
            if self.state.clear {
                let state = renderer.state();
                let (color, depth, stencil) = (
                    state.auto_clear_color,
                    state.auto_clear_depth,
                    state.auto_clear_stencil,
                );
                renderer.clear(color, depth, stencil);
            }
        }

        self.quad.render_with(renderer, &mut self.material)
    }

    fn dispose(&mut self, renderer: &mut dyn Renderer) {
        renderer.destroy_material(self.material.id());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
