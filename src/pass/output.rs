//! Final output pass
//!
//! Converts the linear working buffer to the display: applies the
//! renderer's tone mapping operator and the output color-space transfer
//! function. The operator selection is baked into the shader through
//! defines, so a change of renderer settings triggers a recompile.

use crate::fullscreen::{fullscreen_shader, FullScreenQuad};
use crate::material::{ShaderMaterial, UniformValue};
use crate::pass::{Pass, PassState};
use crate::renderer::traits::{Renderer, RendererResult};
use crate::renderer::types::{ColorSpace, ToneMapping};
use crate::target::RenderTarget;
use std::any::Any;

const OUTPUT_FRAGMENT_SHADER: &str = r#"
struct OutputParams {
    tone_mapping_exposure: f32,
}

@group(0) @binding(0) var<uniform> params: OutputParams;
@group(0) @binding(1) var t_diffuse: texture_2d<f32>;
@group(0) @binding(2) var s_diffuse: sampler;

fn reinhard_tone_mapping(color: vec3<f32>) -> vec3<f32> {
    let c = color * params.tone_mapping_exposure;
    return saturate(c / (vec3<f32>(1.0) + c));
}

fn cineon_tone_mapping(color: vec3<f32>) -> vec3<f32> {
    var c = color * params.tone_mapping_exposure;
    c = max(vec3<f32>(0.0), c - 0.004);
    return pow(
        (c * (6.2 * c + 0.5)) / (c * (6.2 * c + 1.7) + 0.06),
        vec3<f32>(2.2),
    );
}

fn rrt_and_odt_fit(v: vec3<f32>) -> vec3<f32> {
    let a = v * (v + 0.0245786) - 0.000090537;
    let b = v * (0.983729 * v + 0.4329510) + 0.238081;
    return a / b;
}

fn aces_filmic_tone_mapping(color: vec3<f32>) -> vec3<f32> {
    let aces_input = mat3x3<f32>(
        vec3<f32>(0.59719, 0.07600, 0.02840),
        vec3<f32>(0.35458, 0.90834, 0.13383),
        vec3<f32>(0.04823, 0.01566, 0.83777),
    );
    let aces_output = mat3x3<f32>(
        vec3<f32>(1.60475, -0.10208, -0.00327),
        vec3<f32>(-0.53108, 1.10813, -0.07276),
        vec3<f32>(-0.07367, -0.00605, 1.07602),
    );
    var c = color * (params.tone_mapping_exposure / 0.6);
    c = aces_input * c;
    c = rrt_and_odt_fit(c);
    c = aces_output * c;
    return saturate(c);
}

fn agx_default_contrast_approx(x: vec3<f32>) -> vec3<f32> {
    let x2 = x * x;
    let x4 = x2 * x2;
    return 15.5 * x4 * x2
        - 40.14 * x4 * x
        + 31.96 * x4
        - 6.868 * x2 * x
        + 0.4298 * x2
        + 0.1191 * x
        - 0.00232;
}

fn agx_tone_mapping(color: vec3<f32>) -> vec3<f32> {
    let agx_inset = mat3x3<f32>(
        vec3<f32>(0.856627153315983, 0.137318972929847, 0.11189821299995),
        vec3<f32>(0.0951212405381588, 0.761241990602591, 0.0767994186031903),
        vec3<f32>(0.0482516061458583, 0.101439036467562, 0.811302368396859),
    );
    let agx_outset = mat3x3<f32>(
        vec3<f32>(1.1271005818144368, -0.1413297634984383, -0.14132976349843826),
        vec3<f32>(-0.11060664309660323, 1.157823702216272, -0.11060664309660294),
        vec3<f32>(-0.016493938717834573, -0.016493938717834257, 1.2519364065950405),
    );
    let linear_rec2020_to_linear_srgb = mat3x3<f32>(
        vec3<f32>(1.6605, -0.1246, -0.0182),
        vec3<f32>(-0.5876, 1.1329, -0.1006),
        vec3<f32>(-0.0728, -0.0083, 1.1187),
    );
    let linear_srgb_to_linear_rec2020 = mat3x3<f32>(
        vec3<f32>(0.6274, 0.0691, 0.0164),
        vec3<f32>(0.3293, 0.9195, 0.0880),
        vec3<f32>(0.0433, 0.0113, 0.8956),
    );
    let agx_min_ev = -12.47393;
    let agx_max_ev = 4.026069;

    var c = color * params.tone_mapping_exposure;
    c = linear_srgb_to_linear_rec2020 * c;
    c = agx_inset * c;
    c = max(c, vec3<f32>(1e-10));
    c = log2(c);
    c = (c - agx_min_ev) / (agx_max_ev - agx_min_ev);
    c = clamp(c, vec3<f32>(0.0), vec3<f32>(1.0));
    c = agx_default_contrast_approx(c);
    c = agx_outset * c;
    c = pow(max(vec3<f32>(0.0), c), vec3<f32>(2.2));
    c = linear_rec2020_to_linear_srgb * c;
    return clamp(c, vec3<f32>(0.0), vec3<f32>(1.0));
}

fn neutral_tone_mapping(color: vec3<f32>) -> vec3<f32> {
    let start_compression = 0.8 - 0.04;
    let desaturation = 0.15;

    var c = color * params.tone_mapping_exposure;
    let x = min(c.r, min(c.g, c.b));
    let offset = select(0.04, x - 6.25 * x * x, x < 0.08);
    c = c - offset;
    let peak = max(c.r, max(c.g, c.b));
    if (peak < start_compression) {
        return c;
    }
    let d = 1.0 - start_compression;
    let new_peak = 1.0 - d * d / (peak + d - start_compression);
    c = c * (new_peak / peak);
    let g = 1.0 - 1.0 / (desaturation * (peak - new_peak) + 1.0);
    return mix(c, vec3<f32>(new_peak), g);
}

fn srgb_transfer_oetf(value: vec3<f32>) -> vec3<f32> {
    let lower = value * 12.92;
    let higher = 1.055 * pow(value, vec3<f32>(1.0 / 2.4)) - 0.055;
    return select(higher, lower, value <= vec3<f32>(0.0031308));
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSample(t_diffuse, s_diffuse, input.uv);
    var color = texel.rgb;
#ifdef TONE_MAPPING_REINHARD
    color = reinhard_tone_mapping(color);
#endif
#ifdef TONE_MAPPING_CINEON
    color = cineon_tone_mapping(color);
#endif
#ifdef TONE_MAPPING_ACES_FILMIC
    color = aces_filmic_tone_mapping(color);
#endif
#ifdef TONE_MAPPING_AGX
    color = agx_tone_mapping(color);
#endif
#ifdef TONE_MAPPING_NEUTRAL
    color = neutral_tone_mapping(color);
#endif
#ifdef SRGB_TRANSFER
    color = srgb_transfer_oetf(color);
#endif
    return vec4<f32>(color, texel.a);
}
"#;

/// Tone-maps and color-converts the read buffer for display.
pub struct OutputPass {
    state: PassState,
    material: ShaderMaterial,
    quad: FullScreenQuad,
    compiled_for: Option<(ToneMapping, ColorSpace)>,
}

impl OutputPass {
    pub fn new() -> Self {
        let material = ShaderMaterial::new(
            "postfx.output",
            &fullscreen_shader(OUTPUT_FRAGMENT_SHADER),
        )
        .with_uniform("tone_mapping_exposure", UniformValue::Float(1.0))
        .with_uniform("t_diffuse", UniformValue::Texture(None));
        Self {
            state: PassState::default(),
            material,
            quad: FullScreenQuad::empty(),
            compiled_for: None,
        }
    }

    pub fn material(&self) -> &ShaderMaterial {
        &self.material
    }

    fn reconfigure(&mut self, tone_mapping: ToneMapping, color_space: ColorSpace) {
        self.material.clear_defines();
        let define = match tone_mapping {
            ToneMapping::None => None,
            ToneMapping::Reinhard => Some("TONE_MAPPING_REINHARD"),
            ToneMapping::Cineon => Some("TONE_MAPPING_CINEON"),
            ToneMapping::AcesFilmic => Some("TONE_MAPPING_ACES_FILMIC"),
            ToneMapping::Agx => Some("TONE_MAPPING_AGX"),
            ToneMapping::Neutral => Some("TONE_MAPPING_NEUTRAL"),
        };
        if let Some(define) = define {
            self.material.set_define(define, "");
        }
        if color_space == ColorSpace::Srgb {
            self.material.set_define("SRGB_TRANSFER", "");
        }
        self.material.mark_needs_update();
        log::debug!(
            "output pass reconfigured: tone mapping {:?}, color space {:?}",
            tone_mapping,
            color_space
        );
        self.compiled_for = Some((tone_mapping, color_space));
    }
}

impl Default for OutputPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for OutputPass {
    fn name(&self) -> &str {
        "Output"
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
        let tone_mapping = renderer.tone_mapping();
        let color_space = renderer.output_color_space();
        if self.compiled_for != Some((tone_mapping, color_space)) {
            self.reconfigure(tone_mapping, color_space);
        }

        self.material.set_uniform(
            "tone_mapping_exposure",
            UniformValue::Float(renderer.tone_mapping_exposure()),
        );
        self.material
            .set_uniform("t_diffuse", UniformValue::Texture(Some(read.texture())));

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
