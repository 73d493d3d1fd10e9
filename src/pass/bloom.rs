//! Five-mip bloom pass
//!
//! High-luminance regions are extracted into a half-resolution target, then
//! blurred through a chain of five progressively smaller mip pairs with a
//! separable gaussian of growing kernel radius. The blurred mips composite
//! back together with per-mip weights and finally blend additively onto the
//! read buffer.

use crate::fullscreen::{fullscreen_shader, FullScreenQuad};
use crate::material::{ShaderMaterial, UniformValue};
use crate::pass::shader::COPY_FRAGMENT_SHADER;
use crate::pass::{Pass, PassState};
use crate::renderer::traits::{Renderer, RendererResult};
use crate::renderer::types::{BlendState, RenderTargetDescriptor, TextureFormat};
use crate::target::RenderTarget;
use glam::{Vec2, Vec3};
use std::any::Any;

/// Number of blur mip levels.
pub const BLOOM_MIP_COUNT: usize = 5;

/// Per-mip composite weight, largest mip first.
pub const BLOOM_FACTORS: [f32; BLOOM_MIP_COUNT] = [1.0, 0.8, 0.6, 0.4, 0.2];

/// Gaussian kernel radius for each mip level.
pub const BLOOM_KERNEL_SIZES: [u32; BLOOM_MIP_COUNT] = [3, 5, 7, 9, 11];

const MAX_KERNEL_RADIUS: usize = 11;

/// One-sided gaussian weights for a separable blur, `radius` taps starting
/// at the center. The shader mirrors them and normalizes by the running
/// weight sum.
pub fn gaussian_kernel(radius: u32) -> Vec<f32> {
    let sigma = radius as f32;
    (0..radius)
        .map(|i| {
            let x = i as f32;
            0.39894 * (-0.5 * x * x / (sigma * sigma)).exp() / sigma
        })
        .collect()
}

/// The radius knob morphs each mip's weight towards its mirror around 0.6,
/// shifting energy between tight and wide mips.
pub fn lerp_bloom_factor(factor: f32, radius: f32) -> f32 {
    let mirror = 1.2 - factor;
    factor + (mirror - factor) * radius
}

const HIGHPASS_FRAGMENT_SHADER: &str = r#"
struct HighpassParams {
    threshold: f32,
    smooth_width: f32,
    default_opacity: f32,
    default_color: vec3<f32>,
}

@group(0) @binding(0) var<uniform> params: HighpassParams;
@group(0) @binding(1) var t_diffuse: texture_2d<f32>;
@group(0) @binding(2) var s_diffuse: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSample(t_diffuse, s_diffuse, input.uv);
    let luma = dot(texel.rgb, vec3<f32>(0.299, 0.587, 0.114));
    let fallback = vec4<f32>(params.default_color, params.default_opacity);
    let alpha = smoothstep(params.threshold, params.threshold + params.smooth_width, luma);
    return mix(fallback, texel, alpha);
}
"#;

const SEPARABLE_BLUR_FRAGMENT_SHADER: &str = r#"
struct BlurParams {
    inv_size: vec2<f32>,
    direction: vec2<f32>,
    kernel_radius: u32,
    weights: array<vec4<f32>, 11>,
}

@group(0) @binding(0) var<uniform> params: BlurParams;
@group(0) @binding(1) var t_diffuse: texture_2d<f32>;
@group(0) @binding(2) var s_diffuse: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    var weight_sum = params.weights[0].x;
    var color = textureSample(t_diffuse, s_diffuse, input.uv).rgb * weight_sum;
    for (var i = 1u; i < params.kernel_radius; i = i + 1u) {
        let w = params.weights[i].x;
        let offset = params.direction * params.inv_size * f32(i);
        let forward = textureSample(t_diffuse, s_diffuse, input.uv + offset).rgb;
        let backward = textureSample(t_diffuse, s_diffuse, input.uv - offset).rgb;
        color += (forward + backward) * w;
        weight_sum += 2.0 * w;
    }
    return vec4<f32>(color / weight_sum, 1.0);
}
"#;

const COMPOSITE_FRAGMENT_SHADER: &str = r#"
struct CompositeParams {
    bloom_strength: f32,
    bloom_radius: f32,
    bloom_factors: array<vec4<f32>, 5>,
    bloom_tint_colors: array<vec4<f32>, 5>,
}

@group(0) @binding(0) var<uniform> params: CompositeParams;
@group(0) @binding(1) var t_blur1: texture_2d<f32>;
@group(0) @binding(2) var t_blur2: texture_2d<f32>;
@group(0) @binding(3) var t_blur3: texture_2d<f32>;
@group(0) @binding(4) var t_blur4: texture_2d<f32>;
@group(0) @binding(5) var t_blur5: texture_2d<f32>;
@group(0) @binding(6) var s_diffuse: sampler;

fn lerp_bloom_factor(factor: f32) -> f32 {
    let mirror = 1.2 - factor;
    return mix(factor, mirror, params.bloom_radius);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    var sum = vec4<f32>(0.0);
    sum += lerp_bloom_factor(params.bloom_factors[0].x)
        * vec4<f32>(params.bloom_tint_colors[0].xyz, 1.0)
        * textureSample(t_blur1, s_diffuse, input.uv);
    sum += lerp_bloom_factor(params.bloom_factors[1].x)
        * vec4<f32>(params.bloom_tint_colors[1].xyz, 1.0)
        * textureSample(t_blur2, s_diffuse, input.uv);
    sum += lerp_bloom_factor(params.bloom_factors[2].x)
        * vec4<f32>(params.bloom_tint_colors[2].xyz, 1.0)
        * textureSample(t_blur3, s_diffuse, input.uv);
    sum += lerp_bloom_factor(params.bloom_factors[3].x)
        * vec4<f32>(params.bloom_tint_colors[3].xyz, 1.0)
        * textureSample(t_blur4, s_diffuse, input.uv);
    sum += lerp_bloom_factor(params.bloom_factors[4].x)
        * vec4<f32>(params.bloom_tint_colors[4].xyz, 1.0)
        * textureSample(t_blur5, s_diffuse, input.uv);
    return params.bloom_strength * sum;
}
"#;

/// Unreal-style bloom over the read buffer.
pub struct BloomPass {
    state: PassState,
    strength: f32,
    radius: f32,
    threshold: f32,
    resolution: (u32, u32),
    bright_target: RenderTarget,
    horizontal_targets: Vec<RenderTarget>,
    vertical_targets: Vec<RenderTarget>,
    highpass_material: ShaderMaterial,
    blur_materials: Vec<ShaderMaterial>,
    composite_material: ShaderMaterial,
    blend_material: ShaderMaterial,
    quad: FullScreenQuad,
}

impl BloomPass {
    pub fn new(renderer: &mut dyn Renderer, width: u32, height: u32) -> RendererResult<Self> {
        let (mut res_x, mut res_y) = ((width / 2).max(1), (height / 2).max(1));

        let bright_target =
            RenderTarget::new(renderer, Self::mip_descriptor("bloom.bright", res_x, res_y))?;

        let mut horizontal_targets = Vec::with_capacity(BLOOM_MIP_COUNT);
        let mut vertical_targets = Vec::with_capacity(BLOOM_MIP_COUNT);
        let mut blur_materials = Vec::with_capacity(BLOOM_MIP_COUNT);
        for (level, &kernel_radius) in BLOOM_KERNEL_SIZES.iter().enumerate() {
            horizontal_targets.push(RenderTarget::new(
                renderer,
                Self::mip_descriptor(&format!("bloom.blur_h{level}"), res_x, res_y),
            )?);
            vertical_targets.push(RenderTarget::new(
                renderer,
                Self::mip_descriptor(&format!("bloom.blur_v{level}"), res_x, res_y),
            )?);

            let mut weights = gaussian_kernel(kernel_radius);
            weights.resize(MAX_KERNEL_RADIUS, 0.0);
            blur_materials.push(
                ShaderMaterial::new(
                    &format!("bloom.blur{level}"),
                    &fullscreen_shader(SEPARABLE_BLUR_FRAGMENT_SHADER),
                )
                .with_uniform(
                    "inv_size",
                    UniformValue::Vec2(Vec2::new(1.0 / res_x as f32, 1.0 / res_y as f32)),
                )
                .with_uniform("direction", UniformValue::Vec2(Vec2::X))
                .with_uniform("kernel_radius", UniformValue::UInt(kernel_radius))
                .with_uniform("weights", UniformValue::FloatArray(weights))
                .with_uniform("t_diffuse", UniformValue::Texture(None)),
            );

            res_x = (res_x / 2).max(1);
            res_y = (res_y / 2).max(1);
        }

        let highpass_material = ShaderMaterial::new(
            "bloom.highpass",
            &fullscreen_shader(HIGHPASS_FRAGMENT_SHADER),
        )
        .with_uniform("threshold", UniformValue::Float(0.0))
        .with_uniform("smooth_width", UniformValue::Float(0.01))
        .with_uniform("default_opacity", UniformValue::Float(0.0))
        .with_uniform("default_color", UniformValue::Vec3(Vec3::ZERO))
        .with_uniform("t_diffuse", UniformValue::Texture(None));

        let mut composite_material = ShaderMaterial::new(
            "bloom.composite",
            &fullscreen_shader(COMPOSITE_FRAGMENT_SHADER),
        )
        .with_uniform("bloom_strength", UniformValue::Float(1.0))
        .with_uniform("bloom_radius", UniformValue::Float(0.0))
        .with_uniform(
            "bloom_factors",
            UniformValue::FloatArray(BLOOM_FACTORS.to_vec()),
        )
        .with_uniform(
            "bloom_tint_colors",
            UniformValue::Vec3Array(vec![Vec3::ONE; BLOOM_MIP_COUNT]),
        );
        for level in 0..BLOOM_MIP_COUNT {
            composite_material.set_uniform(
                &format!("t_blur{}", level + 1),
                UniformValue::Texture(None),
            );
        }

        let blend_material =
            ShaderMaterial::new("bloom.blend", &fullscreen_shader(COPY_FRAGMENT_SHADER))
                .with_uniform("opacity", UniformValue::Float(1.0))
                .with_uniform("t_diffuse", UniformValue::Texture(None))
                .with_blending(BlendState::additive());

        Ok(Self {
            state: PassState {
                needs_swap: false,
                clear: true,
                ..PassState::default()
            },
            strength: 1.0,
            radius: 0.0,
            threshold: 0.0,
            resolution: (width, height),
            bright_target,
            horizontal_targets,
            vertical_targets,
            highpass_material,
            blur_materials,
            composite_material,
            blend_material,
            quad: FullScreenQuad::empty(),
        })
    }

    fn mip_descriptor(label: &str, width: u32, height: u32) -> RenderTargetDescriptor {
        RenderTargetDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            format: TextureFormat::Rgba16Float,
            depth_stencil: false,
            sample_count: 1,
        }
    }

    pub fn strength(&self) -> f32 {
        self.strength
    }

    pub fn set_strength(&mut self, strength: f32) {
        self.strength = strength;
        self.composite_material
            .set_uniform("bloom_strength", UniformValue::Float(strength));
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius;
        self.composite_material
            .set_uniform("bloom_radius", UniformValue::Float(radius));
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
        self.highpass_material
            .set_uniform("threshold", UniformValue::Float(threshold));
    }

    pub fn set_tint_colors(&mut self, colors: [Vec3; BLOOM_MIP_COUNT]) {
        self.composite_material
            .set_uniform("bloom_tint_colors", UniformValue::Vec3Array(colors.to_vec()));
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

impl Pass for BloomPass {
    fn name(&self) -> &str {
        "Bloom"
    }

    fn state(&self) -> &PassState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PassState {
        &mut self.state
    }

    fn set_size(
        &mut self,
        renderer: &mut dyn Renderer,
        width: u32,
        height: u32,
    ) -> RendererResult<()> {
        self.resolution = (width, height);
        let (mut res_x, mut res_y) = ((width / 2).max(1), (height / 2).max(1));

        self.bright_target.set_size(renderer, res_x, res_y)?;
        for level in 0..BLOOM_MIP_COUNT {
            self.horizontal_targets[level].set_size(renderer, res_x, res_y)?;
            self.vertical_targets[level].set_size(renderer, res_x, res_y)?;
            self.blur_materials[level].set_uniform(
                "inv_size",
                UniformValue::Vec2(Vec2::new(1.0 / res_x as f32, 1.0 / res_y as f32)),
            );
            res_x = (res_x / 2).max(1);
            res_y = (res_y / 2).max(1);
        }
        Ok(())
    }

    fn render(
        &mut self,
        renderer: &mut dyn Renderer,
        _write: &RenderTarget,
        read: &RenderTarget,
        _delta_seconds: f32,
        mask_active: bool,
    ) -> RendererResult<()> {
        let saved_clear_color = renderer.clear_color();
        let saved_auto_clear = renderer.auto_clear();
        renderer.set_clear_color(Vec3::ZERO, 0.0);
        renderer.set_auto_clear(false);

        // Internal targets have no stencil buffer. Under an active mask the
        // stencil state is locked, so this is a recorded no-op; it matters
        // for renderers driven without the compositor's lock discipline.
        if mask_active {
            renderer.set_stencil_test(false);
        }

        // 1. Extract bright regions at half resolution.
        self.highpass_material
            .set_uniform("t_diffuse", UniformValue::Texture(Some(read.texture())));
        renderer.set_render_target(Some(self.bright_target.handle()));
        renderer.clear(true, true, true);
        self.quad.render_with(renderer, &mut self.highpass_material)?;

        // 2. Separable blur down the mip chain.
        let mut input = self.bright_target.texture();
        for level in 0..BLOOM_MIP_COUNT {
            let material = &mut self.blur_materials[level];

            material.set_uniform("t_diffuse", UniformValue::Texture(Some(input)));
            material.set_uniform("direction", UniformValue::Vec2(Vec2::X));
            renderer.set_render_target(Some(self.horizontal_targets[level].handle()));
            renderer.clear(true, true, true);
            self.quad.render_with(renderer, material)?;

            material.set_uniform(
                "t_diffuse",
                UniformValue::Texture(Some(self.horizontal_targets[level].texture())),
            );
            material.set_uniform("direction", UniformValue::Vec2(Vec2::Y));
            renderer.set_render_target(Some(self.vertical_targets[level].handle()));
            renderer.clear(true, true, true);
            self.quad.render_with(renderer, material)?;

            input = self.vertical_targets[level].texture();
        }

        // 3. Composite the five blurred mips into the first scratch target.
        for level in 0..BLOOM_MIP_COUNT {
            self.composite_material.set_uniform(
                &format!("t_blur{}", level + 1),
                UniformValue::Texture(Some(self.vertical_targets[level].texture())),
            );
        }
        renderer.set_render_target(Some(self.horizontal_targets[0].handle()));
        renderer.clear(true, true, true);
        self.quad
            .render_with(renderer, &mut self.composite_material)?;

        // 4. Additively blend the result over the read buffer (or screen).
        self.blend_material.set_uniform(
            "t_diffuse",
            UniformValue::Texture(Some(self.horizontal_targets[0].texture())),
        );
        if mask_active {
            renderer.set_stencil_test(true);
        }
        if self.state.render_to_screen {
            renderer.set_render_target(None);
        } else {
            renderer.set_render_target(Some(read.handle()));
        }
        self.quad.render_with(renderer, &mut self.blend_material)?;

        renderer.set_clear_color(saved_clear_color.0, saved_clear_color.1);
        renderer.set_auto_clear(saved_auto_clear);
        Ok(())
    }

    fn dispose(&mut self, renderer: &mut dyn Renderer) {
        self.bright_target.dispose(renderer);
        for target in &mut self.horizontal_targets {
            target.dispose(renderer);
        }
        for target in &mut self.vertical_targets {
            target.dispose(renderer);
        }
        renderer.destroy_material(self.highpass_material.id());
        for material in &self.blur_materials {
            renderer.destroy_material(material.id());
        }
        renderer.destroy_material(self.composite_material.id());
        renderer.destroy_material(self.blend_material.id());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
