//! Bloom pass internals: kernel math, the mip chain, composite wiring,
//! and the final additive blend.

mod common;

use common::{Op, RecordingRenderer};
use glam::{Vec2, Vec3};
use postfx::material::UniformValue;
use postfx::pass::bloom::{
    gaussian_kernel, lerp_bloom_factor, BloomPass, BLOOM_FACTORS, BLOOM_KERNEL_SIZES,
};
use postfx::pass::Pass;
use postfx::renderer::traits::Renderer;
use postfx::renderer::types::{BlendState, RenderTargetDescriptor};
use postfx::target::RenderTarget;

fn ping_pong(renderer: &mut RecordingRenderer) -> (RenderTarget, RenderTarget) {
    let desc = RenderTargetDescriptor {
        width: 256,
        height: 128,
        ..RenderTargetDescriptor::default()
    };
    let write = RenderTarget::new(renderer, desc.clone()).unwrap();
    let read = RenderTarget::new(renderer, desc).unwrap();
    (write, read)
}

fn find_draw<'a>(ops: &'a [Op], wanted: &str) -> (&'a Vec<(String, UniformValue)>, Option<u64>) {
    ops.iter()
        .find_map(|op| match op {
            Op::DrawFullscreen {
                label,
                uniforms,
                target,
                ..
            } if label == wanted => Some((uniforms, *target)),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no draw labeled {wanted}"))
}

#[test]
fn test_gaussian_kernel_reference_values() {
    let weights = gaussian_kernel(5);
    assert_eq!(weights.len(), 5);
    assert!((weights[0] - 0.079788).abs() < 1e-5);

    // The shader accumulates w0 + 2 * sum(w1..) as its running weight sum
    // and divides every tap by it, so the blur has unity gain no matter
    // how small the raw weights are.
    let weight_sum: f32 = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
    assert!((weight_sum - 0.632676).abs() < 1e-3);
    let gain: f32 = weights
        .iter()
        .enumerate()
        .map(|(i, w)| if i == 0 { w / weight_sum } else { 2.0 * w / weight_sum })
        .sum();
    assert!((gain - 1.0).abs() < 1e-6);
}

#[test]
fn test_lerp_bloom_factor_mirrors_around_the_midpoint() {
    for factor in BLOOM_FACTORS {
        assert!((lerp_bloom_factor(factor, 0.0) - factor).abs() < 1e-6);
        assert!((lerp_bloom_factor(factor, 1.0) - (1.2 - factor)).abs() < 1e-6);
    }
}

#[test]
fn test_mip_chain_halves_from_half_resolution() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (_write, _read) = ping_pong(&mut renderer);
    let _bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();

    let mut sizes: Vec<(Option<String>, u32, u32)> = renderer
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::CreateTarget {
                label,
                width,
                height,
            } => Some((label.clone(), *width, *height)),
            _ => None,
        })
        .collect();
    // Drop the two ping-pong targets created by the test itself.
    sizes.drain(..2);

    let expected = [
        ("bloom.bright", 128, 64),
        ("bloom.blur_h0", 128, 64),
        ("bloom.blur_v0", 128, 64),
        ("bloom.blur_h1", 64, 32),
        ("bloom.blur_v1", 64, 32),
        ("bloom.blur_h2", 32, 16),
        ("bloom.blur_v2", 32, 16),
        ("bloom.blur_h3", 16, 8),
        ("bloom.blur_v3", 16, 8),
        ("bloom.blur_h4", 8, 4),
        ("bloom.blur_v4", 8, 4),
    ];
    assert_eq!(sizes.len(), expected.len());
    for (actual, (label, width, height)) in sizes.iter().zip(expected) {
        assert_eq!(actual.0.as_deref(), Some(label));
        assert_eq!((actual.1, actual.2), (width, height));
    }
}

#[test]
fn test_render_walks_the_full_operation_sequence() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (write, read) = ping_pong(&mut renderer);
    let mut bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();
    renderer.take_ops();

    bloom
        .render(&mut renderer, &write, &read, 0.016, false)
        .unwrap();

    assert_eq!(
        renderer.draw_labels(),
        vec![
            "bloom.highpass",
            "bloom.blur0",
            "bloom.blur0",
            "bloom.blur1",
            "bloom.blur1",
            "bloom.blur2",
            "bloom.blur2",
            "bloom.blur3",
            "bloom.blur3",
            "bloom.blur4",
            "bloom.blur4",
            "bloom.composite",
            "bloom.blend",
        ]
    );

    // The highpass reads the read buffer; the blend writes back into it.
    let (uniforms, target) = find_draw(&renderer.ops, "bloom.highpass");
    assert_eq!(target, Some(3));
    assert!(uniforms.iter().any(|(name, value)| {
        name == "t_diffuse"
            && matches!(value, UniformValue::Texture(Some(tex)) if tex.raw() == read.handle().raw())
    }));
    let (_, target) = find_draw(&renderer.ops, "bloom.blend");
    assert_eq!(target, Some(read.handle().raw()));

    let blend = renderer
        .ops
        .iter()
        .find_map(|op| match op {
            Op::DrawFullscreen {
                label, blending, ..
            } if label == "bloom.blend" => Some(*blending),
            _ => None,
        })
        .unwrap();
    assert_eq!(blend, Some(BlendState::additive()));
}

#[test]
fn test_composite_carries_factors_tints_and_all_five_mips() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (write, read) = ping_pong(&mut renderer);
    let mut bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();
    bloom.set_strength(0.7);
    bloom.set_radius(0.25);
    renderer.take_ops();

    bloom
        .render(&mut renderer, &write, &read, 0.016, false)
        .unwrap();

    let (uniforms, _) = find_draw(&renderer.ops, "bloom.composite");
    let uniform = |name: &str| {
        uniforms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(uniform("bloom_strength"), UniformValue::Float(0.7));
    assert_eq!(uniform("bloom_radius"), UniformValue::Float(0.25));
    assert_eq!(
        uniform("bloom_factors"),
        UniformValue::FloatArray(BLOOM_FACTORS.to_vec())
    );
    assert_eq!(
        uniform("bloom_tint_colors"),
        UniformValue::Vec3Array(vec![Vec3::ONE; 5])
    );
    // Vertical blur results of the five mips, in order.
    for (i, raw) in [5u64, 7, 9, 11, 13].iter().enumerate() {
        assert_eq!(
            uniform(&format!("t_blur{}", i + 1)),
            UniformValue::Texture(Some(postfx::renderer::traits::TextureHandle::from_raw(*raw)))
        );
    }
}

#[test]
fn test_blur_materials_carry_padded_kernels() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (write, read) = ping_pong(&mut renderer);
    let mut bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();
    renderer.take_ops();
    bloom
        .render(&mut renderer, &write, &read, 0.016, false)
        .unwrap();

    let blur_draws: Vec<_> = renderer
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::DrawFullscreen {
                label, uniforms, ..
            } if label.starts_with("bloom.blur") => Some((label.clone(), uniforms.clone())),
            _ => None,
        })
        .collect();

    for (level, &radius) in BLOOM_KERNEL_SIZES.iter().enumerate() {
        let (_, uniforms) = &blur_draws[level * 2];
        let kernel = uniforms
            .iter()
            .find_map(|(name, value)| match value {
                UniformValue::FloatArray(values) if name == "weights" => Some(values.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(kernel.len(), 11);
        let expected = gaussian_kernel(radius);
        assert_eq!(&kernel[..radius as usize], &expected[..]);
        assert!(kernel[radius as usize..].iter().all(|w| *w == 0.0));

        let radius_uniform = uniforms
            .iter()
            .find_map(|(name, value)| match value {
                UniformValue::UInt(v) if name == "kernel_radius" => Some(*v),
                _ => None,
            })
            .unwrap();
        assert_eq!(radius_uniform, radius);
    }
}

#[test]
fn test_set_size_updates_targets_and_inv_size() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (write, read) = ping_pong(&mut renderer);
    let mut bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();

    bloom.set_size(&mut renderer, 400, 300).unwrap();
    assert_eq!(bloom.resolution(), (400, 300));
    renderer.take_ops();

    bloom
        .render(&mut renderer, &write, &read, 0.016, false)
        .unwrap();

    let first_blur = renderer
        .ops
        .iter()
        .find_map(|op| match op {
            Op::DrawFullscreen {
                label, uniforms, ..
            } if label == "bloom.blur0" => Some(uniforms.clone()),
            _ => None,
        })
        .unwrap();
    let inv_size = first_blur
        .iter()
        .find_map(|(name, value)| match value {
            UniformValue::Vec2(v) if name == "inv_size" => Some(*v),
            _ => None,
        })
        .unwrap();
    assert_eq!(inv_size, Vec2::new(1.0 / 200.0, 1.0 / 150.0));
}

#[test]
fn test_threshold_feeds_the_highpass() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (write, read) = ping_pong(&mut renderer);
    let mut bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();
    bloom.set_threshold(0.85);
    renderer.take_ops();

    bloom
        .render(&mut renderer, &write, &read, 0.016, false)
        .unwrap();

    let (uniforms, _) = find_draw(&renderer.ops, "bloom.highpass");
    assert!(uniforms
        .iter()
        .any(|(name, value)| name == "threshold" && *value == UniformValue::Float(0.85)));
    assert!(uniforms
        .iter()
        .any(|(name, value)| name == "smooth_width" && *value == UniformValue::Float(0.01)));
}

#[test]
fn test_mask_suspends_stencil_for_internal_draws_only() {
    let mut renderer = RecordingRenderer::new(256, 128);
    let (write, read) = ping_pong(&mut renderer);
    let mut bloom = BloomPass::new(&mut renderer, 256, 128).unwrap();

    renderer.set_stencil_test(true);
    renderer.set_clear_color(Vec3::new(0.2, 0.3, 0.4), 1.0);
    renderer.take_ops();

    bloom
        .render(&mut renderer, &write, &read, 0.016, true)
        .unwrap();

    for op in &renderer.ops {
        if let Op::DrawFullscreen { label, stencil, .. } = op {
            if label == "bloom.blend" {
                assert!(stencil.test, "blend draw must honor the mask");
            } else {
                assert!(!stencil.test, "{label} must not stencil-test");
            }
        }
    }

    // Clear color and stencil state are restored for the rest of the frame.
    assert_eq!(renderer.clear_color(), (Vec3::new(0.2, 0.3, 0.4), 1.0));
    assert!(renderer.stencil_test());
}
