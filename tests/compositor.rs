//! Pipeline-level behavior: pass ordering, buffer swaps, screen routing,
//! masked carry-forward, and sizing.

mod common;

use common::{Op, RecordingRenderer};
use postfx::fullscreen::fullscreen_shader;
use postfx::material::{ShaderMaterial, UniformValue};
use postfx::pass::shader::COPY_FRAGMENT_SHADER;
use postfx::pass::{BloomPass, MaskPass, Pass, PassState, ShaderPass};
use postfx::renderer::traits::{Renderer, RendererError, RendererResult};
use postfx::renderer::types::{CompareFunction, RenderTargetDescriptor};
use postfx::target::RenderTarget;
use postfx::Compositor;
use std::any::Any;

fn tint_pass(label: &str) -> ShaderPass {
    let material = ShaderMaterial::new(label, &fullscreen_shader(COPY_FRAGMENT_SHADER))
        .with_uniform("opacity", UniformValue::Float(1.0))
        .with_uniform("t_diffuse", UniformValue::Texture(None));
    ShaderPass::new(material)
}

fn draw_targets(renderer: &RecordingRenderer) -> Vec<Option<u64>> {
    renderer
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::DrawFullscreen { target, .. } => Some(*target),
            _ => None,
        })
        .collect()
}

#[test]
fn test_last_enabled_pass_draws_to_screen() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.add_pass(Box::new(tint_pass("fx.a")));
    compositor.add_pass(Box::new(tint_pass("fx.b")));
    compositor.add_pass(Box::new(tint_pass("fx.c")));

    compositor.render(&mut renderer, 0.016).unwrap();

    // a and b ping-pong off-screen, c lands on the screen.
    assert_eq!(draw_targets(&renderer), vec![Some(1), Some(2), None]);
}

#[test]
fn test_disabled_trailing_pass_moves_screen_draw_earlier() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.add_pass(Box::new(tint_pass("fx.a")));
    compositor.add_pass(Box::new(tint_pass("fx.b")));
    let mut disabled = tint_pass("fx.c");
    disabled.state_mut().enabled = false;
    compositor.add_pass(Box::new(disabled));

    compositor.render(&mut renderer, 0.016).unwrap();

    assert_eq!(renderer.draw_labels(), vec!["fx.a", "fx.b"]);
    assert_eq!(draw_targets(&renderer), vec![Some(1), None]);
}

#[test]
fn test_render_to_screen_false_keeps_everything_offscreen() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.render_to_screen = false;
    compositor.add_pass(Box::new(tint_pass("fx.a")));
    compositor.add_pass(Box::new(tint_pass("fx.b")));
    compositor.add_pass(Box::new(tint_pass("fx.c")));

    compositor.render(&mut renderer, 0.016).unwrap();

    assert_eq!(draw_targets(&renderer), vec![Some(1), Some(2), Some(1)]);
}

#[test]
fn test_is_last_enabled_pass_exhaustive() {
    for len in 0usize..=5 {
        for mask in 0u32..(1 << len) {
            let mut renderer = RecordingRenderer::new(8, 8);
            let mut compositor = Compositor::new(&mut renderer, None).unwrap();
            for i in 0..len {
                let mut pass = tint_pass(&format!("fx.{i}"));
                pass.state_mut().enabled = mask & (1 << i) != 0;
                compositor.add_pass(Box::new(pass));
            }
            for i in 0..len {
                let expected = (i + 1..len).all(|j| mask & (1 << j) == 0);
                assert_eq!(
                    compositor.is_last_enabled_pass(i),
                    expected,
                    "len {len} mask {mask:b} index {i}"
                );
            }
            // Indices at or past the end have nothing after them, including
            // index 0 on an empty list.
            assert!(compositor.is_last_enabled_pass(len));
            assert!(compositor.is_last_enabled_pass(len + 1));
        }
    }
}

#[test]
fn test_set_size_scales_by_pixel_ratio_and_reaches_passes() {
    let mut renderer = RecordingRenderer::with_pixel_ratio(64, 64, 2.0);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    // Derived from the 64x64 logical size at ratio 2.
    assert_eq!(compositor.write_buffer().size(), (128, 128));

    let bloom = BloomPass::new(&mut renderer, 128, 128).unwrap();
    compositor.add_pass(Box::new(bloom));

    compositor.set_size(&mut renderer, 100, 50).unwrap();

    assert_eq!(compositor.write_buffer().size(), (200, 100));
    assert_eq!(compositor.read_buffer().size(), (200, 100));
    let bloom = compositor
        .pass(0)
        .unwrap()
        .as_any()
        .downcast_ref::<BloomPass>()
        .unwrap();
    assert_eq!(bloom.resolution(), (200, 100));
}

#[test]
fn test_set_pixel_ratio_reallocates_at_the_new_physical_size() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    assert_eq!(compositor.write_buffer().size(), (64, 64));

    compositor.set_pixel_ratio(&mut renderer, 2.0).unwrap();

    assert_eq!(compositor.write_buffer().size(), (128, 128));
    assert_eq!(compositor.read_buffer().size(), (128, 128));
}

#[test]
fn test_even_number_of_swaps_restores_buffer_roles() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.render_to_screen = false;
    compositor.add_pass(Box::new(tint_pass("fx.a")));
    compositor.add_pass(Box::new(tint_pass("fx.b")));

    let read_before = compositor.read_buffer().handle();
    let write_before = compositor.write_buffer().handle();
    compositor.render(&mut renderer, 0.016).unwrap();

    assert_eq!(compositor.read_buffer().handle(), read_before);
    assert_eq!(compositor.write_buffer().handle(), write_before);
}

#[test]
fn test_single_swap_flips_buffer_roles() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.render_to_screen = false;
    compositor.add_pass(Box::new(tint_pass("fx.a")));

    let read_before = compositor.read_buffer().handle();
    compositor.render(&mut renderer, 0.016).unwrap();

    assert_eq!(compositor.write_buffer().handle(), read_before);
}

#[test]
fn test_masked_swap_blits_unmasked_region_forward() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.render_to_screen = false;
    compositor.add_pass(Box::new(MaskPass::new(
        RecordingRenderer::scene(1),
        RecordingRenderer::camera(1),
    )));
    compositor.add_pass(Box::new(tint_pass("fx.masked")));

    compositor.render(&mut renderer, 0.016).unwrap();

    let draws: Vec<_> = renderer
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::DrawFullscreen {
                label,
                target,
                stencil,
                uniforms,
                ..
            } => Some((label.as_str(), *target, *stencil, uniforms.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(draws.len(), 2);

    // The masked pass draws into the write buffer under Equal(1).
    let (label, target, stencil, _) = &draws[0];
    assert_eq!(*label, "fx.masked");
    assert_eq!(*target, Some(1));
    assert!(stencil.test);
    assert_eq!(stencil.func.compare, CompareFunction::Equal);
    assert_eq!(stencil.func.reference, 1);

    // The compositor then carries the read buffer forward outside the mask.
    let (label, target, stencil, uniforms) = &draws[1];
    assert_eq!(*label, "postfx.copy");
    assert_eq!(*target, Some(1));
    assert_eq!(stencil.func.compare, CompareFunction::NotEqual);
    assert!(uniforms.iter().any(|(name, value)| {
        name == "t_diffuse"
            && matches!(value, UniformValue::Texture(Some(tex)) if tex.raw() == 2)
    }));

    // The test is re-armed after the blit, and the swap happened.
    assert_eq!(renderer.state().stencil.func.compare, CompareFunction::Equal);
    assert_eq!(compositor.read_buffer().handle().raw(), 1);
}

#[test]
fn test_render_restores_previous_render_target() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.add_pass(Box::new(tint_pass("fx.a")));

    let extra = renderer
        .create_target(&RenderTargetDescriptor::default())
        .unwrap();
    renderer.set_render_target(Some(extra));

    compositor.render(&mut renderer, 0.016).unwrap();

    assert_eq!(renderer.render_target(), Some(extra));
}

/// A pass whose render always fails, for error-path checks.
struct FailingPass {
    state: PassState,
}

impl Pass for FailingPass {
    fn name(&self) -> &str {
        "fx.failing"
    }

    fn state(&self) -> &PassState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PassState {
        &mut self.state
    }

    fn render(
        &mut self,
        _renderer: &mut dyn Renderer,
        _write: &RenderTarget,
        _read: &RenderTarget,
        _delta_seconds: f32,
        _mask_active: bool,
    ) -> RendererResult<()> {
        Err(RendererError::InvalidHandle("missing input texture".into()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn test_render_restores_previous_render_target_when_a_pass_fails() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.add_pass(Box::new(FailingPass {
        state: PassState::default(),
    }));

    let extra = renderer
        .create_target(&RenderTargetDescriptor::default())
        .unwrap();
    renderer.set_render_target(Some(extra));

    assert!(compositor.render(&mut renderer, 0.016).is_err());
    assert_eq!(renderer.render_target(), Some(extra));
}

#[test]
fn test_reset_recreates_both_targets_and_reseeds_the_roles() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    compositor.render_to_screen = false;
    compositor.add_pass(Box::new(tint_pass("fx.a")));

    // One swap leaves the roles flipped.
    compositor.render(&mut renderer, 0.016).unwrap();
    assert_eq!(compositor.write_buffer().handle().raw(), 2);
    renderer.take_ops();

    compositor.reset(&mut renderer, None).unwrap();

    let churn: Vec<_> = renderer
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::DestroyTarget(id) => Some((Some(*id), None)),
            Op::CreateTarget { label, .. } => Some((None, label.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        churn,
        vec![
            (Some(1), None),
            (None, Some("compositor.write".to_string())),
            (Some(2), None),
            (None, Some("compositor.read".to_string())),
        ]
    );

    // Fresh handles, write-first ordering, same size as before.
    assert_eq!(compositor.write_buffer().handle().raw(), 3);
    assert_eq!(compositor.read_buffer().handle().raw(), 4);
    assert_eq!(compositor.write_buffer().size(), (64, 64));
}

#[test]
fn test_dispose_releases_targets_and_the_copy_pass() {
    let mut renderer = RecordingRenderer::new(64, 64);
    let mut compositor = Compositor::new(&mut renderer, None).unwrap();
    renderer.take_ops();

    compositor.dispose(&mut renderer);

    let destroyed_targets: Vec<_> = renderer
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::DestroyTarget(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(destroyed_targets, vec![1, 2]);

    let destroyed_materials = renderer
        .ops
        .iter()
        .filter(|op| matches!(op, Op::DestroyMaterial(_)))
        .count();
    assert_eq!(destroyed_materials, 1);
}
