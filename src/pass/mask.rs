//! Stencil mask passes
//!
//! [`MaskPass`] stamps the silhouette of a scene into the stencil buffers of
//! both ping-pong targets and arms a stencil test that confines every
//! following pass to the stamped region. [`ClearMaskPass`] disarms it. The
//! two are used as a bracket around the passes to be masked.

use crate::pass::{Pass, PassState};
use crate::renderer::traits::{CameraHandle, Renderer, RendererResult, SceneHandle};
use crate::renderer::types::{CompareFunction, StencilOp};
use crate::target::RenderTarget;
use std::any::Any;

/// Stencil reference written by a mask and matched by masked passes.
pub const MASK_WRITE_VALUE: u32 = 1;

/// Writes a scene's coverage into the stencil buffer of both targets, then
/// locks the stencil state to `Equal(1)` for the passes that follow.
pub struct MaskPass {
    state: PassState,
    scene: SceneHandle,
    camera: CameraHandle,
    inverse: bool,
}

impl MaskPass {
    pub fn new(scene: SceneHandle, camera: CameraHandle) -> Self {
        Self {
            state: PassState {
                needs_swap: false,
                clear: true,
                ..PassState::default()
            },
            scene,
            camera,
            inverse: false,
        }
    }

    /// Invert the mask: following passes draw everywhere except the scene's
    /// coverage.
    pub fn set_inverse(&mut self, inverse: bool) {
        self.inverse = inverse;
    }

    pub fn inverse(&self) -> bool {
        self.inverse
    }
}

impl Pass for MaskPass {
    fn name(&self) -> &str {
        "Mask"
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
        // The scene geometry only feeds the stencil buffer; color and depth
        // stay untouched while the mask renders.
        renderer.set_color_write(false);
        renderer.set_depth_write(false);
        renderer.lock_color_write(true);
        renderer.lock_depth_write(true);

        let (write_value, clear_value) = if self.inverse {
            (0, MASK_WRITE_VALUE)
        } else {
            (MASK_WRITE_VALUE, 0)
        };

        renderer.set_stencil_test(true);
        renderer.set_stencil_op(StencilOp::Replace, StencilOp::Replace, StencilOp::Replace);
        renderer.set_stencil_func(CompareFunction::Always, write_value, 0xffffffff);
        renderer.set_stencil_clear(clear_value);
        renderer.lock_stencil(true);

        // Stamp the mask into both targets so it survives buffer swaps.
        for target in [read, write] {
            renderer.set_render_target(Some(target.handle()));
            if self.state.clear {
                renderer.clear(true, true, true);
            }
            renderer.render_scene(self.scene, self.camera)?;
        }

        renderer.lock_color_write(false);
        renderer.lock_depth_write(false);
        renderer.set_color_write(true);
        renderer.set_depth_write(true);

        // Arm the test for the masked passes and lock it so they cannot
        // disturb it.
        renderer.lock_stencil(false);
        renderer.set_stencil_func(CompareFunction::Equal, MASK_WRITE_VALUE, 0xffffffff);
        renderer.set_stencil_op(StencilOp::Keep, StencilOp::Keep, StencilOp::Keep);
        renderer.lock_stencil(true);

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Disarms the stencil test armed by the most recent [`MaskPass`].
pub struct ClearMaskPass {
    state: PassState,
}

impl ClearMaskPass {
    pub fn new() -> Self {
        Self {
            state: PassState {
                needs_swap: false,
                ..PassState::default()
            },
        }
    }
}

impl Default for ClearMaskPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for ClearMaskPass {
    fn name(&self) -> &str {
        "ClearMask"
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
        _write: &RenderTarget,
        _read: &RenderTarget,
        _delta_seconds: f32,
        _mask_active: bool,
    ) -> RendererResult<()> {
        renderer.lock_stencil(false);
        renderer.set_stencil_test(false);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
