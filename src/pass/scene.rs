//! Scene rendering pass

use crate::pass::{Pass, PassState};
use crate::renderer::traits::{CameraHandle, Renderer, RendererResult, SceneHandle};
use crate::target::RenderTarget;
use glam::Vec3;
use std::any::Any;

/// Renders a scene with a camera into the read buffer, so that later passes
/// can sample the result without an extra swap.
pub struct ScenePass {
    state: PassState,
    scene: SceneHandle,
    camera: CameraHandle,
    clear_color: Option<(Vec3, f32)>,
    clear_depth: bool,
}

impl ScenePass {
    pub fn new(scene: SceneHandle, camera: CameraHandle) -> Self {
        Self {
            state: PassState {
                needs_swap: false,
                clear: true,
                ..PassState::default()
            },
            scene,
            camera,
            clear_color: None,
            clear_depth: false,
        }
    }

    /// Override the renderer's clear color for the duration of this pass.
    pub fn with_clear_color(mut self, color: Vec3, alpha: f32) -> Self {
        self.clear_color = Some((color, alpha));
        self
    }

    /// Force a depth clear even when the pass does not clear color.
    pub fn set_clear_depth(&mut self, clear_depth: bool) {
        self.clear_depth = clear_depth;
    }

    pub fn scene(&self) -> SceneHandle {
        self.scene
    }

    pub fn camera(&self) -> CameraHandle {
        self.camera
    }
}

impl Pass for ScenePass {
    fn name(&self) -> &str {
        "Scene"
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
        read: &RenderTarget,
        _delta_seconds: f32,
        _mask_active: bool,
    ) -> RendererResult<()> {
        let saved_auto_clear = renderer.auto_clear();
        renderer.set_auto_clear(false);

        let saved_clear_color = self.clear_color.map(|(color, alpha)| {
            let saved = renderer.clear_color();
            renderer.set_clear_color(color, alpha);
            saved
        });

        if self.state.render_to_screen {
            renderer.set_render_target(None);
        } else {
            renderer.set_render_target(Some(read.handle()));
        }

        if self.state.clear {
            let state = renderer.state();
            let (color, depth, stencil) = (
                state.auto_clear_color,
                state.auto_clear_depth,
                state.auto_clear_stencil,
            );
            renderer.clear(color, depth, stencil);
        }
        if self.clear_depth {
            renderer.clear(false, true, false);
        }

        let result = renderer.render_scene(self.scene, self.camera);

        if let Some((color, alpha)) = saved_clear_color {
            renderer.set_clear_color(color, alpha);
        }
        renderer.set_auto_clear(saved_auto_clear);

        result
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
