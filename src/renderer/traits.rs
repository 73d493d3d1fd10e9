//! Core renderer abstraction
//!
//! The compositor and its passes drive a renderer exclusively through the
//! [`Renderer`] trait: they consume the surface, they never construct it.
//! [`crate::renderer::WgpuRenderer`] is the stock implementation.

use crate::material::{MaterialId, ShaderMaterial};
use crate::renderer::types::*;
use glam::Vec3;
use thiserror::Error;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to initialize renderer: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create render target: {0}")]
    TargetCreationFailed(String),
    #[error("Failed to compile shader: {0}")]
    ShaderCompilationFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Failed to read back target: {0}")]
    ReadbackFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type RendererResult<T> = Result<T, RendererError>;

/// Handle to an off-screen render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(u64);

/// Handle to a sampleable color texture (a weak reference: holding one does
/// not keep the underlying target alive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(u64);

/// Handle to a scene registered with the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneHandle(u64);

/// Handle to a camera registered with the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraHandle(u64);

macro_rules! impl_handle {
    ($name:ident) => {
        impl $name {
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

impl_handle!(TargetHandle);
impl_handle!(TextureHandle);
impl_handle!(SceneHandle);
impl_handle!(CameraHandle);

/// Shared mutable renderer state threaded through passes.
///
/// Every pass that mutates this state must restore it symmetrically before
/// returning, except where a pass pair (mask / mask-clear) deliberately
/// spans the pipeline. The `locked` flags reproduce the lock discipline of
/// the mask passes: while a buffer's state is locked, `set_*` calls on it
/// are ignored.
#[derive(Debug, Clone)]
pub struct RenderState {
    pub clear_color: Vec3,
    pub clear_alpha: f32,
    pub auto_clear: bool,
    pub auto_clear_color: bool,
    pub auto_clear_depth: bool,
    pub auto_clear_stencil: bool,

    /// Currently bound render target; `None` means the screen.
    pub render_target: Option<TargetHandle>,

    pub color_write: bool,
    pub depth_write: bool,
    pub stencil: StencilState,

    color_locked: bool,
    depth_locked: bool,
    stencil_locked: bool,

    pub tone_mapping: ToneMapping,
    pub tone_mapping_exposure: f32,
    pub output_color_space: ColorSpace,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            clear_color: Vec3::ZERO,
            clear_alpha: 0.0,
            auto_clear: true,
            auto_clear_color: true,
            auto_clear_depth: true,
            auto_clear_stencil: true,
            render_target: None,
            color_write: true,
            depth_write: true,
            stencil: StencilState::default(),
            color_locked: false,
            depth_locked: false,
            stencil_locked: false,
            tone_mapping: ToneMapping::default(),
            tone_mapping_exposure: 1.0,
            output_color_space: ColorSpace::default(),
        }
    }
}

impl RenderState {
    pub fn set_color_write(&mut self, enabled: bool) {
        if !self.color_locked {
            self.color_write = enabled;
        }
    }

    pub fn lock_color_write(&mut self, locked: bool) {
        self.color_locked = locked;
    }

    pub fn set_depth_write(&mut self, enabled: bool) {
        if !self.depth_locked {
            self.depth_write = enabled;
        }
    }

    pub fn lock_depth_write(&mut self, locked: bool) {
        self.depth_locked = locked;
    }

    pub fn set_stencil_test(&mut self, enabled: bool) {
        if !self.stencil_locked {
            self.stencil.test = enabled;
        }
    }

    pub fn set_stencil_func(&mut self, compare: CompareFunction, reference: u32, read_mask: u32) {
        if !self.stencil_locked {
            self.stencil.func = StencilFunc {
                compare,
                reference,
                read_mask,
            };
        }
    }

    pub fn set_stencil_op(&mut self, fail: StencilOp, z_fail: StencilOp, z_pass: StencilOp) {
        if !self.stencil_locked {
            self.stencil.ops = StencilOps {
                fail,
                z_fail,
                z_pass,
            };
        }
    }

    pub fn set_stencil_clear(&mut self, value: u32) {
        if !self.stencil_locked {
            self.stencil.clear_value = value;
        }
    }

    pub fn lock_stencil(&mut self, locked: bool) {
        self.stencil_locked = locked;
    }
}

/// The renderer surface consumed by the compositor and its passes.
///
/// Size and write-mask/stencil/clear state live in a shared [`RenderState`]
/// exposed through `state()`/`state_mut()`; the trait provides default
/// accessors over it so implementations only supply resource management and
/// the actual draws.
pub trait Renderer {
    fn state(&self) -> &RenderState;
    fn state_mut(&mut self) -> &mut RenderState;

    /// Logical size in pixels, before the pixel-ratio scale.
    fn size(&self) -> (u32, u32);

    /// Device pixel ratio applied on top of the logical size.
    fn pixel_ratio(&self) -> f32;

    fn create_target(&mut self, desc: &RenderTargetDescriptor) -> RendererResult<TargetHandle>;

    fn destroy_target(&mut self, target: TargetHandle);

    /// The color texture of a target, for sampling by a later pass.
    fn target_texture(&self, target: TargetHandle) -> Option<TextureHandle>;

    /// Clear the currently bound target. Color and depth clears honor the
    /// respective write masks; the stencil clear uses the state's stencil
    /// clear value.
    fn clear(&mut self, color: bool, depth: bool, stencil: bool);

    /// Render a registered scene through a registered camera into the
    /// currently bound target.
    fn render_scene(&mut self, scene: SceneHandle, camera: CameraHandle) -> RendererResult<()>;

    /// Draw a full-screen material into the currently bound target,
    /// compiling it first if its defines or source changed.
    fn draw_fullscreen(&mut self, material: &mut ShaderMaterial) -> RendererResult<()>;

    /// Release all GPU state compiled for a material.
    fn destroy_material(&mut self, material: MaterialId);

    // State accessors with default implementations over `RenderState`.

    fn set_render_target(&mut self, target: Option<TargetHandle>) {
        self.state_mut().render_target = target;
    }

    fn render_target(&self) -> Option<TargetHandle> {
        self.state().render_target
    }

    fn clear_color(&self) -> (Vec3, f32) {
        let state = self.state();
        (state.clear_color, state.clear_alpha)
    }

    fn set_clear_color(&mut self, color: Vec3, alpha: f32) {
        let state = self.state_mut();
        state.clear_color = color;
        state.clear_alpha = alpha;
    }

    fn auto_clear(&self) -> bool {
        self.state().auto_clear
    }

    fn set_auto_clear(&mut self, value: bool) {
        self.state_mut().auto_clear = value;
    }

    fn set_color_write(&mut self, enabled: bool) {
        self.state_mut().set_color_write(enabled);
    }

    fn lock_color_write(&mut self, locked: bool) {
        self.state_mut().lock_color_write(locked);
    }

    fn set_depth_write(&mut self, enabled: bool) {
        self.state_mut().set_depth_write(enabled);
    }

    fn lock_depth_write(&mut self, locked: bool) {
        self.state_mut().lock_depth_write(locked);
    }

    fn stencil_test(&self) -> bool {
        self.state().stencil.test
    }

    fn set_stencil_test(&mut self, enabled: bool) {
        self.state_mut().set_stencil_test(enabled);
    }

    fn stencil_func(&self) -> StencilFunc {
        self.state().stencil.func
    }

    fn set_stencil_func(&mut self, compare: CompareFunction, reference: u32, read_mask: u32) {
        self.state_mut()
            .set_stencil_func(compare, reference, read_mask);
    }

    fn set_stencil_op(&mut self, fail: StencilOp, z_fail: StencilOp, z_pass: StencilOp) {
        self.state_mut().set_stencil_op(fail, z_fail, z_pass);
    }

    fn set_stencil_clear(&mut self, value: u32) {
        self.state_mut().set_stencil_clear(value);
    }

    fn lock_stencil(&mut self, locked: bool) {
        self.state_mut().lock_stencil(locked);
    }

    fn tone_mapping(&self) -> ToneMapping {
        self.state().tone_mapping
    }

    fn set_tone_mapping(&mut self, mode: ToneMapping) {
        self.state_mut().tone_mapping = mode;
    }

    fn tone_mapping_exposure(&self) -> f32 {
        self.state().tone_mapping_exposure
    }

    fn set_tone_mapping_exposure(&mut self, exposure: f32) {
        self.state_mut().tone_mapping_exposure = exposure;
    }

    fn output_color_space(&self) -> ColorSpace {
        self.state().output_color_space
    }

    fn set_output_color_space(&mut self, color_space: ColorSpace) {
        self.state_mut().output_color_space = color_space;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RendererError::OutOfMemory;
        assert_eq!(err.to_string(), "Out of memory");

        let err = RendererError::ShaderCompilationFailed("bad token".to_string());
        assert_eq!(err.to_string(), "Failed to compile shader: bad token");
    }

    #[test]
    fn test_locked_stencil_ignores_writes() {
        let mut state = RenderState::default();
        state.set_stencil_test(true);
        state.lock_stencil(true);
        state.set_stencil_test(false);
        state.set_stencil_func(CompareFunction::NotEqual, 7, 0xff);
        assert!(state.stencil.test);
        assert_eq!(state.stencil.func.compare, CompareFunction::Always);

        state.lock_stencil(false);
        state.set_stencil_test(false);
        assert!(!state.stencil.test);
    }

    #[test]
    fn test_locked_color_write() {
        let mut state = RenderState::default();
        state.set_color_write(false);
        state.lock_color_write(true);
        state.set_color_write(true);
        assert!(!state.color_write);
    }
}
