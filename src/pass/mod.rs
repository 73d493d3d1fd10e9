//! Pipeline pass contract
//!
//! Concrete passes live in the submodules; the compositor drives them in
//! list order through the [`Pass`] trait.

use crate::renderer::traits::{Renderer, RendererResult};
use crate::target::RenderTarget;
use std::any::Any;

pub mod bloom;
pub mod mask;
pub mod output;
pub mod scene;
pub mod shader;

pub use bloom::BloomPass;
pub use mask::{ClearMaskPass, MaskPass};
pub use output::OutputPass;
pub use scene::ScenePass;
pub use shader::ShaderPass;

/// Per-pass flags mutated by the compositor each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassState {
    /// Disabled passes are skipped entirely.
    pub enabled: bool,
    /// Whether the pass's output becomes the new read buffer afterwards.
    pub needs_swap: bool,
    /// Whether the pass clears its target before drawing.
    pub clear: bool,
    /// Recomputed by the compositor every frame; true only for the last
    /// enabled pass when the compositor itself targets the screen.
    pub render_to_screen: bool,
}

impl Default for PassState {
    fn default() -> Self {
        Self {
            enabled: true,
            needs_swap: true,
            clear: false,
            render_to_screen: false,
        }
    }
}

/// A single stage of the post-processing pipeline.
///
/// `render` reads from `read` (or its own upstream source) and writes into
/// `write`, or directly to the screen when `render_to_screen` is set for
/// this frame. Target identity does not survive across frames: the
/// compositor swaps the pair after every swapping pass.
pub trait Pass: Any {
    /// Pass name for logging.
    fn name(&self) -> &str;

    fn state(&self) -> &PassState;

    fn state_mut(&mut self) -> &mut PassState;

    /// Resize internal targets, if any.
    fn set_size(
        &mut self,
        _renderer: &mut dyn Renderer,
        _width: u32,
        _height: u32,
    ) -> RendererResult<()> {
        Ok(())
    }

    fn render(
        &mut self,
        renderer: &mut dyn Renderer,
        write: &RenderTarget,
        read: &RenderTarget,
        delta_seconds: f32,
        mask_active: bool,
    ) -> RendererResult<()>;

    /// Release GPU resources owned exclusively by the pass.
    fn dispose(&mut self, _renderer: &mut dyn Renderer) {}

    /// Allow downcasting
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
