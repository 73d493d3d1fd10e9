//! Off-screen render target ownership
//!
//! A [`RenderTarget`] is owned by exactly one party: the compositor owns the
//! two ping-pong buffers, and a pass owns whatever private scratch targets
//! it needs. Other passes only ever see a target through the weak texture
//! handle of its color buffer.

use crate::renderer::traits::{Renderer, RendererError, RendererResult, TargetHandle, TextureHandle};
use crate::renderer::types::RenderTargetDescriptor;

/// An off-screen color buffer (plus optional depth/stencil buffer) with a
/// fixed pixel size.
#[derive(Debug)]
pub struct RenderTarget {
    handle: TargetHandle,
    texture: TextureHandle,
    desc: RenderTargetDescriptor,
}

impl RenderTarget {
    pub fn new(renderer: &mut dyn Renderer, desc: RenderTargetDescriptor) -> RendererResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            log::warn!(
                "allocating degenerate render target {:?} ({}x{})",
                desc.label,
                desc.width,
                desc.height
            );
        }
        let handle = renderer.create_target(&desc)?;
        let texture = renderer.target_texture(handle).ok_or_else(|| {
            RendererError::InvalidHandle(format!("target {:?} has no color texture", desc.label))
        })?;
        Ok(Self {
            handle,
            texture,
            desc,
        })
    }

    pub fn handle(&self) -> TargetHandle {
        self.handle
    }

    /// Weak handle to the color texture, for sampling by a later pass.
    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn descriptor(&self) -> &RenderTargetDescriptor {
        &self.desc
    }

    /// Reallocate at a new pixel size. A no-op when the size is unchanged;
    /// otherwise the old GPU buffers are released and any texture handles
    /// previously obtained from this target go stale.
    pub fn set_size(
        &mut self,
        renderer: &mut dyn Renderer,
        width: u32,
        height: u32,
    ) -> RendererResult<()> {
        if (width, height) == (self.desc.width, self.desc.height) {
            return Ok(());
        }
        renderer.destroy_target(self.handle);
        self.desc.width = width;
        self.desc.height = height;
        let recreated = Self::new(renderer, self.desc.clone())?;
        *self = recreated;
        Ok(())
    }

    /// Release the GPU buffers. The target must not be used afterwards.
    pub fn dispose(&mut self, renderer: &mut dyn Renderer) {
        renderer.destroy_target(self.handle);
    }
}
