//! Post-processing pipeline driver
//!
//! The [`Compositor`] owns a pair of ping-pong render targets and an
//! ordered list of passes. Each frame it walks the list: every enabled
//! pass reads from the read buffer and writes into the write buffer (or
//! straight to the screen for the last enabled pass), and the pair swaps
//! after every pass that requests it.

use crate::pass::mask::{ClearMaskPass, MaskPass, MASK_WRITE_VALUE};
use crate::pass::{Pass, ShaderPass};
use crate::renderer::traits::{Renderer, RendererResult};
use crate::renderer::types::{CompareFunction, RenderTargetDescriptor};
use crate::target::RenderTarget;

pub struct Compositor {
    targets: [RenderTarget; 2],
    write_index: usize,
    read_index: usize,
    passes: Vec<Box<dyn Pass>>,
    copy_pass: ShaderPass,
    /// Logical size; the pixel ratio scales the physical allocation.
    width: u32,
    height: u32,
    pixel_ratio: f32,
    /// When false the whole pipeline stays off-screen, even for the last
    /// pass.
    pub render_to_screen: bool,
}

impl Compositor {
    /// Create a compositor with the given target descriptor, or one derived
    /// from the renderer's current drawing-buffer size.
    pub fn new(
        renderer: &mut dyn Renderer,
        descriptor: Option<RenderTargetDescriptor>,
    ) -> RendererResult<Self> {
        let (width, height) = renderer.size();
        let pixel_ratio = renderer.pixel_ratio();
        let descriptor = descriptor.unwrap_or_else(|| RenderTargetDescriptor {
            width: (width as f32 * pixel_ratio).round() as u32,
            height: (height as f32 * pixel_ratio).round() as u32,
            ..RenderTargetDescriptor::default()
        });

        let mut write_desc = descriptor.clone();
        write_desc.label = Some("compositor.write".to_string());
        let mut read_desc = descriptor;
        read_desc.label = Some("compositor.read".to_string());

        let targets = [
            RenderTarget::new(renderer, write_desc)?,
            RenderTarget::new(renderer, read_desc)?,
        ];

        Ok(Self {
            targets,
            write_index: 0,
            read_index: 1,
            passes: Vec::new(),
            copy_pass: ShaderPass::copy(),
            width,
            height,
            pixel_ratio,
            render_to_screen: true,
        })
    }

    fn scaled_size(&self) -> (u32, u32) {
        (
            (self.width as f32 * self.pixel_ratio).round() as u32,
            (self.height as f32 * self.pixel_ratio).round() as u32,
        )
    }

    pub fn write_buffer(&self) -> &RenderTarget {
        &self.targets[self.write_index]
    }

    pub fn read_buffer(&self) -> &RenderTarget {
        &self.targets[self.read_index]
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn insert_pass(&mut self, index: usize, pass: Box<dyn Pass>) {
        self.passes.insert(index, pass);
    }

    /// Remove and return the pass at `index`. The caller keeps ownership
    /// and is responsible for disposing it.
    pub fn remove_pass(&mut self, index: usize) -> Box<dyn Pass> {
        self.passes.remove(index)
    }

    pub fn passes(&self) -> &[Box<dyn Pass>] {
        &self.passes
    }

    pub fn pass(&self, index: usize) -> Option<&dyn Pass> {
        self.passes.get(index).map(Box::as_ref)
    }

    pub fn pass_mut(&mut self, index: usize) -> Option<&mut (dyn Pass + 'static)> {
        self.passes.get_mut(index).map(Box::as_mut)
    }

    /// True when no enabled pass follows `index`.
    pub fn is_last_enabled_pass(&self, index: usize) -> bool {
        self.passes
            .iter()
            .skip(index + 1)
            .all(|pass| !pass.state().enabled)
    }

    pub fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.write_index, &mut self.read_index);
    }

    /// Run every enabled pass in order. The previously bound render target
    /// is restored afterwards, whether or not a pass fails.
    pub fn render(&mut self, renderer: &mut dyn Renderer, delta_seconds: f32) -> RendererResult<()> {
        let saved_target = renderer.render_target();
        let result = self.render_passes(renderer, delta_seconds);
        renderer.set_render_target(saved_target);
        result
    }

    fn render_passes(
        &mut self,
        renderer: &mut dyn Renderer,
        delta_seconds: f32,
    ) -> RendererResult<()> {
        let mut mask_active = false;

        for i in 0..self.passes.len() {
            if !self.passes[i].state().enabled {
                continue;
            }

            let to_screen = self.render_to_screen && self.is_last_enabled_pass(i);
            self.passes[i].state_mut().render_to_screen = to_screen;
            self.passes[i].render(
                renderer,
                &self.targets[self.write_index],
                &self.targets[self.read_index],
                delta_seconds,
                mask_active,
            )?;

            if self.passes[i].state().needs_swap {
                if mask_active {
                    // Carry the unmasked region of the read buffer forward:
                    // blit it into the write buffer wherever the stencil does
                    // NOT match the mask, then re-arm the mask test.
                    debug_assert!(renderer.stencil_test());
                    renderer.lock_stencil(false);
                    renderer.set_stencil_func(
                        CompareFunction::NotEqual,
                        MASK_WRITE_VALUE,
                        0xffffffff,
                    );
                    self.copy_pass.render(
                        renderer,
                        &self.targets[self.write_index],
                        &self.targets[self.read_index],
                        delta_seconds,
                        mask_active,
                    )?;
                    renderer.set_stencil_func(
                        CompareFunction::Equal,
                        MASK_WRITE_VALUE,
                        0xffffffff,
                    );
                    renderer.lock_stencil(true);
                }
                self.swap_buffers();
            }

            let pass = self.passes[i].as_any();
            if pass.is::<MaskPass>() {
                mask_active = true;
            } else if pass.is::<ClearMaskPass>() {
                mask_active = false;
            }
        }

        Ok(())
    }

    /// Recreate both ping-pong targets, optionally from a new descriptor.
    /// Pass-internal targets are untouched; call [`set_size`](Self::set_size)
    /// for a plain resize.
    pub fn reset(
        &mut self,
        renderer: &mut dyn Renderer,
        descriptor: Option<RenderTargetDescriptor>,
    ) -> RendererResult<()> {
        let descriptor = descriptor.unwrap_or_else(|| {
            let (width, height) = self.scaled_size();
            let mut desc = self.targets[0].descriptor().clone();
            desc.width = width;
            desc.height = height;
            desc
        });

        for (target, label) in self
            .targets
            .iter_mut()
            .zip(["compositor.write", "compositor.read"])
        {
            target.dispose(renderer);
            let mut desc = descriptor.clone();
            desc.label = Some(label.to_string());
            *target = RenderTarget::new(renderer, desc)?;
        }
        self.write_index = 0;
        self.read_index = 1;
        Ok(())
    }

    /// Resize the ping-pong targets and every pass to a new logical size.
    /// The pixel ratio scales the physical allocation.
    pub fn set_size(
        &mut self,
        renderer: &mut dyn Renderer,
        width: u32,
        height: u32,
    ) -> RendererResult<()> {
        self.width = width;
        self.height = height;
        let (scaled_width, scaled_height) = self.scaled_size();

        for target in &mut self.targets {
            target.set_size(renderer, scaled_width, scaled_height)?;
        }
        for pass in &mut self.passes {
            pass.set_size(renderer, scaled_width, scaled_height)?;
        }
        Ok(())
    }

    /// Change the device pixel ratio and reallocate everything at the new
    /// physical size.
    pub fn set_pixel_ratio(
        &mut self,
        renderer: &mut dyn Renderer,
        pixel_ratio: f32,
    ) -> RendererResult<()> {
        self.pixel_ratio = pixel_ratio;
        self.set_size(renderer, self.width, self.height)
    }

    /// Release the ping-pong targets and the internal copy pass. Passes
    /// added by the caller remain the caller's to dispose.
    pub fn dispose(&mut self, renderer: &mut dyn Renderer) {
        for target in &mut self.targets {
            target.dispose(renderer);
        }
        self.copy_pass.dispose(renderer);
    }
}
