//! Test harness: a renderer that records every operation instead of
//! touching a GPU, so tests can assert on the exact sequence of state
//! changes and draws a pipeline produces.

use glam::Vec3;
use postfx::material::{MaterialId, ShaderMaterial, UniformValue};
use postfx::renderer::traits::{
    CameraHandle, RenderState, Renderer, RendererResult, SceneHandle, TargetHandle, TextureHandle,
};
use postfx::renderer::types::{BlendState, RenderTargetDescriptor, StencilState};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateTarget {
        label: Option<String>,
        width: u32,
        height: u32,
    },
    DestroyTarget(u64),
    DestroyMaterial(u64),
    Clear {
        color: bool,
        depth: bool,
        stencil: bool,
        target: Option<u64>,
        clear_color: Vec3,
        clear_alpha: f32,
        stencil_clear: u32,
    },
    DrawFullscreen {
        label: String,
        target: Option<u64>,
        uniforms: Vec<(String, UniformValue)>,
        defines: Vec<String>,
        blending: Option<BlendState>,
        stencil: StencilState,
        color_write: bool,
        recompiled: bool,
    },
    RenderScene {
        scene: u64,
        camera: u64,
        target: Option<u64>,
        stencil: StencilState,
        color_write: bool,
        depth_write: bool,
    },
}

pub struct RecordingRenderer {
    state: RenderState,
    size: (u32, u32),
    pixel_ratio: f32,
    next_target_id: u64,
    pub targets: HashMap<u64, RenderTargetDescriptor>,
    pub ops: Vec<Op>,
}

impl RecordingRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_pixel_ratio(width, height, 1.0)
    }

    pub fn with_pixel_ratio(width: u32, height: u32, pixel_ratio: f32) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            state: RenderState::default(),
            size: (width, height),
            pixel_ratio,
            next_target_id: 1,
            targets: HashMap::new(),
            ops: Vec::new(),
        }
    }

    pub fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }

    /// Labels of the recorded full-screen draws, in order.
    pub fn draw_labels(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::DrawFullscreen { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Scenes and cameras are opaque to the recorder, so tests mint handles
    /// freely.
    pub fn scene(raw: u64) -> SceneHandle {
        SceneHandle::from_raw(raw)
    }

    pub fn camera(raw: u64) -> CameraHandle {
        CameraHandle::from_raw(raw)
    }
}

impl Renderer for RecordingRenderer {
    fn state(&self) -> &RenderState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RenderState {
        &mut self.state
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    fn create_target(&mut self, desc: &RenderTargetDescriptor) -> RendererResult<TargetHandle> {
        let id = self.next_target_id;
        self.next_target_id += 1;
        self.targets.insert(id, desc.clone());
        self.ops.push(Op::CreateTarget {
            label: desc.label.clone(),
            width: desc.width,
            height: desc.height,
        });
        Ok(TargetHandle::from_raw(id))
    }

    fn destroy_target(&mut self, target: TargetHandle) {
        self.targets.remove(&target.raw());
        self.ops.push(Op::DestroyTarget(target.raw()));
    }

    fn target_texture(&self, target: TargetHandle) -> Option<TextureHandle> {
        self.targets
            .contains_key(&target.raw())
            .then(|| TextureHandle::from_raw(target.raw()))
    }

    fn clear(&mut self, color: bool, depth: bool, stencil: bool) {
        self.ops.push(Op::Clear {
            color,
            depth,
            stencil,
            target: self.state.render_target.map(|t| t.raw()),
            clear_color: self.state.clear_color,
            clear_alpha: self.state.clear_alpha,
            stencil_clear: self.state.stencil.clear_value,
        });
    }

    fn render_scene(&mut self, scene: SceneHandle, camera: CameraHandle) -> RendererResult<()> {
        self.ops.push(Op::RenderScene {
            scene: scene.raw(),
            camera: camera.raw(),
            target: self.state.render_target.map(|t| t.raw()),
            stencil: self.state.stencil,
            color_write: self.state.color_write,
            depth_write: self.state.depth_write,
        });
        Ok(())
    }

    fn draw_fullscreen(&mut self, material: &mut ShaderMaterial) -> RendererResult<()> {
        let recompiled = material.take_needs_update();
        self.ops.push(Op::DrawFullscreen {
            label: material.label().to_string(),
            target: self.state.render_target.map(|t| t.raw()),
            uniforms: material.uniforms().to_vec(),
            defines: material.defines().keys().cloned().collect(),
            blending: material.blending,
            stencil: self.state.stencil,
            color_write: self.state.color_write,
            recompiled,
        });
        Ok(())
    }

    fn destroy_material(&mut self, material: MaterialId) {
        self.ops.push(Op::DestroyMaterial(material.raw()));
    }
}
