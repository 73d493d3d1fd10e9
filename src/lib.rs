//! postfx - a post-processing compositor on wgpu
//!
//! A scene renders into an off-screen target, then an ordered chain of
//! full-screen passes refines the image before the last enabled pass
//! presents it. The compositor owns a ping-pong pair of render targets;
//! each pass samples one and draws into the other.
//!
//! # Features
//! - Ordered pass pipeline over ping-pong render targets
//! - Stencil mask passes to confine effects to a scene's silhouette
//! - Five-mip Unreal-style bloom
//! - Tone-mapping output pass (Reinhard, Cineon, ACES filmic, AgX, neutral)
//! - Renderer abstraction with a stock wgpu implementation

pub mod compositor;
pub mod fullscreen;
pub mod material;
pub mod pass;
pub mod renderer;
pub mod target;

pub use compositor::Compositor;
pub use fullscreen::{fullscreen_shader, FullScreenQuad, FULLSCREEN_VERTEX_SHADER};
pub use material::{MaterialId, ShaderMaterial, UniformValue};
pub use pass::{BloomPass, ClearMaskPass, MaskPass, OutputPass, Pass, PassState, ScenePass, ShaderPass};
pub use renderer::{
    CameraParams, ColorSpace, CompareFunction, RenderState, RenderTargetDescriptor, Renderer,
    RendererError, RendererResult, SceneDrawParams, StencilOp, TextureFormat, ToneMapping,
    WgpuRenderer,
};
pub use target::RenderTarget;
