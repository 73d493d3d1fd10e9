//! Renderer abstraction and the wgpu implementation

pub mod traits;
pub mod types;
pub mod wgpu_renderer;

pub use traits::{
    CameraHandle, RenderState, Renderer, RendererError, RendererResult, SceneHandle,
    TargetHandle, TextureHandle,
};
pub use types::*;
pub use wgpu_renderer::{CameraParams, SceneCallback, SceneDrawParams, WgpuRenderer};
