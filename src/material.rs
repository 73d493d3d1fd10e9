//! Shader materials: WGSL source plus a typed uniform bag
//!
//! A [`ShaderMaterial`] is owned by exactly one pass (or by the full-screen
//! quad inside it). Texture-valued uniforms hold weak [`TextureHandle`]s;
//! assigning one never transfers ownership of the underlying target.
//!
//! # GPU layout convention
//!
//! Renderer implementations derive the bind group layout from the uniform
//! declaration order: all non-texture uniforms form a single uniform buffer
//! at binding 0 (std140-style packing, see [`uniform_layout`]), each
//! texture uniform takes the next binding in declaration order, and a
//! shared linear sampler occupies the final binding whenever at least one
//! texture is declared. Pass shaders are written against this convention.

use crate::renderer::traits::TextureHandle;
use crate::renderer::types::BlendState;
use glam::{Vec2, Vec3, Vec4};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a material, used by renderers to cache compiled
/// pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(u64);

impl MaterialId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A typed uniform value
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    /// Weak reference to a render target's color texture
    Texture(Option<TextureHandle>),
    /// Array of scalars; each element occupies a 16-byte slot on the GPU
    FloatArray(Vec<f32>),
    /// Array of vectors; each element occupies a 16-byte slot on the GPU
    Vec3Array(Vec<Vec3>),
}

impl UniformValue {
    pub fn is_texture(&self) -> bool {
        matches!(self, UniformValue::Texture(_))
    }
}

/// A full-screen shader material: WGSL source, preprocessor defines, and
/// the uniform values bound when it is drawn.
#[derive(Debug, Clone)]
pub struct ShaderMaterial {
    id: MaterialId,
    label: String,
    source: String,
    uniforms: Vec<(String, UniformValue)>,
    defines: BTreeMap<String, String>,
    pub blending: Option<BlendState>,
    pub depth_test: bool,
    pub depth_write: bool,
    needs_update: bool,
    version: u64,
}

impl ShaderMaterial {
    pub fn new(label: &str, source: &str) -> Self {
        Self {
            id: MaterialId(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.to_string(),
            source: source.to_string(),
            uniforms: Vec::new(),
            defines: BTreeMap::new(),
            blending: None,
            depth_test: false,
            depth_write: false,
            needs_update: true,
            version: 0,
        }
    }

    pub fn id(&self) -> MaterialId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn with_uniform(mut self, name: &str, value: UniformValue) -> Self {
        self.set_uniform(name, value);
        self
    }

    pub fn with_blending(mut self, blending: BlendState) -> Self {
        self.blending = Some(blending);
        self
    }

    /// Set a uniform, appending it to the declaration order on first use.
    pub fn set_uniform(&mut self, name: &str, value: UniformValue) {
        if let Some(slot) = self.uniforms.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.uniforms.push((name.to_string(), value));
        }
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn uniform_mut(&mut self, name: &str) -> Option<&mut UniformValue> {
        self.uniforms
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Uniforms in declaration order (the GPU layout order).
    pub fn uniforms(&self) -> &[(String, UniformValue)] {
        &self.uniforms
    }

    /// Set a preprocessor define. Changing the define set invalidates the
    /// compiled shader.
    pub fn set_define(&mut self, name: &str, value: &str) {
        let changed = self.defines.get(name).map(String::as_str) != Some(value);
        if changed {
            self.defines.insert(name.to_string(), value.to_string());
            self.mark_needs_update();
        }
    }

    pub fn clear_defines(&mut self) {
        if !self.defines.is_empty() {
            self.defines.clear();
            self.mark_needs_update();
        }
    }

    pub fn has_define(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    pub fn defines(&self) -> &BTreeMap<String, String> {
        &self.defines
    }

    /// Flag the material for recompilation on its next draw.
    pub fn mark_needs_update(&mut self) {
        self.needs_update = true;
        self.version += 1;
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    /// Consume the needs-update flag; called by renderers once the material
    /// has been (re)compiled.
    pub fn take_needs_update(&mut self) -> bool {
        std::mem::replace(&mut self.needs_update, false)
    }

    /// Monotonic version, bumped on every source/define invalidation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Resolve `#ifdef`/`#ifndef`/`#else`/`#endif` blocks against the
    /// define set, producing plain WGSL.
    pub fn preprocess(&self) -> Result<String, String> {
        preprocess(&self.source, &self.defines)
    }
}

/// std140-style packing of a uniform list into bytes.
///
/// Scalars align to 4, `vec2` to 8, `vec3`/`vec4` to 16; array elements
/// occupy 16-byte slots; the total size rounds up to 16. Texture uniforms
/// contribute nothing here (they bind separately).
pub fn uniform_layout(uniforms: &[(String, UniformValue)]) -> Vec<u8> {
    let mut data: Vec<u8> = Vec::new();

    let align = |data: &mut Vec<u8>, alignment: usize| {
        while data.len() % alignment != 0 {
            data.push(0);
        }
    };

    for (_, value) in uniforms {
        match value {
            UniformValue::Float(v) => {
                align(&mut data, 4);
                data.extend_from_slice(bytemuck::bytes_of(v));
            }
            UniformValue::Int(v) => {
                align(&mut data, 4);
                data.extend_from_slice(bytemuck::bytes_of(v));
            }
            UniformValue::UInt(v) => {
                align(&mut data, 4);
                data.extend_from_slice(bytemuck::bytes_of(v));
            }
            UniformValue::Vec2(v) => {
                align(&mut data, 8);
                data.extend_from_slice(bytemuck::bytes_of(v));
            }
            UniformValue::Vec3(v) => {
                align(&mut data, 16);
                data.extend_from_slice(bytemuck::bytes_of(&v.extend(0.0)));
            }
            UniformValue::Vec4(v) => {
                align(&mut data, 16);
                data.extend_from_slice(bytemuck::bytes_of(v));
            }
            UniformValue::FloatArray(values) => {
                align(&mut data, 16);
                for v in values {
                    data.extend_from_slice(bytemuck::bytes_of(&Vec4::new(*v, 0.0, 0.0, 0.0)));
                }
            }
            UniformValue::Vec3Array(values) => {
                align(&mut data, 16);
                for v in values {
                    data.extend_from_slice(bytemuck::bytes_of(&v.extend(0.0)));
                }
            }
            UniformValue::Texture(_) => {}
        }
    }

    // Uniform buffer sizes round up to the struct alignment.
    if !data.is_empty() {
        while data.len() % 16 != 0 {
            data.push(0);
        }
    }

    data
}

fn preprocess(source: &str, defines: &BTreeMap<String, String>) -> Result<String, String> {
    // (parent_active, branch_taken, in_else)
    let mut stack: Vec<(bool, bool, bool)> = Vec::new();
    let mut output = String::with_capacity(source.len());

    for (number, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        let active = stack.iter().all(|(parent, taken, _)| *parent && *taken);

        if let Some(rest) = trimmed.strip_prefix("#ifdef") {
            let name = rest.trim();
            stack.push((active, defines.contains_key(name), false));
        } else if let Some(rest) = trimmed.strip_prefix("#ifndef") {
            let name = rest.trim();
            stack.push((active, !defines.contains_key(name), false));
        } else if trimmed.starts_with("#else") {
            let (_, taken, in_else) = stack
                .last_mut()
                .ok_or_else(|| format!("line {}: #else without #ifdef", number + 1))?;
            if *in_else {
                return Err(format!("line {}: duplicate #else", number + 1));
            }
            *taken = !*taken;
            *in_else = true;
        } else if trimmed.starts_with("#endif") {
            stack
                .pop()
                .ok_or_else(|| format!("line {}: #endif without #ifdef", number + 1))?;
        } else if active {
            output.push_str(line);
            output.push('\n');
        }
    }

    if !stack.is_empty() {
        return Err("unterminated #ifdef".to_string());
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defines(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), String::new()))
            .collect()
    }

    #[test]
    fn test_preprocess_ifdef() {
        let src = "a\n#ifdef FOO\nb\n#else\nc\n#endif\nd\n";
        assert_eq!(preprocess(src, &defines(&["FOO"])).unwrap(), "a\nb\nd\n");
        assert_eq!(preprocess(src, &defines(&[])).unwrap(), "a\nc\nd\n");
    }

    #[test]
    fn test_preprocess_nested() {
        let src = "#ifdef A\n#ifdef B\nx\n#endif\ny\n#endif\n";
        assert_eq!(preprocess(src, &defines(&["A", "B"])).unwrap(), "x\ny\n");
        assert_eq!(preprocess(src, &defines(&["A"])).unwrap(), "y\n");
        assert_eq!(preprocess(src, &defines(&["B"])).unwrap(), "");
    }

    #[test]
    fn test_preprocess_ifndef() {
        let src = "#ifndef A\nx\n#endif\n";
        assert_eq!(preprocess(src, &defines(&[])).unwrap(), "x\n");
        assert_eq!(preprocess(src, &defines(&["A"])).unwrap(), "");
    }

    #[test]
    fn test_preprocess_unbalanced() {
        assert!(preprocess("#endif\n", &defines(&[])).is_err());
        assert!(preprocess("#ifdef A\n", &defines(&[])).is_err());
        assert!(preprocess("#ifdef A\n#else\n#else\n#endif\n", &defines(&["A"])).is_err());
    }

    #[test]
    fn test_uniform_packing_alignment() {
        let uniforms = vec![
            ("a".to_string(), UniformValue::Vec2(Vec2::new(1.0, 2.0))),
            ("b".to_string(), UniformValue::Vec2(Vec2::new(3.0, 4.0))),
            ("c".to_string(), UniformValue::UInt(5)),
            (
                "w".to_string(),
                UniformValue::FloatArray(vec![0.5; 3]),
            ),
        ];
        let data = uniform_layout(&uniforms);
        // vec2 at 0, vec2 at 8, u32 at 16, array of 3 padded slots at 32.
        assert_eq!(data.len(), 32 + 3 * 16);
        let floats: &[f32] = bytemuck::cast_slice(&data[0..16]);
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0]);
        let slot: &[f32] = bytemuck::cast_slice(&data[32..48]);
        assert_eq!(slot[0], 0.5);
    }

    #[test]
    fn test_uniform_packing_vec3_padding() {
        let uniforms = vec![
            ("a".to_string(), UniformValue::Float(1.0)),
            ("b".to_string(), UniformValue::Vec3(Vec3::ONE)),
        ];
        let data = uniform_layout(&uniforms);
        assert_eq!(data.len(), 32);
        let floats: &[f32] = bytemuck::cast_slice(&data);
        assert_eq!(floats[4], 1.0); // vec3 starts at offset 16
    }

    #[test]
    fn test_set_define_marks_update() {
        let mut mat = ShaderMaterial::new("test", "fn f() {}");
        mat.take_needs_update();
        mat.set_define("FOO", "");
        assert!(mat.needs_update());
        let version = mat.version();
        mat.take_needs_update();
        // Re-setting the same value is a no-op.
        mat.set_define("FOO", "");
        assert!(!mat.needs_update());
        assert_eq!(mat.version(), version);
    }

    #[test]
    fn test_uniform_declaration_order_stable() {
        let mut mat = ShaderMaterial::new("test", "");
        mat.set_uniform("b", UniformValue::Float(1.0));
        mat.set_uniform("a", UniformValue::Float(2.0));
        mat.set_uniform("b", UniformValue::Float(3.0));
        let names: Vec<_> = mat.uniforms().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(mat.uniform("b"), Some(&UniformValue::Float(3.0)));
    }
}
