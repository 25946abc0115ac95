//! Shader sources, define injection and pipeline helpers

mod cache;

pub use cache::RaytracePipelineCache;

use crate::{Error, Result, LIGHTMAP_FORMAT};

pub const RAYTRACE_SHADER: &str = include_str!("../../shaders/raytrace.wgsl");
pub const RESOLVE_SHADER: &str = include_str!("../../shaders/resolve.wgsl");
pub const BLUR_SHADER: &str = include_str!("../../shaders/blur.wgsl");
pub const COPY_SHADER: &str = include_str!("../../shaders/copy.wgsl");

/// Value of a pipeline-overridable shader constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShaderDefine {
    Bool(bool),
    U32(u32),
    F32(f32),
}

/// Prepends `override` declarations for `defines` to `source`
pub fn apply_defines(source: &str, defines: &[(&str, ShaderDefine)]) -> String {
    let mut result = String::new();
    for (name, value) in defines {
        match value {
            ShaderDefine::Bool(b) => result.push_str(&format!("override {}: bool = {};\n", name, b)),
            ShaderDefine::U32(u) => result.push_str(&format!("override {}: u32 = {}u;\n", name, u)),
            ShaderDefine::F32(f) => result.push_str(&format!("override {}: f32 = {:?};\n", name, f)),
        }
    }
    result.push_str(source);
    result
}

/// Runs `create` inside a validation error scope.
///
/// wgpu reports invalid shaders and pipelines asynchronously; the scope turns
/// them into an [`Error::Pipeline`] instead of an uncaptured panic.
pub(crate) fn validated<T>(device: &wgpu::Device, what: &str, create: impl FnOnce() -> T) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(Error::Pipeline(format!("{what}: {err}"))),
        None => Ok(value),
    }
}

/// Pipeline drawing one fullscreen triangle into a bake image
pub(crate) fn create_screen_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        cache: None,
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: LIGHTMAP_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) {
        let module = match naga::front::wgsl::parse_str(source) {
            Ok(module) => module,
            Err(err) => panic!("{}", err.emit_to_string(source)),
        };
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap_or_else(|err| panic!("{err:?}"));
    }

    fn raytrace_defines(bits: u32) -> Vec<(&'static str, ShaderDefine)> {
        let flags = helio_lightmap::RaytraceFlags::from_bits_truncate(bits);
        RaytracePipelineCache::defines(flags)
    }

    #[test]
    fn every_raytrace_variant_validates() {
        for bits in 0..helio_lightmap::RaytraceFlags::VARIANT_COUNT as u32 {
            validate(&apply_defines(RAYTRACE_SHADER, &raytrace_defines(bits)));
        }
    }

    #[test]
    fn post_process_shaders_validate() {
        validate(RESOLVE_SHADER);
        validate(COPY_SHADER);
        for horizontal in [false, true] {
            validate(&apply_defines(
                BLUR_SHADER,
                &[("BLUR_HORIZONTAL", ShaderDefine::Bool(horizontal))],
            ));
        }
    }

    #[test]
    fn defines_are_prepended_as_overrides() {
        let src = apply_defines(
            "fn main() {}",
            &[
                ("A", ShaderDefine::Bool(true)),
                ("B", ShaderDefine::U32(3)),
                ("C", ShaderDefine::F32(0.5)),
            ],
        );
        assert_eq!(
            src,
            "override A: bool = true;\noverride B: u32 = 3u;\noverride C: f32 = 0.5;\nfn main() {}"
        );
    }
}
