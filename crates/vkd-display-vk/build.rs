use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Six vertices covering the viewport; no vertex buffer.
    let vs_src = r#"
#version 450
const vec2 CORNERS[6] = vec2[](
    vec2(-1.0, -1.0), vec2(1.0, -1.0), vec2(1.0, 1.0),
    vec2(1.0, 1.0), vec2(-1.0, 1.0), vec2(-1.0, -1.0)
);

void main() {
    gl_Position = vec4(CORNERS[gl_VertexIndex], 0.0, 1.0);
}
"#;

    // Samples the frame relative to the render area pushed by the host.
    //   - set 0, binding 1: combined image sampler (immutable sampler)
    //   - push constant: { uint x, y, width, height }, fragment stage
    let fs_src = r#"
#version 450
layout(set = 0, binding = 1) uniform sampler2D frame;
layout(push_constant) uniform RenderArea {
    uint x;
    uint y;
    uint width;
    uint height;
} area;

layout(location = 0) out vec4 outColor;

void main() {
    vec2 origin = vec2(float(area.x), float(area.y));
    vec2 size = vec2(float(area.width), float(area.height));
    outColor = texture(frame, (gl_FragCoord.xy - origin) / size);
}
"#;

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let vs_spv = comp
        .compile_into_spirv(
            vs_src,
            shaderc::ShaderKind::Vertex,
            "quad.vert",
            "main",
            Some(&opts),
        )
        .unwrap();

    let fs_spv = comp
        .compile_into_spirv(
            fs_src,
            shaderc::ShaderKind::Fragment,
            "quad.frag",
            "main",
            Some(&opts),
        )
        .unwrap();

    fs::write(out.join("quad.vert.spv"), vs_spv.as_binary_u8()).unwrap();
    fs::write(out.join("quad.frag.spv"), fs_spv.as_binary_u8()).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
