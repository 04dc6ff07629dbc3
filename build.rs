// Build script to compile GLSL shaders to SPIR-V
//
// Output lands next to the source as `<name>.<stage>.spv`, which is where
// the renderer looks for it at runtime. A missing glslc is not an error.

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &[
    "fullscreen.vert",
    "screen_quad.frag",
    "gbuffer.vert",
    "gbuffer.frag",
    "deferred_resolve.frag",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for name in SHADERS {
        let input = format!("shaders/{}", name);
        let output = format!("shaders/{}.spv", name);
        if !compile_shader(&input, &output) {
            break;
        }
    }
}

/// Returns `false` when glslc itself is unavailable.
fn compile_shader(input: &str, output: &str) -> bool {
    let result = Command::new("glslc")
        .arg(Path::new(input))
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => true,
        Ok(status) => {
            println!("cargo:warning=Failed to compile {}: exit code {:?}", input, status.code());
            true
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}); shaders were not compiled", e);
            println!("cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}", input, output);
            false
        }
    }
}
