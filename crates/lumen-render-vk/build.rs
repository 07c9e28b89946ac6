// SPDX-License-Identifier: CEPL-1.0
// With the `shaderc` feature, compiles the GLSL in `shaders/` to SPIR-V in
// OUT_DIR and exports that directory as LUMEN_SHADER_DIR.

#[cfg(feature = "shaderc")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::{env, fs, path::PathBuf};

    let out = PathBuf::from(env::var("OUT_DIR")?);
    let src = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("../../shaders");

    let compiler = shaderc::Compiler::new()?;
    let mut opts = shaderc::CompileOptions::new()?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (name, kind) in [
        ("simple_shader.vert", shaderc::ShaderKind::Vertex),
        ("simple_shader.frag", shaderc::ShaderKind::Fragment),
    ] {
        let path = src.join(name);
        println!("cargo:rerun-if-changed={}", path.display());
        let source = fs::read_to_string(&path)?;
        let spv = compiler.compile_into_spirv(&source, kind, name, "main", Some(&opts))?;
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rustc-env=LUMEN_SHADER_DIR={}", out.display());
    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}

#[cfg(not(feature = "shaderc"))]
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
