// SPDX-License-Identifier: CEPL-1.0
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "lumen.toml";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RenderConfig {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    /// Forces FIFO presentation.
    #[serde(default)]
    pub vsync: bool,
    #[serde(default = "default_validation")]
    pub validation: bool,
    #[serde(default = "default_shader_dir")]
    pub shader_dir: PathBuf,
    #[serde(default = "default_vertex_shader")]
    pub vertex_shader: PathBuf,
    #[serde(default = "default_fragment_shader")]
    pub fragment_shader: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct MeshConfig {
    /// 0 draws the plain triangle.
    #[serde(default)]
    pub sierpinski_depth: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            clear_color: default_clear(),
            vsync: false,
            validation: default_validation(),
            shader_dir: default_shader_dir(),
            vertex_shader: default_vertex_shader(),
            fragment_shader: default_fragment_shader(),
        }
    }
}

impl RenderConfig {
    /// Shader paths are relative to `shader_dir` unless absolute.
    pub fn vertex_shader_path(&self) -> PathBuf {
        self.shader_dir.join(&self.vertex_shader)
    }

    pub fn fragment_shader_path(&self) -> PathBuf {
        self.shader_dir.join(&self.fragment_shader)
    }
}

fn default_title() -> String {
    "Lumen".to_owned()
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_clear() -> [f32; 4] {
    [0.1, 0.1, 0.1, 1.0]
}
fn default_validation() -> bool {
    cfg!(debug_assertions)
}
fn default_shader_dir() -> PathBuf {
    PathBuf::from(lumen_render_vk::COMPILED_SHADER_DIR.unwrap_or("shaders"))
}
fn default_vertex_shader() -> PathBuf {
    PathBuf::from("simple_shader.vert.spv")
}
fn default_fragment_shader() -> PathBuf {
    PathBuf::from("simple_shader.frag.spv")
}

pub fn parse(text: &str) -> Result<AppConfig, toml::de::Error> {
    toml::from_str(text)
}

/// Reads `path`, falling back to defaults when it is missing or invalid.
pub fn load(path: &Path) -> AppConfig {
    match fs::read_to_string(path) {
        Ok(text) => match parse(&text) {
            Ok(cfg) => {
                info!("loaded {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("ignoring {}: {e}", path.display());
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            warn!("cannot read {}: {e}; using defaults", path.display());
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.window.title, "Lumen");
        assert_eq!((cfg.window.width, cfg.window.height), (800, 600));
        assert_eq!(cfg.render.clear_color, [0.1, 0.1, 0.1, 1.0]);
        assert!(!cfg.render.vsync);
        assert_eq!(cfg.mesh.sierpinski_depth, 0);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let cfg = parse(
            r#"
            [window]
            title = "demo"

            [render]
            vsync = true
            shader_dir = "/opt/lumen/spv"

            [mesh]
            sierpinski_depth = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.title, "demo");
        assert_eq!(cfg.window.width, 800);
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.clear_color, default_clear());
        assert_eq!(
            cfg.render.vertex_shader_path(),
            PathBuf::from("/opt/lumen/spv/simple_shader.vert.spv")
        );
        assert_eq!(cfg.mesh.sierpinski_depth, 3);
    }

    #[test]
    fn absolute_shader_names_win_over_the_directory() {
        let cfg = parse(
            r#"
            [render]
            fragment_shader = "/tmp/custom.frag.spv"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.render.fragment_shader_path(),
            PathBuf::from("/tmp/custom.frag.spv")
        );
    }

    #[test]
    fn bad_files_fall_back_to_defaults() {
        assert!(parse("[window]\nwidth = \"wide\"").is_err());

        let dir = std::env::temp_dir().join(format!("lumen-config-tests-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.toml");
        fs::write(&path, "[render\nvsync = ").unwrap();
        assert_eq!(load(&path), AppConfig::default());

        assert_eq!(load(&dir.join("missing.toml")), AppConfig::default());
    }
}
