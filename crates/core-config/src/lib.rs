//! Configuration loading and parsing.
//!
//! The host parses `tesh.toml` (or an override path provided by the binary)
//! into a [`Config`]. Every field has a default so an absent or partial file
//! still yields a working configuration; unknown fields are ignored (TOML
//! deserialization tolerance) to allow forward evolution without warnings.
//!
//! The 256-entry color theme follows the conventional terminal layout: 16
//! ANSI colors, a 6x6x6 color cube, and a 24-step grayscale ramp. Theme
//! entries and the semantic color slots can be overridden individually.

use std::{fs, path::PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

/// RGB color. TOML form is a `[r, g, b]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Color(pub u8, pub u8, pub u8);

/// What the viewport does when a new command spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollMode {
    #[default]
    AutoScroll,
    AutoPage,
    Manual,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigFile {
    pub escape_closes: bool,
    pub on_spawn_attach: bool,
    pub on_spawn_scroll_mode: ScrollMode,
    pub on_select_auto_copy: bool,
    pub font_path: String,
    pub default_font_size: u32,
    pub tab_width: u32,
    pub max_length: u64,
    pub windows_wide_terminal: bool,
    pub case_sensitive_completion: bool,
    pub control_delete_kill_process: bool,
    pub backlog_info_render_date: bool,
    /// A bare carriage return rewinds the stored line. See the backlog docs.
    pub cr_clears_line: bool,
    /// 0 = absolute minimum, 1 = compromise, 2 = everything builtin.
    pub builtin_level: u8,

    pub colors: ColorSlots,
    /// Sparse theme overrides: `theme.208 = [255, 135, 0]`. TOML keys are
    /// strings; slot indices are parsed when the theme is built.
    pub theme: std::collections::BTreeMap<String, Color>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            escape_closes: false,
            on_spawn_attach: false,
            on_spawn_scroll_mode: ScrollMode::AutoScroll,
            on_select_auto_copy: true,
            font_path: default_font_path(),
            default_font_size: 12,
            tab_width: 8,
            max_length: 1 << 30,
            windows_wide_terminal: true,
            case_sensitive_completion: false,
            control_delete_kill_process: true,
            backlog_info_render_date: false,
            cr_clears_line: true,
            builtin_level: 1,
            colors: ColorSlots::default(),
            theme: Default::default(),
        }
    }
}

/// Semantic slots: indices into the 256-entry theme.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ColorSlots {
    pub backlog_fg: u8,
    pub directory_fg: u8,
    pub prompt_fg: u8,
    pub info_success_fg: u8,
    pub info_failure_fg: u8,
    pub info_running_fg: u8,
    pub selection_fg: u8,
    pub selected_completion_fg: u8,
}

impl Default for ColorSlots {
    fn default() -> Self {
        Self {
            backlog_fg: 7,
            directory_fg: 12,
            prompt_fg: 15,
            info_success_fg: 10,
            info_failure_fg: 9,
            info_running_fg: 11,
            selection_fg: 0,
            selected_completion_fg: 0,
        }
    }
}

/// Effective configuration handed to the core.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: ConfigFile,
    pub theme: Box<[Color; 256]>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl Config {
    pub fn from_file(file: ConfigFile) -> Self {
        let mut theme = default_theme();
        for (key, &color) in &file.theme {
            match key.parse::<u8>() {
                Ok(index) => theme[index as usize] = color,
                Err(_) => warn!(target: "config", key = %key, "ignoring non-numeric theme slot"),
            }
        }
        Self { file, theme }
    }

    pub fn max_length(&self) -> u64 {
        self.file.max_length
    }

    pub fn builtin_level(&self) -> u8 {
        self.file.builtin_level.min(2)
    }

    pub fn slot_color(&self, slot: u8) -> Color {
        self.theme[slot as usize]
    }
}

fn default_font_path() -> String {
    if cfg!(windows) {
        "C:/Windows/Fonts/consola.ttf".to_string()
    } else {
        "/usr/share/fonts/TTF/DejaVuSansMono.ttf".to_string()
    }
}

/// The conventional xterm 256-color table.
fn default_theme() -> Box<[Color; 256]> {
    let mut theme = Box::new([Color(0, 0, 0); 256]);

    // 16 ANSI colors (dim block then bright block).
    const ANSI: [Color; 16] = [
        Color(0x00, 0x00, 0x00),
        Color(0xcd, 0x00, 0x00),
        Color(0x00, 0xcd, 0x00),
        Color(0xcd, 0xcd, 0x00),
        Color(0x00, 0x00, 0xee),
        Color(0xcd, 0x00, 0xcd),
        Color(0x00, 0xcd, 0xcd),
        Color(0xe5, 0xe5, 0xe5),
        Color(0x7f, 0x7f, 0x7f),
        Color(0xff, 0x00, 0x00),
        Color(0x00, 0xff, 0x00),
        Color(0xff, 0xff, 0x00),
        Color(0x5c, 0x5c, 0xff),
        Color(0xff, 0x00, 0xff),
        Color(0x00, 0xff, 0xff),
        Color(0xff, 0xff, 0xff),
    ];
    theme[..16].copy_from_slice(&ANSI);

    // 6x6x6 color cube.
    const STEPS: [u8; 6] = [0x00, 0x5f, 0x87, 0xaf, 0xd7, 0xff];
    for r in 0..6 {
        for g in 0..6 {
            for b in 0..6 {
                theme[16 + 36 * r + 6 * g + b] = Color(STEPS[r], STEPS[g], STEPS[b]);
            }
        }
    }

    // Grayscale ramp.
    for i in 0..24 {
        let v = (8 + 10 * i) as u8;
        theme[232 + i] = Color(v, v, v);
    }

    theme
}

/// Best-effort config path following platform conventions: a local
/// `tesh.toml` wins, then the platform config directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("tesh.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("tesh").join("tesh.toml");
    }
    PathBuf::from("tesh.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "config", path = %path.display(), "config loaded");
                Ok(Config::from_file(file))
            }
            Err(error) => {
                // Fall back to defaults rather than refusing to start.
                warn!(target: "config", path = %path.display(), %error, "config parse failed, using defaults");
                Ok(Config::default())
            }
        }
    } else {
        Ok(Config::default())
    }
}
