//! Per-ROM test tables
//!
//! Canon persists menu state (cursor positions included) in ROM, so a key
//! script only reproduces the same screens on the dump it was recorded on.
//! Every table is therefore keyed by the code ROM MD5, never the model name.
//!
//! The built-in tables can be extended or overridden from a YAML file:
//!
//! ```yaml
//! known_roms:
//!   5D3: [e6a90e8497c2c1187e0322010a42b9b5]
//! menu_sequences:
//!   e6a90e8497c2c1187e0322010a42b9b5: [m, "wait l", m]
//! log_lines:
//!   e6a90e8497c2c1187e0322010a42b9b5: ["K285 READY"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::common::{Error, Result};

/// Token prefix selecting the slow pre-capture delay
const WAIT_PREFIX: &str = "wait ";

const ROM_5D3: &str = "e6a90e8497c2c1187e0322010a42b9b5";
const ROM_50D: &str = "424545a5cfe10b1a5d8cefffe9fe5297";
const ROM_60D: &str = "d266ce304585952fb3a05a9f6c304f2f";
const ROM_100D: &str = "e06a0e3919ac4d4ef609a864e937a5d3";
const ROM_500D: &str = "0a9fce1e4ef6d2ac2c3bc63eb96d3c34";
const ROM_700D: &str = "f6c20df071b3514fa65f35dc5d71b484";

/// One key of a menu script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStep {
    pub key: String,
    /// Wait longer before capturing, for slow screen transitions
    pub slow: bool,
}

impl KeyStep {
    /// Parse a script token, `"left"` or `"wait l"`
    pub fn parse(token: &str) -> Self {
        match token.strip_prefix(WAIT_PREFIX) {
            Some(key) => Self {
                key: key.trim().to_string(),
                slow: true,
            },
            None => Self {
                key: token.trim().to_string(),
                slow: false,
            },
        }
    }
}

/// Known ROMs, menu key scripts and expected log lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBook {
    /// Model -> code ROM MD5s the tables support
    #[serde(default)]
    pub known_roms: BTreeMap<String, Vec<String>>,

    /// Code ROM MD5 -> key tokens
    #[serde(default)]
    pub menu_sequences: BTreeMap<String, Vec<String>>,

    /// Code ROM MD5 -> substrings expected in order in emulator stderr
    #[serde(default)]
    pub log_lines: BTreeMap<String, Vec<String>>,
}

fn keys(parts: &[(&str, usize)]) -> Vec<String> {
    parts
        .iter()
        .flat_map(|(key, n)| std::iter::repeat(key.to_string()).take(*n))
        .collect()
}

fn icu_lines(kernel: &str, firmware: &str) -> Vec<String> {
    vec![
        format!("{} READY", kernel),
        format!("{} ICU Firmware Version {}", kernel, firmware),
        "[STARTUP] startupInitializeComplete".to_string(),
    ]
}

impl ScriptBook {
    /// Tables for the ROM dumps the test suite was recorded against
    pub fn builtin() -> Self {
        let mut book = Self::default();

        for (model, rom) in [
            ("5D3", ROM_5D3),
            ("50D", ROM_50D),
            ("60D", ROM_60D),
            ("100D", ROM_100D),
            ("500D", ROM_500D),
            ("700D", ROM_700D),
        ] {
            book.known_roms.insert(model.to_string(), vec![rom.to_string()]);
        }

        let menus = [
            (
                ROM_5D3,
                keys(&[
                    ("m", 1),
                    ("l", 2),
                    ("m", 1),
                    ("left", 21),
                    ("up", 2),
                    ("spc", 1),
                    ("down", 1),
                    ("spc", 1),
                    ("right", 3),
                    ("up", 1),
                    ("spc", 1),
                    ("pgdn", 1),
                    ("spc", 1),
                ]),
            ),
            (
                ROM_50D,
                keys(&[
                    ("m", 1),
                    ("l", 2),
                    ("m", 1),
                    ("right", 9),
                    ("up", 2),
                    ("spc", 1),
                    ("down", 1),
                    ("spc", 1),
                    ("right", 1),
                    ("up", 2),
                    ("spc", 1),
                    ("pgdn", 1),
                    ("spc", 1),
                ]),
            ),
            (
                ROM_60D,
                keys(&[
                    ("m", 1),
                    ("l", 2),
                    ("m", 1),
                    ("left", 11),
                    ("up", 2),
                    ("spc", 1),
                    ("down", 1),
                    ("spc", 1),
                    ("left", 1),
                    ("up", 2),
                    ("spc", 1),
                    ("pgup", 1),
                    ("spc", 1),
                ]),
            ),
            (
                // LV takes a long time to come up on this cam
                ROM_100D,
                keys(&[
                    ("m", 1),
                    ("wait l", 2),
                    ("m", 1),
                    ("right", 11),
                    ("up", 3),
                    ("spc", 1),
                    ("down", 1),
                    ("spc", 1),
                ]),
            ),
            (
                // no lens attached, so LV is avoided; wheel keys are unmapped
                ROM_700D,
                keys(&[
                    ("f1", 1),
                    ("m", 1),
                    ("right", 12),
                    ("spc", 1),
                    ("right", 1),
                    ("spc", 1),
                    ("left", 1),
                    ("spc", 1),
                    ("down", 2),
                    ("up", 1),
                    ("spc", 1),
                ]),
            ),
            (
                ROM_500D,
                keys(&[
                    ("f1", 1),
                    ("m", 1),
                    ("l", 2),
                    ("m", 1),
                    ("left", 8),
                    ("right", 1),
                    ("spc", 1),
                    ("right", 1),
                    ("spc", 1),
                    ("right", 1),
                    ("spc", 1),
                    ("up", 2),
                    ("down", 1),
                    ("spc", 1),
                ]),
            ),
        ];
        for (rom, script) in menus {
            book.menu_sequences.insert(rom.to_string(), script);
        }

        for (rom, kernel, firmware) in [
            (ROM_5D3, "K285", "1.2.3 ( 9.0.1 )"),
            (ROM_50D, "K261", "1.0.9 ( 3.4.5 )"),
            (ROM_60D, "K287", "1.1.1 ( 3.3.7 )"),
            (ROM_100D, "K346", "1.0.1 ( 4.4.0 )"),
            (ROM_700D, "K326", "1.1.5 ( 3.0.2 )"),
            (ROM_500D, "K252", "1.1.1 ( 3.6.4 )"),
        ] {
            book.log_lines
                .insert(rom.to_string(), icu_lines(kernel, firmware));
        }

        book
    }

    /// Parse a YAML script file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse script file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Built-in tables, overlaid with `overrides` when given
    pub fn with_overrides(overrides: Option<&Path>) -> Result<Self> {
        let mut book = Self::builtin();
        if let Some(path) = overrides {
            book.merge(Self::load(path)?);
            tracing::debug!("Loaded script overrides from {}", path.display());
        }
        Ok(book)
    }

    /// Overlay `other`; its entries replace ours key by key
    pub fn merge(&mut self, other: ScriptBook) {
        self.known_roms.extend(other.known_roms);
        self.menu_sequences.extend(other.menu_sequences);
        self.log_lines.extend(other.log_lines);
    }

    /// Check that tests exist for this model and ROM dump
    ///
    /// The error is the failure reason to record.
    pub fn check_known(&self, model: &str, code_rom_md5: &str) -> std::result::Result<(), String> {
        let roms = self
            .known_roms
            .get(model)
            .ok_or_else(|| format!("No tests known for cam: {}", model))?;
        if !roms.iter().any(|r| r == code_rom_md5) {
            return Err(format!("Unknown rom for cam, MD5 sum: {}", code_rom_md5));
        }
        Ok(())
    }

    pub fn menu_script(&self, code_rom_md5: &str) -> Option<Vec<KeyStep>> {
        self.menu_sequences
            .get(code_rom_md5)
            .map(|tokens| tokens.iter().map(|t| KeyStep::parse(t)).collect())
    }

    pub fn log_lines(&self, code_rom_md5: &str) -> Option<&[String]> {
        self.log_lines.get(code_rom_md5).map(Vec::as_slice)
    }
}
