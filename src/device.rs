//! Camera model descriptors
//!
//! Resolving a model validates the ROM directory, hashes the ROM dumps and
//! works out which dump holds the firmware code. The code ROM hash is what
//! selects test scripts: two dumps of the same model can boot into different
//! on-screen state (Canon persists menu positions in ROM).

use md5::{Digest, Md5};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

const EOS_CAMS: &[&str] = &[
    "5D", "5D2", "5D3", "5D4", "6D", "6D2", "7D", "7D2", "40D", "50D", "60D", "70D", "77D", "80D",
    "400D", "450D", "500D", "550D", "600D", "650D", "700D", "750D", "760D", "800D", "100D",
    "200D", "1000D", "1100D", "1200D", "1300D", "EOSM", "EOSM2",
];

const POWERSHOT_CAMS: &[&str] = &["EOSM3", "EOSM10", "EOSM5", "A1100"];

const GUI_CAMS: &[&str] = &[
    "5D2", "5D3", "6D", "40D", "50D", "60D", "70D", "450D", "500D", "550D", "600D", "650D",
    "700D", "100D", "1000D", "1100D", "1200D", "1300D", "EOSM", "EOSM2",
];

const SD_CAMS: &[&str] = &[
    "5D3", "5D4", "6D", "6D2", "60D", "70D", "77D", "80D", "450D", "500D", "550D", "600D", "650D",
    "700D", "750D", "760D", "800D", "100D", "200D", "1000D", "1100D", "1200D", "1300D", "EOSM",
    "EOSM2",
];

const CF_CAMS: &[&str] = &["5D", "5D2", "5D3", "5D4", "7D", "7D2", "40D", "50D", "400D"];

/// Every model the harness knows how to describe, sorted
pub fn supported_models() -> Vec<&'static str> {
    let mut all: Vec<&'static str> = EOS_CAMS
        .iter()
        .chain(POWERSHOT_CAMS)
        .chain(GUI_CAMS)
        .chain(SD_CAMS)
        .chain(CF_CAMS)
        .copied()
        .collect();
    all.sort_unstable();
    all.dedup();
    all
}

pub fn is_supported(model: &str) -> bool {
    supported_models().contains(&model)
}

fn digic_version(model: &str) -> Option<u8> {
    let version = match model {
        "50D" | "7D" | "60D" | "500D" | "550D" | "600D" | "1100D" | "1200D" | "1300D"
        | "2000D" | "4000D" | "5D2" => 4,
        "5D3" | "6D" | "70D" | "650D" | "700D" | "100D" | "EOSM" | "EOSM2" => 5,
        "5D4" | "7D2" | "80D" | "750D" | "760D" => 6,
        "6D2" | "77D" | "800D" | "200D" => 7,
        "90D" | "850D" | "250D" | "R" | "RP" | "M50" => 8,
        _ => return None,
    };
    Some(version)
}

/// Which ROM dump contains the firmware code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodeRom {
    Rom0,
    Rom1,
}

fn code_rom_for(digic: u8) -> Option<CodeRom> {
    match digic {
        4 | 5 => Some(CodeRom::Rom1),
        7 | 8 | 10 => Some(CodeRom::Rom0),
        // DIGIC 6 layout hasn't been worked out yet
        _ => None,
    }
}

/// Hex MD5 of a file's content
pub fn md5_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
    Ok(hex::encode(Md5::digest(&bytes)))
}

/// Read-only descriptor of one camera model and its ROM dumps
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub model: String,
    pub rom_dir: PathBuf,
    pub rom0_md5: String,
    pub rom1_md5: String,
    pub digic: u8,
    pub code_rom: CodeRom,
    pub can_emulate_gui: bool,
    pub has_sd: bool,
    pub has_cf: bool,
    pub is_eos: bool,
    pub is_powershot: bool,
    pub unreliable_screencaps: bool,
}

impl Device {
    /// MD5 of the ROM holding firmware code; keys every test table
    pub fn code_rom_md5(&self) -> &str {
        match self.code_rom {
            CodeRom::Rom0 => &self.rom0_md5,
            CodeRom::Rom1 => &self.rom1_md5,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model: {} (DIGIC {})", self.model, self.digic)?;
        let can = if self.can_emulate_gui { "Can" } else { "Cannot" };
        writeln!(f, "\t{} emulate to GUI", can)?;
        if self.has_sd {
            writeln!(f, "\tHas SD card")?;
        }
        if self.has_cf {
            writeln!(f, "\tHas CF card")?;
        }
        write!(f, "\tCode ROM MD5: {}", self.code_rom_md5())
    }
}

/// Build and validate the descriptor for `model` from `<rom_dir>/<model>/`
pub fn resolve_device(model: &str, rom_dir: &Path, unreliable_screencaps: bool) -> Result<Device> {
    if model.is_empty() {
        return Err(Error::Setup("No cam model given".to_string()));
    }
    if !is_supported(model) {
        return Err(Error::UnsupportedDevice(model.to_string()));
    }

    let rom_subdir = rom_dir.join(model);
    if !rom_subdir.is_dir() {
        return Err(Error::RomDirMissing { path: rom_subdir });
    }

    let rom_md5 = |name: &str| -> Result<String> {
        let path = rom_subdir.join(name);
        if !path.is_file() {
            return Err(Error::RomMissing {
                name: name.to_string(),
                path,
            });
        }
        md5_file(&path)
    };
    let rom0_md5 = rom_md5("ROM0.BIN")?;
    let rom1_md5 = rom_md5("ROM1.BIN")?;

    let digic = digic_version(model).ok_or_else(|| {
        Error::Setup(format!("No DIGIC version mapping for cam: {}", model))
    })?;
    let code_rom = code_rom_for(digic).ok_or_else(|| Error::CodeRomUnknown {
        model: model.to_string(),
        digic,
    })?;

    let is_eos = EOS_CAMS.contains(&model);
    let is_powershot = POWERSHOT_CAMS.contains(&model);
    if is_eos && is_powershot {
        return Err(Error::Setup(format!(
            "Cam shouldn't be Powershot and EOS: {}",
            model
        )));
    }

    let rom_dir = rom_dir
        .canonicalize()
        .unwrap_or_else(|_| rom_dir.to_path_buf());

    Ok(Device {
        model: model.to_string(),
        rom_dir,
        rom0_md5,
        rom1_md5,
        digic,
        code_rom,
        can_emulate_gui: GUI_CAMS.contains(&model),
        has_sd: SD_CAMS.contains(&model),
        has_cf: CF_CAMS.contains(&model),
        is_eos,
        is_powershot,
        unreliable_screencaps,
    })
}
