//! Calibration recipe definitions
//!
//! A recipe describes a periodically repeatable calibration exposure set.
//! The full field tuple is the identity of a recipe: editing any parameter
//! produces a new schedule entry rather than inheriting the old run history.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{CcsError, CcsResult};
use crate::types::Binning;

/// Kind of calibration frame a recipe produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RecipeKind {
    /// Zero-second frame measuring readout bias structure
    Bias,
    /// Shuttered frame measuring dark current
    Dark,
}

impl RecipeKind {
    pub fn name(&self) -> &'static str {
        match self {
            RecipeKind::Bias => "BIAS",
            RecipeKind::Dark => "DARK",
        }
    }
}

/// Persistence key for a recipe: the full field tuple
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecipeKey(pub String);

impl RecipeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A parameterized, periodically repeatable calibration exposure definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipe {
    pub kind: RecipeKind,
    pub bin: Binning,
    pub use_alt_amplifier: bool,
    /// Minimum interval between runs of this recipe
    pub frequency_ms: u64,
    /// Number of frames to take per run
    pub count: u32,
    /// Integration time per frame; zero for BIAS
    pub exposure_ms: u64,
}

impl Recipe {
    /// The persistence key: every field participates
    pub fn key(&self) -> RecipeKey {
        RecipeKey(format!(
            "{}/bin{}/alt{}/freq{}/n{}/exp{}",
            self.kind.name(),
            self.bin.0,
            u8::from(self.use_alt_amplifier),
            self.frequency_ms,
            self.count,
            self.exposure_ms,
        ))
    }

    /// Predicted wall-clock cost of one full run of this recipe.
    ///
    /// DARK frames cost integration plus readout; BIAS frames cost readout
    /// only.
    pub fn predicted_duration_ms(&self, readout_overhead_ms: u64) -> u64 {
        let per_frame = match self.kind {
            RecipeKind::Dark => self.exposure_ms.saturating_add(readout_overhead_ms),
            RecipeKind::Bias => readout_overhead_ms,
        };
        per_frame.saturating_mul(u64::from(self.count))
    }
}

/// JSON representation of a recipe in the recipe list file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeJson {
    pub kind: String,
    pub bin: u8,
    #[serde(default)]
    pub use_alt_amplifier: bool,
    pub frequency_ms: u64,
    pub count: u32,
    #[serde(default)]
    pub exposure_ms: u64,
}

impl RecipeJson {
    pub fn to_recipe(&self) -> Result<Recipe, String> {
        let kind = match self.kind.to_ascii_uppercase().as_str() {
            "BIAS" => RecipeKind::Bias,
            "DARK" => RecipeKind::Dark,
            other => return Err(format!("Invalid recipe kind: {}", other)),
        };
        if kind == RecipeKind::Dark && self.exposure_ms == 0 {
            return Err("DARK recipe requires a nonzero exposure_ms".to_string());
        }
        if self.count == 0 {
            return Err("Recipe count must be nonzero".to_string());
        }
        Ok(Recipe {
            kind,
            bin: Binning::new(self.bin)?,
            use_alt_amplifier: self.use_alt_amplifier,
            frequency_ms: self.frequency_ms,
            count: self.count,
            exposure_ms: self.exposure_ms,
        })
    }
}

/// Load the order-preserving recipe list from a JSON file
pub fn load_recipes<P: AsRef<Path>>(path: P) -> CcsResult<Vec<Recipe>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let entries: Vec<RecipeJson> = serde_json::from_reader(reader)?;

    entries
        .iter()
        .map(|entry| entry.to_recipe())
        .collect::<Result<Vec<_>, _>>()
        .map_err(CcsError::Config)
}
