use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Target value for cells that carry no stitch.
pub const NO_STITCH: u16 = u16::MAX;

pub const CELL_EMPTY: u8 = 0;
pub const CELL_CORRECT: u8 = 1;
pub const CELL_WRONG: u8 = 2;

pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteColor {
    pub name: String,
    pub hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternMeta {
    pub title: String,
    pub author: String,
    pub instructions: String,
}

/// A pattern definition as produced by the image converter, plus identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDoc {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub palette: Vec<PaletteColor>,
    pub targets: Vec<u16>,
    #[serde(default)]
    pub meta: PatternMeta,
    pub updated_at: i64,
}

impl PatternDoc {
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(SyncError::Other(format!(
                "pattern {} has empty dimensions {}x{}",
                self.id, self.width, self.height
            )));
        }
        if self.targets.len() != self.cell_count() {
            return Err(SyncError::Other(format!(
                "pattern {} has {} targets for a {}x{} grid",
                self.id,
                self.targets.len(),
                self.width,
                self.height
            )));
        }
        let palette_len = self.palette.len();
        if let Some(bad) = self
            .targets
            .iter()
            .find(|&&t| t != NO_STITCH && t as usize >= palette_len)
        {
            return Err(SyncError::Other(format!(
                "pattern {} references palette index {bad} but has {palette_len} colors",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteCount {
    pub remaining_targets: u32,
    pub wrong_count: u32,
    pub correct_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub scale: f64,
    pub translate_x: f64,
    pub translate_y: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            scale: 1.0,
            translate_x: 0.0,
            translate_y: 0.0,
        }
    }
}

/// Stitching progress for one pattern. Cell arrays are indexed `y * width + x`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub pattern_id: String,
    #[serde(rename = "stitchedStateB64", with = "b64")]
    pub stitched_state: Vec<u8>,
    #[serde(rename = "placedColorsB64", with = "b64_u16")]
    pub placed_colors: Vec<u16>,
    pub palette_counts: Vec<PaletteCount>,
    pub last_selected_palette_index: Option<u32>,
    pub viewport: Viewport,
}

impl ProgressRecord {
    pub fn fresh(pattern: &PatternDoc) -> Self {
        let cells = pattern.cell_count();
        let mut palette_counts = vec![PaletteCount::default(); pattern.palette.len()];
        for &target in &pattern.targets {
            if let Some(count) = palette_counts.get_mut(target as usize) {
                count.remaining_targets += 1;
            }
        }
        Self {
            pattern_id: pattern.id.clone(),
            stitched_state: vec![CELL_EMPTY; cells],
            placed_colors: vec![NO_STITCH; cells],
            palette_counts,
            last_selected_palette_index: None,
            viewport: Viewport::default(),
        }
    }

    fn check_shape(&self, pattern: &PatternDoc, cell: usize) -> Result<()> {
        if self.pattern_id != pattern.id {
            return Err(SyncError::Other(format!(
                "progress belongs to {} not {}",
                self.pattern_id, pattern.id
            )));
        }
        if self.stitched_state.len() != pattern.cell_count()
            || self.placed_colors.len() != pattern.cell_count()
            || self.palette_counts.len() != pattern.palette.len()
        {
            return Err(SyncError::Other(format!(
                "progress for {} does not match the pattern grid",
                pattern.id
            )));
        }
        if cell >= pattern.cell_count() {
            return Err(SyncError::Other(format!(
                "cell {cell} is outside the {}x{} grid",
                pattern.width, pattern.height
            )));
        }
        Ok(())
    }

    /// Place `color` on `cell`, replacing whatever was stitched there.
    /// Returns the resulting cell state.
    pub fn place_stitch(&mut self, pattern: &PatternDoc, cell: usize, color: u16) -> Result<u8> {
        self.check_shape(pattern, cell)?;
        if color as usize >= pattern.palette.len() {
            return Err(SyncError::Other(format!(
                "palette index {color} out of range for {} colors",
                pattern.palette.len()
            )));
        }
        self.clear_stitch(pattern, cell)?;

        let count = &mut self.palette_counts[color as usize];
        let state = if pattern.targets[cell] == color {
            count.correct_count += 1;
            count.remaining_targets = count.remaining_targets.saturating_sub(1);
            CELL_CORRECT
        } else {
            count.wrong_count += 1;
            CELL_WRONG
        };
        self.stitched_state[cell] = state;
        self.placed_colors[cell] = color;
        self.last_selected_palette_index = Some(color as u32);
        Ok(state)
    }

    /// Remove the stitch on `cell`. Returns false when the cell was already empty.
    pub fn clear_stitch(&mut self, pattern: &PatternDoc, cell: usize) -> Result<bool> {
        self.check_shape(pattern, cell)?;
        let state = self.stitched_state[cell];
        if state == CELL_EMPTY {
            return Ok(false);
        }
        let placed = self.placed_colors[cell];
        if let Some(count) = self.palette_counts.get_mut(placed as usize) {
            match state {
                CELL_CORRECT => {
                    count.correct_count = count.correct_count.saturating_sub(1);
                    count.remaining_targets += 1;
                }
                _ => count.wrong_count = count.wrong_count.saturating_sub(1),
            }
        }
        self.stitched_state[cell] = CELL_EMPTY;
        self.placed_colors[cell] = NO_STITCH;
        Ok(true)
    }

    pub fn correct_cells(&self) -> usize {
        self.stitched_state
            .iter()
            .filter(|&&s| s == CELL_CORRECT)
            .count()
    }

    pub fn remaining_targets(&self) -> u64 {
        self.palette_counts
            .iter()
            .map(|c| c.remaining_targets as u64)
            .sum()
    }
}

/// Direction-of-reconciliation bookkeeping for one pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub pattern_id: String,
    pub local_updated_at: i64,
    pub remote_updated_at: Option<i64>,
    pub needs_upload: bool,
}

impl SyncMeta {
    pub fn dirty(pattern_id: &str, local_updated_at: i64) -> Self {
        Self {
            pattern_id: pattern_id.to_string(),
            local_updated_at,
            remote_updated_at: None,
            needs_upload: true,
        }
    }
}

/// Serde adapter embedding raw bytes as standard base64.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter embedding `u16` arrays as little-endian bytes in base64.
pub mod b64_u16 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[u16], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u16>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)?;
        if bytes.len() % 2 != 0 {
            return Err(serde::de::Error::custom(format!(
                "odd byte length {} for a u16 array",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn sample_pattern(id: &str) -> PatternDoc {
    PatternDoc {
        id: id.to_string(),
        width: 3,
        height: 2,
        palette: vec![
            PaletteColor {
                name: "Black".into(),
                hex: "#000000".into(),
                symbol: Some("0".into()),
            },
            PaletteColor {
                name: "Lemon".into(),
                hex: "#FDED54".into(),
                symbol: Some("1".into()),
            },
        ],
        targets: vec![0, 0, 1, NO_STITCH, 1, 1],
        meta: PatternMeta {
            title: "sample".into(),
            ..Default::default()
        },
        updated_at: 1_000,
    }
}
