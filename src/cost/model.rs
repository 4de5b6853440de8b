use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Deterministic size-to-cost formula for the expensive analyzer. Supplied by
/// configuration; nothing here is derived from the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostModel {
    pub model_id: String,
    /// Tokens charged once per call.
    pub base_tokens: u64,
    pub tokens_per_tile: u64,
    /// Edge length in pixels of one billing tile.
    pub tile_size: u32,
    /// Flat charge for each secondary frame, which is sent at low detail.
    pub low_detail_tokens: u64,
    pub usd_per_1k_tokens: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            model_id: "vision-default".to_string(),
            base_tokens: 85,
            tokens_per_tile: 170,
            tile_size: 512,
            low_detail_tokens: 85,
            usd_per_1k_tokens: 0.005,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// Tiles of the full-detail primary frame.
    pub tiles: u64,
    pub tokens: u64,
    pub usd: f64,
}

impl CostModel {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size == 0 {
            return Err(ConfigError::Zero {
                field: "cost_model.tile_size",
            });
        }
        if !self.usd_per_1k_tokens.is_finite() || self.usd_per_1k_tokens < 0.0 {
            return Err(ConfigError::Negative {
                field: "cost_model.usd_per_1k_tokens",
                value: self.usd_per_1k_tokens,
            });
        }
        Ok(())
    }

    /// `ceil(width / tile) * ceil(height / tile)`. Unknown dimensions count as one tile.
    pub fn tile_count(&self, dimensions: Option<(u32, u32)>) -> u64 {
        let Some((width, height)) = dimensions else {
            return 1;
        };
        let tile = self.tile_size.max(1);
        let across = u64::from(width.div_ceil(tile)).max(1);
        let down = u64::from(height.div_ceil(tile)).max(1);
        across * down
    }

    fn price(&self, tiles: u64, extra_tokens: u64) -> CostEstimate {
        let tokens = self
            .base_tokens
            .saturating_add(tiles.saturating_mul(self.tokens_per_tile))
            .saturating_add(extra_tokens);
        CostEstimate {
            tiles,
            tokens,
            usd: tokens as f64 / 1000.0 * self.usd_per_1k_tokens,
        }
    }

    pub fn estimate_frame(&self, dimensions: Option<(u32, u32)>) -> CostEstimate {
        self.price(self.tile_count(dimensions), 0)
    }

    /// One call carrying a batch: the primary frame at full detail, every
    /// secondary frame at the flat low-detail rate, base charged once.
    pub fn estimate_batch(&self, primary: Option<(u32, u32)>, secondary: usize) -> CostEstimate {
        let extra = self
            .low_detail_tokens
            .saturating_mul(u64::try_from(secondary).unwrap_or(u64::MAX));
        self.price(self.tile_count(primary), extra)
    }
}
