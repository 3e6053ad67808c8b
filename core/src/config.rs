use crate::{
    error::{CommissionError, CommissionResult},
    types::CommissionType,
};
use serde::{Deserialize, Serialize};

/// Maximum traversal depth for sponsor chains and override downlines.
pub const MAX_TRAVERSAL_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolRates {
    pub direct:   f64,
    pub binary:   f64,
    #[serde(rename = "override")]
    pub override_: f64,
}

impl PoolRates {
    pub fn rate(&self, pool: CommissionType) -> f64 {
        match pool {
            CommissionType::Direct   => self.direct,
            CommissionType::Binary   => self.binary,
            CommissionType::Override => self.override_,
        }
    }

    pub fn sum(&self) -> f64 {
        self.direct + self.binary + self.override_
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommissionConfig {
    /// Indexed by sponsor hop: tier 1 is the buyer's direct sponsor.
    pub direct_tier_rates:         Vec<f64>,
    pub binary_match_rate:         f64,
    /// Indexed by binary-parent depth below the earner.
    pub override_level_rates:      Vec<f64>,
    pub pool_rates:                PoolRates,
    pub global_cap_rate:           f64,
    pub ghost_volume_ttl_days:     i64,
    pub volume_aging_days:         i64,
    pub absolute_user_cap:         f64,
    /// Decimals of the payout token. Leaf amounts are in its smallest unit.
    pub token_decimals:            u32,
    pub payout_audit_window_weeks: u32,
    pub persist_chunk_size:        usize,
    pub lock_ttl_minutes:          i64,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            direct_tier_rates:    vec![0.10, 0.05, 0.03],
            binary_match_rate:    0.10,
            override_level_rates: vec![0.05, 0.03, 0.02],
            pool_rates: PoolRates {
                direct:    0.20,
                binary:    0.17,
                override_: 0.03,
            },
            global_cap_rate:           0.40,
            ghost_volume_ttl_days:     10,
            volume_aging_days:         180,
            absolute_user_cap:         50_000.0,
            token_decimals:            6,
            payout_audit_window_weeks: 4,
            persist_chunk_size:        500,
            lock_ttl_minutes:          120,
        }
    }
}

impl CommissionConfig {
    /// Load from `{data_dir}/commission_config.json`.
    /// In tests, use CommissionConfig::default().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/commission_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: CommissionConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid {path}: {e}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> CommissionResult<()> {
        let tables = [
            ("direct_tier_rates", &self.direct_tier_rates),
            ("override_level_rates", &self.override_level_rates),
        ];
        for (name, rates) in tables {
            if rates.is_empty() || rates.len() > MAX_TRAVERSAL_DEPTH {
                return Err(CommissionError::validation(format!(
                    "{name} must have 1..={MAX_TRAVERSAL_DEPTH} entries, got {}",
                    rates.len()
                )));
            }
            if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
                return Err(CommissionError::validation(format!(
                    "{name} contains a negative or non-finite rate"
                )));
            }
        }

        let scalars = [
            ("binary_match_rate", self.binary_match_rate),
            ("pool_rates.direct", self.pool_rates.direct),
            ("pool_rates.binary", self.pool_rates.binary),
            ("pool_rates.override", self.pool_rates.override_),
            ("global_cap_rate", self.global_cap_rate),
            ("absolute_user_cap", self.absolute_user_cap),
        ];
        for (name, value) in scalars {
            if !value.is_finite() || value < 0.0 {
                return Err(CommissionError::validation(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }

        if self.token_decimals < 2 || self.token_decimals > 30 {
            return Err(CommissionError::validation(format!(
                "token_decimals must be in 2..=30, got {}",
                self.token_decimals
            )));
        }
        if self.ghost_volume_ttl_days <= 0 || self.volume_aging_days <= 0 {
            return Err(CommissionError::validation(
                "volume windows must be positive day counts",
            ));
        }
        if self.persist_chunk_size == 0 || self.payout_audit_window_weeks == 0 {
            return Err(CommissionError::validation(
                "persist_chunk_size and payout_audit_window_weeks must be non-zero",
            ));
        }

        // Not an error: the global clamp still holds the aggregate ceiling.
        if self.pool_rates.sum() > self.global_cap_rate + 1e-9 {
            log::warn!(
                "pool rates sum to {:.4}, above the global cap {:.4}; the global clamp will bind",
                self.pool_rates.sum(),
                self.global_cap_rate
            );
        }
        Ok(())
    }
}
