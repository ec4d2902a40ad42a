//! Runtime configuration for the index, the tenant manager, and the search service.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// HNSW build/search parameters (`spec.md` §4.2.1).
///
/// | Field | Default | Notes |
/// |---|---|---|
/// | `m` | 16 | Max out-degree per node at layer ≥ 1. Range `[4, 64]`. |
/// | `m_max0` | `2*m` | Max out-degree at layer 0. Derived, not configurable directly. |
/// | `ef_construction` | 200 | Beam width used while inserting. Larger = better recall, slower build. |
/// | `ef_search` | 200 | Default beam width used while searching when the caller omits `ef`. |
/// | `rng_seed` | `None` | When set, level selection is deterministic — used by persistence round-trip tests. |
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max out-degree per node at layer ≥ 1.
    pub m: usize,
    /// Beam width used while inserting (`SEARCH-LAYER`'s `ef`).
    pub ef_construction: usize,
    /// Default beam width used while searching.
    pub ef_search: usize,
    /// Seed for the per-index RNG. `None` means seed from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 200,
            rng_seed: None,
        }
    }
}

impl HnswParams {
    /// Max out-degree per node at layer 0 (`Mmax0 = 2*M`).
    #[inline]
    pub const fn m_max0(&self) -> usize {
        self.m * 2
    }

    /// The level-selection normalization constant `mL = 1 / ln(2)`.
    #[inline]
    pub fn m_l(&self) -> f64 {
        1.0 / std::f64::consts::LN_2
    }

    /// Validates the parameters, returning a [`ConfigError`] describing the
    /// first violation found.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(4..=64).contains(&self.m) {
            return Err(ConfigError::invalid("m", "must be in [4, 64]"));
        }
        if self.ef_construction == 0 {
            return Err(ConfigError::invalid(
                "ef_construction",
                "must be greater than 0",
            ));
        }
        if self.ef_search == 0 {
            return Err(ConfigError::invalid("ef_search", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Bounds for the external metadata store's connection pool
/// (`spec.md` §5: "nominally 5-20 connections").
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StorePoolConfig {
    /// Minimum pool size, kept warm even when idle.
    pub min_connections: u32,
    /// Maximum pool size under load.
    pub max_connections: u32,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 20,
        }
    }
}

impl StorePoolConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.min_connections == 0 {
            return Err(ConfigError::invalid(
                "min_connections",
                "must be greater than 0",
            ));
        }
        if self.max_connections < self.min_connections {
            return Err(ConfigError::invalid(
                "max_connections",
                "must be >= min_connections",
            ));
        }
        Ok(())
    }
}

/// Bounds for the denial-observation sink (`spec.md` §9: "drop-on-full policy").
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DenialSinkConfig {
    /// Capacity of the bounded channel before writes start being dropped.
    pub channel_capacity: usize,
}

impl Default for DenialSinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Top-level configuration, threaded through the tenant manager and search service.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Default and max HNSW build parameters for newly built tenant indexes.
    pub hnsw: HnswParams,
    /// External store connection pool bounds.
    pub store_pool: StorePoolConfig,
    /// Denial-observation sink bounds.
    pub denial_sink: DenialSinkConfig,
    /// Default `k` used by the search service when the caller does not specify one.
    pub default_k: usize,
    /// Maximum `k` the search service will honor, regardless of caller request.
    pub max_k: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hnsw: HnswParams::default(),
            store_pool: StorePoolConfig::default(),
            denial_sink: DenialSinkConfig::default(),
            default_k: 10,
            max_k: 100,
        }
    }
}

impl Config {
    /// Validates every sub-configuration, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        self.hnsw.validate()?;
        self.store_pool.validate()?;
        if self.default_k == 0 {
            return Err(ConfigError::invalid("default_k", "must be greater than 0").into());
        }
        if self.max_k < self.default_k {
            return Err(ConfigError::invalid("max_k", "must be >= default_k").into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn m_max0_is_twice_m() {
        let p = HnswParams {
            m: 16,
            ..Default::default()
        };
        assert_eq!(p.m_max0(), 32);
    }

    #[test]
    fn m_out_of_range_rejected() {
        let p = HnswParams {
            m: 2,
            ..Default::default()
        };
        assert!(p.validate().is_err());

        let p = HnswParams {
            m: 100,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn pool_max_below_min_rejected() {
        let pool = StorePoolConfig {
            min_connections: 10,
            max_connections: 5,
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn max_k_below_default_k_rejected() {
        let cfg = Config {
            default_k: 50,
            max_k: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
