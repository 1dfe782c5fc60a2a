use std::{sync::Arc, time::Duration};

use primitives_shared::{ChainEpoch, Currency};

/// Epochs a pre-commit's randomness ticket stays valid for — chain
/// finality. The pre-commit must land on-chain before the ticket ages out.
pub const MAX_PRECOMMIT_RANDOMNESS_LOOKBACK: ChainEpoch = 900;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("loading sealing config: {0}")]
    Load(String),
}

/// Operator-tunable sealing behavior. Read through [`GetSealingConfig`] so
/// changes take effect between calls without a restart.
#[derive(Debug, Clone, ::serde::Deserialize, ::serde::Serialize)]
pub struct SealingConfig {
    /// Cap on sectors in the open, deal-accepting state. Zero disables the cap.
    pub max_wait_deals_sectors: u64,
    /// Global sealing cap. Zero disables the cap.
    pub max_sealing_sectors: u64,
    /// Sealing cap counting only deal-bearing sectors. Zero disables the cap.
    pub max_sealing_sectors_for_deals: u64,
    /// How long a sector lingers open for more deals before being packed.
    pub wait_deals_delay: Duration,
    pub always_keep_unsealed_copy: bool,

    /// Master switch for batched pre-commits.
    pub batch_pre_commits: bool,
    /// Queue depth at which a batch is sent without waiting for the timer.
    pub max_pre_commit_batch: usize,
    /// Upper bound on how long a queued pre-commit waits for more company.
    pub pre_commit_batch_wait: Duration,
    /// Safety margin subtracted from the earliest sector cutoff.
    pub pre_commit_batch_slack: Duration,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            max_wait_deals_sectors: 2,
            max_sealing_sectors: 0,
            max_sealing_sectors_for_deals: 0,
            wait_deals_delay: Duration::from_secs(6 * 60 * 60),
            always_keep_unsealed_copy: true,

            batch_pre_commits: true,
            max_pre_commit_batch: crate::params::PRE_COMMIT_SECTOR_BATCH_MAX_SIZE,
            pre_commit_batch_wait: Duration::from_secs(24 * 60 * 60),
            pre_commit_batch_slack: Duration::from_secs(3 * 60 * 60),
        }
    }
}

/// Accessor for the current sealing configuration.
pub type GetSealingConfig = Arc<dyn Fn() -> Result<SealingConfig, ConfigError> + Send + Sync>;

/// Gas-fee cap for a batched message: a base plus a per-sector share.
#[derive(Debug, Clone, Copy, ::serde::Deserialize, ::serde::Serialize)]
pub struct BatchFeeConfig {
    pub base: Currency,
    pub per_sector: Currency,
}

impl BatchFeeConfig {
    pub fn fee_for_sectors(&self, sectors: usize) -> Currency {
        self.base + self.per_sector * sectors as Currency
    }
}

/// Fee caps for the messages this pipeline sends.
#[derive(Debug, Clone, Copy, ::serde::Deserialize, ::serde::Serialize)]
pub struct FeeConfig {
    pub max_pre_commit_gas_fee: Currency,
    pub max_pre_commit_batch_gas_fee: BatchFeeConfig,
}

/// Parameters of the chain this provider commits to.
#[derive(Debug, Clone, Copy, ::serde::Deserialize, ::serde::Serialize)]
pub struct NetworkParams {
    /// Seconds per epoch.
    pub block_delay_secs: u64,
    /// Length of the windowed-proof period, in epochs.
    pub wpost_proving_period: ChainEpoch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_fee_scales_per_sector() {
        let fees = BatchFeeConfig {
            base: 3,
            per_sector: 2,
        };
        assert_eq!(fees.fee_for_sectors(0), 3);
        assert_eq!(fees.fee_for_sectors(256), 3 + 512);
    }
}
