use std::sync::Arc;

use async_trait::async_trait;
use primitives_shared::ChainEpoch;

use crate::chain::{ApiError, ChainApi};
use crate::types::Piece;

/// Decides the expiration epoch a sector is pre-committed with.
#[async_trait]
pub trait PreCommitPolicy: Send + Sync {
    async fn expiration(&self, pieces: &[Piece]) -> Result<ChainEpoch, ApiError>;
}

/// Expiration policy with two modes:
///
/// 1. The sector carries deal pieces: expire at the latest deal end epoch.
/// 2. No deal pieces: expire a configured default duration from now.
///
/// Either way the result is aligned to the end of a proving period, shifted
/// by the miner's proving boundary, so the sector expires inside the window
/// the operator expects.
pub struct BasicPreCommitPolicy {
    api: Arc<dyn ChainApi>,

    proving_period: ChainEpoch,
    proving_boundary: ChainEpoch,
    duration: ChainEpoch,
}

impl BasicPreCommitPolicy {
    /// `duration` is the default sector lifetime when no deals constrain it;
    /// `proving_boundary` is `period_start % proving_period` for this miner.
    pub fn new(
        api: Arc<dyn ChainApi>,
        proving_period: ChainEpoch,
        proving_boundary: ChainEpoch,
        duration: ChainEpoch,
    ) -> Self {
        Self {
            api,
            proving_period,
            proving_boundary,
            duration,
        }
    }
}

#[async_trait]
impl PreCommitPolicy for BasicPreCommitPolicy {
    async fn expiration(&self, pieces: &[Piece]) -> Result<ChainEpoch, ApiError> {
        let epoch = self.api.chain_head().await?;

        let mut end: Option<ChainEpoch> = None;

        for piece in pieces {
            let Some(deal) = &piece.deal else {
                continue;
            };

            if deal.schedule.end_epoch < epoch {
                tracing::warn!(
                    deal = deal.deal_id,
                    end_epoch = deal.schedule.end_epoch,
                    current = epoch,
                    "piece schedule ended before the current epoch"
                );
                continue;
            }

            if end.map_or(true, |e| e < deal.schedule.end_epoch) {
                end = Some(deal.schedule.end_epoch);
            }
        }

        let mut end = end.unwrap_or(epoch + self.duration);

        end += self.proving_period - (end % self.proving_period) + self.proving_boundary - 1;

        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_deal, test_cid, StubChain};
    use crate::types::{Piece, PieceInfo};
    use primitives_shared::PaddedPieceSize;

    const PROVING_PERIOD: ChainEpoch = 2880;

    fn deal_piece(deal_id: u64, start_epoch: ChainEpoch, end_epoch: ChainEpoch) -> Piece {
        Piece {
            info: PieceInfo {
                size: PaddedPieceSize::new(1024).unwrap(),
                cid: test_cid(format!("piece-{deal_id}").as_bytes()),
            },
            deal: Some(sample_deal(
                deal_id,
                test_cid(format!("deal-{deal_id}").as_bytes()),
                start_epoch,
                end_epoch,
            )),
        }
    }

    fn pad_piece() -> Piece {
        Piece {
            info: PieceInfo {
                size: PaddedPieceSize::new(512).unwrap(),
                cid: test_cid(b"pad"),
            },
            deal: None,
        }
    }

    fn aligned(end: ChainEpoch, boundary: ChainEpoch) -> ChainEpoch {
        end + PROVING_PERIOD - (end % PROVING_PERIOD) + boundary - 1
    }

    #[tokio::test]
    async fn deal_pieces_pick_the_latest_end_epoch() {
        let chain = Arc::new(StubChain::new(100));
        let policy = BasicPreCommitPolicy::new(chain, PROVING_PERIOD, 10, 5000);

        let expiration = policy
            .expiration(&[deal_piece(1, 50, 4000), deal_piece(2, 50, 6000), pad_piece()])
            .await
            .unwrap();

        assert_eq!(expiration, aligned(6000, 10));
    }

    #[tokio::test]
    async fn no_deals_fall_back_to_default_duration() {
        let chain = Arc::new(StubChain::new(100));
        let policy = BasicPreCommitPolicy::new(chain, PROVING_PERIOD, 7, 5000);

        let expiration = policy.expiration(&[pad_piece()]).await.unwrap();

        assert_eq!(expiration, aligned(100 + 5000, 7));
    }

    #[tokio::test]
    async fn ended_deals_are_ignored() {
        let chain = Arc::new(StubChain::new(10_000));
        let policy = BasicPreCommitPolicy::new(chain, PROVING_PERIOD, 0, 5000);

        // The only deal ended in the past, so the default duration applies.
        let expiration = policy.expiration(&[deal_piece(1, 50, 9_000)]).await.unwrap();

        assert_eq!(expiration, aligned(10_000 + 5000, 0));
    }

    #[tokio::test]
    async fn expiration_lands_on_a_period_boundary() {
        let chain = Arc::new(StubChain::new(1));
        let boundary = 42;
        let policy = BasicPreCommitPolicy::new(chain, PROVING_PERIOD, boundary, 1000);

        let expiration = policy.expiration(&[]).await.unwrap();

        assert_eq!((expiration + 1 - boundary) % PROVING_PERIOD, 0);
    }
}
