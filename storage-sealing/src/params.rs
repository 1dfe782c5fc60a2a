use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use primitives_shared::{ChainEpoch, DealId, MethodNum, RegisteredSealProof, SectorNumber};

/// Miner actor method the batched pre-commit message invokes.
pub const PRE_COMMIT_SECTOR_BATCH: MethodNum = 25;

/// Most sectors a single batched pre-commit message may carry.
pub const PRE_COMMIT_SECTOR_BATCH_MAX_SIZE: usize = 256;

/// Per-sector descriptor of the batched pre-commit message.
///
/// The `replace_*` fields are deprecated on-chain but remain part of the
/// wire tuple, so they are carried (zeroed) here as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct SectorPreCommitInfo {
    pub seal_proof: RegisteredSealProof,
    pub sector_number: SectorNumber,
    /// CommR
    pub sealed_cid: Cid,
    pub seal_rand_epoch: ChainEpoch,
    pub deal_ids: Vec<DealId>,
    pub expiration: ChainEpoch,
    pub replace_capacity: bool,
    pub replace_sector_deadline: u64,
    pub replace_sector_partition: u64,
    pub replace_sector_number: SectorNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct PreCommitSectorBatchParams {
    pub sectors: Vec<SectorPreCommitInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{precommit_info, test_cid};

    fn batch(numbers: &[u32]) -> PreCommitSectorBatchParams {
        PreCommitSectorBatchParams {
            sectors: numbers
                .iter()
                .map(|n| {
                    let mut info = precommit_info((*n).try_into().unwrap());
                    info.sealed_cid = test_cid(format!("sealed-{n}").as_bytes());
                    info.deal_ids = vec![*n as u64 * 10];
                    info.expiration = 1000 + *n as u64;
                    info
                })
                .collect(),
        }
    }

    #[test]
    fn params_round_trip() {
        let params = batch(&[0, 1, 2, 3]);
        let encoded = fvm_ipld_encoding::to_vec(&params).unwrap();
        let decoded: PreCommitSectorBatchParams = fvm_ipld_encoding::from_slice(&encoded).unwrap();
        assert_eq!(params, decoded);
    }

    #[test]
    fn params_encoding_is_deterministic() {
        let params = batch(&[5, 6, 7]);
        assert_eq!(
            fvm_ipld_encoding::to_vec(&params).unwrap(),
            fvm_ipld_encoding::to_vec(&params.clone()).unwrap()
        );
    }
}
