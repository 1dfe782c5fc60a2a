use std::collections::HashMap;
use std::sync::Mutex;

use primitives_shared::SectorId;

use crate::types::SectorState;

/// Coarse buckets the creation caps are counted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StatState {
    Staging,
    Sealing,
    Failed,
    Proving,
}

fn stat_state(state: SectorState) -> Option<StatState> {
    Some(match state {
        SectorState::Undefined | SectorState::Empty | SectorState::WaitDeals
        | SectorState::AddPiece => StatState::Staging,
        SectorState::Packing
        | SectorState::PreCommit1
        | SectorState::PreCommit2
        | SectorState::PreCommitting
        | SectorState::PreCommitWait
        | SectorState::WaitSeed
        | SectorState::Committing
        | SectorState::CommitWait
        | SectorState::FinalizeSector => StatState::Sealing,
        SectorState::AddPieceFailed | SectorState::SealFailed => StatState::Failed,
        SectorState::Proving => StatState::Proving,
        SectorState::Removed => return None,
    })
}

#[derive(Default)]
struct Inner {
    by_sector: HashMap<SectorId, StatState>,
    totals: HashMap<StatState, u64>,
}

/// Running per-state sector counters. The state machine reports every
/// transition through [`SectorStats::update_sector`]; the deal intake only
/// reads the totals when deciding whether it may create another sector.
#[derive(Default)]
pub struct SectorStats {
    inner: Mutex<Inner>,
}

impl SectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_sector(&self, id: SectorId, state: SectorState) {
        let mut inner = self.inner.lock().expect("sector stats lock poisoned");

        let previous = match stat_state(state) {
            Some(bucket) => {
                let previous = inner.by_sector.insert(id, bucket);
                *inner.totals.entry(bucket).or_default() += 1;
                previous
            }
            None => inner.by_sector.remove(&id),
        };

        if let Some(previous) = previous {
            if let Some(count) = inner.totals.get_mut(&previous) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Sectors occupying sealing resources: everything staged or mid-seal.
    pub fn cur_sealing(&self) -> u64 {
        let inner = self.inner.lock().expect("sector stats lock poisoned");
        inner.totals.get(&StatState::Staging).copied().unwrap_or(0)
            + inner.totals.get(&StatState::Sealing).copied().unwrap_or(0)
    }

    /// Sectors still open for deals.
    pub fn cur_staging(&self) -> u64 {
        let inner = self.inner.lock().expect("sector stats lock poisoned");
        inner.totals.get(&StatState::Staging).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use primitives_shared::SectorNumber;

    use super::*;

    fn sid(number: u32) -> SectorId {
        SectorId {
            miner: 1000,
            number: SectorNumber::new(number).unwrap(),
        }
    }

    #[test]
    fn transitions_move_counts_between_buckets() {
        let stats = SectorStats::new();

        stats.update_sector(sid(1), SectorState::WaitDeals);
        stats.update_sector(sid(2), SectorState::WaitDeals);
        assert_eq!(stats.cur_staging(), 2);
        assert_eq!(stats.cur_sealing(), 2);

        stats.update_sector(sid(1), SectorState::Packing);
        assert_eq!(stats.cur_staging(), 1);
        assert_eq!(stats.cur_sealing(), 2);

        stats.update_sector(sid(1), SectorState::Proving);
        assert_eq!(stats.cur_sealing(), 1);
    }

    #[test]
    fn removed_sectors_drop_out() {
        let stats = SectorStats::new();

        stats.update_sector(sid(9), SectorState::WaitDeals);
        stats.update_sector(sid(9), SectorState::Removed);
        assert_eq!(stats.cur_staging(), 0);
        assert_eq!(stats.cur_sealing(), 0);
    }
}
