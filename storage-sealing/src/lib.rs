#![warn(unused_crate_dependencies)]
#![warn(rustdoc::broken_intra_doc_links)]

//! The deal-intake side of a storage provider's sealing pipeline.
//!
//! Two concurrent coordinators live here: the [`PieceMatcher`] binds
//! incoming deal pieces to open sectors and decides when a sector starts
//! packing, and the [`PreCommitBatcher`] coalesces per-sector pre-commit
//! messages into batched on-chain submissions under each sector's cutoff.
//! [`BasicPreCommitPolicy`] derives the expiration epoch sectors are
//! pre-committed with.
//!
//! Everything else — the per-sector state machine, proof generation, the
//! chain connection, the messager and the wallet — stays outside, behind
//! the traits in this crate.

mod batcher;
mod chain;
mod config;
mod events;
mod matcher;
mod params;
mod policy;
mod stats;
mod types;

#[cfg(test)]
mod test_support;

pub use batcher::{BatcherError, PreCommitBatchRes, PreCommitBatcher};
pub use chain::{
    AddressSelector, AddressUse, ApiError, ChainApi, MessageUid, MessagerApi, MinerInfo, PieceData,
    PreCommitBatcherApi, SealerApi, SealerError, SectorNumberCounter, ZeroReader,
};
pub use config::{
    BatchFeeConfig, ConfigError, FeeConfig, GetSealingConfig, NetworkParams, SealingConfig,
    MAX_PRECOMMIT_RANDOMNESS_LOOKBACK,
};
pub use events::{EventQueue, EventsClosed, SectorEvent, SectorEventSink};
pub use matcher::{AddPieceFailureHook, MatcherError, PieceMatcher};
pub use params::{
    PreCommitSectorBatchParams, SectorPreCommitInfo, PRE_COMMIT_SECTOR_BATCH,
    PRE_COMMIT_SECTOR_BATCH_MAX_SIZE,
};
pub use policy::{BasicPreCommitPolicy, PreCommitPolicy};
pub use stats::SectorStats;
pub use types::{
    Address, ConversionError, DealInfo, DealProposal, DealSchedule, Piece, PieceInfo, SectorInfo,
    SectorRef, SectorState,
};
