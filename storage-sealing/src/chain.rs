use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use primitives_shared::{ChainEpoch, Currency, MethodNum, SectorNumber, UnpaddedPieceSize};
use tokio::io::{AsyncRead, ReadBuf};

use crate::types::{Address, PieceInfo, SectorRef};

/// Identifier the message-sending service returns per submission; delivery
/// and replacement are its business.
pub type MessageUid = String;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("chain state unavailable: {0}")]
    State(String),
    #[error("messager rejected the message: {0}")]
    Messager(String),
    #[error("no good address found: {0}")]
    AddressSelection(String),
    #[error("allocating sector number: {0}")]
    Counter(String),
}

/// The miner actor state the batcher needs for address selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub control_addresses: Vec<Address>,
}

/// What an outgoing message pays for, used to pick the paying address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressUse {
    PreCommit,
    Commit,
}

/// Read access to the full node, reduced to what this pipeline consumes.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_head(&self) -> Result<ChainEpoch, ApiError>;

    async fn state_miner_info(&self, miner: &Address) -> Result<MinerInfo, ApiError>;
}

/// The message-sending service. Submission returns a UID; inclusion is
/// observed elsewhere.
#[async_trait]
pub trait MessagerApi: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn send_msg(
        &self,
        from: &Address,
        to: &Address,
        method: MethodNum,
        value: Currency,
        max_fee: Currency,
        params: &[u8],
    ) -> Result<MessageUid, ApiError>;
}

/// Everything the pre-commit batcher needs from the outside world.
pub trait PreCommitBatcherApi: ChainApi + MessagerApi {}

impl<T: ChainApi + MessagerApi> PreCommitBatcherApi for T {}

/// Picks the address a message is paid from, given the funds it needs.
#[async_trait]
pub trait AddressSelector: Send + Sync {
    async fn address_for(
        &self,
        use_kind: AddressUse,
        miner_info: &MinerInfo,
        good_funds: Currency,
        min_funds: Currency,
    ) -> Result<Address, ApiError>;
}

/// Allocates monotonically increasing sector numbers; backed by the
/// external sector metadata store.
#[async_trait]
pub trait SectorNumberCounter: Send + Sync {
    async fn next(&self) -> Result<SectorNumber, ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SealerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Byte source for a piece write.
pub type PieceData = Box<dyn AsyncRead + Send + Unpin>;

/// The sealing-layer storage operations the deal intake drives.
#[async_trait]
pub trait SealerApi: Send + Sync {
    /// Initialize the on-disk structures of a newly allocated sector.
    async fn new_sector(&self, sector: SectorRef) -> Result<(), SealerError>;

    /// Append a piece to the sector's unsealed data, after the pieces in
    /// `existing_piece_sizes`. Returns the written piece's commitment.
    async fn add_piece(
        &self,
        sector: SectorRef,
        existing_piece_sizes: &[UnpaddedPieceSize],
        piece_size: UnpaddedPieceSize,
        data: PieceData,
    ) -> Result<PieceInfo, SealerError>;
}

/// Reader producing a fixed number of zero bytes; the byte source of
/// synthetic padding pieces.
pub struct ZeroReader {
    remaining: u64,
}

impl ZeroReader {
    pub fn new(size: UnpaddedPieceSize) -> Self {
        Self { remaining: *size }
    }
}

const ZERO_CHUNK: [u8; 8192] = [0u8; 8192];

impl AsyncRead for ZeroReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        let to_write = (buf.remaining() as u64)
            .min(self.remaining)
            .min(ZERO_CHUNK.len() as u64) as usize;
        buf.put_slice(&ZERO_CHUNK[..to_write]);
        self.remaining -= to_write as u64;

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn zero_reader_produces_exactly_its_size() {
        let size = UnpaddedPieceSize::new(16256).unwrap();
        let mut reader = ZeroReader::new(size);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len() as u64, *size);
        assert!(out.iter().all(|b| *b == 0));
    }
}
