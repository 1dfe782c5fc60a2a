//! Recording doubles for the pipeline's external collaborators.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use cid::Cid;
use primitives_shared::{
    ChainEpoch, Currency, MethodNum, RegisteredSealProof, SectorNumber, UnpaddedPieceSize,
};
use sha2::Digest;
use tokio::io::AsyncReadExt;

use crate::{
    chain::{
        AddressSelector, AddressUse, ApiError, ChainApi, MessageUid, MessagerApi, MinerInfo,
        PieceData, SealerApi, SealerError, SectorNumberCounter,
    },
    config::{BatchFeeConfig, FeeConfig, NetworkParams},
    events::{EventsClosed, SectorEvent, SectorEventSink},
    params::SectorPreCommitInfo,
    types::{
        Address, DealInfo, DealProposal, DealSchedule, PieceInfo, SectorInfo, SectorRef,
        SectorState,
    },
};

const RAW_MULTICODEC_CODE: u64 = 0x55;
const SHA2_256_MULTICODEC_CODE: u64 = 0x12;

pub(crate) fn test_cid(data: &[u8]) -> Cid {
    let digest = sha2::Sha256::digest(data);
    let multihash = cid::multihash::Multihash::wrap(SHA2_256_MULTICODEC_CODE, &digest)
        .expect("sha-256 digests fit a multihash");
    Cid::new_v1(RAW_MULTICODEC_CODE, multihash)
}

pub(crate) fn sample_deal(
    deal_id: u64,
    piece_cid: Cid,
    start_epoch: ChainEpoch,
    end_epoch: ChainEpoch,
) -> DealInfo {
    DealInfo {
        deal_id,
        publish_cid: Some(test_cid(format!("publish-{deal_id}").as_bytes())),
        proposal: DealProposal {
            piece_cid,
            piece_size: 2048,
            client: Address::from("t1client"),
            provider: Address::from("t0123"),
            label: format!("deal-{deal_id}"),
            start_epoch,
            end_epoch,
            storage_price_per_epoch: 1,
            provider_collateral: 1,
        },
        schedule: DealSchedule {
            start_epoch,
            end_epoch,
        },
        keep_unsealed: true,
    }
}

pub(crate) fn sector_info(sector_number: SectorNumber, ticket_epoch: ChainEpoch) -> SectorInfo {
    SectorInfo {
        sector_number,
        sector_type: RegisteredSealProof::StackedDRG2KiBV1P1,
        pieces: Vec::new(),
        ticket_epoch,
        creation_time: 0,
        state: SectorState::PreCommitting,
    }
}

pub(crate) fn precommit_info(sector_number: SectorNumber) -> SectorPreCommitInfo {
    SectorPreCommitInfo {
        seal_proof: RegisteredSealProof::StackedDRG2KiBV1P1,
        sector_number,
        sealed_cid: test_cid(b"sealed"),
        seal_rand_epoch: 0,
        deal_ids: Vec::new(),
        expiration: 0,
        replace_capacity: false,
        replace_sector_deadline: 0,
        replace_sector_partition: 0,
        replace_sector_number: SectorNumber::new(0).expect("zero is a valid sector number"),
    }
}

pub(crate) fn batcher_fees() -> FeeConfig {
    FeeConfig {
        max_pre_commit_gas_fee: 1_000_000,
        max_pre_commit_batch_gas_fee: BatchFeeConfig {
            base: 3_000_000,
            per_sector: 1_000_000,
        },
    }
}

pub(crate) fn test_network() -> NetworkParams {
    NetworkParams {
        block_delay_secs: 30,
        wpost_proving_period: 2880,
    }
}

/// Polls `condition` until it holds, panicking when it never does.
pub(crate) async fn wait_for<C, F>(mut condition: C)
where
    C: FnMut() -> F,
    F: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentMessage {
    pub from: Address,
    pub to: Address,
    pub method: MethodNum,
    pub value: Currency,
    pub max_fee: Currency,
    pub params: Vec<u8>,
}

/// Chain and messager in one: serves a fixed head and records submissions.
pub(crate) struct StubChain {
    epoch: AtomicU64,
    sent: Mutex<Vec<SentMessage>>,
    fail_sends: AtomicBool,
    next_uid: AtomicU64,
}

impl StubChain {
    pub(crate) fn new(epoch: ChainEpoch) -> Self {
        Self {
            epoch: AtomicU64::new(epoch),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            next_uid: AtomicU64::new(0),
        }
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("stub chain lock poisoned").clone()
    }
}

#[async_trait]
impl ChainApi for StubChain {
    async fn chain_head(&self) -> Result<ChainEpoch, ApiError> {
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    async fn state_miner_info(&self, _miner: &Address) -> Result<MinerInfo, ApiError> {
        Ok(MinerInfo {
            owner: Address::from("t0123"),
            worker: Address::from("t0123"),
            control_addresses: Vec::new(),
        })
    }
}

#[async_trait]
impl MessagerApi for StubChain {
    async fn send_msg(
        &self,
        from: &Address,
        to: &Address,
        method: MethodNum,
        value: Currency,
        max_fee: Currency,
        params: &[u8],
    ) -> Result<MessageUid, ApiError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ApiError::Messager("stub messager set to fail".into()));
        }

        self.sent
            .lock()
            .expect("stub chain lock poisoned")
            .push(SentMessage {
                from: from.clone(),
                to: to.clone(),
                method,
                value,
                max_fee,
                params: params.to_vec(),
            });

        Ok(format!("msg-{}", self.next_uid.fetch_add(1, Ordering::SeqCst)))
    }
}

pub(crate) struct StaticAddressSelector {
    address: Address,
}

impl StaticAddressSelector {
    pub(crate) fn new(address: &str) -> Self {
        Self {
            address: Address::from(address),
        }
    }
}

#[async_trait]
impl AddressSelector for StaticAddressSelector {
    async fn address_for(
        &self,
        _use_kind: AddressUse,
        _miner_info: &MinerInfo,
        _good_funds: Currency,
        _min_funds: Currency,
    ) -> Result<Address, ApiError> {
        Ok(self.address.clone())
    }
}

/// Hands out 1, 2, 3, … like the metadata store's counter would.
pub(crate) struct SeqCounter {
    next: AtomicU32,
}

impl SeqCounter {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl SectorNumberCounter for SeqCounter {
    async fn next(&self) -> Result<SectorNumber, ApiError> {
        let number = self.next.fetch_add(1, Ordering::SeqCst);
        SectorNumber::new(number).map_err(|err| ApiError::Counter(err.to_string()))
    }
}

/// Event sink that just remembers everything it was sent.
#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<(SectorNumber, SectorEvent)>>,
}

impl RecordingEvents {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<(SectorNumber, SectorEvent)> {
        self.events
            .lock()
            .expect("recording events lock poisoned")
            .clone()
    }

    pub(crate) fn contains(&self, sector: SectorNumber, event: &SectorEvent) -> bool {
        self.events()
            .iter()
            .any(|(number, seen)| *number == sector && seen == event)
    }
}

impl SectorEventSink for RecordingEvents {
    fn send(&self, sector: SectorNumber, event: SectorEvent) -> Result<(), EventsClosed> {
        self.events
            .lock()
            .expect("recording events lock poisoned")
            .push((sector, event));
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct AddedPiece {
    pub sector: SectorNumber,
    pub existing: Vec<UnpaddedPieceSize>,
    pub size: UnpaddedPieceSize,
    pub bytes_read: u64,
}

/// Sealing layer double: swallows piece bytes and fabricates commitments.
#[derive(Default)]
pub(crate) struct MockSealer {
    new_sectors: Mutex<Vec<SectorRef>>,
    added: Mutex<Vec<AddedPiece>>,
    fail_adds: AtomicBool,
}

impl MockSealer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_adds(&self) {
        self.fail_adds.store(true, Ordering::SeqCst);
    }

    pub(crate) fn new_sectors(&self) -> Vec<SectorRef> {
        self.new_sectors
            .lock()
            .expect("mock sealer lock poisoned")
            .clone()
    }

    pub(crate) fn added_count(&self) -> usize {
        self.added.lock().expect("mock sealer lock poisoned").len()
    }

    pub(crate) fn with_added<R>(&self, f: impl FnOnce(&[AddedPiece]) -> R) -> R {
        f(&self.added.lock().expect("mock sealer lock poisoned"))
    }
}

#[async_trait]
impl SealerApi for MockSealer {
    async fn new_sector(&self, sector: SectorRef) -> Result<(), SealerError> {
        self.new_sectors
            .lock()
            .expect("mock sealer lock poisoned")
            .push(sector);
        Ok(())
    }

    async fn add_piece(
        &self,
        sector: SectorRef,
        existing_piece_sizes: &[UnpaddedPieceSize],
        piece_size: UnpaddedPieceSize,
        mut data: PieceData,
    ) -> Result<PieceInfo, SealerError> {
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(SealerError::Other("stub sealer set to fail".into()));
        }

        let mut bytes_read = 0u64;
        let mut buf = [0u8; 8192];
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            bytes_read += n as u64;
        }

        let mut added = self.added.lock().expect("mock sealer lock poisoned");
        let cid = test_cid(format!("added-{}-{}", sector.id.number, added.len()).as_bytes());
        added.push(AddedPiece {
            sector: sector.id.number,
            existing: existing_piece_sizes.to_vec(),
            size: piece_size,
            bytes_read,
        });

        Ok(PieceInfo {
            size: piece_size.padded(),
            cid,
        })
    }
}
