use cid::Cid;
use primitives_shared::{
    ActorId, ChainEpoch, Currency, DealId, PaddedPieceSize, RegisteredSealProof, SectorId,
    SectorNumber, UnpaddedPieceSize,
};
use sha2::Digest;

// Reference: <https://github.com/multiformats/multicodec/blob/master/table.csv>
const SHA2_256_MULTICODEC_CODE: u64 = 0x12;
const JSON_MULTICODEC_CODE: u64 = 0x0200;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error(transparent)]
    Cid(#[from] cid::Error),

    #[error(transparent)]
    Multihash(#[from] cid::multihash::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// An on-chain account address, kept opaque to the pipeline — the wallet
/// and the messager are the only parties that interpret it.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Deserialize, ::serde::Serialize,
)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A client's offer to store a piece, as accepted by this provider.
#[derive(Debug, Clone, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct DealProposal {
    #[serde(deserialize_with = "deserialize_string_to_cid")]
    #[serde(serialize_with = "serialize_cid_to_string")]
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub client: Address,
    pub provider: Address,
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: Currency,
    pub provider_collateral: Currency,
}

impl DealProposal {
    /// Get the CID of this deal proposal, as serialized into JSON.
    pub fn json_cid(&self) -> Result<Cid, ConversionError> {
        let deal_proposal_json = serde_json::to_string(self)?;
        let deal_proposal_sha256 = sha2::Sha256::digest(&deal_proposal_json);
        let deal_proposal_multihash =
            cid::multihash::Multihash::wrap(SHA2_256_MULTICODEC_CODE, &deal_proposal_sha256)?;
        Ok(Cid::new_v1(JSON_MULTICODEC_CODE, deal_proposal_multihash))
    }
}

/// The epochs between which the deal's piece must be proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct DealSchedule {
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

/// Everything the pipeline tracks about a published deal.
#[derive(Debug, Clone, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct DealInfo {
    pub deal_id: DealId,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_string_to_opt_cid")]
    #[serde(serialize_with = "serialize_opt_cid_to_string")]
    pub publish_cid: Option<Cid>,
    pub proposal: DealProposal,
    pub schedule: DealSchedule,
    pub keep_unsealed: bool,
}

impl DealInfo {
    /// The hash uniquely identifying this deal while its piece is pending.
    pub fn proposal_cid(&self) -> Result<Cid, ConversionError> {
        self.proposal.json_cid()
    }
}

/// A piece committed into a sector: its commitment and padded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct PieceInfo {
    pub size: PaddedPieceSize,
    #[serde(deserialize_with = "deserialize_string_to_cid")]
    #[serde(serialize_with = "serialize_cid_to_string")]
    pub cid: Cid,
}

/// A piece placed in a sector. Padding pieces carry no deal.
#[derive(Debug, Clone, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct Piece {
    pub info: PieceInfo,
    pub deal: Option<DealInfo>,
}

/// Sector states the pipeline distinguishes. The full lifecycle belongs to
/// the embedding state machine; these are the states it reports back for
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Deserialize, ::serde::Serialize)]
pub enum SectorState {
    Undefined,
    Empty,
    WaitDeals,
    AddPiece,
    Packing,
    PreCommit1,
    PreCommit2,
    PreCommitting,
    PreCommitWait,
    WaitSeed,
    Committing,
    CommitWait,
    FinalizeSector,
    Proving,
    AddPieceFailed,
    SealFailed,
    Removed,
}

/// The sector record owned by the state machine; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct SectorInfo {
    pub sector_number: SectorNumber,
    pub sector_type: RegisteredSealProof,
    pub pieces: Vec<Piece>,
    pub ticket_epoch: ChainEpoch,
    /// Unix timestamp of the sector's creation; zero when unknown.
    pub creation_time: u64,
    pub state: SectorState,
}

impl SectorInfo {
    pub fn deal_ids(&self) -> Vec<DealId> {
        self.pieces
            .iter()
            .filter_map(|piece| piece.deal.as_ref())
            .map(|deal| deal.deal_id)
            .collect()
    }

    /// Unpadded sizes of the pieces already written, in write order.
    pub fn existing_piece_sizes(&self) -> Vec<UnpaddedPieceSize> {
        self.pieces
            .iter()
            .map(|piece| piece.info.size.unpadded())
            .collect()
    }
}

/// A sector as addressed by the sealing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub struct SectorRef {
    pub id: SectorId,
    pub proof_type: RegisteredSealProof,
}

impl SectorRef {
    pub fn new(miner: ActorId, number: SectorNumber, proof_type: RegisteredSealProof) -> Self {
        Self {
            id: SectorId { miner, number },
            proof_type,
        }
    }
}

pub(crate) fn serialize_cid_to_string<S>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error>
where
    S: ::serde::Serializer,
{
    serializer.serialize_str(&cid.to_string())
}

pub(crate) fn deserialize_string_to_cid<'de, D>(deserializer: D) -> Result<Cid, D::Error>
where
    D: ::serde::Deserializer<'de>,
{
    let cid_string = <String as ::serde::Deserialize>::deserialize(deserializer)?;
    cid_string.parse().map_err(::serde::de::Error::custom)
}

pub(crate) fn serialize_opt_cid_to_string<S>(
    cid: &Option<Cid>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: ::serde::Serializer,
{
    match cid {
        Some(cid) => serializer.serialize_some(&cid.to_string()),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_string_to_opt_cid<'de, D>(
    deserializer: D,
) -> Result<Option<Cid>, D::Error>
where
    D: ::serde::Deserializer<'de>,
{
    let cid_string = <Option<String> as ::serde::Deserialize>::deserialize(deserializer)?;
    cid_string
        .map(|s| s.parse().map_err(::serde::de::Error::custom))
        .transpose()
}
