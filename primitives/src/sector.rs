use core::fmt::Display;

/// Max number of sectors a single miner actor can allocate.
pub const MAX_SECTORS: u32 = 32 << 20;

/// Unique identifier of an actor on chain.
pub type ActorId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SectorNumberError {
    #[error("sector number is too large")]
    NumberTooLarge,
}

/// Unique identifier for a sector within one miner actor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ::serde::Serialize,
)]
pub struct SectorNumber(u32);

impl SectorNumber {
    /// Creates a new `SectorNumber`, rejecting numbers above [`MAX_SECTORS`].
    pub fn new(sector_number: u32) -> Result<Self, SectorNumberError> {
        if sector_number > MAX_SECTORS {
            return Err(SectorNumberError::NumberTooLarge);
        }

        Ok(Self(sector_number))
    }
}

impl<'de> ::serde::Deserialize<'de> for SectorNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: ::serde::Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        SectorNumber::new(value).map_err(|_| {
            ::serde::de::Error::invalid_value(
                ::serde::de::Unexpected::Unsigned(value as u64),
                &"an integer between 0 and MAX_SECTORS",
            )
        })
    }
}

impl From<u16> for SectorNumber {
    fn from(value: u16) -> Self {
        SectorNumber(value as u32)
    }
}

impl TryFrom<u32> for SectorNumber {
    type Error = SectorNumberError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SectorNumber> for u32 {
    fn from(value: SectorNumber) -> Self {
        value.0
    }
}

impl From<SectorNumber> for u64 {
    fn from(value: SectorNumber) -> Self {
        value.0 as u64
    }
}

impl Display for SectorNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique sector identifier: the owning miner actor plus the
/// sector number it allocated.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    ::serde::Deserialize,
    ::serde::Serialize,
)]
pub struct SectorId {
    pub miner: ActorId,
    pub number: SectorNumber,
}

impl Display for SectorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{{}, {}}}", self.miner, self.number)
    }
}

/// SectorSize indicates one of a set of possible sizes in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ::serde::Deserialize, ::serde::Serialize)]
pub enum SectorSize {
    _2KiB,
    _8MiB,
    _512MiB,
    _32GiB,
    _64GiB,
}

impl SectorSize {
    /// Returns the size of a sector in bytes.
    pub fn bytes(&self) -> u64 {
        match self {
            SectorSize::_2KiB => 2 << 10,
            SectorSize::_8MiB => 8 << 20,
            SectorSize::_512MiB => 512 << 20,
            SectorSize::_32GiB => 32 << 30,
            SectorSize::_64GiB => 2 * (32 << 30),
        }
    }

    /// How many deals a sector of this size may carry.
    pub fn max_deal_count(&self) -> usize {
        match self {
            SectorSize::_64GiB => 512,
            _ => 256,
        }
    }
}

impl core::fmt::Display for SectorSize {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SectorSize::_2KiB => write!(f, "2KiB"),
            SectorSize::_8MiB => write!(f, "8MiB"),
            SectorSize::_512MiB => write!(f, "512MiB"),
            SectorSize::_32GiB => write!(f, "32GiB"),
            SectorSize::_64GiB => write!(f, "64GiB"),
        }
    }
}

/// Proof of Replication seal proof type, one per supported sector size.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisteredSealProof {
    StackedDRG2KiBV1P1,
    StackedDRG8MiBV1P1,
    StackedDRG512MiBV1P1,
    StackedDRG32GiBV1P1,
    StackedDRG64GiBV1P1,
}

impl RegisteredSealProof {
    pub fn sector_size(&self) -> SectorSize {
        match self {
            RegisteredSealProof::StackedDRG2KiBV1P1 => SectorSize::_2KiB,
            RegisteredSealProof::StackedDRG8MiBV1P1 => SectorSize::_8MiB,
            RegisteredSealProof::StackedDRG512MiBV1P1 => SectorSize::_512MiB,
            RegisteredSealProof::StackedDRG32GiBV1P1 => SectorSize::_32GiB,
            RegisteredSealProof::StackedDRG64GiBV1P1 => SectorSize::_64GiB,
        }
    }

    /// The proof's identifier in the on-chain proof registry.
    pub fn on_chain_id(&self) -> i64 {
        match self {
            RegisteredSealProof::StackedDRG2KiBV1P1 => 5,
            RegisteredSealProof::StackedDRG8MiBV1P1 => 6,
            RegisteredSealProof::StackedDRG512MiBV1P1 => 7,
            RegisteredSealProof::StackedDRG32GiBV1P1 => 8,
            RegisteredSealProof::StackedDRG64GiBV1P1 => 9,
        }
    }

    fn from_on_chain_id(id: i64) -> Option<Self> {
        Some(match id {
            5 => RegisteredSealProof::StackedDRG2KiBV1P1,
            6 => RegisteredSealProof::StackedDRG8MiBV1P1,
            7 => RegisteredSealProof::StackedDRG512MiBV1P1,
            8 => RegisteredSealProof::StackedDRG32GiBV1P1,
            9 => RegisteredSealProof::StackedDRG64GiBV1P1,
            _ => return None,
        })
    }
}

impl ::serde::Serialize for RegisteredSealProof {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ::serde::Serializer,
    {
        serializer.serialize_i64(self.on_chain_id())
    }
}

impl<'de> ::serde::Deserialize<'de> for RegisteredSealProof {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: ::serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        RegisteredSealProof::from_on_chain_id(id).ok_or_else(|| {
            ::serde::de::Error::invalid_value(
                ::serde::de::Unexpected::Signed(id),
                &"a registered seal proof id",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_number_bounds() {
        assert!(SectorNumber::new(0).is_ok());
        assert!(SectorNumber::new(MAX_SECTORS).is_ok());
        assert_eq!(
            SectorNumber::new(MAX_SECTORS + 1),
            Err(SectorNumberError::NumberTooLarge)
        );
    }

    #[test]
    fn sector_size_deal_limits() {
        assert_eq!(SectorSize::_32GiB.max_deal_count(), 256);
        assert_eq!(SectorSize::_64GiB.max_deal_count(), 512);
    }

    #[test]
    fn seal_proof_ids_round_trip() {
        for proof in [
            RegisteredSealProof::StackedDRG2KiBV1P1,
            RegisteredSealProof::StackedDRG8MiBV1P1,
            RegisteredSealProof::StackedDRG512MiBV1P1,
            RegisteredSealProof::StackedDRG32GiBV1P1,
            RegisteredSealProof::StackedDRG64GiBV1P1,
        ] {
            assert_eq!(
                RegisteredSealProof::from_on_chain_id(proof.on_chain_id()),
                Some(proof)
            );
        }
    }

    #[test]
    fn seal_proof_serializes_as_registry_id() {
        let json = serde_json::to_string(&RegisteredSealProof::StackedDRG32GiBV1P1).unwrap();
        assert_eq!(json, "8");
        let back: RegisteredSealProof = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RegisteredSealProof::StackedDRG32GiBV1P1);
    }
}
