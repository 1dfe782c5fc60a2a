use core::ops::{Add, AddAssign, Deref, Rem, Sub};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnpaddedPieceSizeError {
    #[error("minimum piece size is 127 bytes")]
    SizeTooSmall,
    #[error("unpadded piece size must be a power of 2 multiple of 127")]
    SizeNotQuantized,
}

/// Size of a piece in bytes. Unpadded piece size must be a power of two
/// multiple of 127.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ::serde::Deserialize, ::serde::Serialize,
)]
pub struct UnpaddedPieceSize(u64);

impl UnpaddedPieceSize {
    /// The minimum piece size.
    pub const MIN: UnpaddedPieceSize = UnpaddedPieceSize(127);

    /// Initialize a new unpadded piece size. Error is returned if the size
    /// is invalid.
    pub fn new(size: u64) -> Result<Self, UnpaddedPieceSizeError> {
        if size < 127 {
            return Err(UnpaddedPieceSizeError::SizeTooSmall);
        }

        // is 127 * 2^n
        if size >> size.trailing_zeros() != 127 {
            return Err(UnpaddedPieceSizeError::SizeNotQuantized);
        }

        Ok(Self(size))
    }

    /// Converts unpadded piece size into padded piece size.
    pub fn padded(self) -> PaddedPieceSize {
        PaddedPieceSize(self.0 + (self.0 / 127))
    }
}

impl core::fmt::Display for UnpaddedPieceSize {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for UnpaddedPieceSize {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Add for UnpaddedPieceSize {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        UnpaddedPieceSize(self.0 + other.0)
    }
}

impl AddAssign for UnpaddedPieceSize {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for UnpaddedPieceSize {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        UnpaddedPieceSize(self.0 - other.0)
    }
}

impl Rem for UnpaddedPieceSize {
    type Output = Self;

    fn rem(self, other: Self) -> Self::Output {
        UnpaddedPieceSize(self.0 % other.0)
    }
}

impl core::iter::Sum for UnpaddedPieceSize {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(UnpaddedPieceSize(0), |acc, x| acc + x)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaddedPieceSizeError {
    #[error("minimum piece size is 128 bytes")]
    SizeTooSmall,
    #[error("padded piece size must be a power of 2")]
    SizeNotPowerOfTwo,
}

/// Size of a piece in bytes with padding. A valid padded size is always a
/// power of two; sums of padded sizes (offsets, fill levels) are carried in
/// the same unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ::serde::Deserialize, ::serde::Serialize,
)]
pub struct PaddedPieceSize(u64);

impl PaddedPieceSize {
    /// The minimum piece size.
    pub const MIN: PaddedPieceSize = PaddedPieceSize(128);

    /// Initialize a new padded piece size. Error is returned if the size is
    /// invalid.
    pub fn new(size: u64) -> Result<Self, PaddedPieceSizeError> {
        if size < 128 {
            return Err(PaddedPieceSizeError::SizeTooSmall);
        }

        if size.count_ones() != 1 {
            return Err(PaddedPieceSizeError::SizeNotPowerOfTwo);
        }

        Ok(Self(size))
    }

    /// Converts padded piece size into an unpadded piece size.
    pub fn unpadded(self) -> UnpaddedPieceSize {
        UnpaddedPieceSize(self.0 - (self.0 / 128))
    }

    /// The smallest valid piece size that holds `size` arbitrary bytes:
    /// account for the Fr32 expansion ("0" bits after every 127 bytes), then
    /// round up to the next power of two for the binary merkle tree.
    pub fn from_arbitrary_size(size: u64) -> Self {
        let padded_bytes = size + (size / 127);
        Self(padded_bytes.next_power_of_two())
    }
}

impl core::fmt::Display for PaddedPieceSize {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for PaddedPieceSize {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Add for PaddedPieceSize {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        PaddedPieceSize(self.0 + other.0)
    }
}

impl AddAssign for PaddedPieceSize {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for PaddedPieceSize {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        PaddedPieceSize(self.0 - other.0)
    }
}

impl Rem for PaddedPieceSize {
    type Output = Self;

    fn rem(self, other: Self) -> Self::Output {
        PaddedPieceSize(self.0 % other.0)
    }
}

impl core::iter::Sum for PaddedPieceSize {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(PaddedPieceSize(0), |acc, x| acc + x)
    }
}

/// Computes the zero-filled pieces needed between the current write offset
/// and the next piece, which may only start at a multiple of its own size.
///
/// The gap decomposes into power-of-two pieces, smallest first (each piece
/// lands on a multiple of its own size that way). Returns the pad piece
/// sizes and their total, all in padded bytes.
pub fn required_padding(
    offset: PaddedPieceSize,
    next: PaddedPieceSize,
) -> (Vec<PaddedPieceSize>, PaddedPieceSize) {
    let mut to_fill = offset.0.wrapping_neg() % next.0;

    let mut pads = Vec::with_capacity(to_fill.count_ones() as usize);
    let mut total = 0u64;
    while to_fill > 0 {
        let pad = 1u64 << to_fill.trailing_zeros();
        to_fill ^= pad;

        pads.push(PaddedPieceSize(pad));
        total += pad;
    }

    (pads, PaddedPieceSize(total))
}
