use crate::error::{CoreError, CoreResult};

/// Splits 64-bit log addresses into a segment id and an offset.
///
/// ```text
/// | segment id (segment_bits) | offset (64 - segment_bits) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressCodec {
    segment_bits: u32,
}

impl AddressCodec {
    /// Creates a codec reserving `segment_bits` high bits for the segment id.
    ///
    /// # Errors
    ///
    /// Returns an error unless `1 <= segment_bits <= 63`.
    pub fn new(segment_bits: u32) -> CoreResult<Self> {
        if !(1..64).contains(&segment_bits) {
            return Err(CoreError::invalid_config(format!(
                "segment_bits must be within 1..=63, got {segment_bits}"
            )));
        }
        Ok(Self { segment_bits })
    }

    /// Bits used for the segment id.
    #[must_use]
    pub fn segment_bits(&self) -> u32 {
        self.segment_bits
    }

    /// Bits used for the offset.
    #[must_use]
    pub fn offset_bits(&self) -> u32 {
        64 - self.segment_bits
    }

    /// Largest segment id that can be addressed.
    #[must_use]
    pub fn max_segment_id(&self) -> u64 {
        (1u64 << self.segment_bits) - 1
    }

    /// Largest offset that can be addressed.
    #[must_use]
    pub fn max_offset(&self) -> u64 {
        (1u64 << self.offset_bits()) - 1
    }

    /// Builds the address of `offset` inside segment `segment_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AddressOverflow`] if either part does not fit.
    pub fn encode(&self, segment_id: u64, offset: u64) -> CoreResult<u64> {
        if segment_id > self.max_segment_id() {
            return Err(CoreError::address_overflow(format!(
                "segment id {segment_id} exceeds {} bits",
                self.segment_bits
            )));
        }
        if offset > self.max_offset() {
            return Err(CoreError::address_overflow(format!(
                "offset {offset} exceeds {} bits",
                self.offset_bits()
            )));
        }
        Ok((segment_id << self.offset_bits()) | offset)
    }

    /// Like [`AddressCodec::encode`] for parts already known to fit.
    pub(crate) fn pack(&self, segment_id: u64, offset: u64) -> u64 {
        (segment_id << self.offset_bits()) | (offset & self.max_offset())
    }

    /// Splits an address into `(segment_id, offset)`.
    #[must_use]
    pub fn decode(&self, address: u64) -> (u64, u64) {
        (address >> self.offset_bits(), address & self.max_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn address_split() {
        let codec = AddressCodec::new(18).unwrap();
        assert_eq!(codec.offset_bits(), 46);
        let address = codec.encode(3, 1234).unwrap();
        assert_eq!(address >> 46, 3);
        assert_eq!(codec.decode(address), (3, 1234));
    }

    #[test]
    fn overflow_is_rejected() {
        let codec = AddressCodec::new(4).unwrap();
        assert!(codec.encode(15, 0).is_ok());
        assert!(matches!(
            codec.encode(16, 0),
            Err(CoreError::AddressOverflow { .. })
        ));
        assert!(codec.encode(1, 1 << 60).is_err());
        assert!(AddressCodec::new(0).is_err());
        assert!(AddressCodec::new(64).is_err());
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(bits in 1u32..40, id in any::<u64>(), offset in any::<u64>()) {
            let codec = AddressCodec::new(bits).unwrap();
            let id = id & codec.max_segment_id();
            let offset = offset & codec.max_offset();
            let address = codec.encode(id, offset).unwrap();
            prop_assert_eq!(codec.decode(address), (id, offset));
            prop_assert!(codec.encode(id, offset + 1).is_ok() || offset == codec.max_offset());
        }
    }
}
