use super::write_atomic;
use crate::error::{CoreError, CoreResult};
use bloomfilter::Bloom;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

const HEADER_SIZE: usize = 16;

/// Bloom filter over the streams of one index segment.
///
/// Sized from the expected number of entries and the target false
/// positive rate. The hash seeds are random per filter and travel with
/// the bitmap.
///
/// On disk: `[data_length u32][bits u64][hashes u32][filter bytes]`,
/// little-endian, where the filter bytes hold the bitmap, its sizing and
/// its seeds.
pub struct BloomFilter {
    bloom: Bloom<i64>,
    dirty: bool,
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.bits())
            .field("hashes", &self.hashes())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl BloomFilter {
    /// Creates an empty filter for `expected` entries at `false_positive_rate`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `expected` is zero or the rate is
    /// not in `(0, 1)`.
    pub fn new(expected: u64, false_positive_rate: f64) -> CoreResult<Self> {
        let items = usize::try_from(expected)
            .map_err(|_| CoreError::invalid_config(format!("bloom filter for {expected} entries")))?;
        let bloom = Bloom::new_for_fp_rate(items, false_positive_rate)
            .map_err(|e| CoreError::invalid_config(format!("bloom filter sizing: {e}")))?;
        debug!(
            expected,
            false_positive_rate,
            bits = bloom.number_of_bits(),
            hashes = bloom.number_of_hash_functions(),
            "created bloom filter"
        );
        Ok(Self { bloom, dirty: true })
    }

    /// Number of bits.
    #[must_use]
    pub fn bits(&self) -> u64 {
        self.bloom.number_of_bits()
    }

    /// Number of hash functions.
    #[must_use]
    pub fn hashes(&self) -> u32 {
        self.bloom.number_of_hash_functions()
    }

    /// True if changed since it was last written or loaded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Adds `stream` to the set.
    pub fn add(&mut self, stream: i64) {
        if !self.bloom.check_and_set(&stream) {
            self.dirty = true;
        }
    }

    /// False if `stream` was never added; true if it may have been.
    #[must_use]
    pub fn contains(&self, stream: i64) -> bool {
        self.bloom.check(&stream)
    }

    /// Serialized form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let data = self.bloom.as_slice();
        let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.bits().to_le_bytes());
        buf.extend_from_slice(&self.hashes().to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    /// Parses a serialized filter.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a malformed filter.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::corrupted("bloom filter header is truncated"));
        }
        let mut short = [0u8; 4];
        let mut long = [0u8; 8];
        short.copy_from_slice(&data[0..4]);
        let data_length = u32::from_le_bytes(short) as usize;
        long.copy_from_slice(&data[4..12]);
        let bits = u64::from_le_bytes(long);
        short.copy_from_slice(&data[12..16]);
        let hashes = u32::from_le_bytes(short);

        if data.len() != HEADER_SIZE + data_length {
            return Err(CoreError::corrupted(format!(
                "bloom filter holds {} data bytes, header says {data_length}",
                data.len() - HEADER_SIZE
            )));
        }
        let bloom = Bloom::<i64>::from_slice(&data[HEADER_SIZE..])
            .map_err(|e| CoreError::corrupted(format!("bloom filter data: {e}")))?;
        if bloom.number_of_bits() != bits || bloom.number_of_hash_functions() != hashes {
            return Err(CoreError::corrupted(format!(
                "bloom filter header says {bits} bits and {hashes} hashes, data has {} and {}",
                bloom.number_of_bits(),
                bloom.number_of_hash_functions()
            )));
        }
        Ok(Self { bloom, dirty: false })
    }

    /// Writes the filter to `path` unless nothing changed since the last
    /// write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&mut self, path: &Path) -> CoreResult<()> {
        if !self.dirty && path.exists() {
            return Ok(());
        }
        write_atomic(path, &self.encode())?;
        self.dirty = false;
        Ok(())
    }

    /// Reads a filter written by [`BloomFilter::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(path: &Path) -> CoreResult<Self> {
        Self::decode(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_tracks_rate() {
        let filter = BloomFilter::new(1000, 0.01).unwrap();
        // 1000 * |ln(0.01)| / ln(2)^2 = 9585.06
        assert!((9_500..=9_700).contains(&filter.bits()), "{} bits", filter.bits());
        assert_eq!(filter.hashes(), 7);

        let tighter = BloomFilter::new(1000, 0.001).unwrap();
        assert!(tighter.bits() > filter.bits());
    }

    #[test]
    fn invalid_sizing_is_rejected() {
        assert!(matches!(BloomFilter::new(0, 0.01), Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(10_000, 0.01).unwrap();
        for stream in 0..10_000 {
            filter.add(stream * 31);
        }
        for stream in 0..10_000 {
            assert!(filter.contains(stream * 31));
        }
    }

    #[test]
    fn false_positive_rate_is_near_target() {
        let mut filter = BloomFilter::new(10_000, 0.01).unwrap();
        for stream in 0..10_000 {
            filter.add(stream);
        }
        // 100 000 absent streams at 1% should give about 1 000 hits
        let false_positives = (10_000..110_000).filter(|s| filter.contains(*s)).count();
        assert!(false_positives < 1_500, "{false_positives} false positives");
    }

    #[test]
    fn write_skips_clean_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-FILTER.dat");
        let mut filter = BloomFilter::new(100, 0.05).unwrap();
        filter.add(42);
        filter.write(&path).unwrap();
        assert!(!filter.is_dirty());

        let loaded = BloomFilter::load(&path).unwrap();
        assert!(loaded.contains(42));
        assert_eq!(loaded.encode(), filter.encode());

        // re-adding a known stream changes nothing
        filter.add(42);
        assert!(!filter.is_dirty());

        std::fs::write(&path, b"stale").unwrap();
        filter.write(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"stale");
        filter.add(43);
        assert!(filter.is_dirty());
        filter.write(&path).unwrap();
        assert!(BloomFilter::load(&path).unwrap().contains(43));
    }

    #[test]
    fn damaged_filter_is_rejected() {
        let mut encoded = BloomFilter::new(100, 0.05).unwrap().encode();
        encoded.pop();
        assert!(BloomFilter::decode(&encoded).is_err());
        assert!(BloomFilter::decode(&[0; 8]).is_err());

        let mut encoded = BloomFilter::new(100, 0.05).unwrap().encode();
        encoded[4] ^= 0xFF;
        assert!(BloomFilter::decode(&encoded).is_err());
    }
}
