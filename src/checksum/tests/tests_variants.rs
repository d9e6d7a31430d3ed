//! Composite, block, and rolling checksum variants.

#[cfg(test)]
mod tests {
    use crate::checksum::{
        Algorithm, BlockChecksum, Checksum, CompositeChecksum, Crc32, RollingChecksum, XxHash64,
    };

    // ----------------------------------------------------------------
    // Composite
    // ----------------------------------------------------------------

    #[test]
    fn composite_folds_both_halves() {
        let data = b"two algorithms, one word";
        let composite = CompositeChecksum::default_pair();

        let value = composite.calculate(data);
        let high = value >> 32;
        let low = value & 0xFFFF_FFFF;

        assert_eq!(high, Crc32.calculate(data) & 0xFFFF_FFFF);
        assert_eq!(low, XxHash64.calculate(data) & 0xFFFF_FFFF);
    }

    #[test]
    fn composite_detects_what_either_half_detects() {
        let composite = CompositeChecksum::default_pair();
        let sum = composite.calculate(b"original");
        assert!(!composite.verify(b"0riginal", sum));
    }

    // ----------------------------------------------------------------
    // Block
    // ----------------------------------------------------------------

    #[test]
    fn block_checksums_cover_short_trailing_block() {
        let block = BlockChecksum::new(Box::new(Crc32), 8);
        // 20 bytes → blocks of 8, 8, 4.
        let data: Vec<u8> = (0u8..20).collect();
        let sums = block.checksum_blocks(&data);
        assert_eq!(sums.len(), 3);
        assert_eq!(block.verify_blocks(&data, &sums), None);
    }

    #[test]
    fn verify_blocks_reports_first_mismatching_block() {
        let block = BlockChecksum::new(Box::new(Crc32), 8);
        let mut data: Vec<u8> = (0u8..32).collect();
        let sums = block.checksum_blocks(&data);

        // Corrupt a byte inside the third block.
        data[17] ^= 0xFF;
        assert_eq!(block.verify_blocks(&data, &sums), Some(2));
    }

    #[test]
    fn verify_blocks_flags_truncated_data() {
        let block = BlockChecksum::new(Box::new(Crc32), 8);
        let data: Vec<u8> = (0u8..32).collect();
        let sums = block.checksum_blocks(&data);

        // Dropping the last block entirely must be reported at its index.
        assert_eq!(block.verify_blocks(&data[..24], &sums), Some(3));
    }

    #[test]
    fn verify_blocks_flags_extra_data() {
        let block = BlockChecksum::new(Box::new(Crc32), 8);
        let data: Vec<u8> = (0u8..16).collect();
        let sums = block.checksum_blocks(&data);

        let mut longer = data.clone();
        longer.extend_from_slice(&[1, 2, 3]);
        assert_eq!(block.verify_blocks(&longer, &sums), Some(2));
    }

    // ----------------------------------------------------------------
    // Rolling
    // ----------------------------------------------------------------

    #[test]
    fn rolling_window_matches_direct_recompute() {
        // The rolled value over a full window must equal the value
        // obtained by feeding the same window bytes into a fresh roller.
        let data: Vec<u8> = (0u8..64).map(|b| b.wrapping_mul(37)).collect();
        let window = 16;

        let mut roller = RollingChecksum::new(Algorithm::XxHash64, window);
        let mut last = 0;
        for &b in &data {
            last = roller.push(b);
        }

        let mut fresh = RollingChecksum::new(Algorithm::XxHash64, window);
        let mut expected = 0;
        for &b in &data[data.len() - window..] {
            expected = fresh.push(b);
        }

        assert_eq!(last, expected);
    }

    #[test]
    fn rolling_crc_variant_recomputes_over_window() {
        let mut roller = RollingChecksum::new(Algorithm::Crc32, 4);
        for b in [1u8, 2, 3, 4, 5, 6] {
            roller.push(b);
        }
        // Window now holds [3, 4, 5, 6].
        assert_eq!(roller.len(), 4);
        assert_eq!(roller.value(), Crc32.calculate(&[3, 4, 5, 6]));
    }

    #[test]
    fn rolling_distinguishes_shifted_windows() {
        let mut a = RollingChecksum::new(Algorithm::XxHash64, 4);
        let mut b = RollingChecksum::new(Algorithm::XxHash64, 4);

        let va = [10u8, 20, 30, 40].iter().map(|&x| a.push(x)).last().unwrap();
        let vb = [20u8, 30, 40, 50].iter().map(|&x| b.push(x)).last().unwrap();
        assert_ne!(va, vb);
    }
}
