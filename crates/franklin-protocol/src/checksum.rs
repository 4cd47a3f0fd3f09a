//! Group checksum used by identify frames
//!
//! Every 3-byte group of payload gets one check byte. The last group is
//! zero-padded, so an `n`-byte payload carries `ceil(n / 3)` check bytes.

use crate::error::ParseError;

/// Bytes of payload covered by one check byte
pub const GROUP_LEN: usize = 3;

/// Number of check bytes needed for a payload of `len` bytes
pub fn checksum_len(len: usize) -> usize {
    len.div_ceil(GROUP_LEN)
}

fn group_check(index: usize, group: &[u8]) -> u8 {
    let mut bytes = [0u8; GROUP_LEN];
    bytes[..group.len()].copy_from_slice(group);
    let salt = 0x5a_u8.wrapping_add((index as u8).wrapping_mul(0x11));
    bytes[0] ^ bytes[1].rotate_left(3) ^ bytes[2].rotate_left(5) ^ salt
}

/// Compute the check bytes for `payload`
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    payload
        .chunks(GROUP_LEN)
        .enumerate()
        .map(|(i, group)| group_check(i, group))
        .collect()
}

/// Verify a frame made of `payload` followed by its check bytes
///
/// Returns the first mismatching group as an error.
pub fn verify(frame: &[u8], payload_len: usize) -> Result<(), ParseError> {
    let needed = payload_len + checksum_len(payload_len);
    if frame.len() < needed {
        return Err(ParseError::Incomplete {
            needed: needed - frame.len(),
        });
    }

    let (payload, checks) = frame[..needed].split_at(payload_len);
    for (group, (chunk, &actual)) in payload.chunks(GROUP_LEN).zip(checks).enumerate() {
        let expected = group_check(group, chunk);
        if expected != actual {
            return Err(ParseError::ChecksumMismatch {
                group,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Check whether a frame with a `payload_len`-byte payload is intact
pub fn check(frame: &[u8], payload_len: usize) -> bool {
    verify(frame, payload_len).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_len() {
        assert_eq!(checksum_len(25), 9);
        assert_eq!(checksum_len(3), 1);
        assert_eq!(checksum_len(4), 2);
    }

    #[test]
    fn test_check_accepts_own_checksum() {
        let payload: Vec<u8> = (0..25).collect();
        let mut frame = payload.clone();
        frame.extend(checksum(&payload));
        assert_eq!(frame.len(), 34);
        assert!(check(&frame, 25));
    }

    #[test]
    fn test_check_rejects_flipped_bit() {
        let payload: Vec<u8> = (0..25).collect();
        let mut frame = payload.clone();
        frame.extend(checksum(&payload));
        frame[10] ^= 0x04;
        assert!(matches!(
            verify(&frame, 25),
            Err(ParseError::ChecksumMismatch { group: 3, .. })
        ));
    }

    #[test]
    fn test_short_frame_is_incomplete() {
        assert_eq!(
            verify(&[0u8; 30], 25),
            Err(ParseError::Incomplete { needed: 4 })
        );
    }
}
