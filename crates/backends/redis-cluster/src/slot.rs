//! CRC16 hash-slot computation for Redis Cluster key routing.

/// Number of hash slots in a Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC16/XMODEM over `data` (polynomial 0x1021, initial value 0).
///
/// This is the checksum Redis Cluster specifies for slot assignment.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

/// Hash slot for a key, honoring `{...}` hash tags.
///
/// When the key contains a non-empty brace-delimited section, only that
/// section is hashed, so callers can pin related keys to one slot.
#[must_use]
pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key).unwrap_or(key)) % SLOT_COUNT
}

/// The hash-tag portion of a key, if present and non-empty.
fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let close = key[open + 1..].iter().position(|&b| b == b'}')?;
    if close == 0 {
        // "{}" hashes the whole key.
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_reference_vector() {
        // CRC16/XMODEM check value for the ASCII string "123456789".
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn well_known_slots() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"bar"), 5061);
    }

    #[test]
    fn hash_tag_pins_related_keys() {
        assert_eq!(
            hash_slot(b"{user1000}.following"),
            hash_slot(b"{user1000}.followers")
        );
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"user1000"));
    }

    #[test]
    fn empty_tag_hashes_whole_key() {
        assert_eq!(hash_slot(b"foo{}bar"), crc16(b"foo{}bar") % SLOT_COUNT);
    }

    #[test]
    fn only_first_tag_counts() {
        assert_eq!(hash_slot(b"{a}{b}"), hash_slot(b"a"));
    }

    #[test]
    fn slots_stay_in_range() {
        for key in [&b""[..], b"x", b"some:longer:key", b"{tag}rest"] {
            assert!(hash_slot(key) < SLOT_COUNT);
        }
    }
}
