/// Block size of the transport padding scheme.
pub const PADDING_BLOCK: usize = 160;

pub struct MessageUtils;

impl MessageUtils {
    /// Pad a serialized plaintext for encryption: the plaintext, a
    /// single `0x80` terminator, then zeros. The buffer is one byte
    /// short of the next 160-byte multiple, so its length is always
    /// `159 (mod 160)`. Server-compatible; must not change.
    pub fn pad_message(plaintext: &[u8]) -> Vec<u8> {
        let padded_len = (plaintext.len() + 1) / PADDING_BLOCK * PADDING_BLOCK + PADDING_BLOCK - 1;
        let mut padded = vec![0u8; padded_len];
        padded[..plaintext.len()].copy_from_slice(plaintext);
        padded[plaintext.len()] = 0x80;
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_padding_law(len: usize) {
        let plaintext = vec![0xABu8; len];
        let padded = MessageUtils::pad_message(&plaintext);
        assert_eq!(padded.len() % PADDING_BLOCK, PADDING_BLOCK - 1, "len={len}");
        assert_eq!(&padded[..len], &plaintext[..], "len={len}");
        assert_eq!(padded[len], 0x80, "len={len}");
        assert!(
            padded[len + 1..].iter().all(|&b| b == 0),
            "tail must be zero for len={len}"
        );
    }

    #[test]
    fn test_padding_law_across_block_boundaries() {
        for len in [0, 1, 42, 158, 159, 160, 318, 319, 320, 1000] {
            assert_padding_law(len);
        }
    }

    #[test]
    fn test_small_message_pads_to_single_block() {
        assert_eq!(MessageUtils::pad_message(b"hi").len(), 159);
    }

    #[test]
    fn test_block_sized_message_spills_into_next_block() {
        assert_eq!(MessageUtils::pad_message(&[0u8; 159]).len(), 319);
    }
}
