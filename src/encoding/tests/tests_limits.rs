//! Truncated input and length limits.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::encoding::*;

    /// # Scenario
    /// Every primitive decoder is given fewer bytes than it needs.
    ///
    /// # Expected behavior
    /// `UnexpectedEof` reports both the needed and the available count.
    #[test]
    fn truncated__unexpected_eof() {
        match decode_from_slice::<u64>(&[1, 2, 3]) {
            Err(EncodingError::UnexpectedEof { needed, available }) => {
                assert_eq!(needed, 8);
                assert_eq!(available, 3);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
        assert!(matches!(
            decode_from_slice::<u8>(&[]),
            Err(EncodingError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            decode_from_slice::<Vec<u8>>(&[5, 0, 0, 0, 1, 2]),
            Err(EncodingError::UnexpectedEof { .. })
        ));
    }

    /// # Scenario
    /// A length prefix just above `MAX_BYTE_LEN`.
    ///
    /// # Expected behavior
    /// Rejected as `LengthOverflow` before any allocation.
    #[test]
    fn byte_len__above_limit_rejected() {
        let buf = (MAX_BYTE_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_from_slice::<Vec<u8>>(&buf),
            Err(EncodingError::LengthOverflow(_))
        ));
        assert!(matches!(
            decode_from_slice::<String>(&buf),
            Err(EncodingError::LengthOverflow(_))
        ));
    }

    /// # Scenario
    /// A vector count just above `MAX_VEC_ELEMENTS`, and one that claims
    /// more elements than the buffer holds.
    ///
    /// # Expected behavior
    /// `LengthOverflow` and `UnexpectedEof` respectively.
    #[test]
    fn vec_count__limit_and_truncation() {
        let buf = (MAX_VEC_ELEMENTS + 1).to_le_bytes();
        assert!(matches!(
            decode_vec::<u64>(&buf),
            Err(EncodingError::LengthOverflow(_))
        ));

        let mut buf = 3u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            decode_vec::<u64>(&buf),
            Err(EncodingError::UnexpectedEof { .. })
        ));
    }
}
