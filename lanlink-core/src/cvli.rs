//! Compact variable-length integer: 7 bits per byte, least significant group
//! first, high bit set on every byte except the last. A u32 needs at most 5 bytes.

pub const MAX_CVLI_LEN: usize = 5;

/// Append the encoding of `value` to `out`.
pub fn encode(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode one value from the front of `bytes`.
/// Returns the value and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(u32, usize), CvliError> {
    let mut value: u64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if i >= MAX_CVLI_LEN {
            return Err(CvliError::TooLong);
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            let value = u32::try_from(value).map_err(|_| CvliError::Overflow)?;
            return Ok((value, i + 1));
        }
    }
    if bytes.len() >= MAX_CVLI_LEN {
        return Err(CvliError::TooLong);
    }
    Err(CvliError::NeedMore)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CvliError {
    #[error("need more bytes")]
    NeedMore,
    #[error("varint longer than 5 bytes")]
    TooLong,
    #[error("varint does not fit in u32")]
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        encode(v, &mut out);
        out
    }

    #[test]
    fn known_encodings() {
        assert_eq!(enc(0), vec![0x00]);
        assert_eq!(enc(1), vec![0x01]);
        assert_eq!(enc(127), vec![0x7f]);
        assert_eq!(enc(128), vec![0x80, 0x01]);
        assert_eq!(enc(300), vec![0xac, 0x02]);
        assert_eq!(enc(u32::MAX), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn decode_reports_consumed_bytes() {
        let mut buf = enc(300);
        buf.extend_from_slice(b"tail");
        assert_eq!(decode(&buf), Ok((300, 2)));
    }

    #[test]
    fn decode_partial_needs_more() {
        assert_eq!(decode(&[]), Err(CvliError::NeedMore));
        assert_eq!(decode(&[0x80, 0x80]), Err(CvliError::NeedMore));
    }

    #[test]
    fn decode_rejects_six_bytes() {
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(CvliError::TooLong)
        );
        assert_eq!(decode(&[0x80, 0x80, 0x80, 0x80, 0x80]), Err(CvliError::TooLong));
    }

    #[test]
    fn decode_rejects_overflow() {
        assert_eq!(decode(&[0xff, 0xff, 0xff, 0xff, 0x1f]), Err(CvliError::Overflow));
    }
}
