//! Parser combinators for raw `sockaddr` headers.
//!
//! The kernel writes addresses in host byte order, so these helpers read
//! native-endian integers rather than the little-endian wire helpers winnow
//! ships with.

use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;

/// Result type for winnow parsers.
pub(crate) type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// Parse a native-endian u16.
pub(crate) fn parse_u16_ne(input: &mut &[u8]) -> PResult<u16> {
    let bytes: &[u8] = take(2usize).parse_next(input)?;
    Ok(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

/// Parse a native-endian u32.
pub(crate) fn parse_u32_ne(input: &mut &[u8]) -> PResult<u32> {
    let bytes: &[u8] = take(4usize).parse_next(input)?;
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Split a raw address into its `sa_family_t` tag and the family payload.
pub(crate) fn parse_family_header<'a>(input: &mut &'a [u8]) -> PResult<(u16, &'a [u8])> {
    let family = parse_u16_ne(input)?;
    let payload: &[u8] = take(input.len()).parse_next(input)?;
    Ok((family, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u16_ne() {
        let data = 0x1234u16.to_ne_bytes();
        let mut input = &data[..];
        assert_eq!(parse_u16_ne(&mut input).unwrap(), 0x1234);
        assert!(input.is_empty());
    }

    #[test]
    fn test_parse_u32_ne_short_input() {
        let data = [1u8, 2, 3];
        let mut input = &data[..];
        assert!(parse_u32_ne(&mut input).is_err());
    }

    #[test]
    fn test_parse_family_header() {
        let mut data = (libc::AF_UNIX as u16).to_ne_bytes().to_vec();
        data.extend_from_slice(b"/tmp/x\0");
        let mut input = &data[..];
        let (family, payload) = parse_family_header(&mut input).unwrap();
        assert_eq!(i32::from(family), libc::AF_UNIX);
        assert_eq!(payload, b"/tmp/x\0");
        assert!(input.is_empty());
    }
}
