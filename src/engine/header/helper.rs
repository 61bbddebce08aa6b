use crate::error::{BackupError, Result};

/// Marker bit of the GNU base-256 numeric encoding.
const BASE256_FLAG: u8 = 0x80;

// Helper to extract null-terminated strings
pub(crate) fn get_str(buf: &[u8]) -> Result<String> {
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..nul].to_vec())
        .map_err(|e| BackupError::corrupt(format!("invalid utf-8 in header field: {}", e)))
}

// Helper to extract strings that keep at least `min_size` bytes (magic/version)
pub(crate) fn get_str_with_min_size(buf: &[u8], min_size: usize) -> Result<String> {
    let nul = buf.iter().enumerate().position(|(i, &b)| i >= min_size && b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..nul].to_vec())
        .map_err(|e| BackupError::corrupt(format!("invalid utf-8 in header field: {}", e)))
}

// Helper to parse octal strings
pub(crate) fn parse_octal<T>(buf: &[u8]) -> Result<T>
where
    T: num_traits::Num,
{
    let s = std::str::from_utf8(buf)
        .map_err(|_| BackupError::corrupt("non ascii octal field"))?
        .trim_matches(|c| c == '\0' || c == ' ');
    if s.is_empty() {
        return Ok(T::zero());
    }
    T::from_str_radix(s, 8).map_err(|_| BackupError::corrupt(format!("invalid octal: {:?}", s)))
}

// Helper to parse a numeric field, either octal or GNU base-256
pub(crate) fn parse_numeric(buf: &[u8]) -> Result<u64> {
    if buf.first().is_some_and(|b| b & BASE256_FLAG != 0) {
        let mut value = u64::from(buf[0] & !BASE256_FLAG);
        for &b in &buf[1..] {
            if value > (u64::MAX >> 8) {
                return Err(BackupError::corrupt("base-256 field overflows u64"));
            }
            value = (value << 8) | u64::from(b);
        }
        return Ok(value);
    }
    parse_octal::<u64>(buf)
}

// Helper to parse a numeric field that must fit in 32 bits
pub(crate) fn parse_numeric_u32(buf: &[u8]) -> Result<u32> {
    let value = parse_numeric(buf)?;
    u32::try_from(value).map_err(|_| BackupError::corrupt(format!("value {} does not fit 32 bits", value)))
}

// Helper to write a string (null-padded, truncated to the field width)
pub(crate) fn put_str(dst: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
    if len < dst.len() {
        dst[len..].fill(0);
    }
}

// Helper to write octal numbers as zero-padded, null-terminated strings.
// Values too large for the octal digits fall back to GNU base-256.
pub(crate) fn put_numeric(dst: &mut [u8], value: u64) {
    let digits = dst.len() - 1;
    let fits = digits * 3 >= 64 || value < (1u64 << (digits * 3));
    if fits {
        let s = format!("{:0width$o}", value, width = digits);
        dst[..digits].copy_from_slice(&s.as_bytes()[..digits]);
        dst[digits] = b'\0';
        return;
    }
    dst.fill(0);
    let be = value.to_be_bytes();
    let room = dst.len() - 1;
    let take = be.len().min(room);
    let start = dst.len() - take;
    dst[start..].copy_from_slice(&be[be.len() - take..]);
    dst[0] |= BASE256_FLAG;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_str_basic() {
        let data = b"hello\0world";
        match get_str(data) {
            Ok(v) => assert_eq!(v, "hello"),
            Err(e) => panic!("Failed to get string: {}", e),
        }
    }

    #[test]
    fn test_get_str_no_null() {
        let data = b"abcde";
        match get_str(data) {
            Ok(v) => assert_eq!(v, "abcde"),
            Err(e) => panic!("Failed to get string: {}", e),
        }
    }

    #[test]
    fn test_get_str_with_min_size_keeps_magic() {
        let data = b"ustar \0";
        match get_str_with_min_size(&data[..6], 6) {
            Ok(v) => assert_eq!(v, "ustar "),
            Err(e) => panic!("Failed to get string: {}", e),
        }
        match get_str_with_min_size(b" \0", 2) {
            Ok(v) => assert_eq!(v, " \0"),
            Err(e) => panic!("Failed to get string: {}", e),
        }
    }

    #[test]
    fn test_parse_octal_u32() {
        let val: u32 = parse_octal(b"0000644\0").unwrap();
        assert_eq!(val, 0o644);
    }

    #[test]
    fn test_parse_octal_space_terminated() {
        let val: u32 = parse_octal(b"012345\0 ").unwrap();
        assert_eq!(val, 0o12345);
    }

    #[test]
    fn test_parse_octal_empty() {
        let val: u32 = parse_octal(b"\0\0\0").unwrap();
        assert_eq!(val, 0);
    }

    #[test]
    fn test_parse_octal_invalid() {
        let val: Result<u32> = parse_octal(b"notnum\0");
        assert!(val.is_err());
    }

    #[test]
    fn test_put_str_truncate() {
        let mut buf = [0u8; 4];
        put_str(&mut buf, "abcdef");
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_put_str_pads_with_nulls() {
        let mut buf = [0xFFu8; 8];
        put_str(&mut buf, "abc");
        assert_eq!(&buf, b"abc\0\0\0\0\0");
    }

    #[test]
    fn test_put_numeric_octal() {
        let mut buf = [0u8; 8];
        put_numeric(&mut buf, 0o644);
        assert_eq!(&buf, b"0000644\0");
        let mut buf = [0u8; 12];
        put_numeric(&mut buf, 0o1234);
        assert_eq!(&buf, b"00000001234\0");
    }

    #[test]
    fn test_put_numeric_largest_octal() {
        let mut buf = [0u8; 12];
        let max = (1u64 << 33) - 1;
        put_numeric(&mut buf, max);
        assert_eq!(&buf, b"77777777777\0");
        assert_eq!(parse_numeric(&buf).unwrap(), max);
    }

    #[test]
    fn test_put_numeric_base256() {
        let mut buf = [0u8; 12];
        let big = 20 * 1024 * 1024 * 1024u64;
        put_numeric(&mut buf, big);
        assert_eq!(buf[0] & BASE256_FLAG, BASE256_FLAG);
        assert_eq!(parse_numeric(&buf).unwrap(), big);

        let mut buf = [0u8; 8];
        put_numeric(&mut buf, 3_000_000);
        assert_eq!(buf[0], BASE256_FLAG);
        assert_eq!(parse_numeric_u32(&buf).unwrap(), 3_000_000);
    }
}
