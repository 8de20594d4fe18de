//! The outbound half of the codec: command framing.

use bytes::BytesMut;

/// Decimal digit count of `v`.
fn count_digits(mut v: usize) -> usize {
    let mut digits = 1;
    loop {
        if v < 10 {
            return digits;
        }
        if v < 100 {
            return digits + 1;
        }
        if v < 1000 {
            return digits + 2;
        }
        if v < 10000 {
            return digits + 3;
        }
        v /= 10000;
        digits += 4;
    }
}

/// Wire size of one bulk-string frame carrying a `len`-byte payload.
fn bulk_len(len: usize) -> usize {
    1 + count_digits(len) + 2 + len + 2
}

/// Append one command to `buf` as a RESP array of bulk strings:
/// `*<argc>\r\n` followed by `$<len>\r\n<arg>\r\n` per argument.
///
/// Storage is reserved up front from the computed frame size and the write
/// is checked against it. Returns the number of bytes appended.
pub fn format_command(buf: &mut BytesMut, argv: &[&[u8]]) -> usize {
    let mut total = 1 + count_digits(argv.len()) + 2;
    for arg in argv {
        total += bulk_len(arg.len());
    }
    buf.reserve(total);

    let before = buf.len();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(argv.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in argv {
        buf.extend_from_slice(b"$");
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    debug_assert_eq!(buf.len() - before, total);
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_a_single_argument() {
        let mut buf = BytesMut::new();
        let written = format_command(&mut buf, &[b"PING"]);
        assert_eq!(&buf[..], b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(written, buf.len());
    }

    #[test]
    fn formats_multiple_arguments() {
        let mut buf = BytesMut::new();
        format_command(&mut buf, &[b"SET".as_slice(), b"key".as_slice(), b"value".as_slice()]);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }

    #[test]
    fn appends_after_existing_content() {
        let mut buf = BytesMut::new();
        format_command(&mut buf, &[b"PING"]);
        let first = buf.len();
        let written = format_command(&mut buf, &[b"PING"]);
        assert_eq!(buf.len(), first + written);
        assert!(buf[..].starts_with(b"*1\r\n$4\r\nPING\r\n"));
        assert!(buf[first..].starts_with(b"*1\r\n$4\r\nPING\r\n"));
    }

    #[test]
    fn arguments_are_binary_safe() {
        let mut buf = BytesMut::new();
        format_command(&mut buf, &[b"SET".as_slice(), b"k\r\nv".as_slice()]);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nSET\r\n$4\r\nk\r\nv\r\n");
    }

    #[test]
    fn digit_counts_cover_boundaries() {
        for (value, digits) in [
            (0usize, 1usize),
            (9, 1),
            (10, 2),
            (99, 2),
            (100, 3),
            (9999, 4),
            (10000, 5),
            (123456789, 9),
        ] {
            assert_eq!(count_digits(value), digits, "value {value}");
        }
    }
}
