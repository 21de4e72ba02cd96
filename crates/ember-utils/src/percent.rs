//! Percent-encoding for URL paths and query components.
//!
//! Paths and queries decode differently: `+` means a space only inside a
//! query component, never in a path segment, so the two decoders are kept
//! distinct. Encode escapes everything outside the URL "unreserved" set.
//! `decode(encode(x)) == x` for arbitrary bytes, and
//! `encode(decode(x)) == x` for canonical encodings.

#[inline]
fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[inline]
fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

/// Query-component decoder: `%XX` escapes plus `+` as space. Malformed
/// escapes are kept verbatim.
pub fn percent_decode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'%' => {
                let hi = src.get(i + 1).copied().and_then(hex_val);
                let lo = src.get(i + 2).copied().and_then(hex_val);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi << 4) | lo);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// Path decoder: `%XX` escapes only — a literal `+` stays a `+`, so
/// `/a+b.txt` routes and resolves as written. In place, since the decoded
/// form is never longer than the input. Returns the decoded length.
pub fn percent_decode_in_place(buf: &mut [u8]) -> usize {
    let mut read = 0;
    let mut write = 0;
    while read < buf.len() {
        match buf[read] {
            b'%' => {
                let pair = (
                    buf.get(read + 1).copied().and_then(hex_val),
                    buf.get(read + 2).copied().and_then(hex_val),
                );
                if let (Some(hi), Some(lo)) = pair {
                    buf[write] = (hi << 4) | lo;
                    read += 3;
                    write += 1;
                    continue;
                }
                buf[write] = b'%';
            }
            b => buf[write] = b,
        }
        read += 1;
        write += 1;
    }
    write
}

/// Escapes everything outside the unreserved set, space as `%20`.
pub fn percent_encode(src: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(src.len());
    for &b in src {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 15) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_basic() {
        assert_eq!(percent_decode(b"hello%20world"), b"hello world");
        assert_eq!(percent_decode(b"a+b"), b"a b");
        assert_eq!(percent_decode(b"%2Fpath%2f"), b"/path/");
    }

    #[test]
    fn decode_malformed_kept() {
        assert_eq!(percent_decode(b"100%"), b"100%");
        assert_eq!(percent_decode(b"%zz"), b"%zz");
        assert_eq!(percent_decode(b"%2"), b"%2");
    }

    #[test]
    fn roundtrip_raw_bytes() {
        let raw: Vec<u8> = (0u8..=255).collect();
        assert_eq!(percent_decode(percent_encode(&raw).as_bytes()), raw);
    }

    #[test]
    fn roundtrip_canonical_encoding() {
        let enc = percent_encode("büro / files".as_bytes());
        assert_eq!(percent_encode(&percent_decode(enc.as_bytes())), enc);
    }

    #[test]
    fn path_decoder_handles_escapes_in_place() {
        let mut buf = b"/a%20dir/file%2Ehtml".to_vec();
        let n = percent_decode_in_place(&mut buf);
        assert_eq!(&buf[..n], b"/a dir/file.html");
    }

    #[test]
    fn path_decoder_keeps_literal_plus() {
        let mut buf = b"/c%2B%2B/a+b.txt".to_vec();
        let n = percent_decode_in_place(&mut buf);
        assert_eq!(&buf[..n], b"/c++/a+b.txt");
    }

    #[test]
    fn path_decoder_keeps_malformed_escapes() {
        let mut buf = b"/100%/x%ZZ%2".to_vec();
        let n = percent_decode_in_place(&mut buf);
        assert_eq!(&buf[..n], b"/100%/x%ZZ%2");
    }
}
