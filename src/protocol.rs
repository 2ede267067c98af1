//! Per-protocol capability plug-ins.
//!
//! A protocol is represented by exactly two operations over plain byte
//! buffers: splitting a seed file into request regions, and decoding a
//! response buffer into a sequence of server state ids. Everything else the
//! fuzzer does is protocol-agnostic.

use crate::queue::Region;

pub trait ProtocolHandler {
    fn name(&self) -> &'static str;

    /// Split a seed buffer into `(start, end)` request regions. The regions
    /// must be disjoint, in order, and exactly cover `[0, buf.len())`.
    fn extract_requests(&self, buf: &[u8]) -> Vec<(usize, usize)>;

    /// Decode the server state ids (small unsigned integers) found in a
    /// response buffer.
    fn extract_response_codes(&self, buf: &[u8]) -> Vec<u32>;
}

/// Select a handler from the `-P` protocol tag. Unknown tags degrade to the
/// raw handler so that fuzzing still runs, just without message structure.
pub fn handler_for(tag: &str) -> Box<dyn ProtocolHandler> {
    match tag.to_ascii_uppercase().as_str() {
        "FTP" | "SMTP" | "SIP" | "RTSP" => Box::new(TextCodeProtocol),
        _ => {
            log::warn!("No dedicated parser for protocol tag {tag:?}, using raw fallback");
            Box::new(RawProtocol)
        }
    }
}

/// Turn extracted `(start, end)` pairs into [`Region`]s with empty state
/// annotations.
pub fn regions_from_requests(pairs: &[(usize, usize)]) -> Vec<Region> {
    pairs
        .iter()
        .map(|&(start, end)| Region {
            start,
            end,
            state_seq: Vec::new(),
        })
        .collect()
}

/// Text protocols of the FTP/SMTP family: requests are CRLF-terminated
/// lines, responses start with a three-digit status code.
pub struct TextCodeProtocol;

impl ProtocolHandler for TextCodeProtocol {
    fn name(&self) -> &'static str {
        "text-code"
    }

    fn extract_requests(&self, buf: &[u8]) -> Vec<(usize, usize)> {
        let mut regions = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < buf.len() {
            if buf[i] == b'\n' {
                regions.push((start, i + 1));
                start = i + 1;
            }
            i += 1;
        }
        if start < buf.len() {
            regions.push((start, buf.len()));
        }
        if regions.is_empty() {
            regions.push((0, buf.len()));
        }
        regions
    }

    fn extract_response_codes(&self, buf: &[u8]) -> Vec<u32> {
        let mut codes = Vec::new();
        let mut at_line_start = true;
        let mut i = 0;
        while i < buf.len() {
            if at_line_start && i + 3 <= buf.len() {
                let d = &buf[i..i + 3];
                if d.iter().all(u8::is_ascii_digit) {
                    // A continuation line ("123-...") belongs to the same
                    // reply; only "123 " or a bare code terminates one.
                    let cont = buf.get(i + 3) == Some(&b'-');
                    if !cont {
                        let code = (u32::from(d[0] - b'0') * 100)
                            + (u32::from(d[1] - b'0') * 10)
                            + u32::from(d[2] - b'0');
                        codes.push(code);
                    }
                }
            }
            at_line_start = buf[i] == b'\n';
            i += 1;
        }
        codes
    }
}

/// Fallback for unknown protocols: one region, one synthetic state.
pub struct RawProtocol;

impl ProtocolHandler for RawProtocol {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn extract_requests(&self, buf: &[u8]) -> Vec<(usize, usize)> {
        vec![(0, buf.len())]
    }

    fn extract_response_codes(&self, buf: &[u8]) -> Vec<u32> {
        if buf.is_empty() {
            Vec::new()
        } else {
            vec![1]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_requests_partition_the_buffer() {
        let p = TextCodeProtocol;
        let buf = b"USER anon\r\nPASS x\r\nQUIT\r\n";
        let regions = p.extract_requests(buf);
        assert_eq!(regions, vec![(0, 11), (11, 19), (19, 25)]);
        // Exact cover of [0, len).
        let mut cursor = 0;
        for (s, e) in &regions {
            assert_eq!(*s, cursor);
            assert!(e > s);
            cursor = *e;
        }
        assert_eq!(cursor, buf.len());
    }

    #[test]
    fn text_requests_without_trailing_newline() {
        let p = TextCodeProtocol;
        let regions = p.extract_requests(b"USER anon\r\nQUIT");
        assert_eq!(regions, vec![(0, 11), (11, 15)]);
    }

    #[test]
    fn response_codes_ignore_continuations() {
        let p = TextCodeProtocol;
        let codes = p.extract_response_codes(b"220-hello\r\n220 ready\r\n331 pw\r\nnoise\r\n230 ok\r\n");
        assert_eq!(codes, vec![220, 331, 230]);
    }

    #[test]
    fn raw_is_a_single_region() {
        let p = RawProtocol;
        assert_eq!(p.extract_requests(b"abc"), vec![(0, 3)]);
        assert_eq!(p.extract_response_codes(b""), Vec::<u32>::new());
        assert_eq!(p.extract_response_codes(b"x"), vec![1]);
    }
}
