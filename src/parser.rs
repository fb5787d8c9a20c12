//! Slice-based STOMP frame parser.
//!
//! The parser works on a borrowed byte slice and produces owned pieces so the
//! codec can advance its buffer independently of the returned data.

/// A frame parsed from the wire, before header unescaping and UTF-8 checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL
    /// terminator and one optional trailing LF.
    pub consumed: usize,
}

pub type ParseResult = Result<Option<RawFrame>, String>;

fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    let Some((_, v)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(b"content-length"))
    else {
        return Ok(None);
    };
    let s = std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("empty content-length".to_string());
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Skip the single optional LF that may follow a frame's NUL terminator.
fn skip_trailing_lf(input: &[u8], pos: usize) -> usize {
    if input.get(pos) == Some(&b'\n') {
        pos + 1
    } else {
        pos
    }
}

/// Parse a single STOMP frame from a raw byte slice.
///
/// Returns `Ok(Some(frame))` when a full frame was parsed, `Ok(None)` when
/// more bytes are required and `Err` on protocol errors (a header line
/// without `:`, an unparsable `content-length`, or a `content-length` body
/// not followed by NUL).
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let len = input.len();
    let mut pos = input.iter().take_while(|&&b| b == b'\n').count();

    // command line
    let Some(cmd_end) = input[pos..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let command = strip_cr(&input[pos..pos + cmd_end]).to_vec();
    pos += cmd_end + 1;

    // headers, terminated by an empty line
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos >= len {
            return Ok(None);
        }
        let Some(line_end) = input[pos..].iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = strip_cr(&input[pos..pos + line_end]);
        pos += line_end + 1;
        if line.is_empty() {
            break;
        }
        match line.iter().position(|&b| b == b':') {
            Some(colon) => headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec())),
            None => {
                return Err(format!(
                    "malformed header line: {:?}",
                    String::from_utf8_lossy(line)
                ));
            }
        }
    }

    match get_content_length(&headers)? {
        Some(content_len) => {
            let Some(end) = pos.checked_add(content_len).and_then(|n| n.checked_add(1)) else {
                return Err("content-length too large".to_string());
            };
            if end > len {
                return Ok(None);
            }
            let body = input[pos..pos + content_len].to_vec();
            pos += content_len;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            Ok(Some(RawFrame {
                command,
                headers,
                body,
                consumed: skip_trailing_lf(input, pos + 1),
            }))
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul) => {
                let body = input[pos..pos + nul].to_vec();
                Ok(Some(RawFrame {
                    command,
                    headers,
                    body,
                    consumed: skip_trailing_lf(input, pos + nul + 1),
                }))
            }
            None => Ok(None),
        },
    }
}

/// Undo STOMP 1.2 header escaping (`\\`, `\r`, `\n`, `\c`).
///
/// Any other escape sequence, or a trailing lone backslash, is an error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b'c') => out.push(b':'),
            Some(&other) => {
                return Err(format!("undefined escape sequence '\\{}'", other as char));
            }
            None => return Err("trailing backslash".to_string()),
        }
    }
    Ok(out)
}

/// Apply STOMP 1.2 header escaping for wire transmission.
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}
