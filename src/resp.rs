//! Incremental RESP (REdis Serialization Protocol) framer, key extractor and
//! reply serializer.
//!
//! The proxy never needs to build a full value tree for most traffic: it
//! only needs to know where one frame ends (so it can forward the raw bytes
//! untouched) and, for client-originated commands, what the routing key is.
//! [`scan_frame`] answers the first question; [`split_args`] the second.

use crate::error::CodecError;

/// Outcome of scanning a buffer for one complete top-level RESP frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameScan {
    /// `buf[..n]` is one complete frame, including its terminator.
    Complete(usize),
    /// Not enough bytes buffered yet.
    Incomplete,
}

/// Scans `buf` for one complete RESP frame starting at offset 0.
///
/// Recognizes the five typed RESP prefixes (`+ - : $ *`) plus bare inline
/// commands (a line with none of those prefixes), since real Redis clients
/// and the proxy's own admin channel both rely on inline framing for simple
/// commands like `PING` or `SHUTDOWN`.
pub fn scan_frame(buf: &[u8]) -> Result<FrameScan, CodecError> {
    if buf.is_empty() {
        return Ok(FrameScan::Incomplete);
    }
    match scan_value(buf, 0)? {
        Some(end) => Ok(FrameScan::Complete(end)),
        None => Ok(FrameScan::Incomplete),
    }
}

/// Scans one RESP value starting at `pos`. Returns the offset just past the
/// value on success, or `None` if `buf` doesn't yet contain the whole value.
fn scan_value(buf: &[u8], pos: usize) -> Result<Option<usize>, CodecError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    match buf[pos] {
        b'+' | b'-' | b':' => scan_line(buf, pos + 1),
        b'$' => scan_bulk(buf, pos + 1),
        b'*' => scan_array(buf, pos + 1),
        _ => scan_inline(buf, pos),
    }
}

/// Scans to the end of a `\r\n`- or `\n`-terminated line starting at `pos`.
/// Returns the offset just past the terminator.
fn scan_line(buf: &[u8], pos: usize) -> Result<Option<usize>, CodecError> {
    let mut i = pos;
    while i < buf.len() {
        if buf[i] == b'\n' {
            return Ok(Some(i + 1));
        }
        i += 1;
    }
    Ok(None)
}

fn line_len(buf: &[u8], start: usize, end: usize) -> &[u8] {
    let mut stop = end;
    if stop > start && buf[stop - 1] == b'\n' {
        stop -= 1;
    }
    if stop > start && buf[stop - 1] == b'\r' {
        stop -= 1;
    }
    &buf[start..stop]
}

fn scan_inline(buf: &[u8], pos: usize) -> Result<Option<usize>, CodecError> {
    scan_line(buf, pos)
}

fn parse_len(digits: &[u8]) -> Result<i64, CodecError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| CodecError::Protocol(format!("bad length field: {:?}", digits)))
}

fn scan_bulk(buf: &[u8], pos: usize) -> Result<Option<usize>, CodecError> {
    let line_end = match scan_line(buf, pos)? {
        Some(e) => e,
        None => return Ok(None),
    };
    let len = parse_len(line_len(buf, pos, line_end))?;
    if len < 0 {
        // Null bulk string: "$-1\r\n", nothing more to read.
        return Ok(Some(line_end));
    }
    let data_start = line_end;
    let data_end = data_start + len as usize + 2; // payload + trailing CRLF
    if buf.len() < data_end {
        return Ok(None);
    }
    Ok(Some(data_end))
}

fn scan_array(buf: &[u8], pos: usize) -> Result<Option<usize>, CodecError> {
    let line_end = match scan_line(buf, pos)? {
        Some(e) => e,
        None => return Ok(None),
    };
    let count = parse_len(line_len(buf, pos, line_end))?;
    if count < 0 {
        // Null array: "*-1\r\n".
        return Ok(Some(line_end));
    }
    let mut cursor = line_end;
    for _ in 0..count {
        match scan_value(buf, cursor)? {
            Some(end) => cursor = end,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

/// Splits a complete multi-bulk (or inline) command frame into its bulk
/// string arguments. Used only for client-originated commands; backend
/// replies are forwarded as raw bytes and never parsed into arguments.
pub fn split_args(frame: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    if frame.is_empty() {
        return Ok(Vec::new());
    }
    match frame[0] {
        b'*' => split_multibulk(frame),
        b'+' | b'-' | b':' | b'$' => Err(CodecError::Protocol(
            "expected a command, got a reply-typed frame".to_string(),
        )),
        _ => Ok(split_inline(frame)),
    }
}

fn split_inline(frame: &[u8]) -> Vec<Vec<u8>> {
    let line = line_len(frame, 0, frame.len());
    line.split(|b| *b == b' ' || *b == b'\t')
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn split_multibulk(frame: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let line_end = scan_line(frame, 1)?
        .ok_or_else(|| CodecError::Protocol("truncated multi-bulk header".to_string()))?;
    let count = parse_len(line_len(frame, 1, line_end))?;
    if count < 0 {
        return Ok(Vec::new());
    }
    let mut args = Vec::with_capacity(count as usize);
    let mut cursor = line_end;
    for _ in 0..count {
        if cursor >= frame.len() || frame[cursor] != b'$' {
            return Err(CodecError::Protocol(
                "expected bulk string in multi-bulk command".to_string(),
            ));
        }
        let bulk_line_end = scan_line(frame, cursor + 1)?
            .ok_or_else(|| CodecError::Protocol("truncated bulk header".to_string()))?;
        let len = parse_len(line_len(frame, cursor + 1, bulk_line_end))?;
        if len < 0 {
            args.push(Vec::new());
            cursor = bulk_line_end;
            continue;
        }
        let data_start = bulk_line_end;
        let data_end = data_start + len as usize;
        if data_end + 2 > frame.len() {
            return Err(CodecError::Protocol("truncated bulk payload".to_string()));
        }
        args.push(frame[data_start..data_end].to_vec());
        cursor = data_end + 2;
    }
    Ok(args)
}

/// Where the routing key lives in a command, if anywhere.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum KeyPos {
    /// The command has a routing key: the second argument.
    Key(Vec<u8>),
    /// The command is keyless (e.g. `PING`); the pool's keyless policy applies.
    Keyless,
}

/// Extracts the routing key from a split command, applying the pool's hash
/// tag (if any): a two-character delimiter pair with non-empty content
/// between them restricts hashing to that substring.
///
/// `EVAL script numkeys key arg…` is special-cased: the routing key is
/// `KEYS[1]` (the fourth bulk string), not `script`, since `script` is
/// what the second argument normally holds for every other command. Using
/// the literal second argument here would route `EVAL` to a backend
/// derived from the hash of the Lua source rather than the key it
/// actually reads and writes, silently desyncing it from later commands
/// against the same key.
pub fn extract_key(args: &[Vec<u8>], hash_tag: Option<(u8, u8)>) -> KeyPos {
    let is_eval = args
        .first()
        .map(|c| c.eq_ignore_ascii_case(b"EVAL"))
        .unwrap_or(false);
    let key_index = if is_eval { 3 } else { 1 };
    let key = match args.get(key_index) {
        Some(k) => k,
        None => return KeyPos::Keyless,
    };
    match hash_tag {
        Some((open, close)) => KeyPos::Key(apply_hash_tag(key, open, close)),
        None => KeyPos::Key(key.clone()),
    }
}

/// Applies a two-character hash tag: once both delimiters are found (the
/// second occurring after the first), the bytes strictly between them are
/// hashed — even if that span is empty, which is what lets keys like
/// `"//key4"`, `"key4//"` and `"key4///"` all land on the same backend. A
/// single, unmatched delimiter leaves the key untouched.
fn apply_hash_tag(key: &[u8], open: u8, close: u8) -> Vec<u8> {
    if let Some(start) = key.iter().position(|b| *b == open) {
        if let Some(rel_end) = key[start + 1..].iter().position(|b| *b == close) {
            let end = start + 1 + rel_end;
            return key[start + 1..end].to_vec();
        }
    }
    key.to_vec()
}

/// Parses a two-character `hash_tag` config value (`"{}"`, `"//"`, ...)
/// into the open/close byte pair the router uses.
pub fn parse_hash_tag(tag: &str) -> Option<(u8, u8)> {
    let bytes = tag.as_bytes();
    if bytes.len() == 2 {
        Some((bytes[0], bytes[1]))
    } else {
        None
    }
}

/// The proxy's own synthetic error prefix: `-ERROR: ...`.
pub fn proxy_error(detail: &str) -> Vec<u8> {
    format!("-ERROR: {}\r\n", detail).into_bytes()
}

/// The literal timeout error line, which does not carry the `ERROR:` prefix.
pub fn proxy_timeout() -> Vec<u8> {
    b"-Proxy timed out\r\n".to_vec()
}

pub fn simple_ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

pub fn bulk_string(s: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", s.len(), s).into_bytes()
}

pub fn array_of_bulk(items: &[String]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(&bulk_string(item));
    }
    out
}

/// A parsed RESP value. Only used for replies the proxy actually needs to
/// inspect rather than forward verbatim — currently `CLUSTER SLOTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(Vec<u8>),
    Error(Vec<u8>),
    Int(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Value>>),
}

/// Parses one complete RESP value out of `buf`, which must already be a
/// single complete frame as returned by [`scan_frame`].
pub fn parse_value(buf: &[u8]) -> Result<Value, CodecError> {
    let (value, _) = parse_value_at(buf, 0)?;
    Ok(value)
}

fn parse_value_at(buf: &[u8], pos: usize) -> Result<(Value, usize), CodecError> {
    let bad = || CodecError::Protocol("truncated value".to_string());
    if pos >= buf.len() {
        return Err(bad());
    }
    match buf[pos] {
        b'+' => {
            let end = scan_line(buf, pos + 1)?.ok_or_else(bad)?;
            Ok((Value::Simple(line_len(buf, pos + 1, end).to_vec()), end))
        }
        b'-' => {
            let end = scan_line(buf, pos + 1)?.ok_or_else(bad)?;
            Ok((Value::Error(line_len(buf, pos + 1, end).to_vec()), end))
        }
        b':' => {
            let end = scan_line(buf, pos + 1)?.ok_or_else(bad)?;
            Ok((Value::Int(parse_len(line_len(buf, pos + 1, end))?), end))
        }
        b'$' => {
            let line_end = scan_line(buf, pos + 1)?.ok_or_else(bad)?;
            let len = parse_len(line_len(buf, pos + 1, line_end))?;
            if len < 0 {
                return Ok((Value::Bulk(None), line_end));
            }
            let data_end = line_end + len as usize;
            if data_end + 2 > buf.len() {
                return Err(bad());
            }
            Ok((Value::Bulk(Some(buf[line_end..data_end].to_vec())), data_end + 2))
        }
        b'*' => {
            let line_end = scan_line(buf, pos + 1)?.ok_or_else(bad)?;
            let count = parse_len(line_len(buf, pos + 1, line_end))?;
            if count < 0 {
                return Ok((Value::Array(None), line_end));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut cursor = line_end;
            for _ in 0..count {
                let (value, next) = parse_value_at(buf, cursor)?;
                items.push(value);
                cursor = next;
            }
            Ok((Value::Array(Some(items)), cursor))
        }
        _ => Err(CodecError::Protocol("expected a typed RESP value".to_string())),
    }
}

/// Parses a `CLUSTER SLOTS` reply into `(start, end, host, port)` ranges.
/// Each top-level entry is `[start, end, [host, port, ...], ...replicas]`;
/// replica entries (and anything beyond the master's host/port) are
/// ignored since this proxy only ever routes to masters.
pub fn parse_cluster_slots(frame: &[u8]) -> Result<Vec<(usize, usize, String, u16)>, CodecError> {
    let bad = |detail: &str| CodecError::Protocol(format!("bad CLUSTER SLOTS reply: {detail}"));
    let top = parse_value(frame)?;
    let Value::Array(Some(ranges)) = top else {
        return Err(bad("expected top-level array"));
    };
    let mut out = Vec::with_capacity(ranges.len());
    for range in ranges {
        let Value::Array(Some(fields)) = range else {
            return Err(bad("expected a slot-range array"));
        };
        if fields.len() < 3 {
            return Err(bad("slot-range array too short"));
        }
        let start = match &fields[0] {
            Value::Int(n) if *n >= 0 => *n as usize,
            _ => return Err(bad("expected integer start slot")),
        };
        let end = match &fields[1] {
            Value::Int(n) if *n >= 0 => *n as usize,
            _ => return Err(bad("expected integer end slot")),
        };
        let Value::Array(Some(master)) = &fields[2] else {
            return Err(bad("expected master address array"));
        };
        let (Some(Value::Bulk(Some(host))), Some(Value::Int(port))) = (master.first(), master.get(1)) else {
            return Err(bad("expected host/port in master address"));
        };
        out.push((
            start,
            end,
            String::from_utf8_lossy(host).to_string(),
            *port as u16,
        ));
    }
    Ok(out)
}

/// Parses a `-MOVED <slot> <host>:<port>` or `-ASK <slot> <host>:<port>`
/// error line into its redirection kind, slot, and target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Moved { address: String },
    Ask { address: String },
}

pub fn parse_redirect(frame: &[u8]) -> Option<Redirect> {
    if frame.first() != Some(&b'-') {
        return None;
    }
    let line = line_len(frame, 1, frame.len());
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split_whitespace();
    let kind = parts.next()?;
    let _slot = parts.next()?;
    let address = parts.next()?.to_string();
    match kind {
        "MOVED" => Some(Redirect::Moved { address }),
        "ASK" => Some(Redirect::Ask { address }),
        _ => None,
    }
}
