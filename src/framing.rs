//! Length-prefixed JSON framing: `LEN\nJSON\n` with `LEN` in ASCII decimal,
//! counting only the JSON payload bytes.
//!
//! This is the one wire format shared by every stream in the system: broker
//! <-> replicator, broker <-> simulator, client <-> broker, client hello <->
//! simulator. Every transport is read/written through this module so the
//! framing rules live in exactly one place.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Outcome of attempting to decode one frame from a stream.
#[derive(Debug)]
pub enum Frame {
    /// A complete, well-formed JSON payload.
    Ok(Value),
    /// The peer closed the connection cleanly before sending a length header.
    Eof,
    /// The peer sent something that doesn't conform to the wire format.
    FramingError(String),
}

/// Serialize `payload` and prefix it with its ASCII-decimal byte length.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(payload)?;
    let mut out = Vec::with_capacity(body.len() + 16);
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&body);
    out.push(b'\n');
    Ok(out)
}

/// Write an already-serializable payload to `stream` as one frame.
pub async fn write_frame<W, T>(stream: &mut W, payload: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Read one frame from `stream`. Never returns an `Err` for protocol
/// violations — those are reported as `Frame::FramingError` so callers can
/// distinguish "peer misbehaved" (reply with failure, keep socket) from
/// "transport broke" (propagate as `io::Error`, reconnect).
pub async fn read_frame<R>(stream: &mut R) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(if len_buf.is_empty() {
                Frame::Eof
            } else {
                Frame::FramingError("peer closed mid-length-header".to_string())
            });
        }
        if byte[0] == b'\n' {
            break;
        }
        len_buf.push(byte[0]);
    }

    let len_str = match std::str::from_utf8(&len_buf) {
        Ok(s) => s,
        Err(_) => return Ok(Frame::FramingError("length header is not UTF-8".to_string())),
    };
    let len: usize = match len_str.trim().parse() {
        Ok(n) => n,
        Err(_) => {
            return Ok(Frame::FramingError(format!(
                "length header {len_str:?} is not a non-negative integer"
            )))
        }
    };

    let mut payload = vec![0u8; len];
    if len > 0 {
        if let Err(e) = stream.read_exact(&mut payload).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(Frame::FramingError(
                    "peer closed mid-payload (truncated frame)".to_string(),
                ));
            }
            return Err(e);
        }
    }

    // trailing newline
    let mut nl = [0u8; 1];
    match stream.read_exact(&mut nl).await {
        Ok(()) if nl[0] == b'\n' => {}
        Ok(()) => return Ok(Frame::FramingError("missing trailing newline".to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(Frame::FramingError(
                "peer closed before trailing newline".to_string(),
            ))
        }
        Err(e) => return Err(e),
    }

    match serde_json::from_slice::<Value>(&payload) {
        Ok(v) => Ok(Frame::Ok(v)),
        Err(e) => Ok(Frame::FramingError(format!("invalid JSON: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_arbitrary_json() {
        let values = vec![
            json!({"a": 1, "b": "two", "c": [1,2,3]}),
            json!(null),
            json!([]),
            json!({"nested": {"deep": true}}),
        ];
        for v in values {
            let bytes = encode(&v).unwrap();
            let mut cursor = Cursor::new(bytes);
            match read_frame(&mut cursor).await.unwrap() {
                Frame::Ok(decoded) => assert_eq!(decoded, v),
                other => panic!("expected Ok, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn reports_clean_eof_on_empty_stream() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_frame(&mut cursor).await.unwrap(), Frame::Eof));
    }

    #[tokio::test]
    async fn reports_framing_error_on_non_integer_length() {
        let mut cursor = Cursor::new(b"abc\n{}\n".to_vec());
        match read_frame(&mut cursor).await.unwrap() {
            Frame::FramingError(_) => {}
            other => panic!("expected FramingError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_framing_error_on_length_mismatch() {
        // header says 10 bytes but only 2 are supplied before EOF
        let mut cursor = Cursor::new(b"10\n{}".to_vec());
        match read_frame(&mut cursor).await.unwrap() {
            Frame::FramingError(_) => {}
            other => panic!("expected FramingError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_framing_error_on_invalid_json() {
        let mut cursor = Cursor::new(b"9\nnot json\n".to_vec());
        match read_frame(&mut cursor).await.unwrap() {
            Frame::FramingError(_) => {}
            other => panic!("expected FramingError, got {other:?}"),
        }
    }
}
