//! Wire codec for the cache's length-prefixed array protocol.
//!
//! Requests are arrays of bulk strings (`*N\r\n$L\r\nARG\r\n...`); replies
//! are simple strings, errors, integers, bulk strings, or arrays of bulk
//! strings, with `-1` lengths meaning nil. CRLF terminators are validated
//! everywhere; a violation means the stream is desynchronized and the
//! connection must be discarded.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

#[derive(Debug, Error)]
pub enum RespError {
    #[error("i/o error reading reply: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed reply: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Integer(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Flattens the reply into the strings it carries. Nil bulk elements
    /// inside an array become empty strings; a nil top-level bulk or array
    /// flattens to nothing.
    pub fn into_strings(self) -> Vec<String> {
        match self {
            Reply::Simple(s) => vec![s],
            Reply::Integer(i) => vec![i.to_string()],
            Reply::Bulk(Some(s)) => vec![s],
            Reply::Bulk(None) => Vec::new(),
            Reply::Array(None) => Vec::new(),
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(s)) => s,
                    Reply::Bulk(None) => String::new(),
                    Reply::Simple(s) => s,
                    Reply::Integer(i) => i.to_string(),
                    Reply::Array(_) => String::new(),
                })
                .collect(),
        }
    }
}

/// Encodes a command as an array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * args.len() + 16);
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Reads one complete reply. A `-ERROR` reply surfaces as
/// [`RespError::Server`]; the stream stays synchronized in that case.
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Reply, RespError> {
    let line = read_line_crlf(reader).await?;
    let Some(first) = line.chars().next() else {
        return Err(RespError::Protocol("empty reply line".to_string()));
    };
    let rest = &line[1..];

    match first {
        '+' => Ok(Reply::Simple(rest.to_string())),
        '-' => Err(RespError::Server(rest.to_string())),
        ':' => rest
            .parse()
            .map(Reply::Integer)
            .map_err(|_| RespError::Protocol(format!("invalid integer reply {rest:?}"))),
        '$' => {
            let len = parse_length(rest)?;
            match len {
                None => Ok(Reply::Bulk(None)),
                Some(len) => Ok(Reply::Bulk(Some(read_bulk_body(reader, len).await?))),
            }
        }
        '*' => {
            let Some(count) = parse_length(rest)? else {
                return Ok(Reply::Array(None));
            };
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let header = read_line_crlf(reader).await?;
                let Some(len_str) = header.strip_prefix('$') else {
                    return Err(RespError::Protocol(format!(
                        "expected bulk string element, got {header:?}"
                    )));
                };
                match parse_length(len_str)? {
                    None => items.push(Reply::Bulk(None)),
                    Some(len) => items.push(Reply::Bulk(Some(read_bulk_body(reader, len).await?))),
                }
            }
            Ok(Reply::Array(Some(items)))
        }
        other => Err(RespError::Protocol(format!("unknown reply type {other:?}"))),
    }
}

/// Parses a bulk/array length; `-1` means nil.
fn parse_length(raw: &str) -> Result<Option<usize>, RespError> {
    let len: i64 = raw
        .parse()
        .map_err(|_| RespError::Protocol(format!("invalid length {raw:?}")))?;
    match len {
        -1 => Ok(None),
        n if n < 0 => Err(RespError::Protocol(format!("negative length {n}"))),
        n => Ok(Some(n as usize)),
    }
}

async fn read_line_crlf<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, RespError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RespError::Protocol("unexpected end of stream".to_string()));
    }
    if !line.ends_with("\r\n") {
        return Err(RespError::Protocol(format!(
            "line missing CRLF terminator: {line:?}"
        )));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

async fn read_bulk_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    len: usize,
) -> Result<String, RespError> {
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
        return Err(RespError::Protocol(
            "bulk string missing CRLF terminator".to_string(),
        ));
    }
    String::from_utf8(data)
        .map_err(|_| RespError::Protocol("bulk string is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<Reply, RespError> {
        let mut reader = tokio::io::BufReader::new(bytes);
        read_reply(&mut reader).await
    }

    #[tokio::test]
    async fn round_trips_encoded_commands() {
        let encoded = encode_command(&["ZADD", "price:binance:BTCUSDT", "1700000000", "40000.5"]);
        let reply = parse(&encoded).await.unwrap();
        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Bulk(Some("ZADD".to_string())),
                Reply::Bulk(Some("price:binance:BTCUSDT".to_string())),
                Reply::Bulk(Some("1700000000".to_string())),
                Reply::Bulk(Some("40000.5".to_string())),
            ]))
        );
    }

    #[tokio::test]
    async fn round_trips_empty_argument() {
        let encoded = encode_command(&["KEYS", ""]);
        let reply = parse(&encoded).await.unwrap();
        assert_eq!(
            reply.into_strings(),
            vec!["KEYS".to_string(), String::new()]
        );
    }

    #[tokio::test]
    async fn parses_simple_string_and_integer() {
        assert_eq!(
            parse(b"+PONG\r\n").await.unwrap(),
            Reply::Simple("PONG".to_string())
        );
        assert_eq!(parse(b":42\r\n").await.unwrap(), Reply::Integer(42));
    }

    #[tokio::test]
    async fn parses_nil_bulk_and_nil_array() {
        assert_eq!(parse(b"$-1\r\n").await.unwrap(), Reply::Bulk(None));
        assert_eq!(parse(b"*-1\r\n").await.unwrap(), Reply::Array(None));
    }

    #[tokio::test]
    async fn nil_array_element_becomes_empty_string() {
        let reply = parse(b"*2\r\n$3\r\nfoo\r\n$-1\r\n").await.unwrap();
        assert_eq!(
            reply.into_strings(),
            vec!["foo".to_string(), String::new()]
        );
    }

    #[tokio::test]
    async fn server_error_surfaces_as_error() {
        match parse(b"-ERR unknown command\r\n").await {
            Err(RespError::Server(msg)) => assert_eq!(msg, "ERR unknown command"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_bare_lf_terminator() {
        assert!(matches!(
            parse(b"+PONG\n").await,
            Err(RespError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn rejects_missing_bulk_crlf() {
        assert!(matches!(
            parse(b"$3\r\nfooXY").await,
            Err(RespError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn rejects_truncated_bulk() {
        // read_exact hits EOF before the body completes.
        assert!(parse(b"$10\r\nshort\r\n").await.is_err());
    }

    #[tokio::test]
    async fn rejects_non_bulk_array_element() {
        assert!(matches!(
            parse(b"*1\r\n:5\r\n").await,
            Err(RespError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_type_byte() {
        assert!(matches!(
            parse(b"?what\r\n").await,
            Err(RespError::Protocol(_))
        ));
    }
}
