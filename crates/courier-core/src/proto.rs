//! Relay wire protocol
//!
//! Persistent channel (client -> relay): `LOGIN:<username>\n`. Everything
//! the relay sends back is a log line, except `FILE:<name>\n` which is
//! followed by a decimal size line and exactly that many raw bytes.
//!
//! Ephemeral channels carry one `LIST_CLIENTS` query or one `START_FILE`
//! submission. How their strings and sizes are delimited depends on the
//! [`Framing`] the relay speaks.

use crate::transport::FrameReader;
use crate::types::PeerId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub const LOGIN_PREFIX: &str = "LOGIN:";
pub const FILE_PREFIX: &str = "FILE:";
pub const LIST_CLIENTS: &str = "LIST_CLIENTS";
pub const START_FILE: &str = "START_FILE";

/// Separator between identities in a directory response
pub const PEER_DELIMITER: char = ',';

/// A line received on the persistent channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// An inbound file is announced; a size line follows
    FileAnnounce { name: String },
    /// Anything else, shown to the user and otherwise ignored
    Log(String),
}

impl ControlLine {
    pub fn parse(line: &str) -> Self {
        match line.strip_prefix(FILE_PREFIX) {
            Some(name) => ControlLine::FileAnnounce {
                name: name.to_string(),
            },
            None => ControlLine::Log(line.to_string()),
        }
    }
}

/// Encode the login line for `username`
pub fn login_line(username: &PeerId) -> String {
    format!("{}{}\n", LOGIN_PREFIX, username)
}

/// Parse the line following a `FILE:` announcement
pub fn parse_declared_size(line: Option<&str>) -> Result<u64> {
    let line = line.ok_or_else(|| {
        Error::Protocol("connection closed before declared size".to_string())
    })?;
    line.trim()
        .parse::<u64>()
        .map_err(|_| Error::Protocol(format!("invalid declared size: {:?}", line)))
}

/// Split a directory response into peer identities, dropping empty tokens
/// and the local user.
pub fn parse_peer_list(response: &str, local: &PeerId) -> BTreeSet<PeerId> {
    response
        .split(PEER_DELIMITER)
        .filter_map(|token| PeerId::parse(token).ok())
        .filter(|peer| peer != local)
        .collect()
}

/// How strings and sizes are delimited on ephemeral channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Newline-terminated UTF-8 lines, sizes as decimal text
    #[default]
    Lines,
    /// 2-byte big-endian length + modified UTF-8 for strings (the encoding
    /// of Java's `DataOutputStream::writeUTF`), 8-byte big-endian signed
    /// integer for sizes
    Prefixed,
}

impl std::str::FromStr for Framing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lines" => Ok(Framing::Lines),
            "prefixed" => Ok(Framing::Prefixed),
            other => Err(Error::Protocol(format!("unknown framing: {}", other))),
        }
    }
}

impl Framing {
    /// Write one string field
    pub async fn write_str<W: AsyncWrite + Unpin>(self, writer: &mut W, value: &str) -> Result<()> {
        let mut frame = Vec::with_capacity(value.len() + 2);
        match self {
            Framing::Lines => {
                if value.contains(['\n', '\r']) {
                    return Err(Error::Protocol(format!(
                        "field contains a line terminator: {:?}",
                        value
                    )));
                }
                frame.extend_from_slice(value.as_bytes());
                frame.push(b'\n');
            }
            Framing::Prefixed => {
                let encoded = encode_modified_utf8(value);
                let len = u16::try_from(encoded.len()).map_err(|_| {
                    Error::Protocol(format!("field too long: {} bytes", encoded.len()))
                })?;
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(&encoded);
            }
        }
        write_all(writer, &frame).await
    }

    /// Write a declared payload size
    pub async fn write_size<W: AsyncWrite + Unpin>(self, writer: &mut W, size: u64) -> Result<()> {
        match self {
            Framing::Lines => self.write_str(writer, &size.to_string()).await,
            Framing::Prefixed => {
                let size = i64::try_from(size)
                    .map_err(|_| Error::Protocol(format!("size out of range: {}", size)))?;
                write_all(writer, &size.to_be_bytes()).await
            }
        }
    }

    /// Read one string field. End of stream is a connection error: the
    /// relay hung up before answering.
    pub async fn read_str<R: AsyncRead + Unpin>(self, reader: &mut FrameReader<R>) -> Result<String> {
        match self {
            Framing::Lines => reader.read_line().await?.ok_or_else(|| {
                Error::Connection("connection closed before response".to_string())
            }),
            Framing::Prefixed => {
                let header = reader.read_exact(2).await.map_err(closed_mid_response)?;
                let len = u16::from_be_bytes([header[0], header[1]]) as usize;
                let body = reader.read_exact(len).await.map_err(closed_mid_response)?;
                decode_modified_utf8(&body)
            }
        }
    }
}

/// Modified UTF-8: NUL takes two bytes and characters outside the BMP are
/// written as a surrogate pair of three-byte sequences.
fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let malformed = || Error::Protocol("response is not valid modified UTF-8".to_string());
    let continuation = |at: usize| match bytes.get(at) {
        Some(&b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
        _ => Err(malformed()),
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        match lead {
            0x01..=0x7F => {
                units.push(u16::from(lead));
                i += 1;
            }
            0xC0..=0xDF => {
                units.push((u16::from(lead & 0x1F) << 6) | continuation(i + 1)?);
                i += 2;
            }
            0xE0..=0xEF => {
                units.push(
                    (u16::from(lead & 0x0F) << 12) | (continuation(i + 1)? << 6) | continuation(i + 2)?,
                );
                i += 3;
            }
            _ => return Err(malformed()),
        }
    }
    String::from_utf16(&units).map_err(|_| malformed())
}

fn closed_mid_response(err: Error) -> Error {
    match err {
        Error::TransferIntegrity { .. } => {
            Error::Connection("connection closed mid-response".to_string())
        }
        other => other,
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .await
        .map_err(|e| Error::connection("write failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_control_line_parse() {
        assert_eq!(
            ControlLine::parse("FILE:report.txt"),
            ControlLine::FileAnnounce {
                name: "report.txt".to_string()
            }
        );
        assert_eq!(
            ControlLine::parse("bob joined"),
            ControlLine::Log("bob joined".to_string())
        );
        // Prefix is case sensitive and must lead the line
        assert_eq!(
            ControlLine::parse(" FILE:x"),
            ControlLine::Log(" FILE:x".to_string())
        );
    }

    #[test]
    fn test_login_line() {
        let user = PeerId::parse("alice").unwrap();
        assert_eq!(login_line(&user), "LOGIN:alice\n");
    }

    #[test]
    fn test_parse_declared_size() {
        assert_eq!(parse_declared_size(Some("128")).unwrap(), 128);
        assert_eq!(parse_declared_size(Some(" 0 ")).unwrap(), 0);
        assert_eq!(
            parse_declared_size(Some("12kb")).unwrap_err().kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            parse_declared_size(Some("-1")).unwrap_err().kind(),
            ErrorKind::Protocol
        );
        assert_eq!(parse_declared_size(None).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_parse_peer_list() {
        let me = PeerId::parse("alice").unwrap();
        let peers = parse_peer_list("alice,bob,,carol, bob ,", &me);
        let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
        assert_eq!(names, vec!["bob", "carol"]);

        assert!(parse_peer_list("", &me).is_empty());
        assert!(parse_peer_list("alice", &me).is_empty());
    }

    #[tokio::test]
    async fn test_lines_framing_encoding() {
        let mut out = Vec::new();
        Framing::Lines.write_str(&mut out, START_FILE).await.unwrap();
        Framing::Lines.write_str(&mut out, "bob").await.unwrap();
        Framing::Lines.write_size(&mut out, 1024).await.unwrap();
        assert_eq!(out, b"START_FILE\nbob\n1024\n");

        let err = Framing::Lines.write_str(&mut out, "a\nb").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_prefixed_framing_encoding() {
        let mut out = Vec::new();
        Framing::Prefixed.write_str(&mut out, "bob").await.unwrap();
        Framing::Prefixed.write_size(&mut out, 258).await.unwrap();
        assert_eq!(out, [0, 3, b'b', b'o', b'b', 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_prefixed_read_str() {
        let data: &[u8] = &[0, 2, b'o', b'k', 0, 5, b'x'];
        let mut reader = FrameReader::new(data);
        assert_eq!(Framing::Prefixed.read_str(&mut reader).await.unwrap(), "ok");
        // Announced 5 bytes, only 1 arrives
        let err = Framing::Prefixed.read_str(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_prefixed_uses_modified_utf8() {
        let mut out = Vec::new();
        Framing::Prefixed.write_str(&mut out, "a\0é😀").await.unwrap();
        assert_eq!(
            out,
            [
                0, 11, b'a', 0xC0, 0x80, 0xC3, 0xA9, 0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80
            ]
        );

        let mut reader = FrameReader::new(&out[..]);
        assert_eq!(Framing::Prefixed.read_str(&mut reader).await.unwrap(), "a\0é😀");
    }

    #[tokio::test]
    async fn test_prefixed_rejects_malformed_string() {
        // Raw NUL and a four-byte sequence never appear in modified UTF-8
        for body in [&[0, 1, 0x00][..], &[0, 4, 0xF0, 0x9F, 0x98, 0x80][..], &[0, 2, 0xC3, b'a'][..]] {
            let mut reader = FrameReader::new(body);
            let err = Framing::Prefixed.read_str(&mut reader).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol);
        }
    }

    #[tokio::test]
    async fn test_lines_read_str_eof() {
        let data: &[u8] = b"";
        let mut reader = FrameReader::new(data);
        let err = Framing::Lines.read_str(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_framing_from_str() {
        assert_eq!("Lines".parse::<Framing>().unwrap(), Framing::Lines);
        assert_eq!("prefixed".parse::<Framing>().unwrap(), Framing::Prefixed);
        assert!("json".parse::<Framing>().is_err());
    }
}
