//! Wire frame codec.
//!
//! Every unit on the wire is a 7-byte header (`cmd`, `sid`, `length`)
//! followed by exactly `length` payload bytes. The settings and padding
//! scheme payloads are newline-separated `key=value` text, parsed with
//! [`StringMap`].

use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// Frame header size: 1 (cmd) + 4 (stream id) + 2 (payload length) = 7 bytes.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Largest payload a single frame can carry (2-byte length field).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Command set of the tunnel protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Pure padding, payload is discarded.
    Waste = 0,
    /// Open a new stream (client -> server).
    Syn = 1,
    /// Stream payload.
    Psh = 2,
    /// Close a stream.
    Fin = 3,
    /// Client handshake settings.
    Settings = 4,
    /// Fatal notice, payload is a human-readable string.
    Alert = 5,
    /// Server pushes a replacement padding scheme to the client.
    UpdatePaddingScheme = 6,
    /// Server stream-open response; non-empty payload is an error string.
    SynAck = 7,
    /// Keepalive request.
    HeartRequest = 8,
    /// Keepalive response.
    HeartResponse = 9,
    /// Server handshake settings (protocol v2).
    ServerSettings = 10,
}

impl TryFrom<u8> for Command {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Waste),
            1 => Ok(Command::Syn),
            2 => Ok(Command::Psh),
            3 => Ok(Command::Fin),
            4 => Ok(Command::Settings),
            5 => Ok(Command::Alert),
            6 => Ok(Command::UpdatePaddingScheme),
            7 => Ok(Command::SynAck),
            8 => Ok(Command::HeartRequest),
            9 => Ok(Command::HeartResponse),
            10 => Ok(Command::ServerSettings),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown command: {}", value),
            )),
        }
    }
}

/// One multiplexing unit: command, stream id, payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: Command,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    /// A frame with no payload.
    pub fn control(cmd: Command, stream_id: u32) -> Self {
        Self {
            cmd,
            stream_id,
            data: Bytes::new(),
        }
    }

    pub fn with_data(cmd: Command, stream_id: u32, data: Bytes) -> Self {
        Self {
            cmd,
            stream_id,
            data,
        }
    }

    /// A PSH frame carrying stream payload.
    pub fn data(stream_id: u32, data: Bytes) -> Self {
        Self::with_data(Command::Psh, stream_id, data)
    }

    /// Append the encoded frame (header + payload) to `buf`.
    ///
    /// The caller guarantees the payload fits the 2-byte length field;
    /// `Stream` chunks writes at [`MAX_FRAME_PAYLOAD`].
    #[inline]
    pub fn encode_into(&self, buf: &mut BytesMut) {
        debug_assert!(self.data.len() <= MAX_FRAME_PAYLOAD);
        buf.reserve(FRAME_HEADER_SIZE + self.data.len());
        buf.put_u8(self.cmd as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.data.len() as u16);
        if !self.data.is_empty() {
            buf.extend_from_slice(&self.data);
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.data.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a 7-byte header into (command, stream id, payload length).
    pub fn decode_header(header: &[u8; FRAME_HEADER_SIZE]) -> io::Result<(Command, u32, u16)> {
        let cmd = Command::try_from(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let length = u16::from_be_bytes([header[5], header[6]]);
        Ok((cmd, stream_id, length))
    }
}

/// Settings and padding-scheme payload format: newline-separated
/// `key=value` pairs.
#[derive(Debug, Clone, Default)]
pub struct StringMap(std::collections::HashMap<String, String>);

impl StringMap {
    pub fn new() -> Self {
        Self(std::collections::HashMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut map = Self::new();
        let text = String::from_utf8_lossy(data);
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                map.insert(key, value);
            }
        }
        map
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let lines: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        lines.join("\n").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_conversion() {
        assert_eq!(Command::try_from(0).unwrap(), Command::Waste);
        assert_eq!(Command::try_from(7).unwrap(), Command::SynAck);
        assert_eq!(Command::try_from(10).unwrap(), Command::ServerSettings);
        assert!(Command::try_from(11).is_err());
        assert!(Command::try_from(255).is_err());
    }

    #[test]
    fn header_roundtrip() {
        let frame = Frame::data(123, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 5);

        let header: [u8; FRAME_HEADER_SIZE] = encoded[..FRAME_HEADER_SIZE].try_into().unwrap();
        let (cmd, sid, len) = Frame::decode_header(&header).unwrap();
        assert_eq!(cmd, Command::Psh);
        assert_eq!(sid, 123);
        assert_eq!(len, 5);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn control_frame_is_header_only() {
        let frame = Frame::control(Command::Syn, 42);
        assert_eq!(frame.encode().len(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn max_stream_id_and_length() {
        let data = vec![0xFFu8; MAX_FRAME_PAYLOAD];
        let frame = Frame::data(u32::MAX, Bytes::from(data));
        let encoded = frame.encode();
        let header: [u8; FRAME_HEADER_SIZE] = encoded[..FRAME_HEADER_SIZE].try_into().unwrap();
        let (_, sid, len) = Frame::decode_header(&header).unwrap();
        assert_eq!(sid, u32::MAX);
        assert_eq!(len as usize, MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn unknown_command_is_invalid_data() {
        let header = [255u8, 0, 0, 0, 1, 0, 0];
        let err = Frame::decode_header(&header).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn string_map_roundtrip() {
        let mut map = StringMap::new();
        map.insert("v", "2");
        map.insert("client", "test");
        map.insert("special", "a=b=c");

        let parsed = StringMap::from_bytes(&map.to_bytes());
        assert_eq!(parsed.get("v"), Some(&"2".to_string()));
        assert_eq!(parsed.get("client"), Some(&"test".to_string()));
        assert_eq!(parsed.get("special"), Some(&"a=b=c".to_string()));
    }

    #[test]
    fn string_map_empty() {
        assert!(StringMap::new().to_bytes().is_empty());
        assert!(StringMap::from_bytes(&[]).get("anything").is_none());
    }
}
