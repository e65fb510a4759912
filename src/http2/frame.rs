// Jackson Coxson

use crate::RemoteXpcError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame flag bits observed on the RSD wire
pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;
pub const FLAG_PADDED: u8 = 0x08;
pub const FLAG_PRIORITY: u8 = 0x20;

const FRAME_TYPE_DATA: u8 = 0x00;
const FRAME_TYPE_HEADERS: u8 = 0x01;
const FRAME_TYPE_RST_STREAM: u8 = 0x03;
const FRAME_TYPE_SETTINGS: u8 = 0x04;
const FRAME_TYPE_GOAWAY: u8 = 0x07;
const FRAME_TYPE_WINDOW_UPDATE: u8 = 0x08;

pub trait HttpFrame {
    fn serialize(&self) -> Vec<u8>;
}

/// The frame types this client implements; everything else either errors or
/// is not expected from the device
#[derive(Debug)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Settings(SettingsFrame),
    WindowUpdate(WindowUpdateFrame),
}

impl Frame {
    /// Reads the next frame: a 9-byte header {length:24, type:8, flags:8,
    /// streamId:31} followed by the body
    pub async fn read(
        socket: &mut (impl AsyncRead + Unpin + ?Sized),
    ) -> Result<Self, RemoteXpcError> {
        let mut buf = [0u8; 3];
        socket.read_exact(&mut buf).await?;
        let frame_len = u32::from_be_bytes([0x00, buf[0], buf[1], buf[2]]);

        let frame_type = socket.read_u8().await?;
        let flags = socket.read_u8().await?;
        let stream_id = socket.read_u32().await? & 0x7FFF_FFFF;

        let mut body = vec![0; frame_len as usize];
        socket.read_exact(&mut body).await?;

        Self::from_parts(frame_type, flags, stream_id, body)
    }

    fn from_parts(
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        body: Vec<u8>,
    ) -> Result<Self, RemoteXpcError> {
        Ok(match frame_type {
            FRAME_TYPE_DATA => {
                let (pad_length, rest) = strip_padding(flags, &body)?;
                Self::Data(DataFrame {
                    stream_id,
                    flags,
                    payload: rest.to_vec(),
                    pad_length,
                })
            }
            FRAME_TYPE_HEADERS => {
                let (pad_length, rest) = strip_padding(flags, &body)?;
                let (priority, fragment) = if flags & FLAG_PRIORITY != 0 {
                    if rest.len() < 5 {
                        return Err(RemoteXpcError::UnexpectedResponse);
                    }
                    let word = u32::from_be_bytes(rest[..4].try_into().unwrap());
                    (
                        Some(Priority {
                            exclusive: word & 0x8000_0000 != 0,
                            stream_dependency: word & 0x7FFF_FFFF,
                            weight: rest[4],
                        }),
                        rest[5..].to_vec(),
                    )
                } else {
                    (None, rest.to_vec())
                };
                Self::Headers(HeadersFrame {
                    stream_id,
                    flags,
                    priority,
                    fragment,
                    pad_length,
                })
            }
            FRAME_TYPE_RST_STREAM => return Err(RemoteXpcError::HttpStreamReset),
            FRAME_TYPE_SETTINGS => {
                let mut settings = Vec::new();
                for chunk in body.chunks(6) {
                    if chunk.len() != 6 {
                        return Err(RemoteXpcError::UnexpectedResponse);
                    }
                    let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                    let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                    settings.push(Setting::from_wire(id, value)?);
                }
                Self::Settings(SettingsFrame {
                    settings,
                    stream_id,
                    flags,
                })
            }
            FRAME_TYPE_GOAWAY => {
                let msg = if body.len() < 8 {
                    "<MISSING>".to_string()
                } else {
                    String::from_utf8_lossy(&body[8..]).to_string()
                };
                return Err(RemoteXpcError::HttpGoAway(msg));
            }
            FRAME_TYPE_WINDOW_UPDATE => {
                if body.len() != 4 {
                    return Err(RemoteXpcError::UnexpectedResponse);
                }
                let increment = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                Self::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    increment,
                })
            }
            other => return Err(RemoteXpcError::UnknownFrame(other)),
        })
    }
}

/// Strips the pad-length prefix and trailing padding when PADDED is set
fn strip_padding(flags: u8, body: &[u8]) -> Result<(Option<u8>, &[u8]), RemoteXpcError> {
    if flags & FLAG_PADDED == 0 {
        return Ok((None, body));
    }
    let pad_length = *body.first().ok_or(RemoteXpcError::UnexpectedResponse)? as usize;
    if body.len() < 1 + pad_length {
        return Err(RemoteXpcError::UnexpectedResponse);
    }
    Ok((
        Some(pad_length as u8),
        &body[1..body.len() - pad_length],
    ))
}

fn write_header(len: usize, frame_type: u8, flags: u8, stream_id: u32, out: &mut Vec<u8>) {
    let len = (len as u32).to_be_bytes();
    out.extend_from_slice(&len[1..]);
    out.push(frame_type);
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
    /// Trailing padding emitted (and stripped) when the PADDED flag is set
    pub pad_length: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            flags: 0,
            payload,
            pad_length: None,
        }
    }
}

impl HttpFrame for DataFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut flags = self.flags;
        let mut body_len = self.payload.len();
        if let Some(pad) = self.pad_length {
            flags |= FLAG_PADDED;
            body_len += 1 + pad as usize;
        }
        let mut out = Vec::with_capacity(9 + body_len);
        write_header(body_len, FRAME_TYPE_DATA, flags, self.stream_id, &mut out);
        if let Some(pad) = self.pad_length {
            out.push(pad);
        }
        out.extend_from_slice(&self.payload);
        if let Some(pad) = self.pad_length {
            out.extend(std::iter::repeat(0u8).take(pad as usize));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priority {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

/// HPACK is not required for reading the catalog, so the fragment is kept
/// opaque
#[derive(Debug, Clone, PartialEq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub priority: Option<Priority>,
    pub fragment: Vec<u8>,
    pub pad_length: Option<u8>,
}

impl HeadersFrame {
    /// An empty stream-opening HEADERS frame
    pub fn open(stream_id: u32) -> Self {
        Self {
            stream_id,
            flags: FLAG_END_HEADERS,
            priority: None,
            fragment: Vec::new(),
            pad_length: None,
        }
    }
}

impl HttpFrame for HeadersFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut flags = self.flags;
        let mut body_len = self.fragment.len();
        if self.priority.is_some() {
            flags |= FLAG_PRIORITY;
            body_len += 5;
        }
        if let Some(pad) = self.pad_length {
            flags |= FLAG_PADDED;
            body_len += 1 + pad as usize;
        }
        let mut out = Vec::with_capacity(9 + body_len);
        write_header(body_len, FRAME_TYPE_HEADERS, flags, self.stream_id, &mut out);
        if let Some(pad) = self.pad_length {
            out.push(pad);
        }
        if let Some(priority) = &self.priority {
            let mut word = priority.stream_dependency & 0x7FFF_FFFF;
            if priority.exclusive {
                word |= 0x8000_0000;
            }
            out.extend_from_slice(&word.to_be_bytes());
            out.push(priority.weight);
        }
        out.extend_from_slice(&self.fragment);
        if let Some(pad) = self.pad_length {
            out.extend(std::iter::repeat(0u8).take(pad as usize));
        }
        out
    }
}

/// The settings identifiers the RSD wire uses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(u32),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    EnableConnectProtocol(u32),
}

impl Setting {
    fn from_wire(id: u16, value: u32) -> Result<Self, RemoteXpcError> {
        Ok(match id {
            0x01 => Self::HeaderTableSize(value),
            0x02 => Self::EnablePush(value),
            0x03 => Self::MaxConcurrentStreams(value),
            0x04 => Self::InitialWindowSize(value),
            0x05 => Self::MaxFrameSize(value),
            0x06 => Self::MaxHeaderListSize(value),
            0x08 => Self::EnableConnectProtocol(value),
            other => return Err(RemoteXpcError::UnknownHttpSetting(other)),
        })
    }

    fn to_wire(self) -> (u16, u32) {
        match self {
            Self::HeaderTableSize(v) => (0x01, v),
            Self::EnablePush(v) => (0x02, v),
            Self::MaxConcurrentStreams(v) => (0x03, v),
            Self::InitialWindowSize(v) => (0x04, v),
            Self::MaxFrameSize(v) => (0x05, v),
            Self::MaxHeaderListSize(v) => (0x06, v),
            Self::EnableConnectProtocol(v) => (0x08, v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingsFrame {
    pub settings: Vec<Setting>,
    pub stream_id: u32,
    pub flags: u8,
}

impl SettingsFrame {
    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            stream_id: 0,
            flags: FLAG_ACK,
        }
    }
}

impl HttpFrame for SettingsFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.settings.len() * 6);
        write_header(
            self.settings.len() * 6,
            FRAME_TYPE_SETTINGS,
            self.flags,
            self.stream_id,
            &mut out,
        );
        for setting in &self.settings {
            let (id, value) = setting.to_wire();
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl HttpFrame for WindowUpdateFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        write_header(4, FRAME_TYPE_WINDOW_UPDATE, 0, self.stream_id, &mut out);
        out.extend_from_slice(&self.increment.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(bytes: &[u8]) -> Frame {
        Frame::read(&mut &bytes[..]).await.unwrap()
    }

    #[tokio::test]
    async fn data_round_trip() {
        let frame = DataFrame::new(1, b"hello".to_vec());
        let bytes = frame.serialize();
        match round_trip(&bytes).await {
            Frame::Data(parsed) => assert_eq!(parsed, frame),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_with_padding_round_trip() {
        let frame = DataFrame {
            stream_id: 3,
            flags: FLAG_END_STREAM,
            payload: b"payload".to_vec(),
            pad_length: Some(6),
        };
        let bytes = frame.serialize();
        // Header length field includes pad byte and padding
        assert_eq!(bytes[2], (7 + 1 + 6) as u8);
        match round_trip(&bytes).await {
            Frame::Data(parsed) => {
                assert_eq!(parsed.payload, b"payload");
                assert_eq!(parsed.pad_length, Some(6));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn headers_with_priority_and_padding_round_trip() {
        let frame = HeadersFrame {
            stream_id: 1,
            flags: FLAG_END_HEADERS,
            priority: Some(Priority {
                exclusive: true,
                stream_dependency: 7,
                weight: 201,
            }),
            fragment: vec![0x82, 0x84],
            pad_length: Some(3),
        };
        let bytes = frame.serialize();
        match round_trip(&bytes).await {
            Frame::Headers(parsed) => {
                assert_eq!(parsed.priority, frame.priority);
                assert_eq!(parsed.fragment, frame.fragment);
                assert_eq!(parsed.pad_length, Some(3));
                assert!(parsed.flags & FLAG_PRIORITY != 0);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let frame = SettingsFrame {
            settings: vec![
                Setting::MaxConcurrentStreams(100),
                Setting::EnableConnectProtocol(1),
                Setting::InitialWindowSize(1_048_576),
            ],
            stream_id: 0,
            flags: 0,
        };
        let bytes = frame.serialize();
        match round_trip(&bytes).await {
            Frame::Settings(parsed) => assert_eq!(parsed.settings, frame.settings),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_update_round_trip() {
        let frame = WindowUpdateFrame {
            stream_id: 1,
            increment: 983_041,
        };
        let bytes = frame.serialize();
        match round_trip(&bytes).await {
            Frame::WindowUpdate(parsed) => assert_eq!(parsed, frame),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_frame_type_errors() {
        let mut bytes = DataFrame::new(1, vec![]).serialize();
        bytes[3] = 0x0C;
        match Frame::read(&mut &bytes[..]).await {
            Err(RemoteXpcError::UnknownFrame(0x0C)) => {}
            other => panic!("expected unknown frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_setting_errors() {
        let frame = SettingsFrame {
            settings: vec![Setting::EnablePush(0)],
            stream_id: 0,
            flags: 0,
        };
        let mut bytes = frame.serialize();
        bytes[10] = 0x77; // corrupt the setting identifier
        match Frame::read(&mut &bytes[..]).await {
            Err(RemoteXpcError::UnknownHttpSetting(0x0077)) => {}
            other => panic!("expected unknown setting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn goaway_carries_debug_message() {
        let mut bytes = Vec::new();
        let mut body = vec![0u8; 8];
        body.extend_from_slice(b"too slow");
        write_header(body.len(), FRAME_TYPE_GOAWAY, 0, 0, &mut bytes);
        bytes.extend_from_slice(&body);
        match Frame::read(&mut &bytes[..]).await {
            Err(RemoteXpcError::HttpGoAway(msg)) => assert_eq!(msg, "too slow"),
            other => panic!("expected goaway, got {other:?}"),
        }
    }
}
