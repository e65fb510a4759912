// Jackson Coxson

use crate::plist::{self, Dictionary, PlistValue};

/// A usbmuxd wire packet: 16-byte little-endian header followed by an XML
/// plist body. The length field includes the header itself.
pub struct RawPacket {
    pub plist: Dictionary,
    pub version: u32,
    pub message_type: u32,
    pub tag: u32,
}

pub const HEADER_SIZE: u32 = 16;

impl RawPacket {
    pub fn new(plist: Dictionary, version: u32, message_type: u32, tag: u32) -> Self {
        Self {
            plist,
            version,
            message_type,
            tag,
        }
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(packet: RawPacket) -> Self {
        let body = plist::create_xml(&PlistValue::Dictionary(packet.plist));
        let body = body.as_bytes();

        let size = HEADER_SIZE + body.len() as u32;
        let mut out = Vec::with_capacity(size as usize);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&packet.version.to_le_bytes());
        out.extend_from_slice(&packet.message_type.to_le_bytes());
        out.extend_from_slice(&packet.tag.to_le_bytes());
        out.extend_from_slice(body);
        out
    }
}
