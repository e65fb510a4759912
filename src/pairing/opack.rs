// Jackson Coxson

use crate::plist::PlistValue;
use crate::RemoteXpcError;

/// Serializes a value in Apple's OPACK2 encoding
///
/// OPACK2 carries the pairing messages exchanged with Apple TV. Integers
/// above `i32::MAX` and all negative integers are promoted to an `f32`
/// (tag `0x35`) per Apple's documented behavior; values below −2²³ lose
/// precision and callers should not pass them.
///
/// # Errors
/// Dates and UID references have no OPACK2 representation and are
/// rejected.
pub fn opack_dumps(value: &PlistValue) -> Result<Vec<u8>, RemoteXpcError> {
    let mut buf = Vec::new();
    dump_inner(value, &mut buf)?;
    Ok(buf)
}

fn dump_inner(node: &PlistValue, buf: &mut Vec<u8>) -> Result<(), RemoteXpcError> {
    match node {
        PlistValue::Null => buf.push(0x03),
        PlistValue::Boolean(true) => buf.push(0x01),
        PlistValue::Boolean(false) => buf.push(0x02),
        PlistValue::Integer(integer) => match integer.as_signed() {
            Some(v) if (0..=39).contains(&v) => buf.push(0x08 + v as u8),
            Some(v) if (40..=255).contains(&v) => {
                buf.push(0x30);
                buf.push(v as u8);
            }
            Some(v) if v > 255 && v <= i32::MAX as i64 => {
                buf.push(0x32);
                buf.extend_from_slice(&(v as i32).to_le_bytes());
            }
            _ => {
                // Negative or does not fit i32: promoted to f32
                let v = integer
                    .as_signed()
                    .map(|v| v as f32)
                    .unwrap_or_else(|| integer.as_unsigned().unwrap_or(0) as f32);
                buf.push(0x35);
                buf.extend_from_slice(&v.to_le_bytes());
            }
        },
        PlistValue::Real(real) => {
            let narrow = *real as f32;
            if narrow as f64 == *real {
                buf.push(0x35);
                buf.extend_from_slice(&narrow.to_le_bytes());
            } else {
                buf.push(0x36);
                buf.extend_from_slice(&real.to_le_bytes());
            }
        }
        PlistValue::String(s) => {
            let bytes = s.as_bytes();
            let len = bytes.len();
            if len < 0x20 {
                buf.push(0x40 + len as u8);
            } else if len <= 0xFF {
                buf.push(0x61);
                buf.push(len as u8);
            } else if len <= 0xFFFF {
                buf.push(0x62);
                buf.extend_from_slice(&(len as u16).to_le_bytes());
            } else {
                buf.push(0x63);
                buf.extend_from_slice(&(len as u32).to_le_bytes());
            }
            buf.extend_from_slice(bytes);
        }
        PlistValue::Data(data) => {
            let len = data.len();
            if len < 0x20 {
                buf.push(0x70 + len as u8);
            } else if len <= 0xFF {
                buf.push(0x91);
                buf.push(len as u8);
            } else if len <= 0xFFFF {
                buf.push(0x92);
                buf.extend_from_slice(&(len as u16).to_le_bytes());
            } else {
                buf.push(0x93);
                buf.extend_from_slice(&(len as u32).to_le_bytes());
            }
            buf.extend_from_slice(data);
        }
        PlistValue::Array(array) => {
            if array.len() <= 14 {
                buf.push(0xD0 + array.len() as u8);
                for item in array {
                    dump_inner(item, buf)?;
                }
            } else {
                buf.push(0xDF);
                for item in array {
                    dump_inner(item, buf)?;
                }
                buf.push(0x03);
            }
        }
        PlistValue::Dictionary(dict) => {
            // Null values are filtered out before counting, mirroring how
            // undefined entries vanish from the source dictionaries
            let entries: Vec<_> = dict.iter().filter(|(_, v)| !v.is_null()).collect();
            if entries.len() <= 14 {
                buf.push(0xE0 + entries.len() as u8);
                for (key, value) in entries {
                    dump_inner(&PlistValue::String(key.clone()), buf)?;
                    dump_inner(value, buf)?;
                }
            } else {
                buf.push(0xEF);
                for (key, value) in entries {
                    dump_inner(&PlistValue::String(key.clone()), buf)?;
                    dump_inner(value, buf)?;
                }
                // One sentinel ends the entries, a second terminates the
                // implicit trailing key
                buf.push(0x03);
                buf.push(0x03);
            }
        }
        PlistValue::Date(_) => {
            return Err(RemoteXpcError::OpackUnsupported("date".to_string()));
        }
        PlistValue::Uid(_) => {
            return Err(RemoteXpcError::OpackUnsupported("uid".to_string()));
        }
    }
    Ok(())
}
