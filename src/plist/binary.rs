// Jackson Coxson

use chrono::{DateTime, TimeZone, Utc};
use num_bigint::{BigInt, Sign};

use super::{Dictionary, Integer, PlistError, PlistValue, APPLE_EPOCH_OFFSET};

pub(crate) const MAGIC: &[u8] = b"bplist00";
const TRAILER_LEN: usize = 32;

/// Intermediate parse of a single object: scalars are complete, containers
/// hold unresolved object references for the second pass.
enum RawObject {
    Value(PlistValue),
    Array(Vec<usize>),
    Dict(Vec<(usize, usize)>),
}

struct Reader<'a> {
    data: &'a [u8],
    ref_size: usize,
    offsets: Vec<usize>,
}

pub fn parse_binary(input: &[u8]) -> Result<PlistValue, PlistError> {
    if !input.starts_with(MAGIC) {
        return Err(PlistError::BadMagic);
    }
    if input.len() < MAGIC.len() + TRAILER_LEN {
        return Err(PlistError::Truncated);
    }

    let trailer = &input[input.len() - TRAILER_LEN..];
    let offset_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().unwrap()) as usize;
    let top_object = u64::from_be_bytes(trailer[16..24].try_into().unwrap()) as usize;
    let offset_table_offset = u64::from_be_bytes(trailer[24..32].try_into().unwrap()) as usize;

    if offset_size == 0 || offset_size > 8 || ref_size == 0 || ref_size > 8 {
        return Err(PlistError::BadTrailer);
    }
    if num_objects == 0 || top_object >= num_objects {
        return Err(PlistError::BadTrailer);
    }
    let table_end = offset_table_offset
        .checked_add(num_objects.checked_mul(offset_size).ok_or(PlistError::BadTrailer)?)
        .ok_or(PlistError::BadTrailer)?;
    if table_end > input.len() - TRAILER_LEN {
        return Err(PlistError::BadTrailer);
    }

    let mut offsets = Vec::with_capacity(num_objects);
    for i in 0..num_objects {
        let start = offset_table_offset + i * offset_size;
        offsets.push(read_be_uint(&input[start..start + offset_size]) as usize);
    }

    let reader = Reader {
        data: input,
        ref_size,
        offsets,
    };

    // First pass: parse every object, leaving container children as indices
    let mut raw = Vec::with_capacity(num_objects);
    for i in 0..num_objects {
        raw.push(reader.parse_object(i)?);
    }

    // Second pass: resolve references from the top object. Memoization
    // handles forward and cross references; a reference back into an object
    // still being resolved is a cycle, which an owned value tree cannot
    // represent.
    let mut resolved: Vec<Option<PlistValue>> = (0..num_objects).map(|_| None).collect();
    let mut in_progress = vec![false; num_objects];
    resolve(&raw, &mut resolved, &mut in_progress, top_object)
}

fn resolve(
    raw: &[RawObject],
    resolved: &mut Vec<Option<PlistValue>>,
    in_progress: &mut Vec<bool>,
    index: usize,
) -> Result<PlistValue, PlistError> {
    if index >= raw.len() {
        return Err(PlistError::BadObjectRef);
    }
    if let Some(v) = &resolved[index] {
        return Ok(v.clone());
    }
    if in_progress[index] {
        return Err(PlistError::CyclicReference);
    }
    in_progress[index] = true;

    let value = match &raw[index] {
        RawObject::Value(v) => v.clone(),
        RawObject::Array(refs) => {
            let mut items = Vec::with_capacity(refs.len());
            for r in refs {
                items.push(resolve(raw, resolved, in_progress, *r)?);
            }
            PlistValue::Array(items)
        }
        RawObject::Dict(pairs) => {
            let mut dict = Dictionary::new();
            for (k, v) in pairs {
                let key = match resolve(raw, resolved, in_progress, *k)? {
                    PlistValue::String(s) => s,
                    _ => return Err(PlistError::DictKeyNotString),
                };
                dict.insert(key, resolve(raw, resolved, in_progress, *v)?);
            }
            PlistValue::Dictionary(dict)
        }
    };

    in_progress[index] = false;
    resolved[index] = Some(value.clone());
    Ok(value)
}

fn read_be_uint(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for b in bytes {
        v = (v << 8) | *b as u64;
    }
    v
}

impl Reader<'_> {
    fn parse_object(&self, index: usize) -> Result<RawObject, PlistError> {
        let offset = *self.offsets.get(index).ok_or(PlistError::BadObjectRef)?;
        if offset >= self.data.len() {
            return Err(PlistError::Truncated);
        }
        let marker = self.data[offset];
        let upper = marker >> 4;
        let lower = (marker & 0x0F) as usize;
        let mut pos = offset + 1;

        Ok(match upper {
            0x0 => match marker {
                0x00 => RawObject::Value(PlistValue::Null),
                0x08 => RawObject::Value(PlistValue::Boolean(false)),
                0x09 => RawObject::Value(PlistValue::Boolean(true)),
                0x0F => RawObject::Value(PlistValue::Null), // fill byte
                other => return Err(PlistError::UnknownObjectType(other)),
            },
            0x1 => {
                // Integers are stored in 2^lower bytes. Sizes 1, 2 and 4 are
                // unsigned; 8 bytes is two's-complement signed; 16 bytes is a
                // signed big value.
                let size = 1usize << lower;
                let bytes = self.slice(pos, size)?;
                let value = match size {
                    1 | 2 | 4 => Integer::from(read_be_uint(bytes)),
                    8 => Integer::from(i64::from_be_bytes(bytes.try_into().unwrap())),
                    16 => Integer::from(BigInt::from_signed_bytes_be(bytes)),
                    _ => return Err(PlistError::UnknownObjectType(marker)),
                };
                RawObject::Value(PlistValue::Integer(value))
            }
            0x2 => {
                let size = 1usize << lower;
                let bytes = self.slice(pos, size)?;
                let value = match size {
                    4 => f32::from_be_bytes(bytes.try_into().unwrap()) as f64,
                    8 => f64::from_be_bytes(bytes.try_into().unwrap()),
                    _ => return Err(PlistError::UnknownObjectType(marker)),
                };
                RawObject::Value(PlistValue::Real(value))
            }
            0x3 => {
                if marker != 0x33 {
                    return Err(PlistError::UnknownObjectType(marker));
                }
                let bytes = self.slice(pos, 8)?;
                let seconds = f64::from_be_bytes(bytes.try_into().unwrap());
                RawObject::Value(PlistValue::Date(apple_seconds_to_date(seconds)?))
            }
            0x4 => {
                let (len, data_pos) = self.read_length(lower, pos)?;
                RawObject::Value(PlistValue::Data(self.slice(data_pos, len)?.to_vec()))
            }
            0x5 => {
                // ASCII string
                let (len, data_pos) = self.read_length(lower, pos)?;
                let bytes = self.slice(data_pos, len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| PlistError::BadUtf8)?;
                RawObject::Value(PlistValue::String(s.to_string()))
            }
            0x6 => {
                // UTF-16BE string; length counts code units
                let (len, data_pos) = self.read_length(lower, pos)?;
                let bytes = self.slice(data_pos, len * 2)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let s = String::from_utf16(&units).map_err(|_| PlistError::BadUtf8)?;
                RawObject::Value(PlistValue::String(s))
            }
            0x8 => {
                let size = lower + 1;
                let bytes = self.slice(pos, size)?;
                RawObject::Value(PlistValue::Uid(read_be_uint(bytes)))
            }
            0xA => {
                let (len, data_pos) = self.read_length(lower, pos)?;
                pos = data_pos;
                let mut refs = Vec::with_capacity(len);
                for _ in 0..len {
                    refs.push(read_be_uint(self.slice(pos, self.ref_size)?) as usize);
                    pos += self.ref_size;
                }
                RawObject::Array(refs)
            }
            0xD => {
                let (len, data_pos) = self.read_length(lower, pos)?;
                pos = data_pos;
                let mut keys = Vec::with_capacity(len);
                for _ in 0..len {
                    keys.push(read_be_uint(self.slice(pos, self.ref_size)?) as usize);
                    pos += self.ref_size;
                }
                let mut pairs = Vec::with_capacity(len);
                for key in keys {
                    pairs.push((key, read_be_uint(self.slice(pos, self.ref_size)?) as usize));
                    pos += self.ref_size;
                }
                RawObject::Dict(pairs)
            }
            _ => return Err(PlistError::UnknownObjectType(marker)),
        })
    }

    fn slice(&self, pos: usize, len: usize) -> Result<&[u8], PlistError> {
        let end = pos.checked_add(len).ok_or(PlistError::Truncated)?;
        self.data.get(pos..end).ok_or(PlistError::Truncated)
    }

    /// Reads a container or data length. A nibble of 0x0F means an
    /// integer-encoded extended length follows the marker.
    fn read_length(&self, lower: usize, pos: usize) -> Result<(usize, usize), PlistError> {
        if lower != 0x0F {
            return Ok((lower, pos));
        }
        let marker = *self.data.get(pos).ok_or(PlistError::Truncated)?;
        if marker >> 4 != 0x1 {
            return Err(PlistError::UnknownObjectType(marker));
        }
        let size = 1usize << (marker & 0x0F);
        let bytes = self.slice(pos + 1, size)?;
        Ok((read_be_uint(bytes) as usize, pos + 1 + size))
    }
}

fn apple_seconds_to_date(seconds: f64) -> Result<DateTime<Utc>, PlistError> {
    if !seconds.is_finite() {
        return Err(PlistError::BadDate);
    }
    let millis = (seconds * 1000.0) as i64 + APPLE_EPOCH_OFFSET * 1000;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(PlistError::BadDate)
}

fn date_to_apple_seconds(date: &DateTime<Utc>) -> f64 {
    (date.timestamp_millis() as f64 / 1000.0) - APPLE_EPOCH_OFFSET as f64
}

pub fn create_binary(value: &PlistValue) -> Vec<u8> {
    let mut objects: Vec<FlatObject> = Vec::new();
    let top = flatten(value, &mut objects);
    debug_assert_eq!(top, 0);

    let num_objects = objects.len();
    let ref_size = byte_width(num_objects as u64);

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);

    let mut offsets = Vec::with_capacity(num_objects);
    for object in &objects {
        offsets.push(out.len() as u64);
        write_object(object, ref_size, &mut out);
    }

    let offset_table_offset = out.len() as u64;
    let offset_size = byte_width(offset_table_offset);
    for offset in &offsets {
        out.extend_from_slice(&offset.to_be_bytes()[8 - offset_size..]);
    }

    // Trailer: 6 unused bytes, offset size, ref size, then three u64 fields
    out.extend_from_slice(&[0u8; 6]);
    out.push(offset_size as u8);
    out.push(ref_size as u8);
    out.extend_from_slice(&(num_objects as u64).to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&offset_table_offset.to_be_bytes());
    out
}

enum FlatObject {
    Value(PlistValue),
    Array(Vec<usize>),
    Dict(Vec<usize>, Vec<usize>),
}

/// Flattens the value tree into an object list in pre-order; returns the
/// index of the object representing `value`.
fn flatten(value: &PlistValue, objects: &mut Vec<FlatObject>) -> usize {
    let index = objects.len();
    match value {
        PlistValue::Array(items) => {
            objects.push(FlatObject::Array(Vec::new()));
            let refs: Vec<usize> = items.iter().map(|i| flatten(i, objects)).collect();
            objects[index] = FlatObject::Array(refs);
        }
        PlistValue::Dictionary(dict) => {
            objects.push(FlatObject::Dict(Vec::new(), Vec::new()));
            let mut key_refs = Vec::with_capacity(dict.len());
            let mut value_refs = Vec::with_capacity(dict.len());
            for (key, val) in dict {
                key_refs.push(flatten(&PlistValue::String(key.clone()), objects));
                value_refs.push(flatten(val, objects));
            }
            objects[index] = FlatObject::Dict(key_refs, value_refs);
        }
        other => objects.push(FlatObject::Value(other.clone())),
    }
    index
}

fn byte_width(max: u64) -> usize {
    match max {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

fn write_length(upper: u8, len: usize, out: &mut Vec<u8>) {
    if len < 0x0F {
        out.push(upper << 4 | len as u8);
    } else {
        out.push(upper << 4 | 0x0F);
        write_int_object(&Integer::from(len as u64), out);
    }
}

fn write_int_object(value: &Integer, out: &mut Vec<u8>) {
    match value.as_signed() {
        Some(v) if v >= 0 => {
            let v = v as u64;
            match byte_width(v) {
                1 => {
                    out.push(0x10);
                    out.push(v as u8);
                }
                2 => {
                    out.push(0x11);
                    out.extend_from_slice(&(v as u16).to_be_bytes());
                }
                4 => {
                    out.push(0x12);
                    out.extend_from_slice(&(v as u32).to_be_bytes());
                }
                _ => {
                    out.push(0x13);
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        Some(v) => {
            // Negative values always occupy the full signed 8-byte width
            out.push(0x13);
            out.extend_from_slice(&v.to_be_bytes());
        }
        None => {
            // Does not fit i64: 16-byte signed representation
            let big = value.to_big();
            let bytes = big.to_signed_bytes_be();
            let mut padded = [0u8; 16];
            let fill = if big.sign() == Sign::Minus { 0xFF } else { 0x00 };
            padded.fill(fill);
            padded[16 - bytes.len()..].copy_from_slice(&bytes);
            out.push(0x14);
            out.extend_from_slice(&padded);
        }
    }
}

fn write_object(object: &FlatObject, ref_size: usize, out: &mut Vec<u8>) {
    match object {
        FlatObject::Value(value) => match value {
            PlistValue::Null => out.push(0x00),
            PlistValue::Boolean(false) => out.push(0x08),
            PlistValue::Boolean(true) => out.push(0x09),
            PlistValue::Integer(i) => write_int_object(i, out),
            PlistValue::Real(r) => {
                out.push(0x23);
                out.extend_from_slice(&r.to_be_bytes());
            }
            PlistValue::Date(d) => {
                out.push(0x33);
                out.extend_from_slice(&date_to_apple_seconds(d).to_be_bytes());
            }
            PlistValue::Data(d) => {
                write_length(0x4, d.len(), out);
                out.extend_from_slice(d);
            }
            PlistValue::String(s) => {
                if s.is_ascii() {
                    write_length(0x5, s.len(), out);
                    out.extend_from_slice(s.as_bytes());
                } else {
                    let units: Vec<u16> = s.encode_utf16().collect();
                    write_length(0x6, units.len(), out);
                    for unit in units {
                        out.extend_from_slice(&unit.to_be_bytes());
                    }
                }
            }
            PlistValue::Uid(u) => {
                let width = byte_width(*u);
                out.push(0x80 | (width as u8 - 1));
                out.extend_from_slice(&u.to_be_bytes()[8 - width..]);
            }
            PlistValue::Array(_) | PlistValue::Dictionary(_) => unreachable!(),
        },
        FlatObject::Array(refs) => {
            write_length(0xA, refs.len(), out);
            for r in refs {
                write_ref(*r, ref_size, out);
            }
        }
        FlatObject::Dict(keys, values) => {
            write_length(0xD, keys.len(), out);
            for r in keys {
                write_ref(*r, ref_size, out);
            }
            for r in values {
                write_ref(*r, ref_size, out);
            }
        }
    }
}

fn write_ref(r: usize, ref_size: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&(r as u64).to_be_bytes()[8 - ref_size..]);
}
