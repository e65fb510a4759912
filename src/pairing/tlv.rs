// Jackson Coxson

use indexmap::IndexMap;

use crate::RemoteXpcError;

/// TLV types used during pair-setup and pair-verify
///
/// From the HomeKit pairing TLV8 vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingTlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    ErrorResponse = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0a,
    Permissions = 0x0b,
    FragmentData = 0x0c,
    FragmentLast = 0x0d,
    SessionId = 0x0e,
    Ttl = 0x0f,
    ExtraData = 0x10,
    Info = 0x11,
    Acl = 0x12,
    Flags = 0x13,
    ValidationData = 0x14,
    Separator = 0xff,
}

/// One logical TLV8 item
///
/// On the wire an item longer than 255 bytes is fragmented into
/// back-to-back records of the same type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv8Item {
    pub tlv_type: u8,
    pub data: Vec<u8>,
}

impl Tlv8Item {
    pub fn new(tlv_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tlv_type,
            data: data.into(),
        }
    }

    /// A pairing state marker (M1..M6)
    pub fn state(stage: u8) -> Self {
        Self::new(PairingTlvType::State as u8, vec![stage])
    }
}

/// Serializes items, fragmenting any item whose data exceeds 255 bytes into
/// consecutive records of the same type
pub fn encode_tlv8(items: &[Tlv8Item]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        if item.data.is_empty() {
            out.push(item.tlv_type);
            out.push(0);
            continue;
        }
        for chunk in item.data.chunks(255) {
            out.push(item.tlv_type);
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
    }
    out
}

/// Parses records, reassembling fragmented items
///
/// Consecutive records of the same type are merged when the preceding
/// record was a full 255-byte fragment, which is the only way the encoder
/// produces them.
///
/// # Errors
/// Fails on a premature end of buffer.
pub fn decode_tlv8(input: &[u8]) -> Result<Vec<Tlv8Item>, RemoteXpcError> {
    let mut items: Vec<Tlv8Item> = Vec::new();
    let mut index = 0;
    let mut previous_full = false;

    while index < input.len() {
        if index + 2 > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let tlv_type = input[index];
        let length = input[index + 1] as usize;
        index += 2;

        if index + length > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let data = &input[index..index + length];
        index += length;

        match items.last_mut() {
            Some(last) if previous_full && last.tlv_type == tlv_type => {
                last.data.extend_from_slice(data);
            }
            _ => items.push(Tlv8Item::new(tlv_type, data)),
        }
        previous_full = length == 255;
    }

    Ok(items)
}

/// Parses records into a type-keyed map, concatenating consecutive records
/// that share a type
pub fn decode_tlv8_to_dict(input: &[u8]) -> Result<IndexMap<u8, Vec<u8>>, RemoteXpcError> {
    let mut dict: IndexMap<u8, Vec<u8>> = IndexMap::new();
    let mut index = 0;

    while index < input.len() {
        if index + 2 > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let tlv_type = input[index];
        let length = input[index + 1] as usize;
        index += 2;

        if index + length > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        dict.entry(tlv_type)
            .or_default()
            .extend_from_slice(&input[index..index + length]);
        index += length;
    }

    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_the_documented_example() {
        let encoded = encode_tlv8(&[Tlv8Item::new(0x01, vec![0x42, 0x43, 0x44])]);
        assert_eq!(encoded, vec![0x01, 0x03, 0x42, 0x43, 0x44]);
    }

    #[test]
    fn round_trips_item_lists() {
        let items = vec![
            Tlv8Item::state(1),
            Tlv8Item::new(PairingTlvType::Salt as u8, vec![0xAB; 16]),
            Tlv8Item::new(PairingTlvType::PublicKey as u8, vec![0xCD; 384]),
        ];
        let decoded = decode_tlv8(&encode_tlv8(&items)).unwrap();
        assert_eq!(decoded, items);
    }

    #[test]
    fn long_item_is_fragmented_on_the_wire() {
        let item = Tlv8Item::new(0x05, vec![0x11; 600]);
        let encoded = encode_tlv8(&[item]);
        // 255 + 255 + 90 in three records
        assert_eq!(encoded[0], 0x05);
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded[257], 0x05);
        assert_eq!(encoded[258], 255);
        assert_eq!(encoded[514], 0x05);
        assert_eq!(encoded[515], 90);
        assert_eq!(encoded.len(), 600 + 3 * 2);
    }

    #[test]
    fn dict_reassembles_fragments() {
        let data = vec![0x7F; 300];
        let encoded = encode_tlv8(&[Tlv8Item::new(0x06, data.clone())]);
        let dict = decode_tlv8_to_dict(&encoded).unwrap();
        assert_eq!(dict.get(&0x06), Some(&data));
    }

    #[test]
    fn adjacent_distinct_types_stay_separate() {
        let items = vec![
            Tlv8Item::new(0x01, vec![1]),
            Tlv8Item::new(0x02, vec![2]),
            Tlv8Item::new(0x01, vec![3]),
        ];
        let decoded = decode_tlv8(&encode_tlv8(&items)).unwrap();
        assert_eq!(decoded, items);
    }

    #[test]
    fn premature_end_fails() {
        assert!(matches!(
            decode_tlv8(&[0x01]),
            Err(RemoteXpcError::MalformedTlv)
        ));
        assert!(matches!(
            decode_tlv8(&[0x01, 0x05, 0x42]),
            Err(RemoteXpcError::MalformedTlv)
        ));
        assert!(matches!(
            decode_tlv8_to_dict(&[0x01, 0x05, 0x42]),
            Err(RemoteXpcError::MalformedTlv)
        ));
    }

    #[test]
    fn empty_item_encodes_zero_length_record() {
        let items = vec![Tlv8Item::new(PairingTlvType::Separator as u8, vec![])];
        let encoded = encode_tlv8(&items);
        assert_eq!(encoded, vec![0xFF, 0x00]);
        assert_eq!(decode_tlv8(&encoded).unwrap(), items);
    }
}
