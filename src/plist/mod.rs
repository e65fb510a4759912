//! Property-list codec
//!
//! Converts [`PlistValue`] to and from Apple's XML and binary ("bplist00")
//! property-list forms, and splits incoming byte streams into whole plist
//! messages. Every protocol layer in this crate speaks through these types.

mod binary;
mod splitter;
mod xml;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use num_bigint::BigInt;
use thiserror::Error;

pub use splitter::{PlistSplitter, SplitterConfig};

/// Seconds between the Unix epoch and Apple's 2001-01-01 epoch
pub(crate) const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// A property-list value
///
/// Dictionaries preserve insertion order and their keys are always strings.
/// Dates are absolute instants; conversion to and from the Apple epoch is
/// internal to the binary codec.
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Null,
    Boolean(bool),
    Integer(Integer),
    Real(f64),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
    String(String),
    Array(Vec<PlistValue>),
    Dictionary(Dictionary),
    /// NSKeyedArchiver object reference, only produced by the binary form
    Uid(u64),
}

/// A plist integer
///
/// Holds an `i64` in the common case. Unsigned 64-bit values above
/// `i64::MAX`, as produced by some binary plists, fall back to an
/// arbitrary-precision representation so they round-trip losslessly.
#[derive(Debug, Clone)]
pub struct Integer(Repr);

#[derive(Debug, Clone)]
enum Repr {
    Small(i64),
    Big(BigInt),
}

impl Integer {
    pub fn as_signed(&self) -> Option<i64> {
        match &self.0 {
            Repr::Small(i) => Some(*i),
            Repr::Big(b) => i64::try_from(b.clone()).ok(),
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match &self.0 {
            Repr::Small(i) => u64::try_from(*i).ok(),
            Repr::Big(b) => u64::try_from(b.clone()).ok(),
        }
    }

    /// The value widened to an arbitrary-precision integer
    pub fn to_big(&self) -> BigInt {
        match &self.0 {
            Repr::Small(i) => BigInt::from(*i),
            Repr::Big(b) => b.clone(),
        }
    }

    /// Whether the value fits the native signed 64-bit width
    pub fn fits_i64(&self) -> bool {
        matches!(self.0, Repr::Small(_))
    }
}

impl PartialEq for Integer {
    fn eq(&self, other: &Self) -> bool {
        self.to_big() == other.to_big()
    }
}

impl std::fmt::Display for Integer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Repr::Small(i) => write!(f, "{i}"),
            Repr::Big(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for Integer {
    fn from(value: i64) -> Self {
        Self(Repr::Small(value))
    }
}

impl From<u64> for Integer {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => Self(Repr::Small(v)),
            Err(_) => Self(Repr::Big(BigInt::from(value))),
        }
    }
}

impl From<BigInt> for Integer {
    fn from(value: BigInt) -> Self {
        match i64::try_from(value.clone()) {
            Ok(v) => Self(Repr::Small(v)),
            Err(_) => Self(Repr::Big(value)),
        }
    }
}

macro_rules! integer_from_small {
    ($($t:ty),*) => {
        $(impl From<$t> for Integer {
            fn from(value: $t) -> Self {
                Self(Repr::Small(value as i64))
            }
        })*
    };
}
integer_from_small!(i8, i16, i32, u8, u16, u32);

/// An ordered string-keyed mapping of plist values
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary(IndexMap<String, PlistValue>);

impl Dictionary {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PlistValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut PlistValue> {
        self.0.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PlistValue> {
        self.0.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PlistValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl IntoIterator for Dictionary {
    type Item = (String, PlistValue);
    type IntoIter = indexmap::map::IntoIter<String, PlistValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Dictionary {
    type Item = (&'a String, &'a PlistValue);
    type IntoIter = indexmap::map::Iter<'a, String, PlistValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, PlistValue)> for Dictionary {
    fn from_iter<T: IntoIterator<Item = (String, PlistValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl PlistValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PlistValue::Null)
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PlistValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<&Integer> {
        match self {
            PlistValue::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_signed_integer(&self) -> Option<i64> {
        self.as_integer().and_then(|i| i.as_signed())
    }

    pub fn as_unsigned_integer(&self) -> Option<u64> {
        self.as_integer().and_then(|i| i.as_unsigned())
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            PlistValue::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            PlistValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            PlistValue::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<PlistValue>> {
        match self {
            PlistValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dictionary_mut(&mut self) -> Option<&mut Dictionary> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            PlistValue::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<PlistValue>> {
        match self {
            PlistValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for PlistValue {
    fn from(value: bool) -> Self {
        PlistValue::Boolean(value)
    }
}

impl From<f64> for PlistValue {
    fn from(value: f64) -> Self {
        PlistValue::Real(value)
    }
}

impl From<&str> for PlistValue {
    fn from(value: &str) -> Self {
        PlistValue::String(value.to_string())
    }
}

impl From<String> for PlistValue {
    fn from(value: String) -> Self {
        PlistValue::String(value)
    }
}

impl From<&String> for PlistValue {
    fn from(value: &String) -> Self {
        PlistValue::String(value.clone())
    }
}

impl From<Vec<u8>> for PlistValue {
    fn from(value: Vec<u8>) -> Self {
        PlistValue::Data(value)
    }
}

impl From<&[u8]> for PlistValue {
    fn from(value: &[u8]) -> Self {
        PlistValue::Data(value.to_vec())
    }
}

impl From<Vec<PlistValue>> for PlistValue {
    fn from(value: Vec<PlistValue>) -> Self {
        PlistValue::Array(value)
    }
}

impl From<Dictionary> for PlistValue {
    fn from(value: Dictionary) -> Self {
        PlistValue::Dictionary(value)
    }
}

impl From<DateTime<Utc>> for PlistValue {
    fn from(value: DateTime<Utc>) -> Self {
        PlistValue::Date(value)
    }
}

impl From<Integer> for PlistValue {
    fn from(value: Integer) -> Self {
        PlistValue::Integer(value)
    }
}

macro_rules! plist_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for PlistValue {
            fn from(value: $t) -> Self {
                PlistValue::Integer(Integer::from(value))
            }
        })*
    };
}
plist_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl<T: Into<PlistValue>> From<Option<T>> for PlistValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => PlistValue::Null,
        }
    }
}

/// Errors produced by the plist codec
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PlistError {
    #[error("input has no root element")]
    NoRootElement,
    #[error("root element is not <plist>")]
    RootNotPlist,
    #[error("unclosed tag <{0}>")]
    UnclosedTag(String),
    #[error("document is empty after cleanup")]
    EmptyDocument,
    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid character entity")]
    BadEntity,
    #[error("invalid base64 in <data> element")]
    BadBase64,
    #[error("invalid <date> content")]
    BadDate,
    #[error("invalid integer")]
    BadInteger,
    #[error("invalid real")]
    BadReal,
    #[error("input is not valid UTF-8")]
    BadUtf8,
    #[error("bad binary plist magic")]
    BadMagic,
    #[error("truncated binary plist")]
    Truncated,
    #[error("invalid binary plist trailer")]
    BadTrailer,
    #[error("unknown object type byte 0x{0:02X}")]
    UnknownObjectType(u8),
    #[error("binary plist object reference out of range")]
    BadObjectRef,
    #[error("cyclic object reference in binary plist")]
    CyclicReference,
    #[error("dictionary key is not a string")]
    DictKeyNotString,
}

/// Serializes a value as an XML property-list document
pub fn create_xml(value: &PlistValue) -> String {
    xml::create_xml(value)
}

/// Parses an XML property-list document
///
/// Tolerates leading garbage, duplicate XML declarations and stray U+FFFD
/// replacement characters outside the document proper.
pub fn parse_xml(input: &str) -> Result<PlistValue, PlistError> {
    xml::parse_xml(input)
}

/// Serializes a value in binary "bplist00" form
pub fn create_binary(value: &PlistValue) -> Vec<u8> {
    binary::create_binary(value)
}

/// Parses a binary "bplist00" payload
pub fn parse_binary(input: &[u8]) -> Result<PlistValue, PlistError> {
    binary::parse_binary(input)
}

/// Parses a property list in either form
///
/// Buffers starting with the `bplist00` magic are treated as binary;
/// everything else is decoded as UTF-8 and parsed as XML.
pub fn parse_plist(input: &[u8]) -> Result<PlistValue, PlistError> {
    if input.starts_with(binary::MAGIC) {
        binary::parse_binary(input)
    } else {
        let s = std::str::from_utf8(input).map_err(|_| PlistError::BadUtf8)?;
        xml::parse_xml(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> PlistValue {
        let mut dict = Dictionary::new();
        dict.insert("name", "test-device");
        dict.insert("count", 42i64);
        dict.insert("negative", -7i64);
        dict.insert("ratio", 0.5f64);
        dict.insert("enabled", true);
        dict.insert("disabled", false);
        dict.insert("blob", vec![0u8, 1, 2, 254, 255]);
        dict.insert(
            "when",
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap(),
        );
        dict.insert(
            "items",
            PlistValue::Array(vec!["a".into(), 1i64.into(), false.into()]),
        );
        PlistValue::Dictionary(dict)
    }

    #[test]
    fn xml_round_trip() {
        let v = sample();
        let xml = create_xml(&v);
        let parsed = parse_xml(&xml).unwrap();
        assert_eq!(v, parsed);
    }

    #[test]
    fn binary_round_trip() {
        let v = sample();
        let bin = create_binary(&v);
        let parsed = parse_binary(&bin).unwrap();
        assert_eq!(v, parsed);
    }

    #[test]
    fn auto_detection() {
        let v = sample();
        assert_eq!(parse_plist(&create_binary(&v)).unwrap(), v);
        assert_eq!(parse_plist(create_xml(&v).as_bytes()).unwrap(), v);
    }

    #[test]
    fn big_integer_round_trip() {
        let mut dict = Dictionary::new();
        dict.insert("big", u64::MAX);
        let v = PlistValue::Dictionary(dict);
        let parsed = parse_binary(&create_binary(&v)).unwrap();
        let big = parsed
            .as_dictionary()
            .and_then(|d| d.get("big"))
            .and_then(|x| x.as_unsigned_integer());
        assert_eq!(big, Some(u64::MAX));
        assert!(!parsed.as_dictionary().unwrap().get("big").unwrap()
            .as_integer()
            .unwrap()
            .fits_i64());
    }

    #[test]
    fn integer_equality_across_reprs() {
        assert_eq!(Integer::from(7i64), Integer::from(7u64));
        assert_ne!(Integer::from(u64::MAX), Integer::from(i64::MAX));
    }
}
