//! Type-tagged values stored in the primary table.

use std::borrow::Cow;
use std::collections::VecDeque;

use dfly_core::containers::{HotMap, HotSet};

/// Object type tag carried by every stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjType {
    /// Byte string, possibly integer-encoded.
    String,
    /// Ordered list of byte strings.
    List,
    /// Unordered set of byte strings.
    Set,
    /// Field → value map.
    Hash,
}

/// One stored value.
///
/// Strings that are the canonical decimal form of an `i64` are kept integer-encoded; every other
/// string stays raw. Both encodings report [`ObjType::String`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectValue {
    /// Raw byte string.
    Str(Vec<u8>),
    /// Integer-encoded string.
    Int(i64),
    /// List value.
    List(VecDeque<Vec<u8>>),
    /// Set value.
    Set(HotSet<Vec<u8>>),
    /// Hash value.
    Hash(HotMap<Vec<u8>, Vec<u8>>),
}

impl Default for ObjectValue {
    fn default() -> Self {
        Self::Str(Vec::new())
    }
}

impl ObjectValue {
    /// Builds a string value, integer-encoding canonical decimal input.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        match parse_canonical_i64(&bytes) {
            Some(number) => Self::Int(number),
            None => Self::Str(bytes),
        }
    }

    /// Returns the type tag.
    #[must_use]
    pub fn obj_type(&self) -> ObjType {
        match self {
            Self::Str(_) | Self::Int(_) => ObjType::String,
            Self::List(_) => ObjType::List,
            Self::Set(_) => ObjType::Set,
            Self::Hash(_) => ObjType::Hash,
        }
    }

    /// Replaces this value with a string value.
    pub fn set_string(&mut self, bytes: impl Into<Vec<u8>>) {
        *self = Self::from_bytes(bytes);
    }

    /// Replaces this value with an integer-encoded string.
    pub fn set_int(&mut self, number: i64) {
        *self = Self::Int(number);
    }

    /// Returns the integer held by a string value, if it is one.
    #[must_use]
    pub fn try_get_int(&self) -> Option<i64> {
        match self {
            Self::Int(number) => Some(*number),
            Self::Str(bytes) => parse_canonical_i64(bytes),
            _ => None,
        }
    }

    /// Returns string bytes, or `None` for non-string values.
    #[must_use]
    pub fn string_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            Self::Str(bytes) => Some(Cow::Borrowed(bytes.as_slice())),
            Self::Int(number) => Some(Cow::Owned(number.to_string().into_bytes())),
            _ => None,
        }
    }

    /// Logical size: string length or element count.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Str(bytes) => bytes.len(),
            Self::Int(number) => decimal_len(*number),
            Self::List(items) => items.len(),
            Self::Set(members) => members.len(),
            Self::Hash(fields) => fields.len(),
        }
    }

    /// Approximate heap bytes owned by this value, used for memory accounting.
    #[must_use]
    pub fn malloc_used(&self) -> usize {
        match self {
            Self::Str(bytes) => bytes.capacity(),
            Self::Int(_) => 0,
            Self::List(items) => items.iter().map(Vec::capacity).sum(),
            Self::Set(members) => members.iter().map(Vec::capacity).sum(),
            Self::Hash(fields) => fields
                .iter()
                .map(|(field, value)| field.capacity() + value.capacity())
                .sum(),
        }
    }
}

/// Parses the canonical decimal form of an `i64`: optional `-`, no `+`, no leading zeros.
fn parse_canonical_i64(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let digits = bytes.strip_prefix(b"-").unwrap_or(bytes);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    if bytes == b"-0" {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}

fn decimal_len(number: i64) -> usize {
    let sign = usize::from(number < 0);
    let mut magnitude = number.unsigned_abs();
    let mut digits = 1;
    while magnitude >= 10 {
        magnitude /= 10;
        digits += 1;
    }
    sign + digits
}

#[cfg(test)]
mod tests {
    use super::{ObjType, ObjectValue, parse_canonical_i64};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"10".as_slice(), Some(10))]
    #[case(b"-42".as_slice(), Some(-42))]
    #[case(b"0".as_slice(), Some(0))]
    #[case(b"9223372036854775807".as_slice(), Some(i64::MAX))]
    #[case(b"-9223372036854775808".as_slice(), Some(i64::MIN))]
    #[case(b"9223372036854775808".as_slice(), None)]
    #[case(b"010".as_slice(), None)]
    #[case(b"+1".as_slice(), None)]
    #[case(b"-0".as_slice(), None)]
    #[case(b" 1".as_slice(), None)]
    #[case(b"".as_slice(), None)]
    fn canonical_integers_are_recognized(#[case] input: &[u8], #[case] expected: Option<i64>) {
        assert_that!(parse_canonical_i64(input), eq(expected));
    }

    #[rstest]
    fn from_bytes_integer_encodes_canonical_numbers() {
        assert_that!(&ObjectValue::from_bytes(b"15".to_vec()), eq(&ObjectValue::Int(15)));
        assert_that!(
            &ObjectValue::from_bytes(b"015".to_vec()),
            eq(&ObjectValue::Str(b"015".to_vec()))
        );
    }

    #[rstest]
    fn string_bytes_round_trip_both_encodings() {
        let int_value = ObjectValue::Int(-120);
        let raw_value = ObjectValue::from_bytes(b"hello".to_vec());
        let int_bytes = int_value.string_bytes();
        assert_that!(int_bytes.as_deref(), eq(Some(b"-120".as_slice())));
        assert_that!(int_value.size(), eq(4));
        assert_that!(raw_value.size(), eq(5));
        assert_that!(raw_value.obj_type(), eq(ObjType::String));
    }

    #[rstest]
    fn non_string_values_report_their_type_and_no_bytes() {
        let list = ObjectValue::List(vec![b"a".to_vec(), b"b".to_vec()].into());
        assert_that!(list.obj_type(), eq(ObjType::List));
        assert_that!(list.string_bytes().is_none(), eq(true));
        assert_that!(list.try_get_int(), eq(None));
        assert_that!(list.size(), eq(2));
    }
}
