//! Binary parameter encoding (Rust → PostgreSQL).
//!
//! Values are written in the binary format of the extended query protocol.
//! Integers and the fixed-width date/time types go big-endian. Floating point
//! values keep the host byte layout.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};

use crate::types::{Oid, PgType, TypeRegistry};

/// `num_days_from_ce` of 2000-01-01.
const PG_EPOCH_CE_DAYS: i32 = 730_120;

/// Microseconds between 1970-01-01 and 2000-01-01.
const PG_EPOCH_MICROS: i64 = 10_957 * 86_400 * 1_000_000;

/// A value that can be sent as a binary query parameter.
///
/// The trait is object safe so heterogeneous parameter lists can be passed as
/// `&[&dyn Encode]`.
pub trait Encode {
    /// Oid announced for this parameter.
    fn type_oid(&self, registry: &TypeRegistry) -> Oid;

    /// True when the parameter is sent as SQL NULL.
    fn is_null(&self) -> bool {
        false
    }

    /// Append the binary representation to `out`.
    ///
    /// Null values append nothing.
    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut);
}

/// Untyped SQL NULL. The server infers the parameter type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Null;

impl Encode for Null {
    fn type_oid(&self, _registry: &TypeRegistry) -> Oid {
        Oid::NULL
    }

    fn is_null(&self) -> bool {
        true
    }

    fn encode(&self, _registry: &TypeRegistry, _out: &mut BytesMut) {}
}

// ==================== Scalars ====================

macro_rules! encode_be {
    ($($ty:ty => $put:ident),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn type_oid(&self, registry: &TypeRegistry) -> Oid {
                    registry.type_oid::<$ty>()
                }

                fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
                    out.$put(*self);
                }
            }
        )*
    };
}

encode_be! {
    i8 => put_i8,
    i16 => put_i16,
    i32 => put_i32,
    i64 => put_i64,
}

impl Encode for bool {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<bool>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_u8(u8::from(*self));
    }
}

impl Encode for f32 {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<f32>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_slice(&self.to_ne_bytes());
    }
}

impl Encode for f64 {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<f64>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_slice(&self.to_ne_bytes());
    }
}

// ==================== Text and bytes ====================

impl Encode for str {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<str>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<String>()
    }

    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
        self.as_str().encode(registry, out);
    }
}

impl Encode for Bytes {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<Bytes>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_slice(self);
    }
}

impl Encode for uuid::Uuid {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<uuid::Uuid>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_slice(self.as_bytes());
    }
}

impl Encode for serde_json::Value {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<serde_json::Value>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        // jsonb binary format version
        out.put_u8(1);
        out.put_slice(self.to_string().as_bytes());
    }
}

// ==================== Date/time ====================

impl Encode for NaiveDate {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<NaiveDate>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_i32(self.num_days_from_ce() - PG_EPOCH_CE_DAYS);
    }
}

impl Encode for NaiveDateTime {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<NaiveDateTime>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_i64(self.and_utc().timestamp_micros() - PG_EPOCH_MICROS);
    }
}

impl Encode for DateTime<Utc> {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<DateTime<Utc>>()
    }

    fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_i64(self.timestamp_micros() - PG_EPOCH_MICROS);
    }
}

// ==================== Arrays ====================

/// One-dimensional array: `ndim`, `has_null`, element oid, then one
/// `(length, lower bound)` pair, then length-prefixed elements.
impl<T: Encode + PgType> Encode for [T] {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<Vec<T>>()
    }

    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
        out.put_i32(1);
        out.put_i32(0);
        out.put_i32(registry.type_oid::<T>().as_i32());
        out.put_i32(self.len() as i32);
        out.put_i32(1);

        for item in self {
            let at = out.len();
            out.put_i32(0);
            item.encode(registry, out);
            let len = (out.len() - at - 4) as i32;
            out[at..at + 4].copy_from_slice(&len.to_be_bytes());
        }
    }
}

impl<T: Encode + PgType> Encode for Vec<T> {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        self.as_slice().type_oid(registry)
    }

    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
        self.as_slice().encode(registry, out);
    }
}

// ==================== Nullable wrappers ====================

/// `None` is sent as NULL typed with the contained type's oid.
impl<T: Encode + PgType> Encode for Option<T> {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<T>()
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
        if let Some(value) = self {
            value.encode(registry, out);
        }
    }
}

/// An expired reference is sent as NULL typed with the referent's oid.
impl<T: Encode + PgType> Encode for Weak<T> {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        registry.type_oid::<T>()
    }

    fn is_null(&self) -> bool {
        self.strong_count() == 0
    }

    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
        if let Some(value) = self.upgrade() {
            value.encode(registry, out);
        }
    }
}

// ==================== Pointers ====================

macro_rules! encode_deref {
    ($($ptr:ident),*) => {
        $(
            impl<T: Encode + ?Sized> Encode for $ptr<T> {
                fn type_oid(&self, registry: &TypeRegistry) -> Oid {
                    (**self).type_oid(registry)
                }

                fn is_null(&self) -> bool {
                    (**self).is_null()
                }

                fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
                    (**self).encode(registry, out);
                }
            }
        )*
    };
}

encode_deref!(Box, Arc);

impl<T: Encode + ?Sized> Encode for &T {
    fn type_oid(&self, registry: &TypeRegistry) -> Oid {
        (**self).type_oid(registry)
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }

    fn encode(&self, registry: &TypeRegistry, out: &mut BytesMut) {
        (**self).encode(registry, out);
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    fn encoded<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
        let registry = TypeRegistry::new();
        let mut out = BytesMut::new();
        value.encode(&registry, &mut out);
        out.to_vec()
    }

    #[test]
    fn test_integers_are_big_endian() {
        assert_eq!(encoded(&7i8), vec![0x07]);
        assert_eq!(encoded(&0x0102i16), vec![0x01, 0x02]);
        assert_eq!(encoded(&42i32), vec![0, 0, 0, 42]);
        assert_eq!(encoded(&-1i64), vec![0xFF; 8]);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_float_keeps_host_layout() {
        assert_eq!(encoded(&42.13f32), vec![0x1F, 0x85, 0x28, 0x42]);
        assert_eq!(encoded(&1.0f64), 1.0f64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_text_and_bytes_are_raw() {
        assert_eq!(encoded("text"), b"text".to_vec());
        assert_eq!(encoded(&String::from("text")), b"text".to_vec());
        assert_eq!(encoded(&Bytes::from_static(&[0, 1, 2])), vec![0, 1, 2]);
        assert!(encoded("").is_empty());
    }

    #[test]
    fn test_uuid_raw_bytes() {
        let id = uuid::Uuid::from_bytes([
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ]);
        assert_eq!(encoded(&id), id.as_bytes().to_vec());
    }

    #[test]
    fn test_empty_float_array() {
        let values: Vec<f32> = Vec::new();
        assert_eq!(
            encoded(&values),
            vec![
                0, 0, 0, 1, // ndim
                0, 0, 0, 0, // has_null
                0, 0, 2, 0xBC, // element oid 700
                0, 0, 0, 0, // count
                0, 0, 0, 1, // lower bound
            ]
        );
    }

    #[test]
    fn test_int_array_elements_are_length_prefixed() {
        let bytes = encoded(&vec![1i32, 2]);
        assert_eq!(bytes.len(), 20 + 2 * (4 + 4));
        assert_eq!(&bytes[8..12], &23i32.to_be_bytes());
        assert_eq!(&bytes[12..16], &2i32.to_be_bytes());
        assert_eq!(&bytes[20..28], &[0, 0, 0, 4, 0, 0, 0, 1]);
        assert_eq!(&bytes[28..36], &[0, 0, 0, 4, 0, 0, 0, 2]);
    }

    #[test]
    fn test_text_array_oids() {
        let registry = TypeRegistry::new();
        let words = vec!["a".to_string(), "bc".to_string()];
        assert_eq!(words.type_oid(&registry), Oid::TEXT_ARRAY);
        assert_eq!(words.as_slice().type_oid(&registry), Oid::TEXT_ARRAY);

        let bytes = encoded(&words);
        assert_eq!(&bytes[20..25], &[0, 0, 0, 1, b'a']);
        assert_eq!(&bytes[25..31], &[0, 0, 0, 2, b'b', b'c']);
    }

    #[test]
    fn test_date_and_timestamp_epoch() {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert_eq!(encoded(&epoch), vec![0, 0, 0, 0]);

        let next = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        assert_eq!(encoded(&next), vec![0, 0, 0, 1]);

        let before = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        assert_eq!(encoded(&before), (-1i32).to_be_bytes().to_vec());

        let ts = epoch.and_hms_opt(0, 0, 1).unwrap();
        assert_eq!(encoded(&ts), 1_000_000i64.to_be_bytes().to_vec());
        assert_eq!(encoded(&ts.and_utc()), 1_000_000i64.to_be_bytes().to_vec());
    }

    #[test]
    fn test_jsonb_version_prefix() {
        let value = serde_json::json!({"a": 1});
        let bytes = encoded(&value);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..], br#"{"a":1}"#);
    }

    #[test]
    fn test_nullable_wrappers() {
        let registry = TypeRegistry::new();

        let absent: Option<i64> = None;
        assert!(absent.is_null());
        assert_eq!(absent.type_oid(&registry), Oid::INT8);
        assert!(encoded(&absent).is_empty());

        let present = Some(5i16);
        assert!(!present.is_null());
        assert_eq!(encoded(&present), vec![0, 5]);

        let strong = Arc::new(3i32);
        let weak = Arc::downgrade(&strong);
        assert!(!weak.is_null());
        assert_eq!(encoded(&weak), vec![0, 0, 0, 3]);
        drop(strong);
        assert!(weak.is_null());
        assert_eq!(weak.type_oid(&registry), Oid::INT4);
        assert!(encoded(&weak).is_empty());
    }

    #[test]
    fn test_untyped_null() {
        let registry = TypeRegistry::new();
        assert!(Null.is_null());
        assert_eq!(Null.type_oid(&registry), Oid::NULL);
        assert!(encoded(&Null).is_empty());
    }

    #[test]
    fn test_custom_type_uses_registry() {
        #[derive(Clone, Copy)]
        struct Mood(u8);

        impl PgType for Mood {
            fn type_name() -> Cow<'static, str> {
                "mood".into()
            }
        }

        impl Encode for Mood {
            fn type_oid(&self, registry: &TypeRegistry) -> Oid {
                registry.type_oid::<Mood>()
            }

            fn encode(&self, _registry: &TypeRegistry, out: &mut BytesMut) {
                out.put_u8(self.0);
            }
        }

        let mut registry = TypeRegistry::new();
        registry.set_type_oid::<Mood>(Oid(16500));
        assert_eq!(Mood(1).type_oid(&registry), Oid(16500));
        assert_eq!(Box::new(Mood(1)).type_oid(&registry), Oid(16500));
        assert_eq!(Some(Mood(1)).type_oid(&registry), Oid(16500));

        registry.set_type_oid::<Vec<Mood>>(Oid(16499));
        let mut out = BytesMut::new();
        vec![Mood(9)].encode(&registry, &mut out);
        assert_eq!(&out[8..12], &16500i32.to_be_bytes());
        assert_eq!(&out[20..], &[0, 0, 0, 1, 9]);
    }
}
