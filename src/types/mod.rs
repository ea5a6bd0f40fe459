//! PostgreSQL type identifiers.
//!
//! Built-in types carry their oid as a compile-time constant; custom types are
//! resolved at runtime through a [`TypeRegistry`].

mod registry;

pub use registry::TypeRegistry;

use std::borrow::Cow;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub struct Oid(pub i32);

impl Oid {
    /// Oid of a parameter whose type is left to the server.
    pub const NULL: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    // One-dimensional array types
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Oid::NULL
    }
}

// ============================================================================
// Type traits
// ============================================================================

/// Describes how a Rust type is represented in the database.
///
/// Built-in types set [`PgType::OID`]; custom types leave it `None` and get
/// their oid from the connection's [`TypeRegistry`], keyed by type identity.
///
/// ```
/// use std::borrow::Cow;
/// use pgdial::PgType;
///
/// struct Mood;
///
/// impl PgType for Mood {
///     fn type_name() -> Cow<'static, str> {
///         "mood".into()
///     }
/// }
/// ```
pub trait PgType: 'static {
    /// Fixed oid for built-in types.
    const OID: Option<Oid> = None;

    /// Fixed oid of the one-dimensional array of this type.
    const ARRAY_OID: Option<Oid> = None;

    /// Fully qualified type name in the database.
    fn type_name() -> Cow<'static, str>;
}

/// True when `T` resolves without consulting a registry.
pub const fn is_built_in<T: PgType>() -> bool {
    T::OID.is_some()
}

macro_rules! built_in {
    ($($ty:ty => $name:literal, $oid:expr, $array:expr;)*) => {
        $(
            impl PgType for $ty {
                const OID: Option<Oid> = Some($oid);
                const ARRAY_OID: Option<Oid> = Some($array);

                fn type_name() -> Cow<'static, str> {
                    Cow::Borrowed($name)
                }
            }
        )*
    };
}

built_in! {
    bool => "bool", Oid::BOOL, Oid::BOOL_ARRAY;
    i8 => "char", Oid::CHAR, Oid::CHAR_ARRAY;
    i16 => "int2", Oid::INT2, Oid::INT2_ARRAY;
    i32 => "int4", Oid::INT4, Oid::INT4_ARRAY;
    i64 => "int8", Oid::INT8, Oid::INT8_ARRAY;
    f32 => "float4", Oid::FLOAT4, Oid::FLOAT4_ARRAY;
    f64 => "float8", Oid::FLOAT8, Oid::FLOAT8_ARRAY;
    String => "text", Oid::TEXT, Oid::TEXT_ARRAY;
    str => "text", Oid::TEXT, Oid::TEXT_ARRAY;
    bytes::Bytes => "bytea", Oid::BYTEA, Oid::BYTEA_ARRAY;
    uuid::Uuid => "uuid", Oid::UUID, Oid::UUID_ARRAY;
    chrono::NaiveDate => "date", Oid::DATE, Oid::DATE_ARRAY;
    chrono::NaiveDateTime => "timestamp", Oid::TIMESTAMP, Oid::TIMESTAMP_ARRAY;
    chrono::DateTime<chrono::Utc> => "timestamptz", Oid::TIMESTAMPTZ, Oid::TIMESTAMPTZ_ARRAY;
    serde_json::Value => "jsonb", Oid::JSONB, Oid::JSONB_ARRAY;
}

/// Arrays of built-in types take the element's array oid; arrays of custom
/// types are registered like any other custom type.
impl<T: PgType> PgType for Vec<T> {
    const OID: Option<Oid> = T::ARRAY_OID;

    fn type_name() -> Cow<'static, str> {
        Cow::Owned(format!("{}[]", T::type_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mood;

    impl PgType for Mood {
        fn type_name() -> Cow<'static, str> {
            "mood".into()
        }
    }

    #[test]
    fn test_built_in_classification() {
        assert!(is_built_in::<i32>());
        assert!(is_built_in::<String>());
        assert!(is_built_in::<Vec<f32>>());
        assert!(!is_built_in::<Mood>());
        assert!(!is_built_in::<Vec<Mood>>());
    }

    #[test]
    fn test_array_type_names() {
        assert_eq!(Vec::<i64>::type_name(), "int8[]");
        assert_eq!(Vec::<Mood>::type_name(), "mood[]");
        assert_eq!(Vec::<f32>::OID, Some(Oid::FLOAT4_ARRAY));
    }
}
