//! Runtime oid map for custom types.

use std::any::TypeId;
use std::borrow::Cow;
use std::collections::HashMap;

use super::{Oid, PgType};

#[derive(Debug, Clone)]
struct Entry {
    name: Cow<'static, str>,
    oid: Oid,
}

/// Maps custom types to the oids they have in one particular database.
///
/// Built-in types never touch the map: their oid is the constant from
/// [`PgType::OID`].
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    custom: HashMap<TypeId, Entry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a custom type with the null oid.
    ///
    /// Declared types can be listed with [`unresolved`](Self::unresolved) and
    /// resolved once their oid is known. An existing entry is left alone.
    ///
    /// ```
    /// use std::borrow::Cow;
    /// use pgdial::{Oid, PgType, TypeRegistry};
    ///
    /// struct Mood;
    ///
    /// impl PgType for Mood {
    ///     fn type_name() -> Cow<'static, str> {
    ///         "mood".into()
    ///     }
    /// }
    ///
    /// let mut registry = TypeRegistry::new();
    /// registry.register::<Mood>();
    /// assert_eq!(registry.type_oid::<Mood>(), Oid::NULL);
    /// ```
    ///
    /// Built-in types, arrays of them included, are rejected at compile time:
    ///
    /// ```compile_fail
    /// pgdial::TypeRegistry::new().register::<Vec<i64>>();
    /// ```
    pub fn register<T: PgType>(&mut self) -> &mut Self {
        const { assert!(T::OID.is_none(), "built-in types have a fixed oid") };
        self.custom.entry(TypeId::of::<T>()).or_insert_with(|| Entry {
            name: T::type_name(),
            oid: Oid::NULL,
        });
        self
    }

    /// Insert or overwrite the oid of a custom type.
    ///
    /// Built-in oids are fixed:
    ///
    /// ```compile_fail
    /// pgdial::TypeRegistry::new().set_type_oid::<i32>(pgdial::Oid(1));
    /// ```
    pub fn set_type_oid<T: PgType>(&mut self, oid: Oid) -> &mut Self {
        const { assert!(T::OID.is_none(), "built-in types have a fixed oid") };
        self.custom
            .entry(TypeId::of::<T>())
            .and_modify(|entry| entry.oid = oid)
            .or_insert_with(|| Entry {
                name: T::type_name(),
                oid,
            });
        self
    }

    /// Resolve the oid of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a custom type that was never registered. Custom types
    /// must be registered before first use.
    pub fn type_oid<T: PgType + ?Sized>(&self) -> Oid {
        match self.try_type_oid::<T>() {
            Some(oid) => oid,
            None => panic!(
                "type `{}` is not registered in the type registry",
                T::type_name()
            ),
        }
    }

    /// Resolve the oid of `T`, or `None` for an unregistered custom type.
    pub fn try_type_oid<T: PgType + ?Sized>(&self) -> Option<Oid> {
        if let Some(oid) = T::OID {
            return Some(oid);
        }
        self.custom.get(&TypeId::of::<T>()).map(|entry| entry.oid)
    }

    /// True if a value of `T` can be read from a column of type `oid`.
    pub fn accepts_oid<T: PgType + ?Sized>(&self, oid: Oid) -> bool {
        self.try_type_oid::<T>() == Some(oid)
    }

    /// Names of declared custom types whose oid is still null.
    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.custom
            .values()
            .filter(|entry| entry.oid.is_null())
            .map(|entry| entry.name.as_ref())
    }

    /// Number of custom entries.
    pub fn len(&self) -> usize {
        self.custom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.custom.is_empty()
    }
}
