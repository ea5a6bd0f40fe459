//! Query parameter blocks.
//!
//! A [`QueryParams`] holds every parameter of one statement in a single
//! contiguous buffer, together with the parallel arrays the extended query
//! protocol wants: oid, format, length and offset per parameter.

use bytes::BytesMut;
use smallvec::SmallVec;

use crate::encode::Encode;
use crate::native::protocol::{BindMessage, Format, FrontendMessage};
use crate::types::{Oid, TypeRegistry};

/// Length recorded for a NULL parameter.
pub const NULL_LENGTH: i32 = -1;

/// Most statements bind only a handful of parameters.
type ParamVec<T> = SmallVec<[T; 8]>;

/// Encoded parameters, ready to be bound.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    buffer: BytesMut,
    types: ParamVec<Oid>,
    formats: ParamVec<Format>,
    lengths: ParamVec<i32>,
    offsets: ParamVec<usize>,
}

impl QueryParams {
    /// Encode `params` against `registry`.
    ///
    /// # Panics
    ///
    /// Panics if a parameter has a custom type that is not registered.
    pub fn encode(registry: &TypeRegistry, params: &[&dyn Encode]) -> Self {
        let mut block = QueryParams::default();
        for param in params {
            block.push(registry, *param);
        }
        block
    }

    /// Append one parameter.
    pub fn push(&mut self, registry: &TypeRegistry, param: &dyn Encode) {
        let offset = self.buffer.len();
        let length = if param.is_null() {
            NULL_LENGTH
        } else {
            param.encode(registry, &mut self.buffer);
            (self.buffer.len() - offset) as i32
        };

        self.types.push(param.type_oid(registry));
        self.formats.push(Format::Binary);
        self.lengths.push(length);
        self.offsets.push(offset);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Parameter oids, in order.
    pub fn types(&self) -> &[Oid] {
        &self.types
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Encoded byte length per parameter, [`NULL_LENGTH`] for NULL.
    pub fn lengths(&self) -> &[i32] {
        &self.lengths
    }

    /// Encoded bytes of parameter `index`, `None` for NULL or out of range.
    pub fn value(&self, index: usize) -> Option<&[u8]> {
        let length = *self.lengths.get(index)?;
        if length == NULL_LENGTH {
            return None;
        }
        let start = self.offsets[index];
        Some(&self.buffer[start..start + length as usize])
    }

    pub fn values(&self) -> impl Iterator<Item = Option<&[u8]>> + '_ {
        (0..self.len()).map(move |index| self.value(index))
    }
}

/// Statement text paired with its encoded parameters.
#[derive(Debug, Clone)]
pub struct Query {
    text: String,
    params: QueryParams,
}

impl Query {
    pub fn new(text: impl Into<String>, registry: &TypeRegistry, params: &[&dyn Encode]) -> Self {
        Self {
            text: text.into(),
            params: QueryParams::encode(registry, params),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Render the Bind message for this query's parameters.
    ///
    /// Results are requested in binary.
    pub fn bind_message(&self, portal: &str, statement: &str) -> BytesMut {
        BindMessage {
            portal,
            statement,
            params: &self.params,
            result_formats: &[Format::Binary],
        }
        .encode()
    }
}
