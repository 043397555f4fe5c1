//! Encoders for extension heap objects.
//!
//! Object variants outside the built-in set are serialized only if an
//! encoder was registered for their [`ExtensionKind`] tag.

use std::collections::BTreeMap;
use std::fmt;

use super::context::Expr;
use super::Serializer;
use crate::core::error::CompileResult;
use crate::frontend::{Address, ExtensionKind};

/// An extension object handed to its encoder.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionObject<'a> {
    pub address: Address,
    pub kind: ExtensionKind,
    pub payload: &'a [u8],
    pub children: &'a [Address],
}

/// Serializes one extension variant.
///
/// Implementations append payload bytes to the blob, serialize children
/// through [`Serializer::serialize_child`] and emit the construction calls.
/// Calling [`Serializer::register`] before serializing children lets the
/// object take part in cycles.
pub trait ExtensionEncoder {
    fn name(&self) -> &str;

    fn encode(&self, serializer: &mut Serializer<'_>, object: ExtensionObject<'_>) -> CompileResult<Expr>;
}

#[derive(Default)]
pub struct EncoderRegistry {
    encoders: BTreeMap<ExtensionKind, Box<dyn ExtensionEncoder>>,
}

impl EncoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `encoder` for `kind`, returning the encoder it replaces.
    pub fn register(
        &mut self,
        kind: ExtensionKind,
        encoder: Box<dyn ExtensionEncoder>,
    ) -> Option<Box<dyn ExtensionEncoder>> {
        log::debug!("registered extension encoder '{}' for kind {}", encoder.name(), kind.0);
        self.encoders.insert(kind, encoder)
    }

    pub fn get(&self, kind: ExtensionKind) -> Option<&dyn ExtensionEncoder> {
        self.encoders.get(&kind).map(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.encoders.iter().map(|(kind, enc)| (kind.0, enc.name())))
            .finish()
    }
}
