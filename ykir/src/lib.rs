//! ykir -- the serialisable SSA IR used by the yk trace compiler.
//!
//! The AOT compiler serialises a whole-program `Module` into a section of the
//! binary using `Encoder`; at runtime each compilation thread decodes its own
//! copy back with `Decoder`.

mod builder;
pub mod types;

pub use builder::{FuncBuilder, ModuleBuilder};
pub use types::*;

use fallible_iterator::FallibleIterator;
use rmp_serde::{decode, encode, Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// The pack encoder.
///
/// Packs are written in streaming fashion so that a very large module need
/// not be materialised as one msgpack blob in memory.
pub struct Encoder<'a> {
    write_into: &'a mut dyn Write,
}

impl<'a> Encoder<'a> {
    /// Create an encoder which serialises into `write_into`.
    pub fn from(write_into: &'a mut dyn Write) -> Self {
        Self { write_into }
    }

    /// Serialise a pack.
    pub fn serialise(&mut self, pack: Pack) -> Result<(), encode::Error> {
        pack.serialize(&mut Serializer::new(&mut *self.write_into))
    }
}

/// The pack decoder.
///
/// Offers a fallible iterator interface over a stream of packs.
pub struct Decoder<'a> {
    read_from: &'a mut dyn Read,
}

impl<'a> Decoder<'a> {
    /// Create a decoder which decodes from `read_from`.
    pub fn from(read_from: &'a mut dyn Read) -> Self {
        Self { read_from }
    }
}

impl<'a> FallibleIterator for Decoder<'a> {
    type Item = Pack;
    type Error = decode::Error;

    fn next(&mut self) -> Result<Option<Pack>, Self::Error> {
        match Pack::deserialize(&mut Deserializer::new(&mut *self.read_from)) {
            Ok(pack) => Ok(Some(pack)),
            Err(e) => {
                if let decode::Error::InvalidMarkerRead(ref err) = e {
                    if err.kind() == std::io::ErrorKind::UnexpectedEof {
                        // End of the pack stream.
                        return Ok(None);
                    }
                }
                Err(e)
            }
        }
    }
}
