//! Element serializers.
//!
//! A [`Serializer`] turns values of one type into bytes and back.  The
//! persistent list sizes an entry block with [`Serializer::size`], streams
//! the value into the block with [`Serializer::serialize`], and reads it
//! back through a cursor bounded by the stored size.  Null elements are
//! handled by the list itself and never reach a serializer.
//!
//! All multi-byte encodings are big-endian, independent of the host.
//!
//! [`Persistable`] is the registry: it maps an element type to its built-in
//! codec, so `PersistentLinkedList::<i64, _>::create(...)` needs no explicit
//! serializer argument.  Types without a built-in implement [`Serializer`]
//! themselves.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Byte-level codec for values of type `T`.
pub trait Serializer<T> {
    /// Whether every value of `T` encodes to the same number of bytes.
    fn is_fixed_size(&self) -> bool;

    /// Encoded size of `value`, in bytes.
    fn size(&self, value: &T) -> u64;

    /// Writes the encoding of `value` to `out`.
    fn serialize(&self, value: &T, out: &mut dyn Write) -> io::Result<()>;

    /// Reads one value back from `input`.
    ///
    /// `input` is bounded to exactly the bytes [`serialize`][Self::serialize]
    /// produced; variable-size codecs may read to its end.
    fn deserialize(&self, input: &mut dyn Read) -> io::Result<T>;
}

/// Types with a built-in serializer.
///
/// The associated type plays the role of a serializer registry: selection
/// happens by element type, at compile time.
pub trait Persistable: Sized {
    type Serializer: Serializer<Self> + Default;

    /// The built-in serializer for this type.
    fn serializer() -> Self::Serializer {
        Self::Serializer::default()
    }
}

macro_rules! fixed_width_serializer {
    ($name:ident, $ty:ty, $width:expr, $write:ident, $read:ident) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        impl Serializer<$ty> for $name {
            fn is_fixed_size(&self) -> bool {
                true
            }

            fn size(&self, _value: &$ty) -> u64 {
                $width
            }

            fn serialize(&self, value: &$ty, out: &mut dyn Write) -> io::Result<()> {
                out.$write::<BigEndian>(*value)
            }

            fn deserialize(&self, input: &mut dyn Read) -> io::Result<$ty> {
                input.$read::<BigEndian>()
            }
        }

        impl Persistable for $ty {
            type Serializer = $name;
        }
    };
}

fixed_width_serializer!(I16Serializer, i16, 2, write_i16, read_i16);
fixed_width_serializer!(U16Serializer, u16, 2, write_u16, read_u16);
fixed_width_serializer!(I32Serializer, i32, 4, write_i32, read_i32);
fixed_width_serializer!(I64Serializer, i64, 8, write_i64, read_i64);
fixed_width_serializer!(F32Serializer, f32, 4, write_f32, read_f32);
fixed_width_serializer!(F64Serializer, f64, 8, write_f64, read_f64);

/// One byte, `0` or `1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoolSerializer;

impl Serializer<bool> for BoolSerializer {
    fn is_fixed_size(&self) -> bool {
        true
    }

    fn size(&self, _value: &bool) -> u64 {
        1
    }

    fn serialize(&self, value: &bool, out: &mut dyn Write) -> io::Result<()> {
        out.write_u8(u8::from(*value))
    }

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<bool> {
        Ok(input.read_u8()? != 0)
    }
}

impl Persistable for bool {
    type Serializer = BoolSerializer;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ByteSerializer;

impl Serializer<u8> for ByteSerializer {
    fn is_fixed_size(&self) -> bool {
        true
    }

    fn size(&self, _value: &u8) -> u64 {
        1
    }

    fn serialize(&self, value: &u8, out: &mut dyn Write) -> io::Result<()> {
        out.write_u8(*value)
    }

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<u8> {
        input.read_u8()
    }
}

impl Persistable for u8 {
    type Serializer = ByteSerializer;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct I8Serializer;

impl Serializer<i8> for I8Serializer {
    fn is_fixed_size(&self) -> bool {
        true
    }

    fn size(&self, _value: &i8) -> u64 {
        1
    }

    fn serialize(&self, value: &i8, out: &mut dyn Write) -> io::Result<()> {
        out.write_i8(*value)
    }

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<i8> {
        input.read_i8()
    }
}

impl Persistable for i8 {
    type Serializer = I8Serializer;
}

/// Raw bytes; the surrounding container records the length.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteArraySerializer;

impl Serializer<Vec<u8>> for ByteArraySerializer {
    fn is_fixed_size(&self) -> bool {
        false
    }

    fn size(&self, value: &Vec<u8>) -> u64 {
        value.len() as u64
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(value)
    }

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Persistable for Vec<u8> {
    type Serializer = ByteArraySerializer;
}

/// UTF-8 bytes; the surrounding container records the length.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn is_fixed_size(&self) -> bool {
        false
    }

    fn size(&self, value: &String) -> u64 {
        value.len() as u64
    }

    fn serialize(&self, value: &String, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(value.as_bytes())
    }

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<String> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Persistable for String {
    type Serializer = StringSerializer;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T, S>(serializer: &S, value: T) -> T
    where
        S: Serializer<T>,
    {
        let mut encoded = Vec::new();
        serializer
            .serialize(&value, &mut encoded)
            .expect("serialize should not fail");
        assert_eq!(encoded.len() as u64, serializer.size(&value));
        serializer
            .deserialize(&mut encoded.as_slice())
            .expect("deserialize should not fail")
    }

    #[test]
    fn integers_are_big_endian() {
        let mut encoded = Vec::new();
        I32Serializer
            .serialize(&0x0102_0304, &mut encoded)
            .expect("serialize should not fail");
        assert_eq!(encoded, [1, 2, 3, 4]);

        encoded.clear();
        I64Serializer
            .serialize(&-2, &mut encoded)
            .expect("serialize should not fail");
        assert_eq!(encoded, [0xFF; 8]);
    }

    #[test]
    fn primitive_round_trips() {
        assert_eq!(round_trip(&BoolSerializer, true), true);
        assert_eq!(round_trip(&ByteSerializer, 0xA5), 0xA5);
        assert_eq!(round_trip(&I8Serializer, -100), -100);
        assert_eq!(round_trip(&I16Serializer, -12345), -12345);
        assert_eq!(round_trip(&U16Serializer, 54321), 54321);
        assert_eq!(round_trip(&I32Serializer, i32::MIN), i32::MIN);
        assert_eq!(round_trip(&I64Serializer, i64::MAX), i64::MAX);
        assert_eq!(round_trip(&F64Serializer, 2.5_f64), 2.5);
        assert!(round_trip(&F32Serializer, f32::NAN).is_nan());
    }

    #[test]
    fn variable_size_reads_to_bound() {
        let value = String::from("hello, 世界");
        assert_eq!(round_trip(&StringSerializer, value.clone()), value);

        let bytes = vec![0u8, 1, 2, 255];
        assert_eq!(round_trip(&ByteArraySerializer, bytes.clone()), bytes);
    }

    #[test]
    fn registry_selects_by_type() {
        let serializer = <i64 as Persistable>::serializer();
        assert!(serializer.is_fixed_size());
        assert_eq!(serializer.size(&0), 8);
    }
}
