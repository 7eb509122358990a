use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use crate::buffer::ByteBuffer;
use crate::error::CodecError;

/// Cursor-based serializer over a [`ByteBuffer`].
///
/// Sender and receiver must agree on the declared types; nothing on the
/// wire tags them.
pub struct Serializer {
    buf: ByteBuffer,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer {
    pub fn new() -> Self {
        Self { buf: ByteBuffer::new() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { buf: ByteBuffer::from_bytes(bytes) }
    }

    pub fn from_buffer(buf: ByteBuffer) -> Self {
        Self { buf }
    }

    /// Rewind the cursor, switching from writing to reading.
    pub fn reset(&mut self) {
        self.buf
            .set_position(0)
            .expect("position 0 is always in range");
    }

    /// Readable bytes from the cursor onwards.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Finish writing: rewind and take the whole image.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.reset();
        self.buf.to_vec()
    }

    pub fn readable_size(&self) -> u64 {
        self.buf.readable_size()
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut ByteBuffer {
        &mut self.buf
    }

    pub fn write<T: Encode + ?Sized>(&mut self, v: &T) {
        v.encode(self);
    }

    pub fn read<T: Decode>(&mut self) -> Result<T, CodecError> {
        T::decode(self)
    }
}

pub trait Encode {
    fn encode(&self, s: &mut Serializer);
}

pub trait Decode: Sized {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError>;
}

macro_rules! scalar_impl {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encode for $ty {
            fn encode(&self, s: &mut Serializer) {
                s.buf.$write(*self);
            }
        }

        impl Decode for $ty {
            fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
                s.buf.$read()
            }
        }
    };
}

scalar_impl!(i8, write_i8, read_i8);
scalar_impl!(u8, write_u8, read_u8);
scalar_impl!(i16, write_i16, read_i16);
scalar_impl!(u16, write_u16, read_u16);
scalar_impl!(i32, write_varint32, read_varint32);
scalar_impl!(u32, write_uvarint32, read_uvarint32);
scalar_impl!(i64, write_varint64, read_varint64);
scalar_impl!(u64, write_uvarint64, read_uvarint64);
scalar_impl!(f32, write_f32, read_f32);
scalar_impl!(f64, write_f64, read_f64);

impl Encode for bool {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_i8(i8::from(*self));
    }
}

impl Decode for bool {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        Ok(s.buf.read_i8()? != 0)
    }
}

/// The void substitute: a single dummy byte, both as a return value and
/// as an empty argument pack.
impl Encode for () {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_u8(0);
    }
}

impl Decode for () {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        s.buf.read_u8()?;
        Ok(())
    }
}

impl Encode for str {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_str_var(self);
    }
}

impl Encode for String {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_str_var(self);
    }
}

impl Decode for String {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        s.buf.read_str_var()
    }
}

impl<T: Encode> Encode for &T {
    fn encode(&self, s: &mut Serializer) {
        (*self).encode(s);
    }
}

fn decode_len(s: &mut Serializer) -> Result<usize, CodecError> {
    let len = s.buf.read_uvarint64()?;
    // A corrupt length cannot exceed what is actually readable.
    if len > s.buf.readable_size() {
        return Err(CodecError::ShortBuffer { wanted: len, readable: s.buf.readable_size() });
    }
    Ok(len as usize)
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_uvarint64(self.len() as u64);
        for v in self {
            v.encode(s);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        let len = decode_len(s)?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(s)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for HashSet<T> {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_uvarint64(self.len() as u64);
        for v in self {
            v.encode(s);
        }
    }
}

impl<T: Decode + Eq + Hash> Decode for HashSet<T> {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        let len = decode_len(s)?;
        let mut out = HashSet::with_capacity(len);
        for _ in 0..len {
            out.insert(T::decode(s)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_uvarint64(self.len() as u64);
        for v in self {
            v.encode(s);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        let len = decode_len(s)?;
        let mut out = BTreeSet::new();
        for _ in 0..len {
            out.insert(T::decode(s)?);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for HashMap<K, V> {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_uvarint64(self.len() as u64);
        for (k, v) in self {
            k.encode(s);
            v.encode(s);
        }
    }
}

impl<K: Decode + Eq + Hash, V: Decode> Decode for HashMap<K, V> {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        let len = decode_len(s)?;
        let mut out = HashMap::with_capacity(len);
        for _ in 0..len {
            let k = K::decode(s)?;
            let v = V::decode(s)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, s: &mut Serializer) {
        s.buf.write_uvarint64(self.len() as u64);
        for (k, v) in self {
            k.encode(s);
            v.encode(s);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
        let len = decode_len(s)?;
        let mut out = BTreeMap::new();
        for _ in 0..len {
            let k = K::decode(s)?;
            let v = V::decode(s)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

/// Heterogeneous tuples: elements in positional order, no prefix.
macro_rules! tuple_impl {
    ($($T:ident),+) => {
        impl<$($T: Encode),+> Encode for ($($T,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, s: &mut Serializer) {
                let ($(ref $T,)+) = *self;
                $($T.encode(s);)+
            }
        }

        impl<$($T: Decode),+> Decode for ($($T,)+) {
            fn decode(s: &mut Serializer) -> Result<Self, CodecError> {
                Ok(($($T::decode(s)?,)+))
            }
        }
    };
}

tuple_impl!(A);
tuple_impl!(A, B);
tuple_impl!(A, B, C);
tuple_impl!(A, B, C, D);
tuple_impl!(A, B, C, D, E);
tuple_impl!(A, B, C, D, E, F);
tuple_impl!(A, B, C, D, E, F, G);
tuple_impl!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(v: T) {
        let mut s = Serializer::new();
        s.write(&v);
        s.reset();
        assert_eq!(s.read::<T>().unwrap(), v);
    }

    #[test]
    fn scalars() {
        roundtrip(true);
        roundtrip(-3i8);
        roundtrip(250u8);
        roundtrip(-30_000i16);
        roundtrip(60_000u16);
        roundtrip(-123_456i32);
        roundtrip(4_000_000_000u32);
        roundtrip(i64::MIN);
        roundtrip(u64::MAX);
        roundtrip(3.5f32);
        roundtrip(-0.125f64);
    }

    #[test]
    fn strings_and_sequences() {
        roundtrip(String::from("hello rpc"));
        roundtrip(vec![1i32, -2, 3]);
        roundtrip(vec![String::from("a"), String::from("bb")]);
    }

    #[test]
    fn sets_and_maps() {
        roundtrip(HashSet::from([1u32, 2, 3]));
        roundtrip(BTreeSet::from([String::from("x"), String::from("y")]));
        roundtrip(HashMap::from([(String::from("k"), 7i64)]));
        roundtrip(BTreeMap::from([(1u32, String::from("one")), (2, String::from("two"))]));
    }

    #[test]
    fn tuples() {
        roundtrip((42i32,));
        roundtrip((1u8, String::from("two"), 3.0f64));
        roundtrip((true, (String::from("nested"), vec![9u64])));
    }

    #[test]
    fn unit_is_one_byte() {
        let mut s = Serializer::new();
        s.write(&());
        assert_eq!(s.to_vec().len(), 1);
        s.reset();
        s.read::<()>().unwrap();
    }

    #[test]
    fn mixed_stream_in_order() {
        let mut s = Serializer::new();
        s.write("add");
        s.write(&(2i32, 3i32));
        s.reset();
        assert_eq!(s.read::<String>().unwrap(), "add");
        assert_eq!(s.read::<(i32, i32)>().unwrap(), (2, 3));
    }

    #[test]
    fn wrong_type_decode_fails() {
        let mut s = Serializer::new();
        s.write(&123_456_789i64);
        s.reset();
        // A huge varint length prefix cannot be satisfied by the stream.
        assert!(s.read::<String>().is_err());
    }

    #[test]
    fn corrupt_length_prefix_fails() {
        let mut s = Serializer::new();
        s.buffer_mut().write_uvarint64(u64::MAX);
        s.reset();
        assert!(s.read::<Vec<u8>>().is_err());
    }
}
