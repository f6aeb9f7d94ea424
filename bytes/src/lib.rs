//! Disjoint mutable byte slices backed by a shared allocation, and a small
//! typed codec (`pack`/`unpack`/`size`/`cleanup`) used to move payloads across
//! the wire without assuming anything about how user types serialize.
//!
//! The `arc` module is a shared-allocation byte slice in the style of the
//! `bytes` crate, used so that a single inbound network read can be carved up
//! into per-message views without copying. The `codec` module is the typed
//! pack/unpack/size/cleanup abstraction that the coordination core requires
//! of user payloads (see the core's "Byte-stream codec" component).
#![forbid(unsafe_op_in_unsafe_fn)]

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// An `Arc`-backed mutable byte slice backed by a common allocation.
///
/// Calling `extract_to` repeatedly carves a single inbound read buffer into
/// the disjoint per-message slices that the decoder hands to `Codec::unpack`,
/// without any slice outliving the shared allocation.
pub mod arc {
    use std::ops::{Deref, DerefMut};
    use std::sync::Arc;

    /// A byte buffer backed by a shared allocation.
    pub struct Bytes {
        ptr: *mut u8,
        len: usize,
        // Kept alive for as long as any `Bytes` view into it exists.
        sequestered: Arc<Vec<u8>>,
    }

    // The pointer is derived from `sequestered`, which this type holds an
    // owning reference to; distinct `Bytes` own disjoint subranges.
    unsafe impl Send for Bytes {}

    impl Bytes {
        /// Wraps an owned buffer for shared, disjoint sub-slicing.
        pub fn from(mut bytes: Vec<u8>) -> Bytes {
            Bytes {
                ptr: bytes.as_mut_ptr(),
                len: bytes.len(),
                sequestered: Arc::new(bytes),
            }
        }

        /// Extracts `[0, index)` into a new `Bytes`, advancing `self` past it.
        pub fn extract_to(&mut self, index: usize) -> Bytes {
            assert!(index <= self.len);
            let result = Bytes {
                ptr: self.ptr,
                len: index,
                sequestered: self.sequestered.clone(),
            };
            self.ptr = unsafe { self.ptr.add(index) };
            self.len -= index;
            result
        }

        /// The number of bytes remaining in this view.
        pub fn len(&self) -> usize { self.len }
        /// Whether this view is empty.
        pub fn is_empty(&self) -> bool { self.len == 0 }

        /// Recovers the underlying storage, if this is the last live view.
        pub fn try_recover(self) -> Result<Vec<u8>, Bytes> {
            match Arc::try_unwrap(self.sequestered) {
                Ok(bytes) => Ok(bytes),
                Err(rc) => Err(Bytes { ptr: self.ptr, len: self.len, sequestered: rc }),
            }
        }
    }

    impl Deref for Bytes {
        type Target = [u8];
        fn deref(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    impl DerefMut for Bytes {
        fn deref_mut(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
        }
    }
}

/// Dual-mode conversion between a user payload and its wire representation.
///
/// `unpack` may allocate resources (e.g. if it decodes into owned buffers
/// that mirror what `pack` wrote on the sending side); `cleanup` exists so
/// that every allocation performed on the unpack path has a paired
/// deallocation that matches the allocation path, rather than relying on
/// `Drop` to guess which allocator produced the value.
pub trait Codec: Sized {
    /// Appends the wire representation of `self` to `out`.
    fn pack(&self, out: &mut Encoder);
    /// Decodes a value from the front of `bytes`, consuming what it reads.
    fn unpack(bytes: &mut Decoder) -> Self;
    /// The number of bytes `pack` will write for this value.
    fn size(&self) -> usize;
    /// Releases any resources this value holds that were allocated to mirror
    /// the path `unpack` took (default: ordinary `Drop` suffices).
    fn cleanup(self) {}
}

macro_rules! codec_primitive {
    ($t:ty, $write:ident, $read:ident, $size:expr) => {
        impl Codec for $t {
            fn pack(&self, out: &mut Encoder) { out.$write(*self); }
            fn unpack(bytes: &mut Decoder) -> Self { bytes.$read() }
            fn size(&self) -> usize { $size }
        }
    };
}

codec_primitive!(u8, write_u8, read_u8, 1);
codec_primitive!(u32, write_u32, read_u32, 4);
codec_primitive!(u64, write_u64, read_u64, 8);
codec_primitive!(i64, write_i64, read_i64, 8);
codec_primitive!(usize, write_usize, read_usize, 8);

impl Codec for Vec<u8> {
    fn pack(&self, out: &mut Encoder) {
        out.write_u32(self.len() as u32);
        out.write_bytes(self);
    }
    fn unpack(bytes: &mut Decoder) -> Self {
        let len = bytes.read_u32() as usize;
        bytes.read_bytes(len).to_vec()
    }
    fn size(&self) -> usize { 4 + self.len() }
}

impl Codec for String {
    fn pack(&self, out: &mut Encoder) {
        out.write_u32(self.len() as u32);
        out.write_bytes(self.as_bytes());
    }
    fn unpack(bytes: &mut Decoder) -> Self {
        let len = bytes.read_u32() as usize;
        String::from_utf8(bytes.read_bytes(len).to_vec()).expect("non-UTF-8 string on the wire")
    }
    fn size(&self) -> usize { 4 + self.len() }
}

impl<T: Codec> Codec for Vec<T> {
    fn pack(&self, out: &mut Encoder) {
        out.write_u32(self.len() as u32);
        for item in self { item.pack(out); }
    }
    fn unpack(bytes: &mut Decoder) -> Self {
        let len = bytes.read_u32() as usize;
        (0..len).map(|_| T::unpack(bytes)).collect()
    }
    fn size(&self) -> usize { 4 + self.iter().map(Codec::size).sum::<usize>() }
    fn cleanup(self) { for item in self { item.cleanup(); } }
}

impl<A: Codec, B: Codec> Codec for (A, B) {
    fn pack(&self, out: &mut Encoder) { self.0.pack(out); self.1.pack(out); }
    fn unpack(bytes: &mut Decoder) -> Self { (A::unpack(bytes), B::unpack(bytes)) }
    fn size(&self) -> usize { self.0.size() + self.1.size() }
    fn cleanup(self) { self.0.cleanup(); self.1.cleanup(); }
}

/// An append-only byte buffer with reservation tokens for deferred length
/// fields: pack the variable-length body first, then patch in the length
/// once it is known, the way a framed network message packs its header.
#[derive(Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

/// A token identifying a 4-byte length field reserved for later patching.
pub struct LengthToken(usize);

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self { Encoder { buffer: Vec::new() } }

    /// Reserves 4 bytes for a length field to be filled in later via
    /// [`Encoder::fill_length`], and returns a token identifying the spot.
    pub fn reserve_length(&mut self) -> LengthToken {
        let token = LengthToken(self.buffer.len());
        self.write_u32(0);
        token
    }

    /// Patches the length field reserved by `token` with the number of bytes
    /// written to the encoder since the reservation.
    pub fn fill_length(&mut self, token: LengthToken) {
        let LengthToken(pos) = token;
        let body_len = (self.buffer.len() - pos - 4) as u32;
        self.buffer[pos..pos + 4].copy_from_slice(&body_len.to_le_bytes());
    }

    /// Appends a codec-able value.
    pub fn write<T: Codec>(&mut self, value: &T) { value.pack(self); }

    /// Appends a raw byte slice, with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buffer.extend_from_slice(bytes); }

    pub fn write_u8(&mut self, v: u8) { self.buffer.write_u8(v).expect("Vec<u8> writes never fail"); }
    pub fn write_u32(&mut self, v: u32) { self.buffer.write_u32::<LittleEndian>(v).expect("Vec<u8> writes never fail"); }
    pub fn write_u64(&mut self, v: u64) { self.buffer.write_u64::<LittleEndian>(v).expect("Vec<u8> writes never fail"); }
    pub fn write_i64(&mut self, v: i64) { self.buffer.write_i64::<LittleEndian>(v).expect("Vec<u8> writes never fail"); }
    pub fn write_usize(&mut self, v: usize) { self.write_u64(v as u64); }

    /// The number of bytes written so far.
    pub fn len(&self) -> usize { self.buffer.len() }
    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    /// Consumes the encoder, returning the assembled buffer.
    pub fn into_vec(self) -> Vec<u8> { self.buffer }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

/// A read-only cursor over an encoded byte buffer, the dual of [`Encoder`].
pub struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Wraps a byte slice for sequential decoding.
    pub fn new(bytes: &'a [u8]) -> Self { Decoder { bytes } }

    /// Decodes a codec-able value from the front of the buffer.
    pub fn read<T: Codec>(&mut self) -> T { T::unpack(self) }

    /// Reads and consumes an exact number of raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> &'a [u8] {
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        head
    }

    pub fn read_u8(&mut self) -> u8 { self.read_bytes(1)[0] }
    pub fn read_u32(&mut self) -> u32 { (&mut self.read_bytes(4)).read_u32::<LittleEndian>().expect("short buffer") }
    pub fn read_u64(&mut self) -> u64 { (&mut self.read_bytes(8)).read_u64::<LittleEndian>().expect("short buffer") }
    pub fn read_i64(&mut self) -> i64 { (&mut self.read_bytes(8)).read_i64::<LittleEndian>().expect("short buffer") }
    pub fn read_usize(&mut self) -> usize { self.read_u64() as usize }

    /// The number of unread bytes remaining.
    pub fn remaining(&self) -> usize { self.bytes.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut enc = Encoder::new();
        enc.write(&7u8);
        enc.write(&42u32);
        enc.write(&(-9i64));
        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read::<u8>(), 7);
        assert_eq!(dec.read::<u32>(), 42);
        assert_eq!(dec.read::<i64>(), -9);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn round_trips_string() {
        let mut enc = Encoder::new();
        enc.write(&"hello cnc".to_string());
        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read::<String>(), "hello cnc");
    }

    #[test]
    fn round_trips_vec_of_pairs() {
        let data: Vec<(u32, u32)> = vec![(1, 2), (3, 4), (5, 6)];
        let mut enc = Encoder::new();
        enc.write(&data);
        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        let back: Vec<(u32, u32)> = dec.read();
        assert_eq!(back, data);
    }

    #[test]
    fn reservation_token_patches_length() {
        let mut enc = Encoder::new();
        let token = enc.reserve_length();
        enc.write(&1u32);
        enc.write(&2u32);
        enc.write(&3u32);
        enc.fill_length(token);
        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        let len = dec.read_u32();
        assert_eq!(len, 12);
        assert_eq!(dec.remaining(), 12);
    }

    #[test]
    fn arc_bytes_extract_to_splits_disjoint_views() {
        let buf = vec![1u8, 2, 3, 4, 5, 6];
        let mut whole = arc::Bytes::from(buf);
        let first = whole.extract_to(2);
        let second = whole.extract_to(2);
        assert_eq!(&first[..], &[1, 2]);
        assert_eq!(&second[..], &[3, 4]);
        assert_eq!(&whole[..], &[5, 6]);
    }
}
