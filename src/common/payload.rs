use byte_struct::*;

/// Fixed-width value with a little-endian wire form.
///
/// Everything that crosses a connection as typed data (record payloads,
/// collective operands, bulk transfers) goes through this trait, so the
/// wire layout never depends on the in-memory layout of `Self`.
pub trait Payload: Copy + Send + Sync + 'static {
    const WIRE_LEN: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_payload_for_primitive {
    ($($ty:ty),*) => {
        $(
            impl Payload for $ty {
                const WIRE_LEN: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(&self, out: &mut [u8]) {
                    out[..Self::WIRE_LEN].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::WIRE_LEN]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_payload_for_primitive!(u32, u64, i64, f64);

impl<const N: usize> Payload for [u8; N] {
    const WIRE_LEN: usize = N;

    #[inline]
    fn encode(&self, out: &mut [u8]) {
        out[..N].copy_from_slice(self);
    }

    #[inline]
    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&bytes[..N]);
        raw
    }
}

/// Implements [`Payload`] for a `#[derive(ByteStruct)]` type.
#[macro_export]
macro_rules! impl_payload_for_byte_struct {
    ($ty:ty) => {
        impl $crate::common::payload::Payload for $ty {
            const WIRE_LEN: usize = <$ty as byte_struct::ByteStructLen>::BYTE_LEN;

            #[inline]
            fn encode(&self, out: &mut [u8]) {
                byte_struct::ByteStruct::write_bytes(self, &mut out[..Self::WIRE_LEN]);
            }

            #[inline]
            fn decode(bytes: &[u8]) -> Self {
                <$ty as byte_struct::ByteStruct>::read_bytes(&bytes[..Self::WIRE_LEN])
            }
        }
    };
}

/// Join-side tuple carried next to its key: the tuple id on the build side
/// and the time it was produced.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[byte_struct_le]
pub struct TuplePayload {
    pub tuple_id: u64,
    pub timestamp: u64,
}

impl_payload_for_byte_struct!(TuplePayload);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_payload_is_packed_little_endian() {
        assert_eq!(TuplePayload::WIRE_LEN, 16);
        let mut out = [0u8; 16];
        TuplePayload {
            tuple_id: 1,
            timestamp: 0x0203,
        }
        .encode(&mut out);
        assert_eq!(out[0], 1);
        assert_eq!(&out[8..10], &[3, 2]);
        assert_eq!(
            TuplePayload::decode(&out),
            TuplePayload {
                tuple_id: 1,
                timestamp: 0x0203
            }
        );
    }

    #[test]
    fn byte_arrays_copy_verbatim() {
        let mut out = [0u8; 4];
        b"abcd".encode(&mut out);
        assert_eq!(&out, b"abcd");
    }
}
