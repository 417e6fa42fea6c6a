//! Checked reader and writer extensions for message payloads.
use bytes::{Buf, BufMut, Bytes};

use super::{ProtocolError, TypeId};

pub trait UsizeExt {
    /// length is usize in rust, while the protocol wants u32,
    /// this will panic when overflow instead of wrapping
    fn to_u32(self) -> u32;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        match u32::try_from(self) {
            Ok(ok) => ok,
            Err(err) => panic!("message size too large for protocol: {err}"),
        }
    }
}

macro_rules! try_get {
    ($($name:ident -> $ty:ty = $get:ident, $width:expr;)*) => {$(
        fn $name(&mut self) -> Result<$ty, ProtocolError>;
    )*};
}

macro_rules! try_get_impl {
    ($($name:ident -> $ty:ty = $get:ident, $width:expr;)*) => {$(
        fn $name(&mut self) -> Result<$ty, ProtocolError> {
            if self.remaining() < $width {
                return Err(ProtocolError::Incomplete);
            }
            Ok(self.$get())
        }
    )*};
}

/// Bounds-checked big-endian reads; payloads are untrusted so nothing here
/// panics.
pub trait BytesExt {
    try_get! {
        try_get_u8 -> u8 = get_u8, 1;
        try_get_i16 -> i16 = get_i16, 2;
        try_get_u16 -> u16 = get_u16, 2;
        try_get_i32 -> i32 = get_i32, 4;
        try_get_u32 -> u32 = get_u32, 4;
        try_get_i64 -> i64 = get_i64, 8;
        try_get_u64 -> u64 = get_u64, 8;
    }

    fn try_get_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError>;

    /// `u32 length, bytes`.
    fn get_lp_bytes(&mut self) -> Result<Bytes, ProtocolError>;

    /// `u32 length, utf-8 bytes`.
    fn get_lp_str(&mut self) -> Result<String, ProtocolError>;

    /// 16 raw bytes.
    fn get_type_id(&mut self) -> Result<TypeId, ProtocolError>;
}

impl BytesExt for Bytes {
    try_get_impl! {
        try_get_u8 -> u8 = get_u8, 1;
        try_get_i16 -> i16 = get_i16, 2;
        try_get_u16 -> u16 = get_u16, 2;
        try_get_i32 -> i32 = get_i32, 4;
        try_get_u32 -> u32 = get_u32, 4;
        try_get_i64 -> i64 = get_i64, 8;
        try_get_u64 -> u64 = get_u64, 8;
    }

    fn try_get_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.split_to(n))
    }

    fn get_lp_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = BytesExt::try_get_u32(self)? as usize;
        self.try_get_bytes(len)
    }

    fn get_lp_str(&mut self) -> Result<String, ProtocolError> {
        let raw = self.get_lp_bytes()?;
        String::from_utf8(raw.into()).map_err(ProtocolError::non_utf8)
    }

    fn get_type_id(&mut self) -> Result<TypeId, ProtocolError> {
        let raw = self.try_get_bytes(16)?;
        let mut id = [0; 16];
        id.copy_from_slice(&raw);
        Ok(TypeId(id))
    }
}

pub trait BufMutExt {
    /// `u32 length, bytes`.
    fn put_lp_bytes(&mut self, bytes: &[u8]);

    /// `u32 length, utf-8 bytes`.
    fn put_lp_str(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_lp_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len().to_u32());
        self.put_slice(bytes);
    }

    fn put_lp_str(&mut self, string: &str) {
        self.put_lp_bytes(string.as_bytes());
    }
}
