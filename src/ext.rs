//! Buffer and string helper traits.
use bytes::{Buf, BufMut, Bytes};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// Length is `usize` in rust, while sometime postgres want `u32`,
    /// this will panic when overflow instead of wrapping.
    fn to_u32(self) -> u32;
    /// Length is `usize` in rust, while sometime postgres want `u16`,
    /// this will panic when overflow instead of wrapping.
    fn to_u16(self) -> u16;
}

/// Nul string operation.
pub trait StrExt {
    /// String length plus nul (1).
    fn nul_string_len(&self) -> u32;
}

/// Nul string operation in [`BufMut`].
pub trait BufMutExt {
    /// Write string and nul termination.
    fn put_nul_string(&mut self, string: &str);
}

/// Nul string operation in [`Bytes`].
pub trait BytesExt {
    /// Read a nul terminated string, consuming the terminator.
    fn get_nul_string(&mut self) -> Result<String, std::str::Utf8Error>;
    /// Read bytes up to a nul terminator, consuming the terminator.
    fn get_nul_bytes(&mut self) -> Bytes;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

impl StrExt for str {
    fn nul_string_len(&self) -> u32 {
        self.len().to_u32() + 1/* nul */
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

impl BytesExt for Bytes {
    fn get_nul_string(&mut self) -> Result<String, std::str::Utf8Error> {
        let raw = self.get_nul_bytes();
        Ok(std::str::from_utf8(&raw)?.to_owned())
    }

    fn get_nul_bytes(&mut self) -> Bytes {
        let end = self
            .iter()
            .position(|e| matches!(e, b'\0'))
            .unwrap_or(self.len());
        let raw = self.split_to(end);
        if self.has_remaining() {
            Buf::advance(self, 1); // nul
        }
        raw
    }
}
