use bytes::Buf;


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow::anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


/// Getters that fail gracefully on short input instead of panicking like the
///  [bytes::Buf] getters do. All multi-byte numbers are network byte order (BE).
pub trait BufExt: Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u16, u16, get_u16);
    get_checked_impl!(checked_get_u32, u32, get_u32);

    fn checked_split_to(&mut self, len: usize) -> anyhow::Result<bytes::Bytes> {
        if self.remaining() < len {
            return Err(anyhow::anyhow!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }
}

impl <T: Buf> BufExt for T {
}
