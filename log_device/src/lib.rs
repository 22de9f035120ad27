use anyhow::Result;

#[derive(Default, Debug)]
pub struct DeviceStats {
    pub read_cnt: u32,
    pub append_cnt: u32,
    pub seek_cnt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

/// LogDevice abstract interface.
///
/// An append-only byte device: bytes are only ever added at the end via
/// `ld_append`, and read back either sequentially from the cursor or
/// positionally via `ld_read_at`.
pub trait LogDevice {
    fn ld_open(&mut self, path: &str) -> Result<()>;
    fn ld_close(&mut self) -> Result<()>;
    /// Move the sequential read cursor. Returns the new absolute position.
    fn ld_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64>;
    /// Read at the cursor until `buf` is full or the device ends.
    /// Returns the number of bytes actually read.
    fn ld_read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Append `buf` at the end of the device. Returns the offset the
    /// first byte landed at.
    fn ld_append(&mut self, buf: &[u8]) -> Result<u64>;
    /// Positional read, cursor untouched. Returns bytes actually read.
    fn ld_read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn ld_sync(&mut self) -> Result<()>;
}

pub mod file;
pub mod memory;
