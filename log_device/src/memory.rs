use anyhow::Result;

use crate::{DeviceStats, LogDevice, SeekType};

/// Volatile log kept in a Vec, for unit tests.
pub struct MemLogDevice {
    pub mem: Vec<u8>,
    pub stats: DeviceStats,
    cursor: usize,
}

impl MemLogDevice {
    pub fn new() -> Self {
        Self {
            mem: vec![],
            stats: DeviceStats::default(),
            cursor: 0,
        }
    }
}

impl Default for MemLogDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDevice for MemLogDevice {
    fn ld_open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn ld_close(&mut self) -> Result<()> {
        Ok(())
    }

    fn ld_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.stats.seek_cnt += 1;
        let base = match whence {
            SeekType::Set => 0,
            SeekType::Cur => self.cursor as i64,
            SeekType::End => self.mem.len() as i64,
        };
        self.cursor = (base + offset).max(0) as usize;
        Ok(self.cursor as u64)
    }

    fn ld_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stats.read_cnt += 1;
        let available = self.mem.len().saturating_sub(self.cursor);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.mem[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn ld_append(&mut self, buf: &[u8]) -> Result<u64> {
        self.stats.append_cnt += 1;
        let offset = self.mem.len() as u64;
        self.mem.extend_from_slice(buf);
        Ok(offset)
    }

    fn ld_read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.stats.read_cnt += 1;
        let offset = offset as usize;
        let available = self.mem.len().saturating_sub(offset);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.mem[offset..offset + n]);
        Ok(n)
    }

    fn ld_sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn device_tester(dev: &mut dyn LogDevice) -> Result<()> {
        dev.ld_open("test")?;
        assert_eq!(dev.ld_append(b"0123")?, 0);
        assert_eq!(dev.ld_append(b"4567")?, 4);
        let mut buf = [0u8; 4];
        assert_eq!(dev.ld_read_at(&mut buf, 2)?, 4);
        assert_eq!(&buf, b"2345");
        assert_eq!(dev.ld_seek(0, SeekType::End)?, 8);
        dev.ld_sync()?;
        dev.ld_close()?;
        Ok(())
    }

    #[test]
    fn simple_test() -> Result<()> {
        let mut dev = MemLogDevice::new();
        device_tester(&mut dev)
    }

    #[test]
    fn short_reads_at_end() -> Result<()> {
        let mut dev = MemLogDevice::new();
        dev.ld_append(b"abc")?;
        let mut buf = [0u8; 8];
        assert_eq!(dev.ld_read_at(&mut buf, 1)?, 2);
        assert_eq!(dev.ld_read_at(&mut buf, 16)?, 0);
        Ok(())
    }
}
