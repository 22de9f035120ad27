use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};

use anyhow::{anyhow, Result};
use log::debug;

use crate::{DeviceStats, LogDevice, SeekType};

/// Append-only log backed by a real file, created mode 0644 if missing.
pub struct FileLogDevice {
    file: Option<File>,
    pub stats: DeviceStats,
}

impl FileLogDevice {
    pub fn new() -> Self {
        Self {
            file: None,
            stats: DeviceStats::default(),
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| anyhow!("device not opened"))
    }
}

impl Default for FileLogDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDevice for FileLogDevice {
    fn ld_open(&mut self, path: &str) -> Result<()> {
        debug!("FileLogDevice open: {}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)?;
        self.file = Some(file);
        Ok(())
    }

    fn ld_close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn ld_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.stats.seek_cnt += 1;
        let file = self.file_mut()?;
        let pos = file.seek(match whence {
            SeekType::Set => SeekFrom::Start(offset as u64),
            SeekType::Cur => SeekFrom::Current(offset),
            SeekType::End => SeekFrom::End(offset),
        })?;
        Ok(pos)
    }

    fn ld_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stats.read_cnt += 1;
        let file = self.file_mut()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn ld_append(&mut self, buf: &[u8]) -> Result<u64> {
        self.stats.append_cnt += 1;
        let file = self.file_mut()?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(buf)?;
        Ok(offset)
    }

    fn ld_read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.stats.read_cnt += 1;
        let file = self.file_mut()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn ld_sync(&mut self) -> Result<()> {
        self.file_mut()?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        std::env::temp_dir()
            .join(format!("log_device-{}-{}", std::process::id(), nanos))
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn append_then_read_back() -> Result<()> {
        let path = temp_path();
        let mut dev = FileLogDevice::new();
        dev.ld_open(&path)?;
        let first = dev.ld_append(b"hello")?;
        let second = dev.ld_append(b"world")?;
        assert_eq!(first, 0);
        assert_eq!(second, 5);

        let mut buf = [0u8; 5];
        assert_eq!(dev.ld_read_at(&mut buf, 5)?, 5);
        assert_eq!(&buf, b"world");

        dev.ld_seek(0, SeekType::Set)?;
        let mut all = [0u8; 16];
        assert_eq!(dev.ld_read(&mut all)?, 10);
        assert_eq!(&all[..10], b"helloworld");

        dev.ld_close()?;
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn read_past_end_is_short() -> Result<()> {
        let path = temp_path();
        let mut dev = FileLogDevice::new();
        dev.ld_open(&path)?;
        dev.ld_append(b"abc")?;
        let mut buf = [0u8; 8];
        assert_eq!(dev.ld_read_at(&mut buf, 1)?, 2);
        assert_eq!(&buf[..2], b"bc");
        dev.ld_close()?;
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
