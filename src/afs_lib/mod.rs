//! Append-only filesystem logics.
//!
//! Two flat files back every store: `data` takes raw content bytes and
//! `meta` takes framed operation records. Neither is ever rewritten in
//! place. The whole directory tree lives in memory and is rebuilt on
//! open by replaying `meta`; each mutating operation updates memory and
//! then appends the one record that describes it.

use std::fmt;
use std::os::raw::c_int;

pub use log_device;

use log::{debug, info, warn};
use log_device::{LogDevice, SeekType};
use nix::sys::statvfs::{statvfs, Statvfs};
use zerocopy::{AsBytes, FromBytes};

pub mod desc;
pub mod file;
pub mod fuse;
pub mod mem;
pub mod utils;
pub mod xattr;

use desc::*;
use file::*;
use mem::*;
use utils::{crc32, now_secs};

pub const DATA_FILENAME: &str = "data";
pub const META_FILENAME: &str = "meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfsError {
    InvalidArgument,
    NotFound,
    Exists,
    IsDirectory,
    NotDirectory,
    NotEmpty,
    NoData,
    OutOfRange,
    NoExtent,
    Io,
}

impl AfsError {
    pub fn errno(self) -> c_int {
        match self {
            AfsError::InvalidArgument => libc::EINVAL,
            AfsError::NotFound => libc::ENOENT,
            AfsError::Exists => libc::EEXIST,
            AfsError::IsDirectory => libc::EISDIR,
            AfsError::NotDirectory => libc::ENOTDIR,
            AfsError::NotEmpty => libc::ENOTEMPTY,
            AfsError::NoData => libc::ENODATA,
            AfsError::OutOfRange => libc::ERANGE,
            AfsError::NoExtent => libc::ENXIO,
            AfsError::Io => libc::EIO,
        }
    }
}

impl fmt::Display for AfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AfsError::InvalidArgument => "invalid argument",
            AfsError::NotFound => "no such file or directory",
            AfsError::Exists => "file exists",
            AfsError::IsDirectory => "is a directory",
            AfsError::NotDirectory => "not a directory",
            AfsError::NotEmpty => "directory not empty",
            AfsError::NoData => "no such attribute",
            AfsError::OutOfRange => "buffer too small",
            AfsError::NoExtent => "no data past offset",
            AfsError::Io => "input/output error",
        };
        write!(f, "{}", name)
    }
}

impl std::error::Error for AfsError {}

impl From<anyhow::Error> for AfsError {
    fn from(err: anyhow::Error) -> Self {
        warn!("log device error: {:#}", err);
        AfsError::Io
    }
}

impl From<std::io::Error> for AfsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AfsError::NotFound,
            _ => {
                warn!("host io error: {}", err);
                AfsError::Io
            }
        }
    }
}

pub type AfsResult<T> = Result<T, AfsError>;

#[derive(Debug, Clone, Copy)]
pub struct AfsOptions {
    pub write_buffer_size: usize,
}

impl Default for AfsOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        }
    }
}

/// One slot of a `utimens`-style times pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    Now,
    Omit,
    Set(i64),
}

pub struct AppendFs<T: LogDevice> {
    pub data_dev: T,
    pub meta_dev: T,
    pub root_path: String,
    pub table: InodeTable,
    pub write_buffer_size: usize,
}

impl<T: LogDevice> AppendFs<T> {
    pub fn new(data_dev: T, meta_dev: T) -> Self {
        Self {
            data_dev,
            meta_dev,
            root_path: String::new(),
            table: InodeTable::new(),
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        }
    }

    /// Open a store root (created recursively if missing), open the two
    /// backing logs and rebuild the tree from `meta`.
    pub fn open(&mut self, root_path: &str) -> AfsResult<()> {
        std::fs::create_dir_all(root_path)?;
        let root = std::fs::canonicalize(root_path)?;
        let root = root.to_str().ok_or(AfsError::InvalidArgument)?.to_string();
        self.data_dev.ld_open(&format!("{}/{}", root, DATA_FILENAME))?;
        self.meta_dev.ld_open(&format!("{}/{}", root, META_FILENAME))?;
        self.root_path = root;
        self.replay()?;
        info!(
            "store {} open: {} inodes, next id {}",
            self.root_path,
            self.table.len(),
            self.table.next_id
        );
        Ok(())
    }

    pub fn close(&mut self) -> AfsResult<()> {
        self.data_dev.ld_close()?;
        self.meta_dev.ld_close()?;
        Ok(())
    }

    pub fn set_options(&mut self, opts: &AfsOptions) -> AfsResult<()> {
        if opts.write_buffer_size < MIN_WRITE_BUFFER {
            return Err(AfsError::InvalidArgument);
        }
        self.write_buffer_size = opts.write_buffer_size;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata log
    // ------------------------------------------------------------------

    fn append_record(&mut self, record: &Record) -> AfsResult<()> {
        let payload = record.payload();
        let header = RecordHeader::new(record.kind(), &payload);
        self.meta_dev.ld_append(header.as_bytes())?;
        self.meta_dev.ld_append(&payload)?;
        Ok(())
    }

    /// Rebuild the inode table from the metadata log. A record whose
    /// checksum does not match its payload is skipped and replay goes
    /// on; so is a record of unknown type or one too short for its
    /// fields. Only a torn tail (short header or payload read) ends
    /// replay; the torn bytes stay in place and appends continue at
    /// end-of-file.
    fn replay(&mut self) -> AfsResult<()> {
        self.meta_dev.ld_seek(0, SeekType::Set)?;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        loop {
            let got = self.meta_dev.ld_read(&mut header_buf)?;
            if got < RECORD_HEADER_SIZE {
                break;
            }
            let header = match RecordHeader::read_from(&header_buf[..]) {
                Some(h) => h,
                None => break,
            };
            let length = header.length.get() as usize;
            let mut payload = vec![0u8; length];
            if self.meta_dev.ld_read(&mut payload)? < length {
                break;
            }
            if crc32(&payload) != header.checksum.get() {
                debug!("replay: checksum mismatch, record skipped");
                continue;
            }
            let kind = match RecordKind::try_from(header.kind) {
                Ok(kind) => kind,
                Err(_) => {
                    debug!("replay: unknown record type {}, skipped", header.kind);
                    continue;
                }
            };
            match Record::decode(kind, &payload) {
                Some(record) => self.apply(record),
                None => debug!("replay: short payload for {:?}, skipped", kind),
            }
        }
        self.meta_dev.ld_seek(0, SeekType::End)?;
        Ok(())
    }

    fn apply(&mut self, record: Record) {
        match record {
            Record::Create(node) | Record::Mkdir(node) => {
                let index = match self.table.find_by_id(node.inode_id) {
                    Some(index) => {
                        self.table.row_mut(index).clear_content();
                        if self.table.next_id <= node.inode_id {
                            self.table.next_id = node.inode_id + 1;
                        }
                        index
                    }
                    None => self.table.alloc_replayed(node.inode_id),
                };
                let inode = self.table.row_mut(index);
                inode.path = node.path;
                inode.mode = node.mode;
                inode.size = node.size;
                inode.ctime = node.ts as i64;
                inode.mtime = node.ts as i64;
                inode.atime = node.ts as i64;
                inode.deleted = false;
                inode.symlink_target = node.symlink_target;
            }
            Record::Extent {
                inode_id,
                logical,
                data_offset,
                length,
                new_size,
            } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    let inode = self.table.row_mut(index);
                    inode.extents.push(Extent {
                        logical,
                        data_offset,
                        length,
                    });
                    if new_size > inode.size {
                        inode.size = new_size;
                    }
                }
            }
            Record::Truncate { inode_id, new_size } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    let inode = self.table.row_mut(index);
                    inode.size = new_size;
                    inode.trim_extents(new_size);
                }
            }
            Record::Unlink { inode_id } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    self.table.row_mut(index).deleted = true;
                }
            }
            Record::Rename { inode_id, path } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    let inode = self.table.row_mut(index);
                    inode.path = path;
                    inode.deleted = false;
                }
            }
            Record::SetXattr {
                inode_id,
                name,
                value,
            } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    // Replay applies unconditionally, no flag checks.
                    let _ = xattr::set_xattr(self.table.row_mut(index), &name, &value, 0);
                }
            }
            Record::RemoveXattr { inode_id, name } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    let _ = xattr::remove_xattr(self.table.row_mut(index), &name);
                }
            }
            Record::Times {
                inode_id,
                atime,
                mtime,
            } => {
                if let Some(index) = self.table.find_by_id(inode_id) {
                    let inode = self.table.row_mut(index);
                    inode.atime = atime;
                    inode.mtime = mtime;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Node creation
    // ------------------------------------------------------------------

    fn require_parent_dir(&self, path: &str) -> AfsResult<()> {
        let (parent, _) = split_parent(path).ok_or(AfsError::InvalidArgument)?;
        if parent != "/" {
            match self.table.find_by_path(&parent) {
                Some(index) if self.table.row(index).is_dir() => {}
                _ => return Err(AfsError::NotFound),
            }
        }
        Ok(())
    }

    /// Shared create path for files, directories and symlinks: validate,
    /// resurrect a tombstone at the same path or allocate a row, then
    /// append the CREATE/MKDIR record.
    fn make_node(
        &mut self,
        path: &str,
        mode: u32,
        symlink_target: Option<&str>,
    ) -> AfsResult<usize> {
        let norm = normalize_path(path);
        if norm == "/" {
            return Err(AfsError::InvalidArgument);
        }
        if self.table.find_by_path(&norm).is_some() {
            return Err(AfsError::Exists);
        }
        self.require_parent_dir(&norm)?;
        let now = now_secs();
        let tombstone = self
            .table
            .iter()
            .position(|inode| inode.deleted && inode.path == norm);
        let (index, fresh) = match tombstone {
            Some(index) => {
                let inode = self.table.row_mut(index);
                inode.clear_content();
                inode.deleted = false;
                (index, false)
            }
            None => (self.table.alloc(norm.clone(), mode, now), true),
        };
        let record = {
            let inode = self.table.row_mut(index);
            inode.path = norm;
            inode.mode = mode;
            inode.ctime = now;
            inode.mtime = now;
            inode.atime = now;
            if let Some(target) = symlink_target {
                inode.symlink_target = Some(target.to_string());
                inode.size = target.len() as u64;
            }
            let node = NodeRecord {
                inode_id: inode.id,
                mode: inode.mode,
                size: inode.size,
                ts: inode.mtime as u64,
                path: inode.path.clone(),
                symlink_target: inode.symlink_target.clone(),
            };
            if inode.is_dir() {
                Record::Mkdir(node)
            } else {
                Record::Create(node)
            }
        };
        if let Err(err) = self.append_record(&record) {
            if fresh {
                self.table.drop_last();
            } else {
                self.table.row_mut(index).symlink_target = None;
            }
            return Err(err);
        }
        Ok(index)
    }

    pub fn create_file(&mut self, path: &str, mode: u32) -> AfsResult<()> {
        self.make_node(path, libc::S_IFREG | (mode & 0o7777), None)
            .map(|_| ())
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> AfsResult<()> {
        self.make_node(path, libc::S_IFDIR | (mode & 0o777), None)
            .map(|_| ())
    }

    /// Idempotent single-directory create: success when the path is
    /// already there, no parent requirement, ancestors are not created.
    pub fn mkdirs(&mut self, path: &str, mode: u32) -> AfsResult<()> {
        let norm = normalize_path(path);
        if norm == "/" || self.table.find_by_path(&norm).is_some() {
            return Ok(());
        }
        let now = now_secs();
        let index = self.table.alloc(norm, libc::S_IFDIR | mode, now);
        let record = {
            let inode = self.table.row(index);
            Record::Mkdir(NodeRecord {
                inode_id: inode.id,
                mode: inode.mode,
                size: inode.size,
                ts: inode.mtime as u64,
                path: inode.path.clone(),
                symlink_target: None,
            })
        };
        if let Err(err) = self.append_record(&record) {
            self.table.drop_last();
            return Err(err);
        }
        Ok(())
    }

    /// The mode argument is accepted for interface symmetry and ignored;
    /// links are always `S_IFLNK | 0777`.
    pub fn symlink(&mut self, target: &str, linkpath: &str, _mode: u32) -> AfsResult<()> {
        self.make_node(linkpath, libc::S_IFLNK | 0o777, Some(target))
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Removal and rename
    // ------------------------------------------------------------------

    pub fn unlink(&mut self, path: &str) -> AfsResult<()> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        if self.table.row(index).is_dir() {
            return Err(AfsError::IsDirectory);
        }
        let inode_id = {
            let inode = self.table.row_mut(index);
            inode.deleted = true;
            inode.id
        };
        self.append_record(&Record::Unlink { inode_id })
    }

    pub fn rmdir(&mut self, path: &str) -> AfsResult<()> {
        let norm = normalize_path(path);
        if norm == "/" {
            return Err(AfsError::InvalidArgument);
        }
        let index = self.table.find_by_path(&norm).ok_or(AfsError::NotFound)?;
        if !self.table.row(index).is_dir() {
            return Err(AfsError::NotDirectory);
        }
        if !self.is_directory_empty(&norm)? {
            return Err(AfsError::NotEmpty);
        }
        let inode_id = {
            let inode = self.table.row_mut(index);
            inode.deleted = true;
            inode.mtime = now_secs();
            inode.id
        };
        self.append_record(&Record::Unlink { inode_id })
    }

    /// Subtree-aware rename. The moved inode gets its RENAME record
    /// first, then every strict descendant gets one of its own; a crash
    /// in the middle leaves the log short and replay rebuilds the
    /// partially renamed tree.
    pub fn rename(&mut self, from_path: &str, to_path: &str) -> AfsResult<()> {
        let from_norm = normalize_path(from_path);
        let to_norm = normalize_path(to_path);
        let src = self
            .table
            .find_by_path(&from_norm)
            .ok_or(AfsError::NotFound)?;
        if from_norm == to_norm {
            return Ok(());
        }
        let (to_parent, _) = split_parent(&to_norm).ok_or(AfsError::InvalidArgument)?;
        if to_parent != "/" {
            match self.table.find_by_path(&to_parent) {
                Some(index) if self.table.row(index).is_dir() => {}
                _ => return Err(AfsError::NotFound),
            }
        }
        let src_is_dir = self.table.row(src).is_dir();
        if let Some(dst) = self.table.find_by_path(&to_norm) {
            let dst_is_dir = self.table.row(dst).is_dir();
            if src_is_dir {
                if !dst_is_dir {
                    return Err(AfsError::NotDirectory);
                }
                if !self.is_directory_empty(&to_norm)? {
                    return Err(AfsError::NotEmpty);
                }
            } else if dst_is_dir {
                return Err(AfsError::IsDirectory);
            }
            let dst_id = {
                let inode = self.table.row_mut(dst);
                inode.deleted = true;
                inode.mtime = now_secs();
                inode.id
            };
            self.append_record(&Record::Unlink { inode_id: dst_id })?;
        }
        let mut descendants: Vec<(usize, String)> = vec![];
        if src_is_dir {
            for (index, inode) in self.table.iter().enumerate() {
                if index == src || inode.deleted {
                    continue;
                }
                if is_strict_descendant(&inode.path, &from_norm) {
                    let new_path = format!("{}{}", to_norm, &inode.path[from_norm.len()..]);
                    descendants.push((index, new_path));
                }
            }
        }
        let src_id = self.table.row(src).id;
        self.append_record(&Record::Rename {
            inode_id: src_id,
            path: to_norm.clone(),
        })?;
        {
            let inode = self.table.row_mut(src);
            inode.path = to_norm;
            inode.deleted = false;
            inode.mtime = now_secs();
        }
        for (index, new_path) in descendants {
            let inode_id = self.table.row(index).id;
            self.append_record(&Record::Rename {
                inode_id,
                path: new_path.clone(),
            })?;
            let inode = self.table.row_mut(index);
            inode.path = new_path;
            inode.deleted = false;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn stat(&self, path: &str) -> AfsResult<InodeInfo> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        Ok(InodeInfo::from(self.table.row(index)))
    }

    pub fn statfs(&self) -> AfsResult<Statvfs> {
        statvfs(self.root_path.as_str()).map_err(|err| {
            warn!("statvfs({}) failed: {}", self.root_path, err);
            AfsError::Io
        })
    }

    /// Live path for an inode id; what the kernel adapter uses to turn
    /// its inode numbers back into core paths.
    pub fn path_by_id(&self, id: u64) -> Option<String> {
        self.table
            .iter()
            .find(|inode| inode.id == id && !inode.deleted)
            .map(|inode| inode.path.clone())
    }

    pub fn is_directory_empty(&self, path: &str) -> AfsResult<bool> {
        let norm = normalize_path(path);
        for inode in self.table.iter() {
            if inode.deleted || inode.path == norm {
                continue;
            }
            if immediate_child_name(&norm, &inode.path).is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Visit every live immediate child of `dir_path` in inode-table
    /// order. The callback returns `false` to stop early; the result is
    /// success either way.
    pub fn iterate_children<F>(&self, dir_path: &str, mut f: F) -> AfsResult<()>
    where
        F: FnMut(&str, &InodeInfo) -> bool,
    {
        let norm = normalize_path(dir_path);
        for inode in self.table.iter() {
            if inode.deleted {
                continue;
            }
            if let Some(name) = immediate_child_name(&norm, &inode.path) {
                if !f(name, &InodeInfo::from(inode)) {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn set_times(&mut self, path: &str, atime: TimeUpdate, mtime: TimeUpdate) -> AfsResult<()> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let now = now_secs();
        let (inode_id, new_atime, new_mtime) = {
            let inode = self.table.row_mut(index);
            match atime {
                TimeUpdate::Now => inode.atime = now,
                TimeUpdate::Set(secs) => inode.atime = secs,
                TimeUpdate::Omit => {}
            }
            match mtime {
                TimeUpdate::Now => inode.mtime = now,
                TimeUpdate::Set(secs) => inode.mtime = secs,
                TimeUpdate::Omit => {}
            }
            inode.ctime = now;
            (inode.id, inode.atime, inode.mtime)
        };
        self.append_record(&Record::Times {
            inode_id,
            atime: new_atime,
            mtime: new_mtime,
        })
    }

    pub fn read_link(&mut self, path: &str, buf: &mut [u8]) -> AfsResult<usize> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        if !is_symlink(self.table.row(index).mode) {
            return Err(AfsError::InvalidArgument);
        }
        let target = self
            .table
            .row(index)
            .symlink_target
            .clone()
            .unwrap_or_default();
        let target_len = target.len();
        if buf.is_empty() {
            return Ok(target_len);
        }
        if buf.len() == 1 {
            buf[0] = 0;
            return Ok(target_len);
        }
        let copy_len = target_len.min(buf.len() - 1);
        buf[..copy_len].copy_from_slice(&target.as_bytes()[..copy_len]);
        buf[copy_len] = 0;
        self.table.row_mut(index).atime = now_secs();
        Ok(target_len)
    }

    // ------------------------------------------------------------------
    // Extended attributes
    // ------------------------------------------------------------------

    pub fn set_xattr(
        &mut self,
        path: &str,
        name: &str,
        value: &[u8],
        flags: i32,
    ) -> AfsResult<()> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let prior = {
            let inode = self.table.row(index);
            inode.find_xattr(name).map(|i| inode.xattrs[i].value.clone())
        };
        xattr::set_xattr(self.table.row_mut(index), name, value, flags)?;
        let inode_id = self.table.row(index).id;
        if let Err(err) = self.append_record(&Record::SetXattr {
            inode_id,
            name: name.to_string(),
            value: value.to_vec(),
        }) {
            // The in-memory change must not outlive its failed record.
            let inode = self.table.row_mut(index);
            match prior {
                Some(old) => {
                    let _ = xattr::set_xattr(inode, name, &old, xattr::XATTR_REPLACE);
                }
                None => {
                    let _ = xattr::remove_xattr(inode, name);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// `buf` of `None` is the size probe; a buffer shorter than the
    /// value fails `OutOfRange`. Returns the value length.
    pub fn get_xattr(
        &self,
        path: &str,
        name: &str,
        buf: Option<&mut [u8]>,
    ) -> AfsResult<usize> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let inode = self.table.row(index);
        let attr = inode
            .find_xattr(name)
            .map(|i| &inode.xattrs[i])
            .ok_or(AfsError::NoData)?;
        match buf {
            None => Ok(attr.value.len()),
            Some(buf) => {
                if buf.len() < attr.value.len() {
                    return Err(AfsError::OutOfRange);
                }
                buf[..attr.value.len()].copy_from_slice(&attr.value);
                Ok(attr.value.len())
            }
        }
    }

    /// Name list as concatenated `name\0` tokens; same probe protocol
    /// as `get_xattr`.
    pub fn list_xattr(&self, path: &str, buf: Option<&mut [u8]>) -> AfsResult<usize> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let inode = self.table.row(index);
        let total: usize = inode.xattrs.iter().map(|x| x.name.len() + 1).sum();
        match buf {
            None => Ok(total),
            Some(buf) => {
                if buf.len() < total {
                    return Err(AfsError::OutOfRange);
                }
                let mut offset = 0;
                for attr in &inode.xattrs {
                    buf[offset..offset + attr.name.len()].copy_from_slice(attr.name.as_bytes());
                    offset += attr.name.len();
                    buf[offset] = 0;
                    offset += 1;
                }
                Ok(total)
            }
        }
    }

    pub fn remove_xattr(&mut self, path: &str, name: &str) -> AfsResult<()> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let backup = {
            let inode = self.table.row(index);
            inode
                .find_xattr(name)
                .map(|i| inode.xattrs[i].value.clone())
                .ok_or(AfsError::NoData)?
        };
        xattr::remove_xattr(self.table.row_mut(index), name)?;
        let inode_id = self.table.row(index).id;
        if let Err(err) = self.append_record(&Record::RemoveXattr {
            inode_id,
            name: name.to_string(),
        }) {
            let _ = xattr::set_xattr(
                self.table.row_mut(index),
                name,
                &backup,
                xattr::XATTR_CREATE,
            );
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    pub fn truncate(&mut self, path: &str, new_size: u64) -> AfsResult<()> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let mode = self.table.row(index).mode;
        if !is_regular(mode) && !is_symlink(mode) {
            return Err(AfsError::InvalidArgument);
        }
        let inode_id = {
            let inode = self.table.row_mut(index);
            inode.size = new_size;
            inode.id
        };
        self.append_record(&Record::Truncate { inode_id, new_size })?;
        let inode = self.table.row_mut(index);
        inode.trim_extents(new_size);
        inode.mtime = now_secs();
        Ok(())
    }

    /// Assemble `buf` from the extent list. The span past every extent
    /// reads as zeros, and where extents overlap the later flush wins,
    /// so the output is zeroed first and extents land oldest to newest.
    pub fn read(&mut self, path: &str, buf: &mut [u8], offset: u64) -> AfsResult<usize> {
        let index = self.table.find_by_path(path).ok_or(AfsError::NotFound)?;
        let (size, extents) = {
            let inode = self.table.row(index);
            (inode.size, inode.extents.clone())
        };
        if offset >= size {
            return Ok(0);
        }
        let produce = (buf.len() as u64).min(size - offset) as usize;
        let out = &mut buf[..produce];
        out.fill(0);
        for ext in extents {
            let ext_end = ext.logical + ext.length as u64;
            let start = offset.max(ext.logical);
            let end = ext_end.min(offset + produce as u64);
            if start >= end {
                continue;
            }
            let span = (end - start) as usize;
            let data_pos = ext.data_offset + (start - ext.logical);
            let dst = &mut out[(start - offset) as usize..][..span];
            if self.data_dev.ld_read_at(dst, data_pos)? < span {
                return Err(AfsError::Io);
            }
        }
        if produce > 0 {
            self.table.row_mut(index).atime = now_secs();
        }
        Ok(produce)
    }

    // ------------------------------------------------------------------
    // Open files
    // ------------------------------------------------------------------

    pub fn open_file(&mut self, path: &str, flags: i32, mode: u32) -> AfsResult<FileHandle> {
        let norm = normalize_path(path);
        let mut index = self.table.find_by_path(&norm);
        if index.is_none() {
            if flags & libc::O_CREAT == 0 {
                return Err(AfsError::NotFound);
            }
            self.create_file(&norm, mode)?;
            index = self.table.find_by_path(&norm);
        }
        let index = index.ok_or(AfsError::NotFound)?;
        if self.table.row(index).is_dir() {
            return Err(AfsError::IsDirectory);
        }
        let mut handle = FileHandle::new(index, self.write_buffer_size, flags);
        if flags & libc::O_TRUNC != 0 {
            self.truncate(&norm, 0)?;
        }
        if flags & libc::O_APPEND != 0 {
            handle.position = self.table.row(index).size;
        }
        Ok(handle)
    }

    /// Stage `buf` at `offset`. A non-sequential offset flushes the
    /// pending run first; a full buffer flushes mid-copy. The whole
    /// input is always absorbed on success.
    pub fn write_file(
        &mut self,
        handle: &mut FileHandle,
        buf: &[u8],
        offset: u64,
    ) -> AfsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if handle.buffered() > 0 && offset != handle.buffer_offset + handle.buffered() as u64 {
            self.flush_file(handle)?;
        }
        if handle.buffered() == 0 {
            handle.buffer_offset = offset;
        }
        let mut remaining = buf.len();
        while remaining > 0 {
            let mut space = handle.buffer_size - handle.buffered();
            if space == 0 {
                self.flush_file(handle)?;
                handle.buffer_offset = offset + (buf.len() - remaining) as u64;
                space = handle.buffer_size;
            }
            let to_copy = remaining.min(space);
            let start = buf.len() - remaining;
            handle.buffer.extend_from_slice(&buf[start..start + to_copy]);
            remaining -= to_copy;
            if handle.buffered() >= handle.buffer_size {
                self.flush_file(handle)?;
                handle.buffer_offset = offset + (buf.len() - remaining) as u64;
            }
        }
        handle.position = offset + buf.len() as u64;
        Ok(buf.len())
    }

    /// Turn the buffered run into one extent: append the bytes to the
    /// data log, grow the inode, then log the EXTENT record.
    pub fn flush_file(&mut self, handle: &mut FileHandle) -> AfsResult<()> {
        if handle.buffered() == 0 {
            return Ok(());
        }
        let data_offset = self.data_dev.ld_append(&handle.buffer)?;
        let length = handle.buffered() as u32;
        let (inode_id, new_size, old_size, old_mtime) = {
            let inode = self.table.row_mut(handle.inode_index);
            let old_size = inode.size;
            let old_mtime = inode.mtime;
            inode.extents.push(Extent {
                logical: handle.buffer_offset,
                data_offset,
                length,
            });
            let end = handle.buffer_offset + length as u64;
            if end > inode.size {
                inode.size = end;
            }
            inode.mtime = now_secs();
            (inode.id, inode.size, old_size, old_mtime)
        };
        if let Err(err) = self.append_record(&Record::Extent {
            inode_id,
            logical: handle.buffer_offset,
            data_offset,
            length,
            new_size,
        }) {
            // The inode must not get ahead of the log: undo the extent
            // and leave the bytes buffered for a later retry.
            let inode = self.table.row_mut(handle.inode_index);
            inode.extents.pop();
            inode.size = old_size;
            inode.mtime = old_mtime;
            return Err(err);
        }
        handle.buffer.clear();
        Ok(())
    }

    pub fn close_file(&mut self, mut handle: FileHandle) -> AfsResult<()> {
        self.flush_file(&mut handle)
    }

    pub fn fsync_file(&mut self, handle: &mut FileHandle, datasync: bool) -> AfsResult<()> {
        self.flush_file(handle)?;
        self.data_dev.ld_sync()?;
        if !datasync {
            self.meta_dev.ld_sync()?;
        }
        Ok(())
    }

    pub fn fsyncdir(&mut self) -> AfsResult<()> {
        self.meta_dev.ld_sync()?;
        Ok(())
    }

    pub fn seek_file(
        &mut self,
        handle: &mut FileHandle,
        offset: i64,
        whence: Whence,
    ) -> AfsResult<u64> {
        if handle.buffered() > 0 {
            self.flush_file(handle)?;
        }
        let inode = self.table.row(handle.inode_index);
        match whence {
            Whence::Set | Whence::Cur | Whence::End => {
                let base = match whence {
                    Whence::Cur => handle.position as i64,
                    Whence::End => inode.size as i64,
                    _ => 0,
                };
                let new_pos = base + offset;
                if new_pos < 0 {
                    return Err(AfsError::InvalidArgument);
                }
                handle.position = new_pos as u64;
                Ok(handle.position)
            }
            Whence::Data => {
                if offset < 0 {
                    return Err(AfsError::InvalidArgument);
                }
                let offset = offset as u64;
                if offset >= inode.size {
                    return Err(AfsError::NoExtent);
                }
                for ext in &inode.extents {
                    if ext.logical + ext.length as u64 <= offset {
                        continue;
                    }
                    let result = offset.max(ext.logical);
                    handle.position = result;
                    return Ok(result);
                }
                Err(AfsError::NoExtent)
            }
            Whence::Hole => {
                if offset < 0 {
                    return Err(AfsError::InvalidArgument);
                }
                let offset = offset as u64;
                if offset >= inode.size {
                    handle.position = inode.size;
                    return Ok(inode.size);
                }
                let mut pos = offset;
                for ext in &inode.extents {
                    let start = ext.logical;
                    let end = ext.logical + ext.length as u64;
                    if pos < start {
                        handle.position = pos;
                        return Ok(pos);
                    }
                    if pos >= start && pos < end {
                        pos = end;
                    }
                }
                let pos = pos.min(inode.size);
                handle.position = pos;
                Ok(pos)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use log_device::file::FileLogDevice;
    use log_device::memory::MemLogDevice;

    fn mem_fs() -> AppendFs<MemLogDevice> {
        AppendFs::new(MemLogDevice::new(), MemLogDevice::new())
    }

    fn temp_root(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!(
                "afs-{}-{}-{:08x}",
                tag,
                std::process::id(),
                rand::random::<u32>()
            ))
            .to_str()
            .unwrap()
            .to_string()
    }

    fn open_store(root: &str) -> AppendFs<FileLogDevice> {
        let mut fs = AppendFs::new(FileLogDevice::new(), FileLogDevice::new());
        fs.open(root).unwrap();
        fs
    }

    fn cleanup(root: &str) {
        let _ = std::fs::remove_dir_all(root);
    }

    fn meta_path(root: &str) -> String {
        format!(
            "{}/{}",
            std::fs::canonicalize(root).unwrap().to_str().unwrap(),
            META_FILENAME
        )
    }

    #[test]
    fn mkdir_create_basics() {
        let mut fs = mem_fs();
        fs.mkdir("/demo", 0o755).unwrap();
        let info = fs.stat("/demo").unwrap();
        assert!(is_dir(info.mode));
        assert_eq!(info.mode & 0o777, 0o755);

        fs.create_file("/demo/file.bin", 0o644).unwrap();
        assert_eq!(fs.create_file("/demo/file.bin", 0o644), Err(AfsError::Exists));
        assert_eq!(fs.create_file("/nodir/f", 0o644), Err(AfsError::NotFound));
        assert_eq!(fs.mkdir("/", 0o755), Err(AfsError::InvalidArgument));
        // A file is not a valid parent.
        assert_eq!(
            fs.create_file("/demo/file.bin/under", 0o644),
            Err(AfsError::NotFound)
        );
        let info = fs.stat("demo/file.bin").unwrap();
        assert!(is_regular(info.mode));
        assert_eq!(info.size, 0);
    }

    #[test]
    fn mkdirs_is_idempotent() {
        let mut fs = mem_fs();
        fs.mkdirs("/x", 0o755).unwrap();
        fs.mkdirs("/x", 0o700).unwrap();
        fs.mkdirs("/", 0o755).unwrap();
        assert_eq!(fs.stat("/x").unwrap().mode & 0o777, 0o755);
        // Single-directory variant: ancestors are not created.
        fs.mkdirs("/a/b", 0o755).unwrap();
        assert_eq!(fs.stat("/a"), Err(AfsError::NotFound));
        assert!(fs.stat("/a/b").is_ok());
    }

    #[test]
    fn unlink_and_rmdir_errors() {
        let mut fs = mem_fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create_file("/d/f", 0o644).unwrap();

        assert_eq!(fs.unlink("/missing"), Err(AfsError::NotFound));
        assert_eq!(fs.unlink("/d"), Err(AfsError::IsDirectory));
        assert_eq!(fs.rmdir("/d/f"), Err(AfsError::NotDirectory));
        assert_eq!(fs.rmdir("/d"), Err(AfsError::NotEmpty));
        assert_eq!(fs.rmdir("/"), Err(AfsError::InvalidArgument));

        fs.unlink("/d/f").unwrap();
        assert_eq!(fs.stat("/d/f"), Err(AfsError::NotFound));
        fs.rmdir("/d").unwrap();
        assert_eq!(fs.stat("/d"), Err(AfsError::NotFound));
    }

    #[test]
    fn tombstone_resurrection_keeps_id() {
        let mut fs = mem_fs();
        fs.create_file("/f", 0o644).unwrap();
        fs.set_xattr("/f", "user.k", b"v", 0).unwrap();
        let first = fs.stat("/f").unwrap();
        fs.unlink("/f").unwrap();
        fs.create_file("/f", 0o600).unwrap();
        let second = fs.stat("/f").unwrap();
        assert_eq!(second.inode_id, first.inode_id);
        assert_eq!(second.mode & 0o7777, 0o600);
        assert_eq!(second.size, 0);
        assert_eq!(fs.get_xattr("/f", "user.k", None), Err(AfsError::NoData));
    }

    #[test]
    fn hole_read_scenario() {
        let mut fs = mem_fs();
        fs.create_file("/h", 0o644).unwrap();
        let mut handle = fs.open_file("/h", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, &[0xAA; 4096], 1_048_576).unwrap();
        fs.flush_file(&mut handle).unwrap();

        let mut buf = [0xFFu8; 16];
        assert_eq!(fs.read("/h", &mut buf, 0).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(fs.read("/h", &mut buf, 1_048_576).unwrap(), 16);
        assert_eq!(buf, [0xAAu8; 16]);
        assert_eq!(fs.stat("/h").unwrap().size, 1_052_672);
    }

    #[test]
    fn overlap_last_flush_wins() {
        let mut fs = mem_fs();
        fs.create_file("/o", 0o644).unwrap();
        let mut handle = fs.open_file("/o", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, &[0x11; 1024], 0).unwrap();
        fs.flush_file(&mut handle).unwrap();
        fs.write_file(&mut handle, &[0x22; 512], 256).unwrap();
        fs.flush_file(&mut handle).unwrap();

        let mut buf = [0u8; 1024];
        assert_eq!(fs.read("/o", &mut buf, 0).unwrap(), 1024);
        assert!(buf[..256].iter().all(|&b| b == 0x11));
        assert!(buf[256..768].iter().all(|&b| b == 0x22));
        assert!(buf[768..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn sequential_writes_coalesce_into_one_extent() {
        let mut fs = mem_fs();
        fs.create_file("/c", 0o644).unwrap();
        let mut handle = fs.open_file("/c", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, &[1u8; 100], 0).unwrap();
        fs.write_file(&mut handle, &[2u8; 200], 100).unwrap();
        fs.flush_file(&mut handle).unwrap();
        {
            let index = fs.table.find_by_path("/c").unwrap();
            let inode = fs.table.row(index);
            assert_eq!(inode.extents.len(), 1);
            assert_eq!(inode.extents[0].length, 300);
        }
        // A jump backwards breaks the run and costs another extent.
        fs.write_file(&mut handle, &[3u8; 10], 50).unwrap();
        fs.flush_file(&mut handle).unwrap();
        let index = fs.table.find_by_path("/c").unwrap();
        assert_eq!(fs.table.row(index).extents.len(), 2);
        assert_eq!(handle.position, 60);
    }

    #[test]
    fn full_buffer_flushes_mid_write() {
        let mut fs = mem_fs();
        fs.set_options(&AfsOptions {
            write_buffer_size: 4096,
        })
        .unwrap();
        fs.create_file("/big", 0o644).unwrap();
        let mut handle = fs.open_file("/big", libc::O_RDWR, 0).unwrap();
        let payload: Vec<u8> = (0..10_000).map(|i| (i & 0xFF) as u8).collect();
        assert_eq!(fs.write_file(&mut handle, &payload, 0).unwrap(), 10_000);
        fs.flush_file(&mut handle).unwrap();

        let index = fs.table.find_by_path("/big").unwrap();
        let lengths: Vec<u32> = fs.table.row(index).extents.iter().map(|e| e.length).collect();
        assert_eq!(lengths, vec![4096, 4096, 1808]);
        assert_eq!(fs.stat("/big").unwrap().size, 10_000);

        let mut back = vec![0u8; 10_000];
        assert_eq!(fs.read("/big", &mut back, 0).unwrap(), 10_000);
        assert_eq!(back, payload);
    }

    #[test]
    fn set_options_rejects_tiny_buffer() {
        let mut fs = mem_fs();
        assert_eq!(
            fs.set_options(&AfsOptions {
                write_buffer_size: 4095
            }),
            Err(AfsError::InvalidArgument)
        );
        fs.set_options(&AfsOptions {
            write_buffer_size: 4096,
        })
        .unwrap();
        assert_eq!(fs.write_buffer_size, 4096);
    }

    #[test]
    fn open_file_flag_handling() {
        let mut fs = mem_fs();
        assert_eq!(
            fs.open_file("/nope", libc::O_RDWR, 0).err(),
            Some(AfsError::NotFound)
        );
        let mut handle = fs
            .open_file("/f", libc::O_RDWR | libc::O_CREAT, 0o644)
            .unwrap();
        fs.write_file(&mut handle, b"payload", 0).unwrap();
        fs.close_file(handle).unwrap();

        let handle = fs
            .open_file("/f", libc::O_WRONLY | libc::O_APPEND, 0)
            .unwrap();
        assert_eq!(handle.position, 7);
        fs.close_file(handle).unwrap();

        let handle = fs.open_file("/f", libc::O_RDWR | libc::O_TRUNC, 0).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 0);
        fs.close_file(handle).unwrap();

        fs.mkdir("/d", 0o755).unwrap();
        assert_eq!(
            fs.open_file("/d", libc::O_RDONLY, 0).err(),
            Some(AfsError::IsDirectory)
        );
    }

    #[test]
    fn seek_whence_math_and_sparse_probes() {
        let mut fs = mem_fs();
        fs.create_file("/s", 0o644).unwrap();
        let mut handle = fs.open_file("/s", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, &[0xAA; 4096], 1_048_576).unwrap();
        fs.flush_file(&mut handle).unwrap();

        assert_eq!(fs.seek_file(&mut handle, 10, Whence::Set).unwrap(), 10);
        assert_eq!(fs.seek_file(&mut handle, 5, Whence::Cur).unwrap(), 15);
        assert_eq!(
            fs.seek_file(&mut handle, 0, Whence::End).unwrap(),
            1_052_672
        );
        assert_eq!(
            fs.seek_file(&mut handle, -20, Whence::Set),
            Err(AfsError::InvalidArgument)
        );

        assert_eq!(
            fs.seek_file(&mut handle, 0, Whence::Data).unwrap(),
            1_048_576
        );
        assert_eq!(
            fs.seek_file(&mut handle, 1_048_580, Whence::Data).unwrap(),
            1_048_580
        );
        assert_eq!(
            fs.seek_file(&mut handle, 1_052_672, Whence::Data),
            Err(AfsError::NoExtent)
        );
        assert_eq!(fs.seek_file(&mut handle, 0, Whence::Hole).unwrap(), 0);
        assert_eq!(
            fs.seek_file(&mut handle, 1_048_576, Whence::Hole).unwrap(),
            1_052_672
        );
        assert_eq!(
            fs.seek_file(&mut handle, 9_999_999, Whence::Hole).unwrap(),
            1_052_672
        );
    }

    #[test]
    fn readlink_contract() {
        let mut fs = mem_fs();
        fs.create_file("/afile", 0o644).unwrap();
        fs.symlink("/afile", "/link", 0o123).unwrap();
        let info = fs.stat("/link").unwrap();
        assert!(is_symlink(info.mode));
        assert_eq!(info.mode & 0o777, 0o777);
        assert_eq!(info.size, 6);

        let mut empty: [u8; 0] = [];
        assert_eq!(fs.read_link("/link", &mut empty).unwrap(), 6);
        let mut small = [0xFFu8; 4];
        assert_eq!(fs.read_link("/link", &mut small).unwrap(), 6);
        assert_eq!(&small, b"/af\0");
        let mut full = [0u8; 16];
        assert_eq!(fs.read_link("/link", &mut full).unwrap(), 6);
        assert_eq!(&full[..7], b"/afile\0");

        assert_eq!(
            fs.read_link("/afile", &mut full),
            Err(AfsError::InvalidArgument)
        );
    }

    #[test]
    fn xattr_roundtrip_scenario() {
        let mut fs = mem_fs();
        fs.create_file("/f", 0o644).unwrap();
        fs.set_xattr("/f", "user.k", b"v", xattr::XATTR_CREATE).unwrap();
        assert_eq!(
            fs.set_xattr("/f", "user.k", b"v", xattr::XATTR_CREATE),
            Err(AfsError::Exists)
        );
        assert_eq!(fs.get_xattr("/f", "user.k", None).unwrap(), 1);

        let mut short = [0u8; 0];
        assert_eq!(
            fs.get_xattr("/f", "user.k", Some(&mut short)),
            Err(AfsError::OutOfRange)
        );
        let mut buf = [0u8; 8];
        assert_eq!(fs.get_xattr("/f", "user.k", Some(&mut buf)).unwrap(), 1);
        assert_eq!(buf[0], b'v');

        fs.set_xattr("/f", "user.other", b"", 0).unwrap();
        let total = fs.list_xattr("/f", None).unwrap();
        assert_eq!(total, "user.k".len() + 1 + "user.other".len() + 1);
        let mut list = vec![0u8; total];
        assert_eq!(fs.list_xattr("/f", Some(&mut list)).unwrap(), total);
        assert_eq!(&list, b"user.k\0user.other\0");
        let mut tiny = [0u8; 3];
        assert_eq!(
            fs.list_xattr("/f", Some(&mut tiny)),
            Err(AfsError::OutOfRange)
        );

        fs.remove_xattr("/f", "user.k").unwrap();
        assert_eq!(fs.get_xattr("/f", "user.k", None), Err(AfsError::NoData));
        assert_eq!(fs.remove_xattr("/f", "user.k"), Err(AfsError::NoData));
    }

    #[test]
    fn set_times_now_omit_set() {
        let mut fs = mem_fs();
        fs.create_file("/t", 0o644).unwrap();
        fs.set_times("/t", TimeUpdate::Set(1000), TimeUpdate::Set(2000))
            .unwrap();
        let info = fs.stat("/t").unwrap();
        assert_eq!(info.atime, 1000);
        assert_eq!(info.mtime, 2000);

        fs.set_times("/t", TimeUpdate::Omit, TimeUpdate::Set(3000))
            .unwrap();
        let info = fs.stat("/t").unwrap();
        assert_eq!(info.atime, 1000);
        assert_eq!(info.mtime, 3000);

        let before = now_secs();
        fs.set_times("/t", TimeUpdate::Now, TimeUpdate::Omit).unwrap();
        let info = fs.stat("/t").unwrap();
        assert!(info.atime >= before);
        assert_eq!(info.mtime, 3000);
        assert!(info.ctime >= before);
    }

    #[test]
    fn iterate_children_in_insertion_order() {
        let mut fs = mem_fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create_file("/d/a", 0o644).unwrap();
        fs.create_file("/d/b", 0o644).unwrap();
        fs.mkdir("/d/c", 0o755).unwrap();
        fs.create_file("/d/c/deeper", 0o644).unwrap();

        let mut names = vec![];
        fs.iterate_children("/d", |name, info| {
            names.push((name.to_string(), info.inode_id));
            true
        })
        .unwrap();
        let just_names: Vec<&str> = names.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(just_names, vec!["a", "b", "c"]);

        let mut seen = 0;
        fs.iterate_children("/d", |_, _| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);

        let mut roots = vec![];
        fs.iterate_children("/", |name, _| {
            roots.push(name.to_string());
            true
        })
        .unwrap();
        assert_eq!(roots, vec!["d"]);

        assert!(!fs.is_directory_empty("/d").unwrap());
        assert!(fs.is_directory_empty("/d/c/deeper").unwrap());
        fs.unlink("/d/c/deeper").unwrap();
        assert!(fs.is_directory_empty("/d/c").unwrap());
    }

    #[test]
    fn subtree_rename_scenario() {
        let mut fs = mem_fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/a/b", 0o755).unwrap();
        fs.create_file("/a/b/c", 0o644).unwrap();
        let mut handle = fs.open_file("/a/b/c", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, b"hi", 0).unwrap();
        fs.close_file(handle).unwrap();

        fs.rename("/a", "/x").unwrap();
        assert_eq!(fs.stat("/a"), Err(AfsError::NotFound));
        assert_eq!(fs.stat("/x/b/c").unwrap().size, 2);
        let mut buf = [0u8; 2];
        assert_eq!(fs.read("/x/b/c", &mut buf, 0).unwrap(), 2);
        assert_eq!(&buf, b"hi");
        // Nothing lives under the old prefix anymore.
        assert!(!fs
            .table
            .iter()
            .any(|inode| !inode.deleted && is_strict_descendant(&inode.path, "/a")));
    }

    #[test]
    fn rename_destination_checks() {
        let mut fs = mem_fs();
        fs.mkdir("/dir", 0o755).unwrap();
        fs.mkdir("/dir2", 0o755).unwrap();
        fs.create_file("/dir2/child", 0o644).unwrap();
        fs.create_file("/file", 0o644).unwrap();
        fs.create_file("/file2", 0o644).unwrap();

        assert_eq!(fs.rename("/dir", "/file"), Err(AfsError::NotDirectory));
        assert_eq!(fs.rename("/file", "/dir"), Err(AfsError::IsDirectory));
        assert_eq!(fs.rename("/dir", "/dir2"), Err(AfsError::NotEmpty));
        assert_eq!(fs.rename("/missing", "/x"), Err(AfsError::NotFound));
        assert_eq!(fs.rename("/file", "/nodir/x"), Err(AfsError::NotFound));
        fs.rename("/file", "/file").unwrap();

        // File over file replaces the destination.
        let mut handle = fs.open_file("/file", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, b"src", 0).unwrap();
        fs.close_file(handle).unwrap();
        fs.rename("/file", "/file2").unwrap();
        assert_eq!(fs.stat("/file"), Err(AfsError::NotFound));
        let mut buf = [0u8; 3];
        assert_eq!(fs.read("/file2", &mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"src");

        // Directory over empty directory is allowed.
        fs.unlink("/dir2/child").unwrap();
        fs.rename("/dir", "/dir2").unwrap();
        assert_eq!(fs.stat("/dir"), Err(AfsError::NotFound));
        assert!(fs.stat("/dir2").is_ok());
    }

    #[test]
    fn truncate_trims_extents_scenario() {
        let root = temp_root("truncate");
        {
            let mut fs = open_store(&root);
            fs.create_file("/t", 0o644).unwrap();
            let mut handle = fs.open_file("/t", libc::O_RDWR, 0).unwrap();
            fs.write_file(&mut handle, &[0xFF; 8192], 0).unwrap();
            fs.close_file(handle).unwrap();

            fs.truncate("/t", 100).unwrap();
            assert_eq!(fs.stat("/t").unwrap().size, 100);
            let index = fs.table.find_by_path("/t").unwrap();
            assert_eq!(fs.table.row(index).extents.len(), 1);
            assert_eq!(fs.table.row(index).extents[0].length, 100);

            let mut buf = [0u8; 200];
            assert_eq!(fs.read("/t", &mut buf, 0).unwrap(), 100);
            assert!(buf[..100].iter().all(|&b| b == 0xFF));
            fs.close().unwrap();
        }
        {
            let mut fs = open_store(&root);
            assert_eq!(fs.stat("/t").unwrap().size, 100);
            let mut buf = [0u8; 200];
            assert_eq!(fs.read("/t", &mut buf, 0).unwrap(), 100);
            assert!(buf[..100].iter().all(|&b| b == 0xFF));
            let index = fs.table.find_by_path("/t").unwrap();
            assert!(fs
                .table
                .row(index)
                .extents
                .iter()
                .all(|e| e.logical + e.length as u64 <= 100));
        }
        cleanup(&root);
    }

    #[test]
    fn truncate_rejects_directories() {
        let mut fs = mem_fs();
        fs.mkdir("/d", 0o755).unwrap();
        assert_eq!(fs.truncate("/d", 0), Err(AfsError::InvalidArgument));
        fs.symlink("/d", "/l", 0).unwrap();
        fs.truncate("/l", 0).unwrap();
        assert_eq!(fs.stat("/l").unwrap().size, 0);
    }

    #[test]
    fn create_write_reopen_read_tail() {
        let root = temp_root("tail");
        let payload: Vec<u8> = (0..4_202_496u64).map(|i| (i & 0xFF) as u8).collect();
        {
            let mut fs = open_store(&root);
            fs.mkdir("/demo", 0o755).unwrap();
            fs.create_file("/demo/file.bin", 0o644).unwrap();
            let mut handle = fs.open_file("/demo/file.bin", libc::O_RDWR, 0).unwrap();
            assert_eq!(
                fs.write_file(&mut handle, &payload, 0).unwrap(),
                payload.len()
            );
            fs.flush_file(&mut handle).unwrap();
            fs.close_file(handle).unwrap();
            fs.close().unwrap();
        }
        {
            let mut fs = open_store(&root);
            assert_eq!(fs.stat("/demo/file.bin").unwrap().size, 4_202_496);
            let mut buf = [0u8; 64];
            assert_eq!(fs.read("/demo/file.bin", &mut buf, 4_202_432).unwrap(), 64);
            for (k, &byte) in buf.iter().enumerate() {
                assert_eq!(byte, ((4_202_432 + k as u64) & 0xFF) as u8);
            }
        }
        cleanup(&root);
    }

    #[test]
    fn everything_survives_reopen() {
        let root = temp_root("reopen");
        let expected_id;
        {
            let mut fs = open_store(&root);
            fs.mkdir("/d", 0o750).unwrap();
            fs.create_file("/d/f", 0o644).unwrap();
            let mut handle = fs.open_file("/d/f", libc::O_RDWR, 0).unwrap();
            fs.write_file(&mut handle, b"hello world", 0).unwrap();
            fs.close_file(handle).unwrap();
            fs.symlink("/d/f", "/d/link", 0).unwrap();
            fs.set_xattr("/d/f", "user.one", b"1", 0).unwrap();
            fs.set_xattr("/d/f", "user.two", b"two", 0).unwrap();
            fs.set_times("/d/f", TimeUpdate::Set(1111), TimeUpdate::Set(2222))
                .unwrap();
            expected_id = fs.stat("/d/f").unwrap().inode_id;
            fs.close().unwrap();
        }
        {
            let mut fs = open_store(&root);
            let dir = fs.stat("/d").unwrap();
            assert!(is_dir(dir.mode));
            assert_eq!(dir.mode & 0o777, 0o750);

            let info = fs.stat("/d/f").unwrap();
            assert_eq!(info.inode_id, expected_id);
            assert_eq!(info.size, 11);
            assert_eq!(info.atime, 1111);
            assert_eq!(info.mtime, 2222);

            let mut buf = [0u8; 11];
            assert_eq!(fs.read("/d/f", &mut buf, 0).unwrap(), 11);
            assert_eq!(&buf, b"hello world");

            let mut target = [0u8; 32];
            assert_eq!(fs.read_link("/d/link", &mut target).unwrap(), 4);
            assert_eq!(&target[..5], b"/d/f\0");

            let mut value = [0u8; 8];
            assert_eq!(fs.get_xattr("/d/f", "user.one", Some(&mut value)).unwrap(), 1);
            assert_eq!(value[0], b'1');
            assert_eq!(fs.get_xattr("/d/f", "user.two", None).unwrap(), 3);

            // Ids keep increasing from where the log left off.
            fs.create_file("/later", 0o644).unwrap();
            assert!(fs.stat("/later").unwrap().inode_id > expected_id);
        }
        cleanup(&root);
    }

    // Walk the framed records in a raw meta image, returning
    // (payload_start, payload_len) for each.
    fn record_spans(meta: &[u8]) -> Vec<(usize, usize)> {
        let mut spans = vec![];
        let mut pos = 0;
        while pos + RECORD_HEADER_SIZE <= meta.len() {
            let header = RecordHeader::read_from(&meta[pos..pos + RECORD_HEADER_SIZE]).unwrap();
            let length = header.length.get() as usize;
            if pos + RECORD_HEADER_SIZE + length > meta.len() {
                break;
            }
            spans.push((pos + RECORD_HEADER_SIZE, length));
            pos += RECORD_HEADER_SIZE + length;
        }
        spans
    }

    #[test]
    fn flipped_byte_drops_only_that_record() {
        let root = temp_root("flip");
        {
            let mut fs = open_store(&root);
            fs.create_file("/a", 0o644).unwrap();
            fs.create_file("/b", 0o644).unwrap();
            fs.create_file("/c", 0o644).unwrap();
            fs.close().unwrap();
        }
        let meta = meta_path(&root);
        let mut bytes = std::fs::read(&meta).unwrap();
        let spans = record_spans(&bytes);
        assert_eq!(spans.len(), 3);
        let (start, len) = spans[1];
        bytes[start + len / 2] ^= 0x40;
        std::fs::write(&meta, &bytes).unwrap();
        {
            let mut fs = open_store(&root);
            assert!(fs.stat("/a").is_ok());
            assert_eq!(fs.stat("/b"), Err(AfsError::NotFound));
            assert!(fs.stat("/c").is_ok());
            // The damaged record still occupies clean framing, so
            // later appends replay fine.
            fs.create_file("/d", 0o644).unwrap();
            fs.close().unwrap();
        }
        {
            let mut fs = open_store(&root);
            assert!(fs.stat("/d").is_ok());
        }
        cleanup(&root);
    }

    #[test]
    fn torn_tail_ends_replay_and_stays_in_place() {
        let root = temp_root("torn");
        {
            let mut fs = open_store(&root);
            fs.create_file("/a", 0o644).unwrap();
            fs.create_file("/b", 0o644).unwrap();
            fs.close().unwrap();
        }
        let meta = meta_path(&root);
        // A header promising more payload than the file holds.
        let mut bytes = std::fs::read(&meta).unwrap();
        let torn = RecordHeader::new(RecordKind::Unlink, &[0u8; 64]);
        bytes.extend_from_slice(torn.as_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        std::fs::write(&meta, &bytes).unwrap();
        let torn_len = bytes.len() as u64;
        {
            let mut fs = open_store(&root);
            // Everything before the tear is applied, the tear ends
            // replay, and the log is left exactly as found.
            assert!(fs.stat("/a").is_ok());
            assert!(fs.stat("/b").is_ok());
            assert_eq!(std::fs::metadata(&meta).unwrap().len(), torn_len);
            fs.close().unwrap();
        }
        cleanup(&root);
    }

    #[test]
    fn failed_flush_rolls_back_inode_state() {
        let mut fs = AppendFs::new(FlakyDevice::new(), FlakyDevice::new());
        fs.create_file("/f", 0o644).unwrap();
        let mut handle = fs.open_file("/f", libc::O_RDWR, 0).unwrap();
        fs.write_file(&mut handle, b"payload", 0).unwrap();

        fs.meta_dev.fail_appends = true;
        assert_eq!(fs.flush_file(&mut handle), Err(AfsError::Io));
        {
            let index = fs.table.find_by_path("/f").unwrap();
            let inode = fs.table.row(index);
            assert!(inode.extents.is_empty());
            assert_eq!(inode.size, 0);
        }
        // The bytes stay buffered for a retry.
        assert_eq!(handle.buffered(), 7);

        fs.meta_dev.fail_appends = false;
        fs.flush_file(&mut handle).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 7);
        let mut buf = [0u8; 7];
        assert_eq!(fs.read("/f", &mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn unknown_record_type_is_skipped() {
        let root = temp_root("unknown");
        {
            let mut fs = open_store(&root);
            fs.create_file("/a", 0o644).unwrap();
            fs.close().unwrap();
        }
        let meta = meta_path(&root);
        let mut bytes = std::fs::read(&meta).unwrap();
        let alien_payload = b"from the future";
        let mut alien = RecordHeader::new(RecordKind::Unlink, alien_payload);
        alien.kind = 42;
        bytes.extend_from_slice(alien.as_bytes());
        bytes.extend_from_slice(alien_payload);
        std::fs::write(&meta, &bytes).unwrap();
        {
            let mut fs = open_store(&root);
            assert!(fs.stat("/a").is_ok());
        }
        cleanup(&root);
    }

    // A device whose appends can be made to fail, for exercising the
    // rollback paths.
    struct FlakyDevice {
        inner: MemLogDevice,
        pub fail_appends: bool,
    }

    impl FlakyDevice {
        fn new() -> Self {
            Self {
                inner: MemLogDevice::new(),
                fail_appends: false,
            }
        }
    }

    impl LogDevice for FlakyDevice {
        fn ld_open(&mut self, path: &str) -> Result<()> {
            self.inner.ld_open(path)
        }
        fn ld_close(&mut self) -> Result<()> {
            self.inner.ld_close()
        }
        fn ld_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
            self.inner.ld_seek(offset, whence)
        }
        fn ld_read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.inner.ld_read(buf)
        }
        fn ld_append(&mut self, buf: &[u8]) -> Result<u64> {
            if self.fail_appends {
                anyhow::bail!("injected append failure");
            }
            self.inner.ld_append(buf)
        }
        fn ld_read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            self.inner.ld_read_at(buf, offset)
        }
        fn ld_sync(&mut self) -> Result<()> {
            self.inner.ld_sync()
        }
    }

    #[test]
    fn xattr_mutations_roll_back_on_append_failure() {
        let mut fs = AppendFs::new(FlakyDevice::new(), FlakyDevice::new());
        fs.create_file("/f", 0o644).unwrap();
        fs.set_xattr("/f", "user.k", b"old", 0).unwrap();

        fs.meta_dev.fail_appends = true;
        assert_eq!(fs.set_xattr("/f", "user.k", b"new", 0), Err(AfsError::Io));
        assert_eq!(fs.remove_xattr("/f", "user.k"), Err(AfsError::Io));
        assert_eq!(
            fs.set_xattr("/f", "user.fresh", b"x", 0),
            Err(AfsError::Io)
        );
        fs.meta_dev.fail_appends = false;

        let mut buf = [0u8; 8];
        assert_eq!(fs.get_xattr("/f", "user.k", Some(&mut buf)).unwrap(), 3);
        assert_eq!(&buf[..3], b"old");
        assert_eq!(fs.get_xattr("/f", "user.fresh", None), Err(AfsError::NoData));
    }

    #[test]
    fn failed_create_leaves_no_node_behind() {
        let mut fs = AppendFs::new(FlakyDevice::new(), FlakyDevice::new());
        fs.meta_dev.fail_appends = true;
        assert_eq!(fs.create_file("/f", 0o644), Err(AfsError::Io));
        fs.meta_dev.fail_appends = false;
        assert_eq!(fs.stat("/f"), Err(AfsError::NotFound));
        fs.create_file("/f", 0o644).unwrap();
        assert!(fs.stat("/f").is_ok());
    }

    #[test]
    fn statfs_reports_host_filesystem() {
        let root = temp_root("statfs");
        let fs = open_store(&root);
        let st = fs.statfs().unwrap();
        assert!(st.blocks() > 0);
        cleanup(&root);
    }
}
