/// FUSE operations.
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use log::*;
use log_device::LogDevice;

use crate::afs_lib::desc::{is_dir, is_symlink};
use crate::afs_lib::file::{FileHandle, Whence, DEFAULT_WRITE_BUFFER};
use crate::afs_lib::mem::InodeInfo;
use crate::afs_lib::utils::{now_secs, ret, utc_time};
use crate::afs_lib::{AfsError, AfsOptions, AppendFs, TimeUpdate};
use crate::{prv, rep, STORE_ROOT, WRITE_BUFFER_SIZE};

/// Attribute TTL, 1 second default
const TTL: Duration = Duration::from_secs(1);

/// The kernel's root inode number. The core never stores the root, so
/// kernel ino = core inode id + 1 and ino 1 is synthesized here.
const FUSE_ROOT_INO: u64 = 1;

pub struct AfsFuse<T: LogDevice> {
    pub fs: AppendFs<T>,
    handles: HashMap<u64, FileHandle>,
    next_fh: u64,
}

impl<T: LogDevice> AfsFuse<T> {
    pub fn new(fs: AppendFs<T>) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, AfsError> {
        if ino == FUSE_ROOT_INO {
            return Ok("/".to_string());
        }
        self.fs.path_by_id(ino - 1).ok_or(AfsError::NotFound)
    }

    fn join_path(parent: &str, name: &OsStr) -> Result<String, AfsError> {
        let name = name.to_str().ok_or(AfsError::InvalidArgument)?;
        if parent == "/" {
            Ok(format!("/{}", name))
        } else {
            Ok(format!("{}/{}", parent, name))
        }
    }

    fn to_attr(info: &InodeInfo, req: &Request<'_>) -> FileAttr {
        let kind = if is_dir(info.mode) {
            FileType::Directory
        } else if is_symlink(info.mode) {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino: info.inode_id + 1,
            size: info.size,
            blocks: (info.size + 511) / 512,
            atime: utc_time(info.atime),
            mtime: utc_time(info.mtime),
            ctime: utc_time(info.ctime),
            crtime: UNIX_EPOCH,
            kind,
            perm: (info.mode & 0o7777) as u16,
            // The core stores no link counts; directories conventionally
            // report 2 and everything else 1.
            nlink: if is_dir(info.mode) { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn root_attr(req: &Request<'_>) -> FileAttr {
        let now = utc_time(now_secs());
        FileAttr {
            ino: FUSE_ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn attr_of(&self, ino: u64, req: &Request<'_>) -> Result<FileAttr, AfsError> {
        if ino == FUSE_ROOT_INO {
            return Ok(Self::root_attr(req));
        }
        let path = self.path_of(ino)?;
        Ok(Self::to_attr(&self.fs.stat(&path)?, req))
    }

    fn time_update(time: Option<TimeOrNow>) -> TimeUpdate {
        match time {
            None => TimeUpdate::Omit,
            Some(TimeOrNow::Now) => TimeUpdate::Now,
            Some(TimeOrNow::SpecificTime(at)) => TimeUpdate::Set(
                at.duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            ),
        }
    }
}

impl<T: LogDevice> Filesystem for AfsFuse<T> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        let root = STORE_ROOT.read().unwrap().clone();
        ret(self.fs.open(&root))?;
        let buffer = *WRITE_BUFFER_SIZE.read().unwrap();
        if buffer != DEFAULT_WRITE_BUFFER {
            ret(self.fs.set_options(&AfsOptions {
                write_buffer_size: buffer,
            }))?;
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs.close().unwrap();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        prv!("lookup", parent, name);
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        rep!(reply, info, self.fs.stat(&path));
        reply.entry(&TTL, &Self::to_attr(&info, req), 0);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        prv!("getattr", ino);
        rep!(reply, attr, self.attr_of(ino, req));
        reply.attr(&TTL, &attr);
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        prv!("setattr", ino, size, atime, mtime);
        rep!(reply, path, self.path_of(ino));
        if let Some(size) = size {
            rep!(reply, self.fs.truncate(&path, size));
        }
        if atime.is_some() || mtime.is_some() {
            rep!(
                reply,
                self.fs
                    .set_times(&path, Self::time_update(atime), Self::time_update(mtime))
            );
        }
        rep!(reply, attr, self.attr_of(ino, req));
        reply.attr(&TTL, &attr);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        rep!(reply, path, self.path_of(ino));
        let mut probe: [u8; 0] = [];
        rep!(reply, len, self.fs.read_link(&path, &mut probe));
        let mut buf = vec![0u8; len + 1];
        rep!(reply, self.fs.read_link(&path, &mut buf));
        reply.data(&buf[..len]);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        prv!("mknod", parent, name, mode);
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        rep!(reply, self.fs.create_file(&path, mode));
        rep!(reply, info, self.fs.stat(&path));
        reply.entry(&TTL, &Self::to_attr(&info, req), 0);
        debug!("mknod done");
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        prv!("mkdir", parent, name, mode);
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        rep!(reply, self.fs.mkdir(&path, mode));
        rep!(reply, info, self.fs.stat(&path));
        reply.entry(&TTL, &Self::to_attr(&info, req), 0);
        debug!("mkdir done");
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        rep!(reply, self.fs.unlink(&path));
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        rep!(reply, self.fs.rmdir(&path));
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        prv!("symlink", parent, name, link);
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        let target = match link.to_str() {
            Some(target) => target,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, self.fs.symlink(target, &path, 0o777));
        rep!(reply, info, self.fs.stat(&path));
        reply.entry(&TTL, &Self::to_attr(&info, req), 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EOPNOTSUPP);
            return;
        }
        rep!(reply, from_parent, self.path_of(parent));
        rep!(reply, from_path, Self::join_path(&from_parent, name));
        rep!(reply, to_parent, self.path_of(newparent));
        rep!(reply, to_path, Self::join_path(&to_parent, newname));
        rep!(reply, self.fs.rename(&from_path, &to_path));
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // Hard links have no place in the log format.
        reply.error(libc::EOPNOTSUPP);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        prv!("open", ino, flags);
        rep!(reply, path, self.path_of(ino));
        let flags = flags & !(libc::O_CREAT | libc::O_EXCL);
        rep!(reply, handle, self.fs.open_file(&path, flags, 0));
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        prv!("read", ino, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        rep!(reply, path, self.path_of(ino));
        let mut data = vec![0u8; size as usize];
        rep!(reply, n, self.fs.read(&path, &mut data, offset as u64));
        reply.data(&data[..n]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        prv!("write", ino, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        rep!(reply, written, self.fs.write_file(handle, data, offset as u64));
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        rep!(reply, self.fs.flush_file(handle));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = match self.handles.remove(&fh) {
            Some(handle) => handle,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        rep!(reply, self.fs.close_file(handle));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        rep!(reply, self.fs.fsync_file(handle, datasync));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if ino != FUSE_ROOT_INO {
            rep!(reply, path, self.path_of(ino));
            rep!(reply, info, self.fs.stat(&path));
            if !is_dir(info.mode) {
                reply.error(libc::ENOTDIR);
                return;
            }
        }
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        prv!("readdir", ino, offset);
        rep!(reply, path, self.path_of(ino));
        let parent_ino = if path == "/" {
            FUSE_ROOT_INO
        } else {
            match crate::afs_lib::mem::split_parent(&path) {
                Some((parent, _)) if parent != "/" => match self.fs.stat(&parent) {
                    Ok(info) => info.inode_id + 1,
                    Err(_) => FUSE_ROOT_INO,
                },
                _ => FUSE_ROOT_INO,
            }
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        rep!(
            reply,
            self.fs.iterate_children(&path, |name, info| {
                let kind = if is_dir(info.mode) {
                    FileType::Directory
                } else if is_symlink(info.mode) {
                    FileType::Symlink
                } else {
                    FileType::RegularFile
                };
                entries.push((info.inode_id + 1, kind, name.to_string()));
                true
            })
        );
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        rep!(reply, self.fs.fsyncdir());
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        rep!(reply, st, self.fs.statfs());
        reply.statfs(
            st.blocks(),
            st.blocks_free(),
            st.blocks_available(),
            st.files(),
            st.files_free(),
            st.block_size() as u32,
            st.name_max() as u32,
            st.fragment_size() as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        rep!(reply, path, self.path_of(ino));
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, self.fs.set_xattr(&path, name, value, flags));
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        rep!(reply, path, self.path_of(ino));
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, len, self.fs.get_xattr(&path, name, None));
        if size == 0 {
            reply.size(len as u32);
        } else if len as u32 <= size {
            let mut buf = vec![0u8; len];
            rep!(reply, self.fs.get_xattr(&path, name, Some(&mut buf)));
            reply.data(&buf);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        rep!(reply, path, self.path_of(ino));
        rep!(reply, total, self.fs.list_xattr(&path, None));
        if size == 0 {
            reply.size(total as u32);
        } else if total as u32 <= size {
            let mut buf = vec![0u8; total];
            rep!(reply, self.fs.list_xattr(&path, Some(&mut buf)));
            reply.data(&buf);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        rep!(reply, path, self.path_of(ino));
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        rep!(reply, self.fs.remove_xattr(&path, name));
        reply.ok();
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        rep!(reply, attr, self.attr_of(ino, req));
        let mode = attr.perm as u32;
        if mask & libc::R_OK != 0 && mode & 0o400 == 0 {
            reply.error(libc::EACCES);
            return;
        }
        if mask & libc::W_OK != 0 && mode & 0o200 == 0 {
            reply.error(libc::EACCES);
            return;
        }
        if mask & libc::X_OK != 0 && mode & 0o100 == 0 {
            reply.error(libc::EACCES);
            return;
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        prv!("create", parent, name, mode);
        rep!(reply, parent_path, self.path_of(parent));
        rep!(reply, path, Self::join_path(&parent_path, name));
        rep!(
            reply,
            handle,
            self.fs.open_file(&path, flags | libc::O_CREAT, mode)
        );
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        rep!(reply, info, self.fs.stat(&path));
        reply.created(&TTL, &Self::to_attr(&info, req), 0, fh, 0);
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let whence = match Whence::from_raw(whence) {
            Some(whence) => whence,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        rep!(reply, pos, self.fs.seek_file(handle, offset, whence));
        reply.offset(pos as i64);
    }
}
