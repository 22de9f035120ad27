//! Extended attribute storage on an inode.

use crate::afs_lib::mem::{Inode, Xattr};
use crate::afs_lib::AfsError;

pub const XATTR_CREATE: i32 = libc::XATTR_CREATE;
pub const XATTR_REPLACE: i32 = libc::XATTR_REPLACE;

/// Insert or overwrite an attribute, honoring the create/replace flags.
/// Both flags at once keep both checks live: an existing name fails
/// `Exists`, a missing one fails `NoData`.
pub fn set_xattr(inode: &mut Inode, name: &str, value: &[u8], flags: i32) -> Result<(), AfsError> {
    let existing = inode.find_xattr(name);
    if flags & XATTR_CREATE != 0 && existing.is_some() {
        return Err(AfsError::Exists);
    }
    if flags & XATTR_REPLACE != 0 && existing.is_none() {
        return Err(AfsError::NoData);
    }
    match existing {
        Some(index) => inode.xattrs[index].value = value.to_vec(),
        None => inode.xattrs.push(Xattr {
            name: name.to_string(),
            value: value.to_vec(),
        }),
    }
    Ok(())
}

pub fn remove_xattr(inode: &mut Inode, name: &str) -> Result<(), AfsError> {
    match inode.find_xattr(name) {
        Some(index) => {
            inode.xattrs.remove(index);
            Ok(())
        }
        None => Err(AfsError::NoData),
    }
}
