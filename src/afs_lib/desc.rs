//! On-log record formats.
//!
//! The metadata log is a flat stream of records, each framed by a 9-byte
//! header: type byte, payload length and a CRC32 of the payload, both
//! little-endian. There is no magic and no format version; the replay
//! loop tolerates a torn tail and skips single damaged records.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::afs_lib::utils::crc32;

pub const RECORD_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RecordKind {
    Create = 1,
    Extent = 2,
    Truncate = 3,
    Unlink = 4,
    Rename = 5,
    Mkdir = 6,
    SetXattr = 7,
    RemoveXattr = 8,
    Times = 9,
}

#[derive(AsBytes, FromBytes, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct RecordHeader {
    pub kind: u8,
    pub length: U32<LittleEndian>,
    pub checksum: U32<LittleEndian>,
}

impl RecordHeader {
    pub fn new(kind: RecordKind, payload: &[u8]) -> Self {
        Self {
            kind: kind.into(),
            length: U32::new(payload.len() as u32),
            checksum: U32::new(crc32(payload)),
        }
    }
}

/// CREATE and MKDIR share one payload layout; the type byte carries the
/// intent. The symlink target trails the path iff the mode says symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub inode_id: u64,
    pub mode: u32,
    pub size: u64,
    pub ts: u64,
    pub path: String,
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Create(NodeRecord),
    Mkdir(NodeRecord),
    Extent {
        inode_id: u64,
        logical: u64,
        data_offset: u64,
        length: u32,
        new_size: u64,
    },
    Truncate {
        inode_id: u64,
        new_size: u64,
    },
    Unlink {
        inode_id: u64,
    },
    Rename {
        inode_id: u64,
        path: String,
    },
    SetXattr {
        inode_id: u64,
        name: String,
        value: Vec<u8>,
    },
    RemoveXattr {
        inode_id: u64,
        name: String,
    },
    Times {
        inode_id: u64,
        atime: i64,
        mtime: i64,
    },
}

pub fn is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

pub fn is_symlink(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFLNK
}

pub fn is_regular(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

struct PayloadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn take_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn take_i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn take_string(&mut self, n: usize) -> Option<String> {
        self.take(n)
            .and_then(|b| String::from_utf8(b.to_vec()).ok())
    }
}

fn encode_node(payload: &mut Vec<u8>, node: &NodeRecord) {
    payload.extend_from_slice(&node.inode_id.to_le_bytes());
    payload.extend_from_slice(&node.mode.to_le_bytes());
    payload.extend_from_slice(&node.size.to_le_bytes());
    payload.extend_from_slice(&node.ts.to_le_bytes());
    payload.extend_from_slice(&(node.path.len() as u32).to_le_bytes());
    payload.extend_from_slice(node.path.as_bytes());
    if is_symlink(node.mode) {
        if let Some(target) = &node.symlink_target {
            payload.extend_from_slice(&(target.len() as u32).to_le_bytes());
            payload.extend_from_slice(target.as_bytes());
        }
    }
}

fn decode_node(payload: &[u8]) -> Option<NodeRecord> {
    let mut cur = PayloadCursor::new(payload);
    let inode_id = cur.take_u64()?;
    let mode = cur.take_u32()?;
    let size = cur.take_u64()?;
    let ts = cur.take_u64()?;
    let path_len = cur.take_u32()? as usize;
    let path = cur.take_string(path_len)?;
    // A symlink record may legitimately end before the target; in that
    // case the target stays unset rather than failing the record.
    let mut symlink_target = None;
    if is_symlink(mode) {
        if let Some(target_len) = cur.take_u32() {
            symlink_target = cur.take_string(target_len as usize);
        }
    }
    Some(NodeRecord {
        inode_id,
        mode,
        size,
        ts,
        path,
        symlink_target,
    })
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Create(_) => RecordKind::Create,
            Record::Mkdir(_) => RecordKind::Mkdir,
            Record::Extent { .. } => RecordKind::Extent,
            Record::Truncate { .. } => RecordKind::Truncate,
            Record::Unlink { .. } => RecordKind::Unlink,
            Record::Rename { .. } => RecordKind::Rename,
            Record::SetXattr { .. } => RecordKind::SetXattr,
            Record::RemoveXattr { .. } => RecordKind::RemoveXattr,
            Record::Times { .. } => RecordKind::Times,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut payload = vec![];
        match self {
            Record::Create(node) | Record::Mkdir(node) => encode_node(&mut payload, node),
            Record::Extent {
                inode_id,
                logical,
                data_offset,
                length,
                new_size,
            } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
                payload.extend_from_slice(&logical.to_le_bytes());
                payload.extend_from_slice(&data_offset.to_le_bytes());
                payload.extend_from_slice(&length.to_le_bytes());
                payload.extend_from_slice(&new_size.to_le_bytes());
            }
            Record::Truncate { inode_id, new_size } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
                payload.extend_from_slice(&new_size.to_le_bytes());
            }
            Record::Unlink { inode_id } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
            }
            Record::Rename { inode_id, path } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
                payload.extend_from_slice(&(path.len() as u32).to_le_bytes());
                payload.extend_from_slice(path.as_bytes());
            }
            Record::SetXattr {
                inode_id,
                name,
                value,
            } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
                payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
                payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                payload.extend_from_slice(name.as_bytes());
                payload.extend_from_slice(value);
            }
            Record::RemoveXattr { inode_id, name } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
                payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
                payload.extend_from_slice(name.as_bytes());
            }
            Record::Times {
                inode_id,
                atime,
                mtime,
            } => {
                payload.extend_from_slice(&inode_id.to_le_bytes());
                payload.extend_from_slice(&atime.to_le_bytes());
                payload.extend_from_slice(&mtime.to_le_bytes());
            }
        }
        payload
    }

    /// Decode a checksummed payload. `None` means the payload is too
    /// short or malformed for its type; replay skips such records.
    pub fn decode(kind: RecordKind, payload: &[u8]) -> Option<Record> {
        match kind {
            RecordKind::Create => decode_node(payload).map(Record::Create),
            RecordKind::Mkdir => decode_node(payload).map(Record::Mkdir),
            RecordKind::Extent => {
                let mut cur = PayloadCursor::new(payload);
                Some(Record::Extent {
                    inode_id: cur.take_u64()?,
                    logical: cur.take_u64()?,
                    data_offset: cur.take_u64()?,
                    length: cur.take_u32()?,
                    new_size: cur.take_u64()?,
                })
            }
            RecordKind::Truncate => {
                let mut cur = PayloadCursor::new(payload);
                Some(Record::Truncate {
                    inode_id: cur.take_u64()?,
                    new_size: cur.take_u64()?,
                })
            }
            RecordKind::Unlink => {
                let mut cur = PayloadCursor::new(payload);
                Some(Record::Unlink {
                    inode_id: cur.take_u64()?,
                })
            }
            RecordKind::Rename => {
                let mut cur = PayloadCursor::new(payload);
                let inode_id = cur.take_u64()?;
                let path_len = cur.take_u32()? as usize;
                Some(Record::Rename {
                    inode_id,
                    path: cur.take_string(path_len)?,
                })
            }
            RecordKind::SetXattr => {
                let mut cur = PayloadCursor::new(payload);
                let inode_id = cur.take_u64()?;
                let name_len = cur.take_u32()? as usize;
                let value_len = cur.take_u32()? as usize;
                let name = cur.take_string(name_len)?;
                let value = cur.take(value_len)?.to_vec();
                Some(Record::SetXattr {
                    inode_id,
                    name,
                    value,
                })
            }
            RecordKind::RemoveXattr => {
                let mut cur = PayloadCursor::new(payload);
                let inode_id = cur.take_u64()?;
                let name_len = cur.take_u32()? as usize;
                Some(Record::RemoveXattr {
                    inode_id,
                    name: cur.take_string(name_len)?,
                })
            }
            RecordKind::Times => {
                let mut cur = PayloadCursor::new(payload);
                Some(Record::Times {
                    inode_id: cur.take_u64()?,
                    atime: cur.take_i64()?,
                    mtime: cur.take_i64()?,
                })
            }
        }
    }
}
