pub mod afs_lib;

use lazy_static::lazy_static;
use mut_static::MutStatic;
pub use afs_lib::*;

lazy_static! {
    // Static launch arguments, read back from the signal handler and
    // the FUSE init callback.
    pub static ref MOUNT_POINT: MutStatic<String> = MutStatic::new();
    pub static ref STORE_ROOT: MutStatic<String> = MutStatic::new();
    pub static ref WRITE_BUFFER_SIZE: MutStatic<usize> = MutStatic::new();
}
