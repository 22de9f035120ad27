use std::os::raw::c_int;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::afs_lib::AfsError;

/// CRC32, IEEE 802.3 flavor: reflected, polynomial 0xEDB88320,
/// init 0xFFFFFFFF, final xor 0xFFFFFFFF.
const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                0xEDB8_8320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn utc_time(timestamp_seconds: i64) -> SystemTime {
    let naive = NaiveDateTime::from_timestamp_opt(timestamp_seconds, 0)
        .unwrap_or_else(|| NaiveDateTime::from_timestamp_opt(0, 0).unwrap());
    let datetime: DateTime<Utc> = DateTime::from_utc(naive, Utc);
    SystemTime::from(datetime)
}

pub fn init_logs() {
    let _ = env_logger::try_init();
}

/// Convert a core result into the `Result<T, c_int>` shape fuser's
/// `init` wants.
pub fn ret<T>(res: Result<T, AfsError>) -> Result<T, c_int> {
    res.map_err(|e| e.errno())
}

/// Reply with the errno of a failed core call and bail out of the
/// current FUSE callback.
#[macro_export]
macro_rules! rep {
    ($reply:expr, $res:expr) => {
        match $res {
            Ok(v) => v,
            Err(e) => {
                $reply.error(e.errno());
                return;
            }
        }
    };
    ($reply:expr, $name:ident, $res:expr) => {
        let $name = match $res {
            Ok(v) => v,
            Err(e) => {
                $reply.error(e.errno());
                return;
            }
        };
    };
}

#[macro_export]
macro_rules! prv {
    ($($arg:expr),+ $(,)?) => {
        log::debug!("{}", [$(format!("{} = {:?}", stringify!($arg), $arg)),+].join(", "));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // The classic CRC-32/IEEE check string.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty_and_single() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"\x00"), 0xD202_EF8D);
    }

    #[test]
    fn crc32_detects_flip() {
        let a = crc32(b"some record payload");
        let b = crc32(b"some record pbyload");
        assert_ne!(a, b);
    }

    #[test]
    fn utc_time_roundtrip() {
        let t = utc_time(1_700_000_000);
        let back = t
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(back, 1_700_000_000);
    }
}
