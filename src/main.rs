use std::env::set_var;
use std::fs;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use execute::Execute;
use fork::{fork, Fork};
use fuser::MountOption;
use log::*;
use log_device::file::FileLogDevice;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};

use afs::afs_lib::file::DEFAULT_WRITE_BUFFER;
use afs::afs_lib::fuse::AfsFuse;
use afs::afs_lib::utils::init_logs;
use afs::{AppendFs, MOUNT_POINT, STORE_ROOT, WRITE_BUFFER_SIZE};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([mountpoint] "Optional mountpoint to mount on")
            .default_value("tests/mnt"))
        .arg(arg!(-s --store <DIR> "Store root directory holding the data and meta logs")
            .required(false)
            .default_value("store"))
        .arg(arg!(-b --buffer <BYTES> "Write buffer size in bytes (min 4096)")
            .required(false))
        .arg(arg!(-f --front "Keep daemon running in front").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-r --read_only "Mount as read only filesystem").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();
    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let store = matches.get_one::<String>("store").unwrap();
    let path_mountpoint = fs::canonicalize(mountpoint)?;
    let abspath_mountpoint = path_mountpoint
        .to_str()
        .ok_or_else(|| anyhow!("Bad mountpoint path"))?;
    info!("Store root: {}", store);
    STORE_ROOT.set(store.clone()).unwrap();
    MOUNT_POINT.set(abspath_mountpoint.to_string()).unwrap();
    let buffer = match matches.get_one::<String>("buffer") {
        Some(bytes) => bytes.parse::<usize>()?,
        None => DEFAULT_WRITE_BUFFER,
    };
    WRITE_BUFFER_SIZE.set(buffer).unwrap();

    macro_rules! umount {
        () => {
            {
                use log::*;
                info!("Unmounting {}", MOUNT_POINT.read().unwrap().clone());
                let mut command = execute::command_args!("fusermount", "-u", MOUNT_POINT.read().unwrap().clone());
                command.stdout(Stdio::piped());
                let output = command.execute_output().unwrap();
                info!("fusermount output: {}", String::from_utf8(output.stdout).unwrap());
            }
        };
    }

    pub extern "C" fn signal_handler(_: i32) {
        unsafe { println!("[{}] Received signal and will umount.", libc::getpid()); }
        umount!();
        unsafe { println!("[{}] All Done.", libc::getpid()); }
        std::process::exit(0);
    }

    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(signal_handler),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    unsafe {
        match signal::sigaction(signal::SIGINT, &sig_action) {
            Ok(_) => {}
            Err(e) => {
                println!("SIGINT signal set failed, {:?}", e);
            }
        }
    }

    let read_only = matches.get_flag("read_only");
    let options = [
        if read_only { MountOption::RO } else { MountOption::RW },
        MountOption::FSName("afs".to_string()),
    ];
    let retry_times = 3;
    match if matches.get_flag("front") { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("Daemon running at pid: {}", child);
            Ok(())
        }
        Ok(Fork::Child) => {
            match retry_with_index(Fixed::from_millis(100), |current_try| {
                info!("[try {}/{}] Mount to {}", current_try, retry_times, abspath_mountpoint);
                let fs = AppendFs::new(FileLogDevice::new(), FileLogDevice::new());
                let res = fuser::mount2(AfsFuse::new(fs), abspath_mountpoint, &options);
                match res {
                    Ok(_) => {
                        info!("All Done.");
                        OperationResult::Ok(())
                    }
                    Err(e) => {
                        if current_try > retry_times {
                            OperationResult::Err(format!("Failed to mount after {} retries! Err: {}", retry_times, e))
                        } else {
                            umount!();
                            info!("Umount Done.");
                            OperationResult::Retry(format!("Failed to mount, trying to umount..."))
                        }
                    }
                }
            }) {
                Ok(_) => Ok(()),
                Err(e) => Err(anyhow!("Mount failed with {}", e)),
            }
        }
        Err(e) => Err(anyhow!("Fork returns error {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use fuser::Filesystem;

    #[test]
    fn simple_fuse() {
        struct SimpleFuse;
        impl Filesystem for SimpleFuse {}
    }
}
