//! Renesas DRP-AI driver backend (`/dev/drpai0`).

use super::{AcceleratorDevice, AcceleratorProvider, Region, RegionTable};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

const STATUS_RUN: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrpaiStatus {
    pub status: u32,
    pub err: u32,
    pub reserved: [u32; 10],
}

mod ioctl {
    use super::*;

    nix::ioctl_write_ptr!(assign, 46, 0, Region);
    nix::ioctl_write_ptr!(start, 46, 1, Region);
    nix::ioctl_none!(reset, 46, 2);
    nix::ioctl_read!(get_status, 46, 3, DrpaiStatus);
    nix::ioctl_readwrite!(get_area, 46, 9, Region);
}

/// Runs an ioctl, retrying while it is interrupted by a signal.
fn xioctl<F>(mut call: F) -> io::Result<()>
where
    F: FnMut() -> nix::Result<i32>,
{
    loop {
        match call() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub struct DrpaiDevice {
    file: File,
}

impl DrpaiDevice {
    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

impl Read for DrpaiDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DrpaiDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl AcceleratorDevice for DrpaiDevice {
    fn area(&mut self) -> io::Result<Region> {
        let mut area = Region::default();
        xioctl(|| unsafe { ioctl::get_area(self.fd(), &mut area) })?;
        Ok(area)
    }

    fn assign(&mut self, region: Region) -> io::Result<()> {
        xioctl(|| unsafe { ioctl::assign(self.fd(), &region) })
    }

    fn start(&mut self, regions: &RegionTable) -> io::Result<()> {
        // the driver reads the whole table through the pointer
        xioctl(|| unsafe { ioctl::start(self.fd(), regions.as_ptr()) })
    }

    fn is_running(&mut self) -> io::Result<bool> {
        let mut status = DrpaiStatus::default();
        match xioctl(|| unsafe { ioctl::get_status(self.fd(), &mut status) }) {
            Ok(()) => Ok(status.err == 0 && status.status == STATUS_RUN),
            Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn reset(&mut self) -> io::Result<()> {
        xioctl(|| unsafe { ioctl::reset(self.fd()) })
    }
}

#[derive(Debug, Clone)]
pub struct DrpaiProvider {
    path: PathBuf,
}

impl DrpaiProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AcceleratorProvider for DrpaiProvider {
    type Device = DrpaiDevice;

    fn open(&self) -> io::Result<DrpaiDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        Ok(DrpaiDevice { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        assert_eq!(std::mem::size_of::<Region>(), 8);
        assert_eq!(std::mem::size_of::<DrpaiStatus>(), 48);
    }

    #[test]
    fn test_missing_device() {
        let provider = DrpaiProvider::new("/dev/drpai-does-not-exist");
        assert!(provider.open().is_err());
    }
}
