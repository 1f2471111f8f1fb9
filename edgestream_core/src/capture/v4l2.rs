//! V4L2 memory-mapped streaming backend on top of the `v4l` crate.
//!
//! Negotiation goes through `v4l::Device` and `video::Capture`. Buffers are
//! queued and dequeued one by one with the crate's raw ioctl wrapper, since
//! a checked-out frame must stay out of the driver until the session hands
//! it back.

use super::{Capability, DequeuedBuffer, DeviceProvider, Resolution, VideoDevice};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use v4l::buffer::Type;
use v4l::format::FieldOrder;
use v4l::framesize::FrameSizeEnum;
use v4l::memory::Memory;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

pub const YUYV: &[u8; 4] = b"YUYV";

/// Runs a raw V4L2 ioctl, retrying while it is interrupted by a signal.
fn xioctl<T>(fd: i32, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        match unsafe { v4l::v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) } {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

/// A shared, read-write mapping of one driver buffer.
pub struct MmapRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

impl MmapRegion {
    fn map(fd: BorrowedFd<'_>, len: usize, offset: u32) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset as _,
            )
        }?;
        Ok(Self { ptr, len })
    }
}

impl AsRef<[u8]> for MmapRegion {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!(target: "edgestream::capture::v4l2", "munmap failed: {}", e);
        }
    }
}

pub struct V4l2Device {
    device: Device,
}

impl V4l2Device {
    fn fd(&self) -> i32 {
        self.device.handle().fd()
    }

    fn new_buffer(index: u32) -> v4l2_buffer {
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf.index = index;
        buf
    }

    fn stream_type() -> i32 {
        Type::VideoCapture as i32
    }
}

fn version_code((major, minor, patch): (u8, u8, u8)) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8) | patch as u32
}

fn discrete_sizes(sizes: impl IntoIterator<Item = FrameSizeEnum>) -> Vec<Resolution> {
    sizes
        .into_iter()
        .filter_map(|size| match size {
            FrameSizeEnum::Discrete(d) => Some(Resolution::new(d.width, d.height)),
            FrameSizeEnum::Stepwise(_) => None,
        })
        .collect()
}

impl VideoDevice for V4l2Device {
    type Mapping = MmapRegion;

    fn query_capability(&self) -> io::Result<Capability> {
        let caps = self.device.query_caps()?;
        let bits = caps.capabilities.bits();
        Ok(Capability {
            driver: caps.driver,
            card: caps.card,
            version: version_code(caps.version),
            capabilities: bits,
            device_caps: bits,
        })
    }

    fn frame_sizes(&self) -> io::Result<Vec<Resolution>> {
        let sizes = self.device.enum_framesizes(FourCC::new(YUYV))?;
        Ok(discrete_sizes(sizes.into_iter().map(|s| s.size)))
    }

    fn set_format(&mut self, resolution: Resolution) -> io::Result<Resolution> {
        let mut format = Format::new(resolution.width, resolution.height, FourCC::new(YUYV));
        format.field_order = FieldOrder::Progressive;
        let accepted = self.device.set_format(&format)?;
        if accepted.fourcc != FourCC::new(YUYV) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("device delivers {} instead of YUYV", accepted.fourcc),
            ));
        }
        Ok(Resolution::new(accepted.width, accepted.height))
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()> {
        self.device.set_params(&Parameters::with_fps(fps))?;
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        xioctl(self.fd(), vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MmapRegion> {
        let mut buf = Self::new_buffer(index);
        xioctl(self.fd(), vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        let offset = unsafe { buf.m.offset };
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        MmapRegion::map(fd, buf.length as usize, offset)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::new_buffer(index);
        xioctl(self.fd(), vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = Self::new_buffer(0);
        xioctl(self.fd(), vidioc::VIDIOC_DQBUF, &mut buf)?;
        Ok(DequeuedBuffer {
            index: buf.index as usize,
            bytes_used: buf.bytesused as usize,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut kind = Self::stream_type();
        xioctl(self.fd(), vidioc::VIDIOC_STREAMON, &mut kind)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut kind = Self::stream_type();
        xioctl(self.fd(), vidioc::VIDIOC_STREAMOFF, &mut kind)
    }
}

/// `v4l` opens nodes non-blocking, so dequeueing never stalls the loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Provider;

impl DeviceProvider for V4l2Provider {
    type Device = V4l2Device;

    fn open(&self, path: &str) -> io::Result<V4l2Device> {
        Ok(V4l2Device {
            device: Device::with_path(path)?,
        })
    }
}
