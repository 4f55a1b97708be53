use std::ffi::c_void;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;

use super::TunDevice;

/// A tunnel backed by an already-opened descriptor (a `/dev/net/tun` fd or
/// one handed over by a VPN service). Device acquisition and routing setup
/// stay with the caller; this adapter only does datagram I/O.
///
/// The descriptor is switched to non-blocking; EAGAIN is retried after a
/// short async sleep so the hosting task stays cooperative.
pub struct FdTun {
    fd: OwnedFd,
}

impl FdTun {
    /// Take ownership of `fd`. The fd is closed when the device is dropped.
    ///
    /// # Safety-adjacent contract
    /// `fd` must be an open descriptor that yields one IP datagram per read;
    /// the caller must not use it afterwards.
    pub fn from_raw_fd(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            anyhow::bail!("invalid tun fd: {fd}");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self { fd })
    }
}

const RETRY_DELAY: Duration = Duration::from_millis(2);

#[async_trait]
impl TunDevice for FdTun {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            anyhow::bail!("tun read buffer is empty");
        }

        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<c_void>(),
                    buf.len(),
                )
            };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                anyhow::bail!("tun fd reached end of stream");
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => sleep(RETRY_DELAY).await,
                _ => anyhow::bail!("read(tun) failed: {err}"),
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // A tun write either takes the whole datagram or fails; partial
        // writes do not occur on packet-oriented fds.
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast::<c_void>(),
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => sleep(RETRY_DELAY).await,
                _ => anyhow::bail!("write(tun) failed: {err}"),
            }
        }
    }
}
