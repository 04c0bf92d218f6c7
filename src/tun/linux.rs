/// Linux tun device via /dev/net/tun
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tracing::info;

use super::{TunConfig, TunDevice, TunProvider};
use crate::error::{GarmError, Result};

const TUN_DEVICE: &[u8] = b"/dev/net/tun\0";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
union IfrIfru {
    ifru_flags: libc::c_short,
    ifru_mtu: libc::c_int,
    _pad: [u8; 24],
}

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_uchar; libc::IFNAMSIZ],
    ifr_ifru: IfrIfru,
}

impl IfReq {
    fn with_name(name: &str) -> io::Result<IfReq> {
        if name.as_bytes().len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }

        let mut ifr_name = [0; libc::IFNAMSIZ];
        for (dst, src) in ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src;
        }

        Ok(IfReq {
            ifr_name,
            ifr_ifru: IfrIfru { _pad: [0; 24] },
        })
    }
}

/// Owns the raw tunnel fd; closed on drop.
#[derive(Debug)]
struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl TunFd {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match unsafe { libc::read(self.0, buf.as_mut_ptr() as _, buf.len()) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match unsafe { libc::write(self.0, buf.as_ptr() as _, buf.len()) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }
}

pub struct LinuxTun {
    fd: AsyncFd<TunFd>,
    name: String,
}

impl LinuxTun {
    /// Create the tun interface and claim its fd.
    pub fn open(config: &TunConfig) -> io::Result<LinuxTun> {
        let fd = match unsafe { libc::open(TUN_DEVICE.as_ptr() as _, libc::O_RDWR) } {
            -1 => return Err(io::Error::last_os_error()),
            fd => TunFd(fd),
        };

        let mut ifr = IfReq::with_name(&config.name)?;
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
        if unsafe { libc::ioctl(fd.0, TUNSETIFF as _, &ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(fd.0)?;
        set_mtu(&config.name, config.mtu)?;

        Ok(LinuxTun {
            fd: AsyncFd::new(fd)?,
            name: config.name.clone(),
        })
    }

    /// Wrap an fd handed over by the host VPN facility. The fd must
    /// already be attached to a tun interface.
    pub fn from_raw_fd(fd: RawFd, name: impl Into<String>) -> io::Result<LinuxTun> {
        set_nonblocking(fd)?;
        Ok(LinuxTun {
            fd: AsyncFd::new(TunFd(fd))?,
            name: name.into(),
        })
    }
}

impl TunDevice for LinuxTun {
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.fd.get_ref().read(buf)
    }

    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.fd.get_ref().write(buf)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_mtu(name: &str, mtu: u16) -> io::Result<()> {
    let sock = match unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) } {
        -1 => return Err(io::Error::last_os_error()),
        fd => fd,
    };

    let mut ifr = IfReq::with_name(name)?;
    ifr.ifr_ifru.ifru_mtu = mtu as libc::c_int;

    let rc = unsafe { libc::ioctl(sock, libc::SIOCSIFMTU as _, &ifr) };
    unsafe { libc::close(sock) };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Opens tun interfaces on the local host.
///
/// Address, route and per-app assignment belong to the platform's
/// tunnel builder; this provider only creates the interface, sets the
/// MTU and hands the fd to the engine.
#[derive(Debug, Default)]
pub struct LinuxTunProvider;

impl TunProvider for LinuxTunProvider {
    fn open(&self, config: &TunConfig) -> Result<Arc<dyn TunDevice>> {
        let tun = LinuxTun::open(config)
            .map_err(|e| GarmError::Tunnel(format!("failed to open {}: {e}", config.name)))?;

        info!(
            "Tunnel {} up: mtu {}, {}/{} via {}, ipv6 {}",
            config.name,
            config.mtu,
            config.ipv4_network.0,
            config.ipv4_network.1,
            config.gateway4,
            if config.ipv6_enabled { "on" } else { "off" },
        );

        Ok(Arc::new(tun))
    }
}
