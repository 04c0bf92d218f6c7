/// Tunnel device abstraction
///
/// Reads yield outbound IP packets from apps, writes inject IP
/// packets back to apps. The OS owns interface configuration; the
/// engine only pumps frames through the fd it was handed.
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::config::{AppInclusion, ConfigSnapshot};
use crate::error::Result;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

pub const DEFAULT_MTU: u16 = 1500;

/// Parameters handed to the OS tunnel builder.
///
/// The app inclusion set is opaque input to tunnel construction and
/// never consulted by the data plane.
#[derive(Debug, Clone)]
pub struct TunConfig {
    pub name: String,
    pub mtu: u16,
    pub ipv4_network: (Ipv4Addr, u8),
    /// The engine's own address; also the DNS server pushed to apps.
    pub gateway4: Ipv4Addr,
    pub ipv6_enabled: bool,
    pub ipv6_network: (Ipv6Addr, u8),
    pub gateway6: Ipv6Addr,
    pub app_inclusion: AppInclusion,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "garm0".to_string(),
            mtu: DEFAULT_MTU,
            ipv4_network: (Ipv4Addr::new(10, 0, 0, 0), 24),
            gateway4: Ipv4Addr::new(10, 0, 0, 1),
            ipv6_enabled: false,
            ipv6_network: (Ipv6Addr::new(0xfd00, 0x6761, 0x726d, 0, 0, 0, 0, 0), 64),
            gateway6: Ipv6Addr::new(0xfd00, 0x6761, 0x726d, 0, 0, 0, 0, 1),
            app_inclusion: AppInclusion::default(),
        }
    }
}

impl TunConfig {
    pub fn from_snapshot(config: &ConfigSnapshot, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ipv6_enabled: config.ipv6_enabled,
            app_inclusion: config.app_inclusion.clone(),
            ..Self::default()
        }
    }
}

/// A tunnel endpoint the pump can poll.
///
/// All operations are non-blocking; `poll_recv` integrates with the
/// runtime's readiness machinery.
pub trait TunDevice: Send + Sync + 'static {
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Read one frame without waiting. `WouldBlock` when none is
    /// queued.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame without waiting. `WouldBlock` when the device
    /// cannot take it; the caller drops the frame.
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;

    fn name(&self) -> &str;
}

/// Await the next frame from the device.
pub async fn recv(device: &dyn TunDevice, buf: &mut [u8]) -> io::Result<usize> {
    std::future::poll_fn(|cx| device.poll_recv(cx, buf)).await
}

/// Obtains tunnel devices from the host OS VPN facility.
pub trait TunProvider: Send + Sync + 'static {
    fn open(&self, config: &TunConfig) -> Result<Arc<dyn TunDevice>>;
}
