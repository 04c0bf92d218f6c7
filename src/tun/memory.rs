/// In-memory tunnel pair
///
/// Behaves like a tun fd from the engine's side: the paired handle
/// plays the role of the client apps, injecting outbound frames and
/// observing what the engine writes back.
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{TunConfig, TunDevice, TunProvider};
use crate::error::{GarmError, Result};

pub const DEFAULT_QUEUE: usize = 64;

pub struct MemoryTun {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    name: String,
}

/// The app side of the pair.
pub struct MemoryTunHandle {
    /// Frames the "apps" send into the tunnel.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Frames the engine wrote back to the "apps".
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Create a connected device/handle pair.
pub fn pair(queue: usize) -> (Arc<MemoryTun>, MemoryTunHandle) {
    let (app_tx, engine_rx) = mpsc::channel(queue);
    let (engine_tx, app_rx) = mpsc::channel(queue);

    let device = Arc::new(MemoryTun {
        inbound: Mutex::new(engine_rx),
        outbound: engine_tx,
        name: "memtun0".to_string(),
    });

    (
        device,
        MemoryTunHandle {
            tx: app_tx,
            rx: app_rx,
        },
    )
}

fn copy_frame(frame: &[u8], buf: &mut [u8]) -> usize {
    let n = frame.len().min(buf.len());
    buf[..n].copy_from_slice(&frame[..n]);
    n
}

impl TunDevice for MemoryTun {
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.inbound.lock().poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Ok(copy_frame(&frame, buf))),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.lock().try_recv() {
            Ok(frame) => Ok(copy_frame(&frame, buf)),
            Err(mpsc::error::TryRecvError::Empty) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame queued"))
            }
            Err(mpsc::error::TryRecvError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel closed",
            )),
        }
    }

    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.outbound.try_send(buf.to_vec()) {
            Ok(()) => Ok(buf.len()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel closed",
            )),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Hands out a pre-built [`MemoryTun`], recording the tunnel
/// parameters it was asked for.
pub struct MemoryTunProvider {
    device: Arc<MemoryTun>,
    last_config: Mutex<Option<TunConfig>>,
    opens: AtomicUsize,
}

impl MemoryTunProvider {
    pub fn new(device: Arc<MemoryTun>) -> Self {
        Self {
            device,
            last_config: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn last_config(&self) -> Option<TunConfig> {
        self.last_config.lock().clone()
    }

    /// How many times the engine asked for a tunnel.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl TunProvider for MemoryTunProvider {
    fn open(&self, config: &TunConfig) -> Result<Arc<dyn TunDevice>> {
        *self.last_config.lock() = Some(config.clone());
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(self.device.clone())
    }
}

/// A provider that always fails, for exercising start failures.
pub struct FailingTunProvider;

impl TunProvider for FailingTunProvider {
    fn open(&self, _config: &TunConfig) -> Result<Arc<dyn TunDevice>> {
        Err(GarmError::Tunnel("tunnel facility unavailable".to_string()))
    }
}
