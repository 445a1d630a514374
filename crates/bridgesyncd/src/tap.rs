//! Virtual device multiplexer: one TUN/TAP device per announced switch
//! port.
//!
//! Frames read from a tap (kernel transmitting out the port) are relayed
//! to the switch as packet-out; frames the switch punts up are queued to
//! the tap's I/O task and written out. Each device gets its own task on
//! an `AsyncFd`, so one wedged tap cannot stall the others. Must be used
//! from within the tokio runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use swbridge_types::{DriverStatus, PacketBuffer, PacketPool, PortId, SwitchDriver};

use crate::error::Result;

/// Ethernet header plus one VLAN tag on top of the link MTU.
const FRAME_OVERHEAD: usize = 18;
const DEFAULT_MTU: usize = 1500;

type DriverSlot = Arc<RwLock<Option<Arc<dyn SwitchDriver>>>>;

struct TapDevice {
    name: String,
    mtu: Arc<AtomicUsize>,
    outbound: mpsc::UnboundedSender<PacketBuffer>,
}

pub struct TapManager {
    pool: Arc<PacketPool>,
    driver: DriverSlot,
    devices: Mutex<HashMap<PortId, TapDevice>>,
}

impl TapManager {
    pub fn new(pool: Arc<PacketPool>) -> Self {
        Self {
            pool,
            driver: Arc::new(RwLock::new(None)),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the packet-out destination for inbound frames.
    pub fn set_driver(&self, driver: Arc<dyn SwitchDriver>) {
        *self.driver.write() = Some(driver);
    }

    /// Creates the tap device for an announced port and starts its I/O
    /// task.
    #[cfg(target_os = "linux")]
    pub fn create_dev(&self, port: PortId, name: &str) -> Result<()> {
        let fd = linux::open_tap(name)?;
        let async_fd = tokio::io::unix::AsyncFd::new(fd)
            .map_err(crate::error::BridgesyncError::Io)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mtu = Arc::new(AtomicUsize::new(DEFAULT_MTU));
        self.devices.lock().insert(
            port,
            TapDevice {
                name: name.to_string(),
                mtu: mtu.clone(),
                outbound: tx,
            },
        );

        info!(port, name, "created tap device");
        tokio::spawn(linux::tap_io(
            port,
            async_fd,
            rx,
            self.pool.clone(),
            self.driver.clone(),
            mtu,
        ));
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create_dev(&self, port: PortId, name: &str) -> Result<()> {
        debug!(port, name, "tap devices unsupported on this platform, frames will be dropped");
        let (tx, _rx) = mpsc::unbounded_channel();
        self.devices.lock().insert(
            port,
            TapDevice {
                name: name.to_string(),
                mtu: Arc::new(AtomicUsize::new(DEFAULT_MTU)),
                outbound: tx,
            },
        );
        Ok(())
    }

    /// Tears down the device for a withdrawn port. Dropping the sender
    /// makes the I/O task drain its backlog back to the pool and exit.
    pub fn destroy_dev(&self, port: PortId) {
        if let Some(device) = self.devices.lock().remove(&port) {
            info!(port, name = %device.name, "destroyed tap device");
        }
    }

    /// Bounds the tap read size from kernel link MTU updates.
    pub fn set_mtu(&self, port: PortId, mtu: u32) {
        let devices = self.devices.lock();
        let Some(device) = devices.get(&port) else {
            return;
        };
        debug!(port, mtu, "tap mtu updated");
        device.mtu.store(mtu as usize, Ordering::Relaxed);
    }

    pub fn name_of(&self, port: PortId) -> Option<String> {
        self.devices.lock().get(&port).map(|d| d.name.clone())
    }

    /// Hands a frame punted by the switch to the port's tap device.
    pub fn enqueue(&self, port: PortId, buffer: PacketBuffer) -> DriverStatus {
        let devices = self.devices.lock();
        let Some(device) = devices.get(&port) else {
            drop(devices);
            debug!(port, "frame for port without a tap device, dropping");
            self.pool.release(buffer);
            return DriverStatus::NotFound;
        };
        if let Err(rejected) = device.outbound.send(buffer) {
            drop(devices);
            self.pool.release(rejected.0);
            return DriverStatus::NotFound;
        }
        DriverStatus::Ok
    }
}

pub(crate) enum WriteOutcome {
    Done,
    WouldBlock,
    Failed,
}

/// Drains the outbound backlog with a non-blocking writer. On
/// would-block the frame goes back to the queue front and `true` is
/// returned so the caller waits for writability again; a hard error
/// drops the whole backlog back to the pool.
pub(crate) fn drain_outbound<W>(
    backlog: &mut VecDeque<PacketBuffer>,
    pool: &PacketPool,
    mut write: W,
) -> bool
where
    W: FnMut(&[u8]) -> WriteOutcome,
{
    while let Some(buffer) = backlog.pop_front() {
        match write(buffer.as_slice()) {
            WriteOutcome::Done => pool.release(buffer),
            WriteOutcome::WouldBlock => {
                backlog.push_front(buffer);
                return true;
            }
            WriteOutcome::Failed => {
                warn!(dropped = backlog.len() + 1, "tap write failed, dropping backlog");
                pool.release(buffer);
                while let Some(buffer) = backlog.pop_front() {
                    pool.release(buffer);
                }
                return false;
            }
        }
    }
    false
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use tokio::io::unix::AsyncFd;
    use tracing::warn;

    use super::*;
    use crate::error::BridgesyncError;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    pub(super) fn open_tap(name: &str) -> Result<OwnedFd> {
        let raw = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK,
            )
        };
        if raw < 0 {
            return Err(BridgesyncError::Io(std::io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
            return Err(BridgesyncError::Io(std::io::Error::last_os_error()));
        }
        Ok(fd)
    }

    pub(super) async fn tap_io(
        port: PortId,
        fd: AsyncFd<OwnedFd>,
        mut outbound: mpsc::UnboundedReceiver<PacketBuffer>,
        pool: Arc<PacketPool>,
        driver: DriverSlot,
        mtu: Arc<AtomicUsize>,
    ) {
        let raw = fd.get_ref().as_raw_fd();
        let mut backlog: VecDeque<PacketBuffer> = VecDeque::new();

        loop {
            tokio::select! {
                guard = fd.readable() => {
                    let Ok(mut guard) = guard else { break };
                    read_ready(port, raw, &mut guard, &pool, &driver, &mtu);
                }
                guard = fd.writable(), if !backlog.is_empty() => {
                    let Ok(mut guard) = guard else { break };
                    let would_block = drain_outbound(&mut backlog, &pool, |frame| {
                        let n = unsafe {
                            libc::write(raw, frame.as_ptr() as *const libc::c_void, frame.len())
                        };
                        if n >= 0 {
                            WriteOutcome::Done
                        } else if would_block_errno() {
                            WriteOutcome::WouldBlock
                        } else {
                            WriteOutcome::Failed
                        }
                    });
                    if would_block {
                        guard.clear_ready();
                    }
                }
                frame = outbound.recv() => {
                    match frame {
                        Some(buffer) => backlog.push_back(buffer),
                        None => break, // device destroyed
                    }
                }
            }
        }

        while let Some(buffer) = backlog.pop_front() {
            pool.release(buffer);
        }
    }

    fn read_ready(
        port: PortId,
        raw: i32,
        guard: &mut tokio::io::unix::AsyncFdReadyGuard<'_, OwnedFd>,
        pool: &Arc<PacketPool>,
        driver: &DriverSlot,
        mtu: &Arc<AtomicUsize>,
    ) {
        loop {
            let mut buffer = match pool.acquire() {
                Ok(buffer) => buffer,
                Err(_) => {
                    // keep consuming so the fd does not stay readable forever
                    warn!(port, "packet pool exhausted, dropping inbound frame");
                    let mut scratch = [0u8; 2048];
                    let n = unsafe {
                        libc::read(raw, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
                    };
                    if n < 0 && would_block_errno() {
                        guard.clear_ready();
                    }
                    return;
                }
            };

            let limit = (mtu.load(Ordering::Relaxed) + FRAME_OVERHEAD).min(buffer.capacity());
            let n = unsafe {
                libc::read(
                    raw,
                    buffer.storage_mut().as_mut_ptr() as *mut libc::c_void,
                    limit,
                )
            };
            if n < 0 {
                pool.release(buffer);
                if would_block_errno() {
                    guard.clear_ready();
                } else {
                    warn!(port, error = %std::io::Error::last_os_error(), "tap read failed");
                }
                return;
            }
            buffer.set_len(n as usize);

            let current = driver.read().clone();
            match current {
                Some(driver) => {
                    driver.enqueue(port, buffer);
                }
                None => pool.release(buffer),
            }
        }
    }

    fn would_block_errno() -> bool {
        std::io::Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock
    }
}
