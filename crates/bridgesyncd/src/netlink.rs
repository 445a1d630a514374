//! Kernel boundary: rtnetlink socket subscribed to link and neighbor
//! notifications, message parsing into [`NetlinkEvent`]s, dump requests
//! for the periodic resync, and admin-state link changes.

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST,
    };
    use netlink_packet_route::link::{
        AfSpecBridge, BridgeVlanInfoFlags, LinkAttribute, LinkExtentMask, LinkFlags, LinkMessage,
    };
    use netlink_packet_route::neighbour::{NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, trace, warn};

    use swbridge_types::MacAddress;

    use crate::error::{BridgesyncError, Result};
    use crate::types::{BridgeNeighbor, LinkSnapshot, NetlinkEvent, VlanBitmap};

    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_NEIGH: u32 = 3;

    /// Socket receive buffer size for burst loads.
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    /// Netlink socket subscribed to RTNLGRP_LINK and RTNLGRP_NEIGH.
    pub struct NetlinkSocket {
        socket: Socket,
        buffer: Vec<u8>,
        sequence: u32,
    }

    impl NetlinkSocket {
        /// Create and bind the notification socket. Failure here is a
        /// critical initialization error; the daemon must not proceed.
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE).map_err(|e| {
                BridgesyncError::Critical(format!("failed to create netlink socket: {}", e))
            })?;

            let groups = (1 << (RTNLGRP_LINK - 1)) | (1 << (RTNLGRP_NEIGH - 1));
            let addr = SocketAddr::new(0, groups);
            socket.bind(&addr).map_err(|e| {
                BridgesyncError::Critical(format!("failed to bind netlink socket: {}", e))
            })?;

            debug!("netlink socket bound to RTNLGRP_LINK | RTNLGRP_NEIGH");

            let nl_socket = Self {
                socket,
                buffer: vec![0u8; 65536],
                sequence: 0,
            };
            nl_socket.tune_socket();
            Ok(nl_socket)
        }

        fn set_nonblocking(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 {
                    return Err(BridgesyncError::Netlink(
                        "failed to get socket flags".into(),
                    ));
                }
                if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(BridgesyncError::Netlink(
                        "failed to set non-blocking mode".into(),
                    ));
                }
            }
            Ok(())
        }

        /// Large receive buffer plus NETLINK_NO_ENOBUFS so event bursts
        /// do not kill the subscription.
        fn tune_socket(&self) {
            let fd = self.socket.as_raw_fd();
            unsafe {
                let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                ) < 0
                {
                    warn!("failed to set SO_RCVBUF, using default buffer size");
                }

                let enable: libc::c_int = 1;
                if libc::setsockopt(
                    fd,
                    libc::SOL_NETLINK,
                    libc::NETLINK_NO_ENOBUFS,
                    &enable as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                ) < 0
                {
                    warn!("failed to set NETLINK_NO_ENOBUFS");
                }
            }
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }

        fn send_request(&mut self, payload: RouteNetlinkMessage, flags: u16) -> Result<()> {
            let mut header = NetlinkHeader::default();
            header.flags = flags;
            self.sequence = self.sequence.wrapping_add(1);
            header.sequence_number = self.sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| BridgesyncError::Netlink(format!("failed to send request: {}", e)))?;
            Ok(())
        }

        /// Request a dump of all links with bridge VLAN information.
        pub fn request_link_dump(&mut self) -> Result<()> {
            let mut msg = LinkMessage::default();
            msg.header.interface_family = AddressFamily::Bridge;
            msg.attributes
                .push(LinkAttribute::ExtMask(vec![LinkExtentMask::Brvlan]));
            self.send_request(
                RouteNetlinkMessage::GetLink(msg),
                NLM_F_REQUEST | NLM_F_DUMP,
            )?;
            debug!("requested bridge link dump");
            Ok(())
        }

        /// Request a dump of the kernel bridge forwarding database.
        pub fn request_neigh_dump(&mut self) -> Result<()> {
            let mut msg = NeighbourMessage::default();
            msg.header.family = AddressFamily::Bridge;
            self.send_request(
                RouteNetlinkMessage::GetNeighbour(msg),
                NLM_F_REQUEST | NLM_F_DUMP,
            )?;
            debug!("requested bridge fdb dump");
            Ok(())
        }

        /// Issue a kernel link admin up/down change.
        pub fn set_link_admin(&mut self, ifindex: u32, up: bool) -> Result<()> {
            let mut msg = LinkMessage::default();
            msg.header.index = ifindex;
            msg.header.flags = if up { LinkFlags::Up } else { LinkFlags::empty() };
            msg.header.change_mask = LinkFlags::Up;
            self.send_request(RouteNetlinkMessage::SetLink(msg), NLM_F_REQUEST | NLM_F_ACK)?;
            debug!(ifindex, up, "sent link admin change");
            Ok(())
        }

        /// Receive events with non-blocking semantics. `Ok(None)` means
        /// no data was available.
        pub fn try_receive_events(&mut self) -> Result<Option<Vec<NetlinkEvent>>> {
            // recv through a slice so the data always lands at offset 0
            let mut recv_buf = &mut self.buffer[..];
            match self.socket.recv(&mut recv_buf, libc::MSG_DONTWAIT) {
                Ok(len) => Ok(Some(self.parse_buffer(len)?)),
                Err(e) => {
                    let errno = std::io::Error::last_os_error();
                    if errno.raw_os_error() == Some(libc::EAGAIN)
                        || errno.raw_os_error() == Some(libc::EWOULDBLOCK)
                    {
                        Ok(None)
                    } else {
                        Err(BridgesyncError::Netlink(format!("failed to receive: {}", e)))
                    }
                }
            }
        }

        fn parse_buffer(&mut self, len: usize) -> Result<Vec<NetlinkEvent>> {
            let mut events = Vec::new();
            let mut offset = 0;

            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                    &self.buffer[offset..],
                )
                .map_err(|e| {
                    BridgesyncError::Netlink(format!("failed to parse message: {}", e))
                })?;

                if msg.header.length == 0 {
                    return Err(BridgesyncError::Malformed(
                        "zero-length netlink message".into(),
                    ));
                }
                offset += msg.header.length as usize;
                // netlink 4-byte alignment
                offset = (offset + 3) & !3;

                match &msg.payload {
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                        events.push(NetlinkEvent::LinkNew(parse_link(link)));
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                        events.push(NetlinkEvent::LinkDel(link.header.index));
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)) => {
                        if let Some(entry) = parse_neighbour(neigh) {
                            events.push(NetlinkEvent::NeighNew(entry));
                        }
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelNeighbour(neigh)) => {
                        if let Some(entry) = parse_neighbour(neigh) {
                            events.push(NetlinkEvent::NeighDel(entry));
                        }
                    }
                    NetlinkPayload::Done(_) => {
                        events.push(NetlinkEvent::DumpComplete);
                    }
                    NetlinkPayload::Error(err) => {
                        if err.code.is_some() {
                            warn!(error = ?err, "netlink error message");
                        }
                    }
                    _ => {}
                }
            }

            trace!(count = events.len(), "received netlink events");
            Ok(events)
        }
    }

    fn parse_link(msg: &LinkMessage) -> LinkSnapshot {
        let mut name = String::new();
        let mut mac = MacAddress::ZERO;
        let mut mtu = 0;
        let mut master = 0;
        let mut bridge_vlans = None;

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => name = n.clone(),
                LinkAttribute::Address(bytes) => {
                    if let Some(m) = MacAddress::from_bytes(bytes) {
                        mac = m;
                    }
                }
                LinkAttribute::Mtu(v) => mtu = *v,
                LinkAttribute::Controller(v) => master = *v,
                LinkAttribute::AfSpecBridge(nested) => {
                    bridge_vlans = Some(parse_bridge_vlans(nested));
                }
                _ => {}
            }
        }

        LinkSnapshot {
            ifindex: msg.header.index,
            name,
            mac,
            flags: msg.header.flags.bits(),
            mtu,
            master,
            bridge_vlans,
        }
    }

    /// Expand the kernel's vlan_info list (single entries plus
    /// range-begin/range-end pairs) into the bitmap form.
    fn parse_bridge_vlans(attrs: &[AfSpecBridge]) -> VlanBitmap {
        let mut bitmap = VlanBitmap::default();
        let mut range_start: Option<(u16, BridgeVlanInfoFlags)> = None;

        for attr in attrs {
            let AfSpecBridge::VlanInfo(info) = attr else {
                continue;
            };
            if info.flags.contains(BridgeVlanInfoFlags::RangeBegin) {
                range_start = Some((info.vid, info.flags));
                continue;
            }
            let (start, flags) = match range_start.take() {
                Some((start, flags)) if info.flags.contains(BridgeVlanInfoFlags::RangeEnd) => {
                    (start, flags)
                }
                _ => (info.vid, info.flags),
            };
            for vid in start..=info.vid {
                bitmap.set(vid, flags.contains(BridgeVlanInfoFlags::Untagged));
            }
            if info.flags.contains(BridgeVlanInfoFlags::Pvid) {
                bitmap.set_pvid(info.vid);
            }
        }
        bitmap
    }

    /// Bridge FDB entries only; IP neighbors are not our concern.
    fn parse_neighbour(msg: &NeighbourMessage) -> Option<BridgeNeighbor> {
        if msg.header.family != AddressFamily::Bridge {
            return None;
        }
        let mut vlan = 0;
        let mut mac = None;
        for attr in &msg.attributes {
            match attr {
                NeighbourAttribute::Vlan(v) => vlan = *v,
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    mac = MacAddress::from_bytes(bytes);
                }
                _ => {}
            }
        }
        Some(BridgeNeighbor {
            ifindex: msg.header.ifindex,
            vlan,
            mac: mac?,
        })
    }

    /// Async wrapper integrating the socket with the tokio event loop.
    pub struct AsyncNetlinkSocket {
        inner: AsyncFd<OwnedFd>,
        socket: NetlinkSocket,
    }

    impl AsyncNetlinkSocket {
        pub fn new() -> Result<Self> {
            let socket = NetlinkSocket::new()?;
            socket.set_nonblocking()?;

            // dup the fd so the Socket keeps ownership of the original
            let fd = socket.as_raw_fd();
            let owned_fd = unsafe {
                let new_fd = libc::dup(fd);
                if new_fd < 0 {
                    return Err(BridgesyncError::Critical("failed to dup netlink fd".into()));
                }
                OwnedFd::from_raw_fd(new_fd)
            };

            let inner = AsyncFd::new(owned_fd).map_err(|e| {
                BridgesyncError::Critical(format!("failed to create AsyncFd: {}", e))
            })?;

            Ok(Self { inner, socket })
        }

        pub async fn recv_events(&mut self) -> Result<Vec<NetlinkEvent>> {
            loop {
                let mut guard = self.inner.readable().await.map_err(|e| {
                    BridgesyncError::Netlink(format!("AsyncFd readable error: {}", e))
                })?;

                match guard.try_io(|_| {
                    self.socket
                        .try_receive_events()
                        .map_err(std::io::Error::other)
                }) {
                    Ok(Ok(Some(events))) => return Ok(events),
                    Ok(Ok(None)) => {
                        guard.clear_ready();
                        continue;
                    }
                    Ok(Err(e)) => {
                        return Err(BridgesyncError::Netlink(format!("receive error: {}", e)));
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        pub fn request_link_dump(&mut self) -> Result<()> {
            self.socket.request_link_dump()
        }

        pub fn request_neigh_dump(&mut self) -> Result<()> {
            self.socket.request_neigh_dump()
        }

        pub fn set_link_admin(&mut self, ifindex: u32, up: bool) -> Result<()> {
            self.socket.set_link_admin(ifindex, up)
        }
    }

    #[cfg(test)]
    mod tests {
        use netlink_packet_route::link::BridgeVlanInfo;

        use super::*;

        fn vlan_info(vid: u16, flags: BridgeVlanInfoFlags) -> AfSpecBridge {
            AfSpecBridge::VlanInfo(BridgeVlanInfo { flags, vid })
        }

        #[test]
        fn test_vlan_info_flags_map_to_bitmap() {
            let attrs = [
                vlan_info(10, BridgeVlanInfoFlags::empty()),
                vlan_info(20, BridgeVlanInfoFlags::Pvid | BridgeVlanInfoFlags::Untagged),
            ];
            let bitmap = parse_bridge_vlans(&attrs);
            assert!(bitmap.is_member(10));
            assert!(!bitmap.is_untagged(10));
            assert!(bitmap.is_member(20));
            assert!(bitmap.is_untagged(20));
            assert_eq!(bitmap.pvid(), 20);
        }

        #[test]
        fn test_vlan_info_range_pair_expands() {
            let attrs = [
                vlan_info(100, BridgeVlanInfoFlags::RangeBegin),
                vlan_info(103, BridgeVlanInfoFlags::RangeEnd),
            ];
            let bitmap = parse_bridge_vlans(&attrs);
            for vid in 100..=103 {
                assert!(bitmap.is_member(vid));
            }
            assert!(!bitmap.is_member(99));
            assert!(!bitmap.is_member(104));
        }

        #[test]
        fn test_lone_range_begin_without_end_is_single_entry() {
            // a dangling begin is treated like a plain entry on the next
            // non-end record
            let attrs = [
                vlan_info(50, BridgeVlanInfoFlags::RangeBegin),
                vlan_info(60, BridgeVlanInfoFlags::empty()),
            ];
            let bitmap = parse_bridge_vlans(&attrs);
            assert!(bitmap.is_member(60));
            assert!(!bitmap.is_member(55));
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only).
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::error::Result;
    use crate::types::NetlinkEvent;

    pub struct NetlinkSocket;

    impl NetlinkSocket {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub fn as_raw_fd(&self) -> i32 {
            -1
        }

        pub fn request_link_dump(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn request_neigh_dump(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn set_link_admin(&mut self, _ifindex: u32, _up: bool) -> Result<()> {
            Ok(())
        }

        pub fn try_receive_events(&mut self) -> Result<Option<Vec<NetlinkEvent>>> {
            Ok(Some(Vec::new()))
        }
    }

    pub struct AsyncNetlinkSocket;

    impl AsyncNetlinkSocket {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub async fn recv_events(&mut self) -> Result<Vec<NetlinkEvent>> {
            // prevent a busy loop in development builds
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            Ok(Vec::new())
        }

        pub fn request_link_dump(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn request_neigh_dump(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn set_link_admin(&mut self, _ifindex: u32, _up: bool) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
