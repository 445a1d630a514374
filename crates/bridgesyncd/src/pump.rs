//! Event pump: the single task that owns the netlink socket and the
//! write path into the object cache.
//!
//! Kernel events, periodic resync dumps, state-resend requests from the
//! switch side and admin-state changes all funnel through one loop, so
//! cache writes and driver programming are naturally serialized. Event
//! handling never escapes an error out of the loop; anything that goes
//! wrong is logged and repaired by the next resync.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use swbridge_types::PortId;

use crate::bridge::BridgeStateTranslator;
use crate::cache::ObjectCache;
use crate::config::PumpConfig;
use crate::netlink::AsyncNetlinkSocket;
use crate::ports::PortRegistry;
use crate::tap::TapManager;
use crate::types::{BridgeNeighbor, LinkSnapshot, NetlinkEvent, IFF_UP};

/// Applies parsed kernel events to the cache and translator. Socket-free
/// so the logic is testable without a kernel.
pub struct SyncEngine {
    cache: Arc<ObjectCache>,
    ports: Arc<PortRegistry>,
    translator: Arc<BridgeStateTranslator>,
    taps: Arc<TapManager>,
}

impl SyncEngine {
    pub fn new(
        cache: Arc<ObjectCache>,
        ports: Arc<PortRegistry>,
        translator: Arc<BridgeStateTranslator>,
        taps: Arc<TapManager>,
    ) -> Self {
        Self {
            cache,
            ports,
            translator,
            taps,
        }
    }

    pub fn apply_event(&self, event: NetlinkEvent) {
        match event {
            NetlinkEvent::LinkNew(link) => self.handle_link_new(link),
            NetlinkEvent::LinkDel(ifindex) => self.handle_link_del(ifindex),
            NetlinkEvent::NeighNew(neighbor) => self.handle_neigh_new(neighbor),
            NetlinkEvent::NeighDel(neighbor) => self.handle_neigh_del(neighbor),
            NetlinkEvent::DumpComplete => {}
        }
    }

    /// New or changed link. The kernel sends AF_UNSPEC notifications
    /// without bridge VLAN info for changes that do not touch VLANs;
    /// those keep the VLAN state already cached for the link.
    pub fn handle_link_new(&self, mut link: LinkSnapshot) {
        if link.bridge_vlans.is_none() {
            if let Some(prior) = self.cache.get_link(link.ifindex) {
                link.bridge_vlans = prior.bridge_vlans;
            }
        }

        let prior = self.cache.upsert_link(link.clone());

        // first enslaved port decides which bridge we serve
        if link.has_master() && self.translator.bridge_ifindex().is_none() {
            if let Some(master) = self.cache.get_link(link.master) {
                self.translator.adopt_bridge(&master);
            } else {
                debug!(
                    link = %link.name,
                    master = link.master,
                    "master link not yet cached, adoption deferred"
                );
            }
        }
        self.translator.refresh_bridge(&link);

        let adopted = self.translator.bridge_ifindex();
        let was_member = prior
            .as_ref()
            .map(|p| Some(p.master) == adopted && p.has_master())
            .unwrap_or(false);
        let is_member = Some(link.master) == adopted && link.has_master();
        // adoption can lag the first slave event when the master is
        // reported after its slaves; membership counts as applied only
        // once the ifindex is bound, so a resync re-report of the slave
        // still programs the port
        let was_applied = was_member && self.ports.port_for_ifindex(link.ifindex).is_some();

        match (was_applied, is_member) {
            (false, true) => {
                let port = self
                    .ports
                    .port_for_ifindex(link.ifindex)
                    .or_else(|| self.ports.bind_ifindex(&link.name, link.ifindex));
                if port.is_some() {
                    info!(link = %link.name, ifindex = link.ifindex, "port joined bridge");
                    self.translator.add_interface(&link);
                }
            }
            (true, true) => {
                self.translator
                    .update_interface(prior.as_ref().unwrap(), &link);
            }
            (true, false) => {
                let old = prior.as_ref().unwrap();
                info!(link = %old.name, ifindex = old.ifindex, "port left bridge");
                self.retire_neighbors_of(old.ifindex);
                self.translator.delete_interface(old);
            }
            (false, false) => {}
        }

        // the tap read size follows the kernel link MTU
        if let Some(port) = self.ports.port_for_ifindex(link.ifindex) {
            if prior.map(|p| p.mtu) != Some(link.mtu) {
                self.taps.set_mtu(port, link.mtu);
            }
        }
    }

    pub fn handle_link_del(&self, ifindex: u32) {
        let (link, neighbors) = self.cache.drop_link(ifindex);
        let Some(link) = link else {
            debug!(ifindex, "delete for unknown link, ignoring");
            return;
        };
        info!(link = %link.name, ifindex, "link deleted");
        for neighbor in &neighbors {
            self.translator.neigh_removed(neighbor);
        }
        self.translator.delete_interface(&link);
        self.ports.unbind_ifindex(ifindex);
    }

    pub fn handle_neigh_new(&self, neighbor: BridgeNeighbor) {
        if self.cache.upsert_neighbor(neighbor.clone()) {
            self.translator.neigh_created(&neighbor);
        } else {
            debug!(mac = %neighbor.mac, vlan = neighbor.vlan, "duplicate fdb entry, ignoring");
        }
    }

    pub fn handle_neigh_del(&self, neighbor: BridgeNeighbor) {
        if self.cache.drop_neighbor(&neighbor) {
            self.translator.neigh_removed(&neighbor);
        }
    }

    fn retire_neighbors_of(&self, ifindex: u32) {
        for neighbor in self.cache.neighbors_of(ifindex) {
            self.handle_neigh_del(neighbor);
        }
    }

    /// Retires cached links absent from a completed kernel dump.
    pub fn retire_missing_links(&self, seen: &HashSet<u32>) {
        for link in self.cache.links() {
            if !seen.contains(&link.ifindex) {
                warn!(link = %link.name, ifindex = link.ifindex, "link vanished, retiring");
                self.handle_link_del(link.ifindex);
            }
        }
    }

    /// Retires cached fdb entries absent from a completed kernel dump.
    pub fn retire_missing_neighbors(&self, seen: &HashSet<BridgeNeighbor>) {
        for neighbor in self.cache.neighbors() {
            if !seen.contains(&neighbor) {
                warn!(mac = %neighbor.mac, vlan = neighbor.vlan, "fdb entry vanished, retiring");
                self.handle_neigh_del(neighbor);
            }
        }
    }

    /// A dumped fdb entry is re-applied even when already cached; the
    /// driver re-issues identical messages, so drift gets repaired.
    pub fn resync_neigh_new(&self, neighbor: BridgeNeighbor) {
        self.cache.upsert_neighbor(neighbor.clone());
        self.translator.neigh_created(&neighbor);
    }

    /// Re-announces everything known to a freshly (re)connected switch.
    pub fn resend_state(&self) {
        let adopted = self.translator.bridge_ifindex();
        info!("resending full bridge state to switch");
        for link in self.cache.links() {
            if link.has_master() && Some(link.master) == adopted {
                self.translator.add_interface(&link);
            }
        }
        for neighbor in self.cache.neighbors() {
            self.translator.neigh_created(&neighbor);
        }
    }

    /// Resolves an admin-state request against the cache. `Ok(None)`
    /// means the kernel already has the requested state.
    pub fn admin_change_target(&self, port: PortId, up: bool) -> Option<AdminOutcome> {
        let Some(ifindex) = self.ports.ifindex_for_port(port) else {
            return Some(AdminOutcome::NotMapped);
        };
        let Some(link) = self.cache.get_link(ifindex) else {
            return Some(AdminOutcome::NotMapped);
        };
        if (link.flags & IFF_UP != 0) == up {
            debug!(port, ifindex, up, "admin state already matches, nothing to do");
            return None;
        }
        Some(AdminOutcome::Change(ifindex))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdminOutcome {
    Change(u32),
    /// Port or link not known yet; the request stays queued.
    NotMapped,
}

/// Requests crossing from the switch side into the pump task.
#[derive(Debug)]
pub enum PumpCommand {
    SetAdminState { port: PortId, up: bool },
    ResendState,
}

/// Cloneable sender half handed to the northbound interface.
#[derive(Clone)]
pub struct PumpHandle {
    tx: mpsc::UnboundedSender<PumpCommand>,
}

impl PumpHandle {
    pub fn set_admin_state(&self, port: PortId, up: bool) {
        if self.tx.send(PumpCommand::SetAdminState { port, up }).is_err() {
            warn!(port, "event pump gone, dropping admin request");
        }
    }

    pub fn resend_state(&self) {
        if self.tx.send(PumpCommand::ResendState).is_err() {
            warn!("event pump gone, dropping resend request");
        }
    }
}

struct AdminRequest {
    port: PortId,
    up: bool,
    attempts: u32,
}

/// Which dump the current resync cycle is waiting on.
enum ResyncPhase {
    Idle,
    Links { seen: HashSet<u32> },
    Neighbors { seen: HashSet<BridgeNeighbor> },
}

pub struct EventPump {
    socket: AsyncNetlinkSocket,
    engine: SyncEngine,
    rx: mpsc::UnboundedReceiver<PumpCommand>,
    backlog: VecDeque<NetlinkEvent>,
    pending_admin: VecDeque<AdminRequest>,
    phase: ResyncPhase,
    resync_interval: Duration,
    max_events_per_wakeup: usize,
    admin_retry_limit: u32,
}

impl EventPump {
    pub fn new(
        socket: AsyncNetlinkSocket,
        engine: SyncEngine,
        config: &PumpConfig,
    ) -> (Self, PumpHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = Self {
            socket,
            engine,
            rx,
            backlog: VecDeque::new(),
            pending_admin: VecDeque::new(),
            phase: ResyncPhase::Idle,
            resync_interval: Duration::from_secs(config.resync_interval_secs),
            max_events_per_wakeup: config.max_events_per_wakeup,
            admin_retry_limit: config.admin_retry_limit,
        };
        (pump, PumpHandle { tx })
    }

    #[cfg(test)]
    pub fn try_recv_command(&mut self) -> Option<PumpCommand> {
        self.rx.try_recv().ok()
    }

    pub async fn run(mut self) {
        // initial state is learned through the same dump cycle the
        // periodic resync uses
        self.start_resync();

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await; // immediate first tick

        loop {
            tokio::select! {
                result = self.socket.recv_events() => match result {
                    Ok(events) => self.backlog.extend(events),
                    Err(e) => warn!(error = %e, "netlink receive failed"),
                },
                Some(command) = self.rx.recv() => self.handle_command(command),
                _ = resync.tick() => self.start_resync(),
                // keep draining a non-empty backlog without blocking on I/O
                _ = std::future::ready(()), if !self.backlog.is_empty() => {}
            }
            self.process_backlog();
            self.flush_pending_admin();
        }
    }

    fn start_resync(&mut self) {
        if !matches!(self.phase, ResyncPhase::Idle) {
            // a dump whose NLMSG_DONE was lost must not wedge every
            // later tick; restart from scratch instead
            warn!("previous resync never completed, restarting");
            self.phase = ResyncPhase::Idle;
        }
        debug!("starting kernel state resync");
        if let Err(e) = self.socket.request_link_dump() {
            warn!(error = %e, "link dump request failed");
            return;
        }
        self.phase = ResyncPhase::Links {
            seen: HashSet::new(),
        };
    }

    /// Bounded work per wakeup so one event burst cannot starve command
    /// handling.
    fn process_backlog(&mut self) {
        for _ in 0..self.max_events_per_wakeup.max(1) {
            let Some(event) = self.backlog.pop_front() else {
                return;
            };
            self.dispatch_one(event);
        }
    }

    fn dispatch_one(&mut self, event: NetlinkEvent) {
        match (&mut self.phase, event) {
            (ResyncPhase::Links { seen }, NetlinkEvent::LinkNew(link)) => {
                seen.insert(link.ifindex);
                self.engine.handle_link_new(link);
            }
            (ResyncPhase::Links { .. }, NetlinkEvent::DumpComplete) => {
                let ResyncPhase::Links { seen } =
                    std::mem::replace(&mut self.phase, ResyncPhase::Idle)
                else {
                    return;
                };
                self.engine.retire_missing_links(&seen);
                match self.socket.request_neigh_dump() {
                    Ok(()) => {
                        self.phase = ResyncPhase::Neighbors {
                            seen: HashSet::new(),
                        };
                    }
                    Err(e) => warn!(error = %e, "fdb dump request failed"),
                }
            }
            (ResyncPhase::Neighbors { seen }, NetlinkEvent::NeighNew(neighbor)) => {
                seen.insert(neighbor.clone());
                self.engine.resync_neigh_new(neighbor);
            }
            (ResyncPhase::Neighbors { .. }, NetlinkEvent::DumpComplete) => {
                let ResyncPhase::Neighbors { seen } =
                    std::mem::replace(&mut self.phase, ResyncPhase::Idle)
                else {
                    return;
                };
                self.engine.retire_missing_neighbors(&seen);
                debug!("kernel state resync complete");
            }
            (_, NetlinkEvent::DumpComplete) => {}
            (_, event) => self.engine.apply_event(event),
        }
    }

    fn handle_command(&mut self, command: PumpCommand) {
        match command {
            PumpCommand::SetAdminState { port, up } => {
                self.pending_admin.push_back(AdminRequest {
                    port,
                    up,
                    attempts: 0,
                });
            }
            PumpCommand::ResendState => self.engine.resend_state(),
        }
    }

    /// Admin requests are retried across wakeups because a port may be
    /// announced before its kernel link exists.
    fn flush_pending_admin(&mut self) {
        for _ in 0..self.pending_admin.len() {
            let Some(request) = self.pending_admin.pop_front() else {
                break;
            };
            match self.engine.admin_change_target(request.port, request.up) {
                None => {} // already in the requested state
                Some(AdminOutcome::Change(ifindex)) => {
                    if let Err(e) = self.socket.set_link_admin(ifindex, request.up) {
                        warn!(port = request.port, error = %e, "admin change failed, will retry");
                        self.requeue_admin(request);
                    }
                }
                Some(AdminOutcome::NotMapped) => self.requeue_admin(request),
            }
        }
    }

    fn requeue_admin(&mut self, mut request: AdminRequest) {
        request.attempts += 1;
        if request.attempts >= self.admin_retry_limit {
            error!(
                port = request.port,
                up = request.up,
                attempts = request.attempts,
                "giving up on admin state change"
            );
            return;
        }
        self.pending_admin.push_back(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use swbridge_types::{MacAddress, PacketPool};

    fn engine() -> (SyncEngine, Arc<ObjectCache>, Arc<PortRegistry>) {
        let cache = Arc::new(ObjectCache::new());
        let ports = Arc::new(PortRegistry::new());
        ports.register(3, "eth0");
        let translator = Arc::new(BridgeStateTranslator::new(
            ports.clone(),
            &BridgeConfig::default(),
        ));
        let taps = Arc::new(TapManager::new(Arc::new(PacketPool::new(4, 64))));
        (
            SyncEngine::new(cache.clone(), ports.clone(), translator, taps),
            cache,
            ports,
        )
    }

    fn link(ifindex: u32, name: &str, master: u32, flags: u32) -> LinkSnapshot {
        LinkSnapshot {
            ifindex,
            name: name.to_string(),
            mac: MacAddress::new([2, 0, 0, 0, 0, ifindex as u8]),
            flags,
            mtu: 1500,
            master,
            bridge_vlans: None,
        }
    }

    #[test]
    fn test_enslaved_link_binds_port() {
        let (engine, _, ports) = engine();
        engine.handle_link_new(link(1, "br0", 0, IFF_UP));
        engine.handle_link_new(link(5, "eth0", 1, IFF_UP));
        assert_eq!(ports.port_for_ifindex(5), Some(3));
    }

    #[test]
    fn test_slave_reported_before_master_still_binds() {
        let (engine, _, ports) = engine();
        // dump order: slave first, so adoption is deferred
        engine.handle_link_new(link(5, "eth0", 1, IFF_UP));
        assert!(ports.port_for_ifindex(5).is_none());
        engine.handle_link_new(link(1, "br0", 0, IFF_UP));

        // the next resync re-reports the slave; adoption catches up and
        // the port must be bound and programmed now
        engine.handle_link_new(link(5, "eth0", 1, IFF_UP));
        assert_eq!(ports.port_for_ifindex(5), Some(3));
    }

    #[test]
    fn test_link_del_retires_neighbors_and_binding() {
        let (engine, cache, ports) = engine();
        engine.handle_link_new(link(1, "br0", 0, IFF_UP));
        engine.handle_link_new(link(5, "eth0", 1, IFF_UP));
        engine.handle_neigh_new(BridgeNeighbor {
            ifindex: 5,
            vlan: 20,
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        });

        engine.handle_link_del(5);
        assert!(cache.get_link(5).is_none());
        assert!(cache.neighbors_of(5).is_empty());
        assert!(ports.port_for_ifindex(5).is_none());
    }

    #[test]
    fn test_unspec_update_keeps_cached_vlans() {
        let (engine, cache, _) = engine();
        engine.handle_link_new(link(1, "br0", 0, IFF_UP));

        let mut with_vlans = link(5, "eth0", 1, IFF_UP);
        let mut vlans = crate::types::VlanBitmap::default();
        vlans.set(10, false);
        with_vlans.bridge_vlans = Some(vlans.clone());
        engine.handle_link_new(with_vlans);

        // flags-only notification without AF_BRIDGE data
        engine.handle_link_new(link(5, "eth0", 1, 0));
        assert_eq!(cache.get_link(5).unwrap().bridge_vlans, Some(vlans));
    }

    #[test]
    fn test_retire_missing_links() {
        let (engine, cache, _) = engine();
        engine.handle_link_new(link(1, "br0", 0, IFF_UP));
        engine.handle_link_new(link(5, "eth0", 1, IFF_UP));

        let seen: HashSet<u32> = [1].into_iter().collect();
        engine.retire_missing_links(&seen);
        assert!(cache.get_link(5).is_none());
        assert!(cache.get_link(1).is_some());
    }

    #[test]
    fn test_retire_missing_neighbors() {
        let (engine, cache, _) = engine();
        let stale = BridgeNeighbor {
            ifindex: 5,
            vlan: 20,
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        };
        let fresh = BridgeNeighbor {
            ifindex: 5,
            vlan: 30,
            mac: "aa:bb:cc:dd:ee:01".parse().unwrap(),
        };
        engine.handle_neigh_new(stale.clone());
        engine.handle_neigh_new(fresh.clone());

        let seen: HashSet<BridgeNeighbor> = [fresh.clone()].into_iter().collect();
        engine.retire_missing_neighbors(&seen);
        assert_eq!(cache.neighbors(), vec![fresh]);
    }

    #[tokio::test]
    async fn test_stale_resync_phase_is_restarted() {
        let (engine, _, _) = engine();
        let socket = crate::netlink::AsyncNetlinkSocket::new().expect("netlink socket");
        let (mut pump, _handle) = EventPump::new(socket, engine, &PumpConfig::default());

        // a links dump that never saw its terminating message
        pump.phase = ResyncPhase::Links {
            seen: [9].into_iter().collect(),
        };
        pump.start_resync();

        match &pump.phase {
            ResyncPhase::Links { seen } => assert!(seen.is_empty(), "expected a fresh dump"),
            _ => panic!("expected a links dump in progress"),
        }
    }

    #[test]
    fn test_admin_change_target() {
        let (engine, _, ports) = engine();
        engine.handle_link_new(link(1, "br0", 0, IFF_UP));
        engine.handle_link_new(link(5, "eth0", 1, IFF_UP));
        assert_eq!(ports.port_for_ifindex(5), Some(3));

        // already up: nothing to do
        assert_eq!(engine.admin_change_target(3, true), None);
        // down requested: change against ifindex 5
        assert_eq!(
            engine.admin_change_target(3, false),
            Some(AdminOutcome::Change(5))
        );
        // unknown port stays queued
        assert_eq!(
            engine.admin_change_target(99, true),
            Some(AdminOutcome::NotMapped)
        );
    }
}
