//! Northbound contract implementation: the entry point the control
//! channel drives when the switch connects, announces ports, reports
//! status changes or punts packets.

use std::sync::Arc;

use tracing::{info, warn};

use swbridge_types::{
    DriverStatus, Northbound, PacketBuffer, PortEvent, PortId, PortNotification, PortStatus,
    SwitchDriver,
};

use crate::bridge::BridgeStateTranslator;
use crate::ports::PortRegistry;
use crate::pump::PumpHandle;
use crate::tap::TapManager;

pub struct NorthboundHandler {
    ports: Arc<PortRegistry>,
    translator: Arc<BridgeStateTranslator>,
    taps: Arc<TapManager>,
    pump: PumpHandle,
}

impl NorthboundHandler {
    pub fn new(
        ports: Arc<PortRegistry>,
        translator: Arc<BridgeStateTranslator>,
        taps: Arc<TapManager>,
        pump: PumpHandle,
    ) -> Self {
        Self {
            ports,
            translator,
            taps,
            pump,
        }
    }
}

impl Northbound for NorthboundHandler {
    fn register_switch(&self, driver: Arc<dyn SwitchDriver>) {
        info!("switch connected, installing programming contract");
        self.taps.set_driver(driver.clone());
        self.translator.set_driver(driver);
    }

    fn resend_state(&self) {
        self.pump.resend_state();
    }

    /// Each announced port gets a name mapping and a tap device; a
    /// withdrawn port loses both.
    fn port_notification(&self, notifications: Vec<PortNotification>) {
        for notification in notifications {
            match notification.event {
                PortEvent::Add => {
                    info!(
                        port = notification.port_id,
                        name = %notification.name,
                        "port announced"
                    );
                    self.ports.register(notification.port_id, &notification.name);
                    if let Err(e) = self
                        .taps
                        .create_dev(notification.port_id, &notification.name)
                    {
                        warn!(
                            port = notification.port_id,
                            name = %notification.name,
                            error = %e,
                            "failed to create tap device"
                        );
                    }
                }
                PortEvent::Del => {
                    info!(
                        port = notification.port_id,
                        name = %notification.name,
                        "port withdrawn"
                    );
                    self.taps.destroy_dev(notification.port_id);
                    self.ports.unregister(notification.port_id);
                }
            }
        }
    }

    /// Mirrors the hardware port state onto the kernel link. The actual
    /// change goes through the event pump, which owns the socket and
    /// retries until the link exists.
    fn port_status_changed(&self, port: PortId, status: PortStatus) {
        self.pump.set_admin_state(port, status.is_up());
    }

    fn enqueue(&self, port: PortId, buffer: PacketBuffer) -> DriverStatus {
        self.taps.enqueue(port, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectCache;
    use crate::config::BridgeConfig;
    use crate::pump::{EventPump, PumpCommand, SyncEngine};
    use swbridge_types::PacketPool;

    fn handler() -> (NorthboundHandler, Arc<PortRegistry>) {
        let pool = Arc::new(PacketPool::new(4, 64));
        let ports = Arc::new(PortRegistry::new());
        let translator = Arc::new(BridgeStateTranslator::new(
            ports.clone(),
            &BridgeConfig::default(),
        ));
        let taps = Arc::new(TapManager::new(pool));
        let cache = Arc::new(ObjectCache::new());
        let engine = SyncEngine::new(cache, ports.clone(), translator.clone(), taps.clone());
        let (_pump, handle) = EventPump::new(
            crate::netlink::AsyncNetlinkSocket::new().expect("netlink socket"),
            engine,
            &crate::config::PumpConfig::default(),
        );
        (
            NorthboundHandler::new(ports.clone(), translator, taps, handle),
            ports,
        )
    }

    #[tokio::test]
    async fn test_port_notification_maintains_registry() {
        let (handler, ports) = handler();
        handler.port_notification(vec![PortNotification {
            event: PortEvent::Add,
            port_id: 3,
            name: "port3".to_string(),
        }]);
        assert_eq!(ports.port_for_name("port3"), Some(3));

        handler.port_notification(vec![PortNotification {
            event: PortEvent::Del,
            port_id: 3,
            name: "port3".to_string(),
        }]);
        assert!(ports.port_for_name("port3").is_none());
    }

    #[tokio::test]
    async fn test_status_change_becomes_pump_command() {
        let pool = Arc::new(PacketPool::new(4, 64));
        let ports = Arc::new(PortRegistry::new());
        let translator = Arc::new(BridgeStateTranslator::new(
            ports.clone(),
            &BridgeConfig::default(),
        ));
        let taps = Arc::new(TapManager::new(pool));
        let cache = Arc::new(ObjectCache::new());
        let engine = SyncEngine::new(cache, ports.clone(), translator.clone(), taps.clone());
        let (mut pump, handle) = EventPump::new(
            crate::netlink::AsyncNetlinkSocket::new().expect("netlink socket"),
            engine,
            &crate::config::PumpConfig::default(),
        );

        let handler = NorthboundHandler::new(ports, translator, taps, handle);
        handler.port_status_changed(7, PortStatus::from_bits(PortStatus::LOWER_DOWN));

        match pump.try_recv_command() {
            Some(PumpCommand::SetAdminState { port, up }) => {
                assert_eq!(port, 7);
                assert!(!up);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
