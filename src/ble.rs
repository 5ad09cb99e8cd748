use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use futures::{
    future,
    stream::{BoxStream, StreamExt},
};
use std::{cmp::Reverse, sync::Arc, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{PillTickError, Result},
    types::{DeviceInfo, DeviceRequest},
};

/// Notification payloads from the notify characteristic, in arrival order
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Yields once when the link to the device is lost
pub type DisconnectStream = BoxStream<'static, ()>;

/// Picks which device a session talks to
///
/// This stands in for the platform's device chooser. Returning `Ok(None)`
/// means the chooser was dismissed without a selection.
#[async_trait]
pub trait DeviceChooser: Send + Sync {
    /// Offer matching devices and return the selected one
    async fn request_device(&self, request: &DeviceRequest)
        -> Result<Option<Arc<dyn GattDevice>>>;
}

/// A selected peripheral and its GATT operations
///
/// Each method is one platform call; none of them retries.
#[async_trait]
pub trait GattDevice: Send + Sync {
    /// Identity of the device
    fn info(&self) -> DeviceInfo;

    /// Stream that fires when the link drops for any reason
    async fn disconnect_events(&self) -> Result<DisconnectStream>;

    /// Open the transport
    async fn connect(&self) -> Result<()>;

    /// Resolve the primary service
    async fn has_service(&self, service: Uuid) -> Result<bool>;

    /// Resolve one characteristic of an already resolved service
    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<bool>;

    /// Enable notifications and return the payload stream
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream>;

    /// Disable notifications
    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Write one value
    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Close the transport
    async fn disconnect(&self) -> Result<()>;
}

/// Chooses among the candidates, strongest signal first; `None` dismisses
pub type DeviceSelector = Box<dyn Fn(&[DeviceInfo]) -> Option<usize> + Send + Sync>;

/// Device chooser backed by a btleplug scan
pub struct BleChooser {
    manager: Manager,
    scan_window: Duration,
    selector: DeviceSelector,
}

impl BleChooser {
    /// Create a chooser that scans for `scan_window` and picks the strongest device
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new(scan_window: Duration) -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            scan_window,
            selector: Box::new(|devices| if devices.is_empty() { None } else { Some(0) }),
        })
    }

    /// Replace the selection policy
    #[must_use]
    pub fn with_selector(mut self, selector: DeviceSelector) -> Self {
        self.selector = selector;
        self
    }

    async fn default_adapter(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PillTickError::BluetoothUnavailable)
    }
}

#[async_trait]
impl DeviceChooser for BleChooser {
    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<Option<Arc<dyn GattDevice>>> {
        let central = self.default_adapter().await?;

        // Serial-style peripherals rarely advertise their 128-bit service, so
        // the scan is unfiltered and names are matched afterwards.
        info!("Scanning for devices ({} ms)...", self.scan_window.as_millis());
        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.scan_window).await;
        central.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in central.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if !request.accepts(properties.local_name.as_deref()) {
                continue;
            }
            let advertises = properties.services.contains(&request.service);
            let info = DeviceInfo::new(
                properties
                    .local_name
                    .unwrap_or_else(|| "Unknown device".to_string()),
                peripheral.address().to_string(),
                properties.rssi,
            );
            debug!("Candidate device: {} ({})", info.name, info.address);
            candidates.push((info, advertises, peripheral));
        }

        rank_candidates(&mut candidates);
        let infos: Vec<DeviceInfo> = candidates.iter().map(|(info, ..)| info.clone()).collect();

        let Some(index) = (self.selector)(&infos) else {
            info!("No device selected from {} candidate(s)", infos.len());
            return Ok(None);
        };
        let Some((info, _, peripheral)) = candidates.into_iter().nth(index) else {
            return Ok(None);
        };

        info!("Selected device: {}", info.name);
        Ok(Some(Arc::new(BleDevice {
            central,
            peripheral,
            info,
        })))
    }
}

/// Devices advertising the session's service first, then strongest signal
/// first; unknown signal sorts last
fn rank_candidates<T>(candidates: &mut [(DeviceInfo, bool, T)]) {
    candidates.sort_by_key(|(info, advertises, _)| {
        (Reverse(*advertises), Reverse(info.rssi.unwrap_or(i16::MIN)))
    });
}

/// A peripheral selected through [`BleChooser`]
pub struct BleDevice {
    central: Adapter,
    peripheral: Peripheral,
    info: DeviceInfo,
}

impl BleDevice {
    fn find_characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .ok_or(PillTickError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl GattDevice for BleDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn disconnect_events(&self) -> Result<DisconnectStream> {
        let id = self.peripheral.id();
        let events = self.central.events().await?;

        Ok(events
            .filter_map(move |event| {
                let lost = matches!(event, CentralEvent::DeviceDisconnected(ref lost) if *lost == id);
                future::ready(lost.then_some(()))
            })
            .boxed())
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn has_service(&self, service: Uuid) -> Result<bool> {
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.services().iter().any(|s| s.uuid == service))
    }

    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<bool> {
        Ok(self
            .peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service)
            .is_some_and(|s| s.characteristics.iter().any(|c| c.uuid == characteristic)))
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        let target = self.find_characteristic(service, characteristic)?;

        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;

        Ok(notifications
            .filter_map(move |n| future::ready((n.uuid == characteristic).then_some(n.value)))
            .boxed())
    }

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let target = self.find_characteristic(service, characteristic)?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let target = self.find_characteristic(service, characteristic)?;
        self.peripheral
            .write(&target, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
