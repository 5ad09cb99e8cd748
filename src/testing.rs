//! Scripted transport doubles for unit tests

use async_trait::async_trait;
use futures::{channel::mpsc as fmpsc, stream::StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    ble::{DeviceChooser, DisconnectStream, GattDevice, NotificationStream},
    error::{PillTickError, Result},
    session::{SessionEvent, WakeLock},
    types::{DeviceInfo, DeviceRequest},
    NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID,
};

fn refused(what: &str) -> PillTickError {
    PillTickError::Io(std::io::Error::other(format!("mock refused {what}")))
}

pub struct MockDevice {
    info: DeviceInfo,
    services: HashMap<Uuid, Vec<Uuid>>,
    write_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    pub fail_connect: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_write: AtomicBool,
    pub fail_unsubscribe: AtomicBool,
    pub connected: AtomicBool,
    pub subscribed: AtomicBool,
    pub disconnect_calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    notifier: Mutex<Option<fmpsc::UnboundedSender<Vec<u8>>>>,
    link_watchers: Mutex<Vec<fmpsc::UnboundedSender<()>>>,
}

impl MockDevice {
    fn with_services(services: HashMap<Uuid, Vec<Uuid>>) -> Self {
        Self {
            info: DeviceInfo::new(
                "PillBox-01".to_string(),
                "C0:FF:EE:00:00:01".to_string(),
                Some(-48),
            ),
            services,
            write_delay: None,
            connect_delay: None,
            subscribe_delay: None,
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            disconnect_calls: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
            link_watchers: Mutex::new(Vec::new()),
        }
    }

    /// A healthy device exposing the Nordic UART service
    pub fn nus() -> Self {
        Self::with_services(HashMap::from([(
            NUS_SERVICE_UUID,
            vec![NUS_RX_CHAR_UUID, NUS_TX_CHAR_UUID],
        )]))
    }

    pub fn without_service() -> Self {
        Self::with_services(HashMap::new())
    }

    pub fn without_notify_characteristic() -> Self {
        Self::with_services(HashMap::from([(NUS_SERVICE_UUID, vec![NUS_RX_CHAR_UUID])]))
    }

    pub fn failing_connect(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_subscribe(self) -> Self {
        self.fail_subscribe.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_write_delay(mut self, millis: u64) -> Self {
        self.write_delay = Some(Duration::from_millis(millis));
        self
    }

    pub fn with_connect_delay(mut self, millis: u64) -> Self {
        self.connect_delay = Some(Duration::from_millis(millis));
        self
    }

    pub fn with_subscribe_delay(mut self, millis: u64) -> Self {
        self.subscribe_delay = Some(Duration::from_millis(millis));
        self
    }

    /// Emit one notification payload
    pub fn notify(&self, payload: &[u8]) {
        if let Some(tx) = self.notifier.lock().unwrap().as_ref() {
            tx.unbounded_send(payload.to_vec()).unwrap();
        }
    }

    /// Simulate the peripheral going away
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for tx in self.link_watchers.lock().unwrap().iter() {
            let _ = tx.unbounded_send(());
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| String::from_utf8(bytes.clone()).unwrap())
            .collect()
    }
}

#[async_trait]
impl GattDevice for MockDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn disconnect_events(&self) -> Result<DisconnectStream> {
        let (tx, rx) = fmpsc::unbounded();
        self.link_watchers.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }

    async fn connect(&self) -> Result<()> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(refused("connect"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn has_service(&self, service: Uuid) -> Result<bool> {
        Ok(self.services.contains_key(&service))
    }

    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<bool> {
        Ok(self
            .services
            .get(&service)
            .is_some_and(|chars| chars.contains(&characteristic)))
    }

    async fn subscribe(&self, _service: Uuid, _characteristic: Uuid) -> Result<NotificationStream> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(refused("subscribe"));
        }
        let (tx, rx) = fmpsc::unbounded();
        *self.notifier.lock().unwrap() = Some(tx);
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(rx.boxed())
    }

    async fn unsubscribe(&self, _service: Uuid, _characteristic: Uuid) -> Result<()> {
        self.subscribed.store(false, Ordering::SeqCst);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(refused("unsubscribe"));
        }
        Ok(())
    }

    async fn write(&self, _service: Uuid, _characteristic: Uuid, data: &[u8]) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(refused("write"));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.notifier.lock().unwrap().take();
        // Like a real stack, an explicit disconnect is reported as a lost link too.
        self.drop_link();
        Ok(())
    }
}

pub struct MockChooser {
    device: Option<Arc<MockDevice>>,
    pub requests: Mutex<Vec<DeviceRequest>>,
}

impl MockChooser {
    pub fn selecting(device: Arc<MockDevice>) -> Self {
        Self {
            device: Some(device),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn dismissed() -> Self {
        Self {
            device: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeviceChooser for MockChooser {
    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<Option<Arc<dyn GattDevice>>> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self
            .device
            .as_ref()
            .map(|device| Arc::clone(device) as Arc<dyn GattDevice>))
    }
}

#[derive(Default)]
pub struct CountingWakeLock {
    held: AtomicBool,
    acquire_delay: Option<Duration>,
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
}

impl CountingWakeLock {
    /// A lock whose acquire takes `millis` to be granted
    pub fn slow(millis: u64) -> Self {
        Self {
            acquire_delay: Some(Duration::from_millis(millis)),
            ..Self::default()
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeLock for CountingWakeLock {
    async fn acquire(&self) -> Result<()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.held.store(false, Ordering::SeqCst);
    }
}

/// Next observer event, failing the test if none arrives within a second
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("session event channel closed")
}
