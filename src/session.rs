use async_trait::async_trait;
use futures::stream::StreamExt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ble::{DeviceChooser, DisconnectStream, GattDevice, NotificationStream},
    error::{PillTickError, Result},
    protocol::{decode_line, encode_line, MAX_ATTRIBUTE_LEN},
    types::{DeviceInfo, SessionParams, SessionState},
};

/// Something the session controller reports to its observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The controller moved to a new state
    StateChanged(SessionState),
    /// One notification payload, decoded with trailing whitespace trimmed
    LineReceived(String),
    /// The session ended, whether closed explicitly or lost
    Disconnected,
}

/// Advisory keep-awake handle held while a session is connected
///
/// Failures are never fatal; the controller logs and carries on.
#[async_trait]
pub trait WakeLock: Send + Sync {
    /// Request the lock
    async fn acquire(&self) -> Result<()>;
    /// Give the lock back; must tolerate being called without a prior acquire
    async fn release(&self);
}

/// Wake lock for hosts without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

#[async_trait]
impl WakeLock for NoopWakeLock {
    async fn acquire(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) {}
}

struct Link {
    device: Arc<dyn GattDevice>,
    service: Uuid,
    rx_char: Uuid,
    tx_char: Uuid,
    subscribed: bool,
}

#[derive(Default)]
struct Session {
    state: SessionState,
    // Bumped whenever a session ends; in-flight steps of an older session
    // compare against it and back off.
    generation: u64,
    link: Option<Link>,
    pump: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl Session {
    fn take_handles(&mut self) -> Option<Link> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.link.take()
    }
}

struct Shared {
    session: Mutex<Session>,
    status: watch::Sender<SessionState>,
    observers: StdMutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    wake_lock: Arc<dyn WakeLock>,
}

impl Shared {
    fn publish(&self, session: &mut Session, state: SessionState) {
        session.state = state;
        self.status.send_replace(state);
        info!("Session state: {state}");
        self.notify(&SessionEvent::StateChanged(state));
    }

    fn notify(&self, event: &SessionEvent) {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn on_link_lost(&self, generation: u64) {
        {
            let mut session = self.session.lock().await;
            if session.generation != generation || session.link.is_none() {
                return;
            }
            session.generation += 1;
            if let Some(pump) = session.pump.take() {
                pump.abort();
            }
            // This runs on the watcher task itself, so its handle is only detached.
            session.watcher.take();
            session.link.take();
            self.publish(&mut session, SessionState::Idle);
        }

        info!("Device disconnected");
        self.wake_lock.release().await;
        self.notify(&SessionEvent::Disconnected);
    }
}

async fn watch_link(shared: Arc<Shared>, generation: u64, mut disconnects: DisconnectStream) {
    if disconnects.next().await.is_some() {
        shared.on_link_lost(generation).await;
    }
}

async fn pump_lines(shared: Arc<Shared>, mut notifications: NotificationStream) {
    while let Some(payload) = notifications.next().await {
        let line = decode_line(&payload);
        debug!("Device → {line}");
        shared.notify(&SessionEvent::LineReceived(line));
    }
}

/// Owns one BLE session and turns it into a line-oriented text channel
///
/// The controller is the only component that opens or closes the transport.
/// Observers see a single status value ([`SessionController::watch_status`])
/// and an ordered event stream ([`SessionController::subscribe`]). Independent
/// devices need independent controllers.
///
/// # Examples
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use pilltick::{BleChooser, NoopWakeLock, SessionController, SessionParams};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let chooser = BleChooser::new(Duration::from_secs(5)).await?;
///     let controller = SessionController::new(Arc::new(chooser), Arc::new(NoopWakeLock));
///
///     controller.open_session(&SessionParams::default()).await?;
///     controller.send_line("SYNC_TIME 1700000000").await?;
///     controller.close_session().await;
///     Ok(())
/// }
/// ```
pub struct SessionController {
    chooser: Arc<dyn DeviceChooser>,
    shared: Arc<Shared>,
    write_gate: Mutex<()>,
    max_line_bytes: usize,
}

impl SessionController {
    /// Create an idle controller
    pub fn new(chooser: Arc<dyn DeviceChooser>, wake_lock: Arc<dyn WakeLock>) -> Self {
        let (status, _) = watch::channel(SessionState::Idle);

        Self {
            chooser,
            shared: Arc::new(Shared {
                session: Mutex::new(Session::default()),
                status,
                observers: StdMutex::new(Vec::new()),
                wake_lock,
            }),
            write_gate: Mutex::new(()),
            max_line_bytes: MAX_ATTRIBUTE_LEN,
        }
    }

    /// Limit the encoded size of one outbound line
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.status.borrow()
    }

    /// Watch the single observable status value
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionState> {
        self.shared.status.subscribe()
    }

    /// Register an observer for state changes, received lines and disconnects
    ///
    /// Events arrive in the order they happened. Dropping the receiver
    /// unregisters it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Device of the current session, if any
    pub async fn device_info(&self) -> Option<DeviceInfo> {
        self.shared
            .session
            .lock()
            .await
            .link
            .as_ref()
            .map(|link| link.device.info())
    }

    /// Select a device and open a line channel to it
    ///
    /// Walks `Requesting → Connecting → DiscoveringService →
    /// DiscoveringCharacteristics → Subscribing → Connected`. Must be driven
    /// by a user action: the chooser may prompt.
    ///
    /// # Errors
    ///
    /// - [`PillTickError::SessionBusy`] if the controller is not idle
    /// - [`PillTickError::UserCancelled`] if no device was selected
    /// - [`PillTickError::DeviceUnreachable`] if the transport cannot be opened
    /// - [`PillTickError::ServiceNotFound`] / [`PillTickError::CharacteristicNotFound`]
    ///   on a firmware mismatch
    /// - [`PillTickError::SubscriptionFailed`] if notifications cannot be enabled
    /// - [`PillTickError::Disconnected`] if the session was closed or lost meanwhile
    ///
    /// Apart from `SessionBusy` and `Disconnected`, a failure leaves the
    /// controller in [`SessionState::Error`] with every handle released.
    pub async fn open_session(&self, params: &SessionParams) -> Result<DeviceInfo> {
        let generation = {
            let mut session = self.shared.session.lock().await;
            if !session.state.is_idle() {
                return Err(PillTickError::SessionBusy {
                    state: session.state.to_string(),
                });
            }
            session.generation += 1;
            self.shared.publish(&mut session, SessionState::Requesting);
            session.generation
        };

        match self.establish(generation, params).await {
            Ok(info) => {
                if let Err(e) = self.shared.wake_lock.acquire().await {
                    debug!("Wake lock unavailable: {e}");
                }
                if !self.is_current(generation).await {
                    // Closed or lost while the lock was being acquired.
                    self.shared.wake_lock.release().await;
                    return Err(PillTickError::Disconnected);
                }
                info!("Connected to {}", info.name);
                Ok(info)
            }
            Err(e) => {
                self.abandon(generation, &e).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, generation: u64, params: &SessionParams) -> Result<DeviceInfo> {
        let device = self
            .chooser
            .request_device(&params.device_request())
            .await?
            .ok_or(PillTickError::UserCancelled)?;

        match self.bring_up(generation, &device, params).await {
            Ok(()) => Ok(device.info()),
            Err(e) => {
                if !self.is_current(generation).await {
                    // The session ended while a step was in flight; the step may
                    // have reopened the transport after the teardown closed it.
                    if let Err(e) = device.disconnect().await {
                        debug!("Ignoring disconnect failure for a stale session: {e}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        generation: u64,
        device: &Arc<dyn GattDevice>,
        params: &SessionParams,
    ) -> Result<()> {
        let unreachable = |e: PillTickError| PillTickError::DeviceUnreachable(e.to_string());

        let disconnects = device.disconnect_events().await.map_err(unreachable)?;
        self.attach(generation, device, params, disconnects).await?;

        device.connect().await.map_err(unreachable)?;
        self.advance(generation, SessionState::DiscoveringService)
            .await?;

        if !device.has_service(params.service).await.map_err(unreachable)? {
            return Err(PillTickError::ServiceNotFound(params.service));
        }
        self.advance(generation, SessionState::DiscoveringCharacteristics)
            .await?;

        for characteristic in [params.rx_char, params.tx_char] {
            if !device
                .has_characteristic(params.service, characteristic)
                .await
                .map_err(unreachable)?
            {
                return Err(PillTickError::CharacteristicNotFound(characteristic));
            }
        }
        self.advance(generation, SessionState::Subscribing).await?;

        let notifications = device
            .subscribe(params.service, params.tx_char)
            .await
            .map_err(|e| PillTickError::SubscriptionFailed(e.to_string()))?;
        if let Err(e) = self.go_live(generation, notifications).await {
            if let Err(e) = device.unsubscribe(params.service, params.tx_char).await {
                debug!("Ignoring unsubscribe failure for a stale session: {e}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.shared.session.lock().await.generation == generation
    }

    async fn attach(
        &self,
        generation: u64,
        device: &Arc<dyn GattDevice>,
        params: &SessionParams,
        disconnects: DisconnectStream,
    ) -> Result<()> {
        let mut session = self.shared.session.lock().await;
        if session.generation != generation {
            return Err(PillTickError::Disconnected);
        }

        session.link = Some(Link {
            device: Arc::clone(device),
            service: params.service,
            rx_char: params.rx_char,
            tx_char: params.tx_char,
            subscribed: false,
        });
        session.watcher = Some(tokio::spawn(watch_link(
            Arc::clone(&self.shared),
            generation,
            disconnects,
        )));
        self.shared.publish(&mut session, SessionState::Connecting);
        Ok(())
    }

    async fn advance(&self, generation: u64, state: SessionState) -> Result<()> {
        let mut session = self.shared.session.lock().await;
        if session.generation != generation {
            return Err(PillTickError::Disconnected);
        }
        self.shared.publish(&mut session, state);
        Ok(())
    }

    async fn go_live(&self, generation: u64, notifications: NotificationStream) -> Result<()> {
        let mut session = self.shared.session.lock().await;
        if session.generation != generation {
            return Err(PillTickError::Disconnected);
        }

        session.pump = Some(tokio::spawn(pump_lines(
            Arc::clone(&self.shared),
            notifications,
        )));
        if let Some(link) = session.link.as_mut() {
            link.subscribed = true;
        }
        self.shared.publish(&mut session, SessionState::Connected);
        Ok(())
    }

    async fn abandon(&self, generation: u64, error: &PillTickError) {
        let link = {
            let mut session = self.shared.session.lock().await;
            if session.generation != generation {
                // Closed or lost while opening; that path already settled the state.
                return;
            }
            let link = session.take_handles();
            self.shared.publish(&mut session, SessionState::Error);
            link
        };

        warn!("Opening session failed: {error}");
        if let Some(link) = link {
            if let Err(e) = link.device.disconnect().await {
                debug!("Ignoring disconnect failure after aborted open: {e}");
            }
        }
    }

    /// Send one text line to the device
    ///
    /// A single `\n` is appended and the UTF-8 bytes go out as one write.
    /// Concurrent callers are serialized; at most one write is in flight.
    ///
    /// # Errors
    ///
    /// - [`PillTickError::NotConnected`] outside [`SessionState::Connected`]; nothing is written
    /// - [`PillTickError::InvalidParameters`] for empty text or embedded line breaks
    /// - [`PillTickError::LineTooLong`] if the encoded line exceeds the configured maximum
    /// - [`PillTickError::WriteRejected`] if the write fails; it is not retried
    pub async fn send_line(&self, text: &str) -> Result<()> {
        let _in_flight = self.write_gate.lock().await;

        let (device, service, rx_char) = {
            let session = self.shared.session.lock().await;
            if session.state != SessionState::Connected {
                return Err(PillTickError::NotConnected);
            }
            let link = session.link.as_ref().ok_or(PillTickError::NotConnected)?;
            (Arc::clone(&link.device), link.service, link.rx_char)
        };

        let bytes = encode_line(text, self.max_line_bytes)?;
        debug!("You → {text}");

        device
            .write(service, rx_char, &bytes)
            .await
            .map_err(|e| PillTickError::WriteRejected(e.to_string()))
    }

    /// End the session; safe to call from any state
    ///
    /// Unsubscribes and disconnects best-effort, then always lands in
    /// [`SessionState::Idle`] with the wake lock released. If a session was open
    /// or opening, observers get the same [`SessionEvent::Disconnected`] as for
    /// a dropped link. An `open_session` still in flight fails with
    /// [`PillTickError::Disconnected`] and leaves no transport behind.
    pub async fn close_session(&self) {
        let (link, had_session) = {
            let mut session = self.shared.session.lock().await;
            let had_session = session.link.is_some()
                || session.state.is_opening()
                || session.state == SessionState::Connected;
            session.generation += 1;
            let link = session.take_handles();
            if link.is_some() {
                self.shared.publish(&mut session, SessionState::Disconnecting);
            }
            (link, had_session)
        };

        if let Some(link) = link {
            if link.subscribed {
                if let Err(e) = link.device.unsubscribe(link.service, link.tx_char).await {
                    debug!("Ignoring unsubscribe failure: {e}");
                }
            }
            if let Err(e) = link.device.disconnect().await {
                debug!("Ignoring disconnect failure: {e}");
            }
        }

        {
            let mut session = self.shared.session.lock().await;
            if session.state != SessionState::Idle {
                self.shared.publish(&mut session, SessionState::Idle);
            }
        }

        self.shared.wake_lock.release().await;
        if had_session {
            info!("Session closed");
            self.shared.notify(&SessionEvent::Disconnected);
        }
    }

    /// Return from [`SessionState::Error`] to [`SessionState::Idle`]
    pub async fn reset(&self) {
        let mut session = self.shared.session.lock().await;
        if session.state == SessionState::Error {
            self.shared.publish(&mut session, SessionState::Idle);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let Ok(mut session) = self.shared.session.try_lock() else {
            return;
        };
        let Some(link) = session.take_handles() else {
            return;
        };

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = link.device.disconnect().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{next_event, CountingWakeLock, MockChooser, MockDevice};
    use std::{sync::atomic::Ordering, time::Duration};
    use tokio_test::{assert_err, assert_ok};

    fn controller_for(device: &Arc<MockDevice>) -> (SessionController, Arc<CountingWakeLock>) {
        let wake_lock = Arc::new(CountingWakeLock::default());
        let controller = SessionController::new(
            Arc::new(MockChooser::selecting(Arc::clone(device))),
            wake_lock.clone(),
        );
        (controller, wake_lock)
    }

    async fn wait_for_state(controller: &SessionController, state: SessionState) {
        let mut status = controller.watch_status();
        tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .expect("status channel closed");
    }

    fn open_in_background(controller: &Arc<SessionController>) -> JoinHandle<Result<DeviceInfo>> {
        let controller = Arc::clone(controller);
        tokio::spawn(async move { controller.open_session(&SessionParams::default()).await })
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn test_open_session_walks_every_state() {
        let device = Arc::new(MockDevice::nus());
        let (controller, wake_lock) = controller_for(&device);
        let mut events = controller.subscribe();

        let info = assert_ok!(controller.open_session(&SessionParams::default()).await);
        assert_eq!(info.name, "PillBox-01");
        assert_eq!(controller.state(), SessionState::Connected);
        assert!(device.subscribed.load(Ordering::SeqCst));
        assert!(wake_lock.is_held());
        assert_eq!(wake_lock.acquires.load(Ordering::SeqCst), 1);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            [
                SessionState::Requesting,
                SessionState::Connecting,
                SessionState::DiscoveringService,
                SessionState::DiscoveringCharacteristics,
                SessionState::Subscribing,
                SessionState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_chooser_dismissed() {
        let wake_lock = Arc::new(CountingWakeLock::default());
        let controller = SessionController::new(Arc::new(MockChooser::dismissed()), wake_lock.clone());

        let err = assert_err!(controller.open_session(&SessionParams::default()).await);
        assert!(matches!(err, PillTickError::UserCancelled));
        assert_eq!(controller.state(), SessionState::Error);
        assert!(controller.device_info().await.is_none());
        assert!(!wake_lock.is_held());

        controller.reset().await;
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_open_session_failures_release_transport() {
        let cases = [
            (MockDevice::nus().failing_connect(), "unreachable"),
            (MockDevice::without_service(), "service"),
            (MockDevice::without_notify_characteristic(), "characteristic"),
            (MockDevice::nus().failing_subscribe(), "subscribe"),
        ];

        for (device, case) in cases {
            let device = Arc::new(device);
            let (controller, _) = controller_for(&device);

            let err = assert_err!(controller.open_session(&SessionParams::default()).await);
            match case {
                "unreachable" => assert!(matches!(err, PillTickError::DeviceUnreachable(_))),
                "service" => assert!(matches!(err, PillTickError::ServiceNotFound(_))),
                "characteristic" => assert!(matches!(
                    err,
                    PillTickError::CharacteristicNotFound(id) if id == crate::NUS_TX_CHAR_UUID
                )),
                _ => assert!(matches!(err, PillTickError::SubscriptionFailed(_))),
            }
            assert!(err.requires_reset(), "{case}");
            assert_eq!(controller.state(), SessionState::Error, "{case}");
            assert!(controller.device_info().await.is_none(), "{case}");
            assert!(!device.connected.load(Ordering::SeqCst), "{case}");
        }
    }

    #[tokio::test]
    async fn test_open_session_rejected_unless_idle() {
        let device = Arc::new(MockDevice::nus());
        let (controller, _) = controller_for(&device);
        assert_ok!(controller.open_session(&SessionParams::default()).await);

        let err = assert_err!(controller.open_session(&SessionParams::default()).await);
        assert!(matches!(err, PillTickError::SessionBusy { .. }));
        assert_eq!(controller.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_send_line_while_idle() {
        let device = Arc::new(MockDevice::nus());
        let (controller, _) = controller_for(&device);

        let err = assert_err!(controller.send_line("PING").await);
        assert!(matches!(err, PillTickError::NotConnected));
        assert!(device.written_lines().is_empty());
    }

    #[tokio::test]
    async fn test_send_line_appends_terminator() {
        let device = Arc::new(MockDevice::nus());
        let (controller, _) = controller_for(&device);
        assert_ok!(controller.open_session(&SessionParams::default()).await);

        assert_ok!(controller.send_line("SYNC_TIME 1700000000").await);
        assert_eq!(device.written_lines(), ["SYNC_TIME 1700000000\n"]);
    }

    #[tokio::test]
    async fn test_send_line_rejections() {
        let device = Arc::new(MockDevice::nus());
        let (controller, _) = controller_for(&device);
        let controller = controller.with_max_line_bytes(8);
        assert_ok!(controller.open_session(&SessionParams::default()).await);

        assert!(matches!(
            controller.send_line("").await,
            Err(PillTickError::InvalidParameters(_))
        ));
        assert!(matches!(
            controller.send_line("12345678").await,
            Err(PillTickError::LineTooLong { len: 9, max: 8 })
        ));

        device.fail_write.store(true, Ordering::SeqCst);
        assert!(matches!(
            controller.send_line("PING").await,
            Err(PillTickError::WriteRejected(_))
        ));
        assert_eq!(controller.state(), SessionState::Connected);
        assert!(device.written_lines().is_empty());
    }

    #[tokio::test]
    async fn test_one_write_in_flight() {
        let device = Arc::new(MockDevice::nus().with_write_delay(20));
        let (controller, _) = controller_for(&device);
        assert_ok!(controller.open_session(&SessionParams::default()).await);

        let (a, b, c) = tokio::join!(
            controller.send_line("A"),
            controller.send_line("B"),
            controller.send_line("C"),
        );
        assert_ok!(a);
        assert_ok!(b);
        assert_ok!(c);
        assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(device.written_lines().len(), 3);
    }

    #[tokio::test]
    async fn test_lines_delivered_in_order() {
        let device = Arc::new(MockDevice::nus());
        let (controller, _) = controller_for(&device);
        assert_ok!(controller.open_session(&SessionParams::default()).await);
        let mut first = controller.subscribe();
        let mut second = controller.subscribe();

        device.notify(b"OK\r\n");
        device.notify(b"NEXT 1700003600 Aspirin  ");

        for events in [&mut first, &mut second] {
            assert_eq!(
                next_event(events).await,
                SessionEvent::LineReceived("OK".to_string())
            );
            assert_eq!(
                next_event(events).await,
                SessionEvent::LineReceived("NEXT 1700003600 Aspirin".to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect() {
        let device = Arc::new(MockDevice::nus());
        let (controller, wake_lock) = controller_for(&device);
        assert_ok!(controller.open_session(&SessionParams::default()).await);
        let mut events = controller.subscribe();
        let mut status = controller.watch_status();

        device.drop_link();

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionState::Idle)
        );
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
        assert_eq!(*status.borrow_and_update(), SessionState::Idle);
        assert_eq!(status.borrow().to_string(), "disconnected");
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!wake_lock.is_held());
        assert!(controller.device_info().await.is_none());
        assert!(matches!(
            controller.send_line("PING").await,
            Err(PillTickError::NotConnected)
        ));

        // A fresh session may start right away.
        assert_ok!(controller.open_session(&SessionParams::default()).await);
    }

    #[tokio::test]
    async fn test_close_session_converges() {
        let device = Arc::new(MockDevice::nus());
        let (controller, wake_lock) = controller_for(&device);
        assert_ok!(controller.open_session(&SessionParams::default()).await);
        let mut events = controller.subscribe();

        device.fail_unsubscribe.store(true, Ordering::SeqCst);
        controller.close_session().await;

        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!wake_lock.is_held());
        assert!(!device.connected.load(Ordering::SeqCst));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            [
                SessionEvent::StateChanged(SessionState::Disconnecting),
                SessionEvent::StateChanged(SessionState::Idle),
                SessionEvent::Disconnected,
            ]
        );

        // The platform's own disconnect event must not produce a second notification.
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let device = Arc::new(MockDevice::nus());
        let (controller, wake_lock) = controller_for(&device);
        let mut events = controller.subscribe();

        controller.close_session().await;
        controller.close_session().await;

        assert_eq!(controller.state(), SessionState::Idle);
        assert!(events.try_recv().is_err());
        assert_eq!(wake_lock.releases.load(Ordering::SeqCst), 2);
        assert_eq!(device.disconnect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_session_clears_error() {
        let device = Arc::new(MockDevice::without_service());
        let (controller, _) = controller_for(&device);
        assert_err!(controller.open_session(&SessionParams::default()).await);
        assert_eq!(controller.state(), SessionState::Error);
        let mut events = controller.subscribe();

        controller.close_session().await;
        assert_eq!(controller.state(), SessionState::Idle);

        // Nothing was connected, so there is no disconnect to report.
        assert_eq!(
            drain(&mut events),
            [SessionEvent::StateChanged(SessionState::Idle)]
        );
    }

    #[tokio::test]
    async fn test_close_during_connect_leaves_no_transport() {
        let device = Arc::new(MockDevice::nus().with_connect_delay(50));
        let (controller, wake_lock) = controller_for(&device);
        let controller = Arc::new(controller);

        let opening = open_in_background(&controller);
        wait_for_state(&controller, SessionState::Connecting).await;
        let mut events = controller.subscribe();
        controller.close_session().await;

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(PillTickError::Disconnected)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!device.connected.load(Ordering::SeqCst));
        assert!(!wake_lock.is_held());
        assert!(controller.device_info().await.is_none());
        assert_eq!(
            drain(&mut events),
            [
                SessionEvent::StateChanged(SessionState::Disconnecting),
                SessionEvent::StateChanged(SessionState::Idle),
                SessionEvent::Disconnected,
            ]
        );

        assert_ok!(controller.open_session(&SessionParams::default()).await);
    }

    #[tokio::test]
    async fn test_close_during_subscribe_unsubscribes() {
        let device = Arc::new(MockDevice::nus().with_subscribe_delay(50));
        let (controller, _) = controller_for(&device);
        let controller = Arc::new(controller);

        let opening = open_in_background(&controller);
        wait_for_state(&controller, SessionState::Subscribing).await;
        controller.close_session().await;

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(PillTickError::Disconnected)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!device.subscribed.load(Ordering::SeqCst));
        assert!(!device.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_link_lost_while_opening() {
        let device = Arc::new(MockDevice::nus().with_connect_delay(50));
        let (controller, wake_lock) = controller_for(&device);
        let controller = Arc::new(controller);

        let opening = open_in_background(&controller);
        wait_for_state(&controller, SessionState::Connecting).await;
        let mut events = controller.subscribe();
        device.drop_link();

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionState::Idle)
        );
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(PillTickError::Disconnected)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!device.connected.load(Ordering::SeqCst));
        assert!(!wake_lock.is_held());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_while_wake_lock_pending_releases_it() {
        let device = Arc::new(MockDevice::nus());
        let wake_lock = Arc::new(CountingWakeLock::slow(50));
        let controller = Arc::new(SessionController::new(
            Arc::new(MockChooser::selecting(Arc::clone(&device))),
            wake_lock.clone(),
        ));

        let opening = open_in_background(&controller);
        wait_for_state(&controller, SessionState::Connected).await;
        controller.close_session().await;

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(PillTickError::Disconnected)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(wake_lock.acquires.load(Ordering::SeqCst), 1);
        assert!(!wake_lock.is_held());
        assert!(!device.connected.load(Ordering::SeqCst));
    }
}
