use crate::buffer::{BufferError, BufferLedger, ReadBuffer};
use crate::device_events::{DeviceEvent, EventBus, EventMask};
use crate::device_handle::{DeviceHandle, DeviceId};
use crate::streaming::{LinkLostHook, StreamOptions};
use crate::transport::{DeviceDiscovery, DiscoveredDevice, PhysicalKey, TransportError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type ConnectCallback = Arc<dyn Fn(DeviceId, DeviceHandle) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(DeviceId) + Send + Sync>;
pub type DiscoveryErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionManagerError {
    #[error("Failed to start the connection dispatch thread: {0}")]
    DispatchThread(#[from] std::io::Error),
}

/// Tunables of a `ConnectionManager`
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Largest chunk handed to a read-data callback
    pub read_chunk_len: usize,
    /// Size of the buffer a write-data callback fills
    pub write_chunk_len: usize,
    /// Pause before asking an idle transport again
    pub idle_poll: Duration,
    pub dispatch_thread_name: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            read_chunk_len: 16 * 1024,
            write_chunk_len: 4 * 1024,
            idle_poll: Duration::from_millis(1),
            dispatch_thread_name: "la-dispatch".to_string(),
        }
    }
}

impl ManagerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_chunk_len(mut self, len: usize) -> Self {
        self.read_chunk_len = len.max(1);
        self
    }

    pub fn write_chunk_len(mut self, len: usize) -> Self {
        self.write_chunk_len = len.max(1);
        self
    }

    pub fn idle_poll(mut self, interval: Duration) -> Self {
        self.idle_poll = interval;
        self
    }

    pub fn dispatch_thread_name(mut self, name: &str) -> Self {
        self.dispatch_thread_name = name.to_string();
        self
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            read_chunk_len: self.read_chunk_len,
            write_chunk_len: self.write_chunk_len,
            idle_poll: self.idle_poll,
        }
    }
}

enum Command {
    Scan,
    LinkLost(DeviceId),
    Shutdown,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, DeviceHandle>,
    by_key: HashMap<PhysicalKey, DeviceId>,
}

#[derive(Default)]
struct Observers {
    connect: Vec<ConnectCallback>,
    disconnect: Vec<DisconnectCallback>,
    discovery_error: Vec<DiscoveryErrorCallback>,
}

struct ManagerShared {
    discovery: Box<dyn DeviceDiscovery>,
    registry: Mutex<Registry>,
    observers: Mutex<Observers>,
    events: Arc<EventBus>,
    ledger: Arc<BufferLedger>,
    options: ManagerOptions,
}

/// Single point of truth for which devices are connected.
///
/// Discovery, connect and disconnect handling run on a dispatch thread owned
/// by the manager, and every connect/disconnect observer is called from it.
/// Dropping the manager disconnects all devices and joins that thread.
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    commands: Sender<Command>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(discovery: impl DeviceDiscovery + 'static) -> Result<Self, ConnectionManagerError> {
        Self::with_options(discovery, ManagerOptions::default())
    }

    pub fn with_options(
        discovery: impl DeviceDiscovery + 'static,
        options: ManagerOptions,
    ) -> Result<Self, ConnectionManagerError> {
        let (commands, receiver) = unbounded();
        let thread_name = options.dispatch_thread_name.clone();

        let shared = Arc::new(ManagerShared {
            discovery: Box::new(discovery),
            registry: Mutex::new(Registry::default()),
            observers: Mutex::new(Observers::default()),
            events: Arc::new(EventBus::new()),
            ledger: Arc::new(BufferLedger::new()),
            options,
        });

        let dispatch_shared = Arc::clone(&shared);
        let dispatch_commands = commands.clone();
        let dispatcher = thread::Builder::new()
            .name(thread_name)
            .spawn(move || dispatch_shared.run_dispatch(&receiver, &dispatch_commands))?;

        Ok(Self {
            shared,
            commands,
            dispatcher: Some(dispatcher),
        })
    }

    /// Ask for a rescan of the bus. Returns at once; results arrive through
    /// the connect/disconnect observers, failures through the discovery
    /// error observers.
    pub fn begin_discovery(&self) {
        if self.commands.send(Command::Scan).is_err() {
            log::warn!("Connection dispatch thread is gone, discovery request dropped");
        }
    }

    /// Called once per newly connected device. Registering twice means
    /// being called twice.
    pub fn register_on_connect<F>(&self, callback: F)
    where
        F: Fn(DeviceId, DeviceHandle) + Send + Sync + 'static,
    {
        self.shared.observers().connect.push(Arc::new(callback));
    }

    /// Called once per disconnected device, after its handle went stale
    pub fn register_on_disconnect<F>(&self, callback: F)
    where
        F: Fn(DeviceId) + Send + Sync + 'static,
    {
        self.shared.observers().disconnect.push(Arc::new(callback));
    }

    pub fn register_on_discovery_error<F>(&self, callback: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.shared.observers().discovery_error.push(Arc::new(callback));
    }

    /// Channel listener for the kinds of events in `mask`
    pub fn subscribe(&self, mask: EventMask) -> Receiver<DeviceEvent> {
        self.shared.events.subscribe(mask)
    }

    /// Give back a buffer delivered by a read stream.
    ///
    /// A buffer can only be given back once, since releasing consumes it:
    ///
    /// ```compile_fail
    /// # use logic_device_rs::{ConnectionManager, ReadBuffer};
    /// fn release_twice(manager: &ConnectionManager, buffer: ReadBuffer) {
    ///     let _ = manager.release_buffer(buffer);
    ///     let _ = manager.release_buffer(buffer);
    /// }
    /// ```
    pub fn release_buffer(&self, buffer: ReadBuffer) -> Result<(), BufferError> {
        if !buffer.belongs_to(&self.shared.ledger) {
            return Err(BufferError::ForeignBuffer {
                device: buffer.device_id(),
            });
        }
        drop(buffer);
        Ok(())
    }

    pub fn buffers(&self) -> &BufferLedger {
        &self.shared.ledger
    }

    pub fn device(&self, id: DeviceId) -> Option<DeviceHandle> {
        self.shared.registry().devices.get(&id).cloned()
    }

    /// Connected devices, oldest connection first
    pub fn devices(&self) -> Vec<DeviceHandle> {
        let mut devices: Vec<DeviceHandle> =
            self.shared.registry().devices.values().cloned().collect();
        devices.sort_by_key(DeviceHandle::id);
        devices
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.shared.options
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.thread().id() == thread::current().id() {
                return;
            }
            if dispatcher.join().is_err() {
                log::warn!("Connection dispatch thread panicked");
            }
        }
    }
}

impl ManagerShared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_dispatch(&self, receiver: &Receiver<Command>, commands: &Sender<Command>) {
        let span = tracing::debug_span!("connection_dispatch");
        let _enter = span.enter();

        for command in receiver {
            match command {
                Command::Scan => self.scan(commands),
                Command::LinkLost(id) => self.disconnect(id),
                Command::Shutdown => break,
            }
        }

        let ids: Vec<DeviceId> = self.registry().devices.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        log::debug!("Connection dispatch stopped");
    }

    fn scan(&self, commands: &Sender<Command>) {
        let found = match self.discovery.scan() {
            Ok(found) => found,
            Err(e) => {
                self.report_discovery_error(&e);
                return;
            }
        };

        let present: HashSet<&PhysicalKey> = found.iter().map(|d| &d.key).collect();
        let vanished: Vec<DeviceId> = self
            .registry()
            .by_key
            .iter()
            .filter(|(key, _)| !present.contains(key))
            .map(|(_, id)| *id)
            .collect();
        for id in vanished {
            self.disconnect(id);
        }

        for discovered in found {
            if self.registry().by_key.contains_key(&discovered.key) {
                continue;
            }
            self.connect(discovered, commands);
        }
    }

    fn connect(&self, discovered: DiscoveredDevice, commands: &Sender<Command>) {
        let id = DeviceId::allocate();
        let key = discovered.key.clone();

        let lost_sender = commands.clone();
        let link_lost: LinkLostHook = Arc::new(move |device| {
            let _ = lost_sender.send(Command::LinkLost(device));
        });

        let handle = match DeviceHandle::attach(
            id,
            discovered,
            Arc::clone(&self.ledger),
            Arc::clone(&self.events),
            link_lost,
            self.options.stream_options(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Failed to initialize device at {}: {}", key, e);
                self.report_discovery_error(&e);
                return;
            }
        };

        {
            let mut registry = self.registry();
            registry.by_key.insert(key.clone(), id);
            registry.devices.insert(id, handle.clone());
        }
        log::info!(
            "Device {} connected: {} at {} ({})",
            id,
            handle.class(),
            key,
            if handle.is_usb2() { "high speed" } else { "full speed" }
        );

        self.events.publish(&DeviceEvent::Connected(id));
        let observers = self.observers().connect.clone();
        for observer in observers {
            observer(id, handle.clone());
        }
    }

    fn disconnect(&self, id: DeviceId) {
        let handle = {
            let mut registry = self.registry();
            let Some(handle) = registry.devices.remove(&id) else {
                return;
            };
            registry.by_key.remove(handle.physical_key());
            handle
        };

        handle.detach();
        log::info!("Device {} disconnected", id);

        self.events.publish(&DeviceEvent::Disconnected(id));
        let observers = self.observers().disconnect.clone();
        for observer in observers {
            observer(id);
        }
    }

    fn report_discovery_error(&self, error: &TransportError) {
        log::warn!("Device discovery failed: {}", error);
        self.events
            .publish(&DeviceEvent::DiscoveryError(error.to_string()));
        let observers = self.observers().discovery_error.clone();
        for observer in observers {
            observer(error);
        }
    }
}
