use crate::buffer::{try_alloc_chunk, BufferLedger, ReadBuffer};
use crate::device_events::{DeviceEvent, EventBus};
use crate::device_handle::{DeviceError, DeviceId};
use crate::transport::{Transport, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receives every captured chunk, in production order. The buffer is the
/// consumer's from here on.
pub type ReadDataCallback = Arc<dyn Fn(DeviceId, ReadBuffer) + Send + Sync>;

/// Fills the next outgoing chunk. The slice is only valid during the call.
pub type WriteDataCallback = Arc<dyn Fn(DeviceId, &mut [u8]) + Send + Sync>;

/// Told when a stream ends because of a communication failure
pub type ErrorCallback = Arc<dyn Fn(DeviceId, &TransportError) + Send + Sync>;

pub(crate) type LinkLostHook = Arc<dyn Fn(DeviceId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingState {
    Idle,
    Reading,
    Writing,
}

impl StreamingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingState::Idle => "idle",
            StreamingState::Reading => "reading",
            StreamingState::Writing => "writing",
        }
    }
}

impl fmt::Display for StreamingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamMode {
    Read,
    Write,
}

impl StreamMode {
    fn state(self) -> StreamingState {
        match self {
            StreamMode::Read => StreamingState::Reading,
            StreamMode::Write => StreamingState::Writing,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            StreamMode::Read => "read_start",
            StreamMode::Write => "write_start",
        }
    }

    fn thread_prefix(self) -> &'static str {
        match self {
            StreamMode::Read => "la-read",
            StreamMode::Write => "la-write",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamOptions {
    pub read_chunk_len: usize,
    pub write_chunk_len: usize,
    pub idle_poll: Duration,
}

struct Worker {
    generation: u64,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Worker {
    /// Signal the worker and wait for it, unless we are running on it
    fn halt(self) {
        self.stop.store(true, Ordering::Release);
        join_unless_current(self.thread);
    }
}

fn join_unless_current(thread: JoinHandle<()>) {
    if thread.thread().id() == thread::current().id() {
        // Called from inside a callback: the loop sees the flag on return
        return;
    }
    if thread.join().is_err() {
        log::warn!("Streaming worker panicked");
    }
}

struct Slot {
    state: StreamingState,
    worker: Option<Worker>,
    /// Worker that ended on its own and may still be running its error callback
    finished: Option<JoinHandle<()>>,
    generation: u64,
    ended_by_error: bool,
    detached: bool,
}

#[derive(Default)]
struct Callbacks {
    read: Option<ReadDataCallback>,
    write: Option<WriteDataCallback>,
    error: Option<ErrorCallback>,
}

struct StreamShared {
    device: DeviceId,
    transport: Arc<dyn Transport>,
    ledger: Arc<BufferLedger>,
    events: Arc<EventBus>,
    link_lost: LinkLostHook,
    options: StreamOptions,
    slot: Mutex<Slot>,
    callbacks: Mutex<Callbacks>,
}

/// Idle/Reading/Writing state machine of one device.
///
/// Start and stop return as soon as the transition is accepted; data moves on
/// a worker thread owned by the controller. Every state check and the
/// configuration calls guarded by `while_idle` serialize on the same lock.
pub struct StreamingController {
    shared: Arc<StreamShared>,
}

impl StreamingController {
    pub(crate) fn new(
        device: DeviceId,
        transport: Arc<dyn Transport>,
        ledger: Arc<BufferLedger>,
        events: Arc<EventBus>,
        link_lost: LinkLostHook,
        options: StreamOptions,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                device,
                transport,
                ledger,
                events,
                link_lost,
                options,
                slot: Mutex::new(Slot {
                    state: StreamingState::Idle,
                    worker: None,
                    finished: None,
                    generation: 0,
                    ended_by_error: false,
                    detached: false,
                }),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    pub fn state(&self) -> StreamingState {
        self.shared.slot().state
    }

    pub fn is_detached(&self) -> bool {
        self.shared.slot().detached
    }

    pub(crate) fn set_read_callback(&self, callback: ReadDataCallback) {
        self.shared.callbacks().read = Some(callback);
    }

    pub(crate) fn set_write_callback(&self, callback: WriteDataCallback) {
        self.shared.callbacks().write = Some(callback);
    }

    pub(crate) fn set_error_callback(&self, callback: ErrorCallback) {
        self.shared.callbacks().error = Some(callback);
    }

    /// Run `f` only while the device is attached and idle, holding off any
    /// start until it returns.
    pub(crate) fn while_idle<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce() -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let slot = self.shared.slot();
        if slot.detached {
            return Err(DeviceError::StaleHandle(self.shared.device));
        }
        if slot.state != StreamingState::Idle {
            return Err(DeviceError::InvalidStateTransition {
                device: self.shared.device,
                state: slot.state,
                requested: operation,
            });
        }
        f()
    }

    pub(crate) fn start(&self, mode: StreamMode) -> Result<(), DeviceError> {
        let device = self.shared.device;
        let mut slot = self.shared.slot();
        if slot.detached {
            return Err(DeviceError::StaleHandle(device));
        }
        if slot.state != StreamingState::Idle {
            return Err(DeviceError::InvalidStateTransition {
                device,
                state: slot.state,
                requested: mode.operation(),
            });
        }

        slot.generation += 1;
        let generation = slot.generation;
        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let worker_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name(format!("{}-{}", mode.thread_prefix(), device))
            .spawn(move || match mode {
                StreamMode::Read => shared.run_read(generation, &worker_stop),
                StreamMode::Write => shared.run_write(generation, &worker_stop),
            })?;

        // An earlier worker that failed on its own is left to finish
        slot.finished = None;
        slot.worker = Some(Worker {
            generation,
            stop,
            thread,
        });
        slot.state = mode.state();
        slot.ended_by_error = false;
        log::debug!("Device {} {}", device, mode.state());
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<(), DeviceError> {
        let device = self.shared.device;
        let worker = {
            let mut slot = self.shared.slot();
            if slot.detached {
                return Err(DeviceError::StaleHandle(device));
            }
            if slot.state == StreamingState::Idle {
                if std::mem::take(&mut slot.ended_by_error) {
                    log::debug!("Device {} already stopped by a device error", device);
                    return Ok(());
                }
                return Err(DeviceError::InvalidStateTransition {
                    device,
                    state: StreamingState::Idle,
                    requested: "stop",
                });
            }
            slot.state = StreamingState::Idle;
            slot.worker.take()
        };

        if let Some(worker) = worker {
            worker.halt();
        }
        log::debug!("Device {} idle", device);
        Ok(())
    }

    /// Stop whatever runs and refuse every later call. Used on disconnect.
    pub(crate) fn detach(&self) {
        let (worker, finished) = {
            let mut slot = self.shared.slot();
            slot.detached = true;
            slot.state = StreamingState::Idle;
            (slot.worker.take(), slot.finished.take())
        };
        if let Some(worker) = worker {
            worker.halt();
        }
        if let Some(finished) = finished {
            join_unless_current(finished);
        }
        // Registrants get their contexts back
        *self.shared.callbacks() = Callbacks::default();
    }
}

impl StreamShared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_read(&self, generation: u64, stop: &AtomicBool) {
        let span = tracing::debug_span!("read_stream", device = %self.device);
        let _enter = span.enter();

        let len = self.options.read_chunk_len;
        let mut sequence = 0u64;

        while !stop.load(Ordering::Acquire) {
            // Data stays on the device until someone can take it
            let callback = self.callbacks().read.clone();
            let Some(callback) = callback else {
                thread::sleep(self.options.idle_poll);
                continue;
            };

            let Some(mut chunk) = try_alloc_chunk(len) else {
                self.fail(generation, TransportError::BufferAllocation { len });
                return;
            };

            let n = match self.transport.read_chunk(&mut chunk) {
                Ok(0) => {
                    thread::sleep(self.options.idle_poll);
                    continue;
                }
                Ok(n) => n.min(len),
                Err(e) => {
                    self.fail(generation, e);
                    return;
                }
            };
            chunk.truncate(n);

            if stop.load(Ordering::Acquire) {
                break;
            }
            self.deliver(&callback, sequence, chunk);
            sequence += 1;
        }

        log::debug!("Read stream of device {} ended after {} chunks", self.device, sequence);
    }

    fn deliver(&self, callback: &ReadDataCallback, sequence: u64, chunk: Vec<u8>) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("deliver_chunk"), 0));

        let len = chunk.len();
        let buffer = ReadBuffer::deliver(&self.ledger, self.device, sequence, chunk);
        self.events.publish(&DeviceEvent::ReadData {
            device: self.device,
            sequence,
            len,
        });
        callback(self.device, buffer);
    }

    fn run_write(&self, generation: u64, stop: &AtomicBool) {
        let span = tracing::debug_span!("write_stream", device = %self.device);
        let _enter = span.enter();

        let len = self.options.write_chunk_len;
        let mut written = 0u64;

        while !stop.load(Ordering::Acquire) {
            let callback = self.callbacks().write.clone();
            let Some(callback) = callback else {
                thread::sleep(self.options.idle_poll);
                continue;
            };

            let Some(mut chunk) = try_alloc_chunk(len) else {
                self.fail(generation, TransportError::BufferAllocation { len });
                return;
            };
            callback(self.device, &mut chunk);

            // A chunk the consumer already filled goes out even if stop arrived meanwhile
            if let Err(e) = self.transport.write_chunk(&chunk) {
                self.fail(generation, e);
                return;
            }
            written += 1;
        }

        log::debug!("Write stream of device {} ended after {} chunks", self.device, written);
    }

    /// End the stream from the worker itself after a communication failure
    fn fail(&self, generation: u64, error: TransportError) {
        let owned = {
            let mut slot = self.slot();
            let current = slot.worker.as_ref().map(|w| w.generation) == Some(generation);
            if current {
                slot.finished = slot.worker.take().map(|w| w.thread);
                slot.state = StreamingState::Idle;
                slot.ended_by_error = true;
            }
            current
        };

        if owned {
            log::warn!("Streaming on device {} stopped: {}", self.device, error);
            self.events.publish(&DeviceEvent::Error {
                device: self.device,
                message: error.to_string(),
            });
            let callback = self.callbacks().error.clone();
            if let Some(callback) = callback {
                callback(self.device, &error);
            }
        }

        if error.is_disconnect() {
            (self.link_lost)(self.device);
        }
    }
}
