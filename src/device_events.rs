use crate::device_handle::DeviceId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

bitflags::bitflags! {
    /// Kinds of events a listener wants to receive
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        const CONNECT = 1 << 0;
        const DISCONNECT = 1 << 1;
        const ERROR = 1 << 2;
        const READ_DATA = 1 << 3;
        const DISCOVERY_ERROR = 1 << 4;
        const ALL = Self::CONNECT.bits()
            | Self::DISCONNECT.bits()
            | Self::ERROR.bits()
            | Self::READ_DATA.bits()
            | Self::DISCOVERY_ERROR.bits();
    }
}

/// Notification published to channel listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(DeviceId),
    Disconnected(DeviceId),
    /// Streaming stopped because of a communication failure
    Error { device: DeviceId, message: String },
    /// A read chunk was handed to the read-data callback
    ReadData {
        device: DeviceId,
        sequence: u64,
        len: usize,
    },
    DiscoveryError(String),
}

impl DeviceEvent {
    pub fn kind(&self) -> EventMask {
        match self {
            DeviceEvent::Connected(_) => EventMask::CONNECT,
            DeviceEvent::Disconnected(_) => EventMask::DISCONNECT,
            DeviceEvent::Error { .. } => EventMask::ERROR,
            DeviceEvent::ReadData { .. } => EventMask::READ_DATA,
            DeviceEvent::DiscoveryError(_) => EventMask::DISCOVERY_ERROR,
        }
    }

    pub fn device(&self) -> Option<DeviceId> {
        match self {
            DeviceEvent::Connected(id) | DeviceEvent::Disconnected(id) => Some(*id),
            DeviceEvent::Error { device, .. } | DeviceEvent::ReadData { device, .. } => {
                Some(*device)
            }
            DeviceEvent::DiscoveryError(_) => None,
        }
    }
}

struct Listener {
    mask: EventMask,
    sender: Sender<DeviceEvent>,
}

/// Fan-out of device events to any number of channel listeners
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, mask: EventMask) -> Receiver<DeviceEvent> {
        let (sender, receiver) = unbounded();
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Listener { mask, sender });
        receiver
    }

    /// Deliver to every interested listener, forgetting the ones whose
    /// receiver was dropped.
    pub fn publish(&self, event: &DeviceEvent) {
        let kind = event.kind();
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        listeners.retain(|listener| {
            if !listener.mask.intersects(kind) {
                return true;
            }
            listener.sender.send(event.clone()).is_ok()
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_filters_events() {
        let bus = EventBus::new();
        let connects = bus.subscribe(EventMask::CONNECT);
        let everything = bus.subscribe(EventMask::ALL);

        bus.publish(&DeviceEvent::Connected(DeviceId::new(1)));
        bus.publish(&DeviceEvent::Disconnected(DeviceId::new(1)));

        assert_eq!(connects.try_iter().collect::<Vec<_>>(), vec![DeviceEvent::Connected(DeviceId::new(1))]);
        assert_eq!(everything.try_iter().count(), 2);
    }

    #[test]
    fn test_dropped_listener_is_forgotten() {
        let bus = EventBus::new();
        let receiver = bus.subscribe(EventMask::ALL);
        assert_eq!(bus.listener_count(), 1);

        drop(receiver);
        bus.publish(&DeviceEvent::DiscoveryError("no bus".into()));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_event_kind_and_device() {
        let event = DeviceEvent::ReadData {
            device: DeviceId::new(3),
            sequence: 0,
            len: 512,
        };
        assert_eq!(event.kind(), EventMask::READ_DATA);
        assert_eq!(event.device(), Some(DeviceId::new(3)));
        assert_eq!(DeviceEvent::DiscoveryError(String::new()).device(), None);
    }
}
