use crate::{
    address::HardwareAddress,
    button::ButtonIntent,
    config::RuntimeConfig,
    error::{Error, Result},
    presence::PresenceMonitor,
    protocol::{build_shutdown_payload, build_wake_packet, parse_heartbeat, DatagramTransport},
    store::TargetStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Wake,
    Shutdown,
}

impl Command {
    pub fn from_switch(on: bool) -> Self {
        if on {
            Self::Wake
        } else {
            Self::Shutdown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wake => "WAKE",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOutcome {
    Sent(Command, HardwareAddress),
    FactoryReset,
}

pub struct CommandDispatcher<S, T> {
    store: S,
    transport: T,
    presence: PresenceMonitor,
    wake_port: u16,
    shutdown_port: u16,
}

impl<S: TargetStore, T: DatagramTransport> CommandDispatcher<S, T> {
    pub fn new(store: S, transport: T, config: &RuntimeConfig) -> Self {
        Self {
            store,
            transport,
            presence: PresenceMonitor::new(config.presence.clone()),
            wake_port: config.network.wake_port,
            shutdown_port: config.network.shutdown_port,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn presence(&self) -> &PresenceMonitor {
        &self.presence
    }

    pub fn target(&self) -> Result<HardwareAddress> {
        self.store.get()?.target().ok_or(Error::TargetNotConfigured)
    }

    pub fn send(&mut self, command: Command, now_ms: u64) -> Result<HardwareAddress> {
        let target = self.target()?;
        match command {
            Command::Wake => {
                self.transport
                    .send_broadcast(self.wake_port, &build_wake_packet(&target))?;
                self.presence.wake_issued(now_ms);
            }
            Command::Shutdown => {
                self.transport.send_broadcast(
                    self.shutdown_port,
                    build_shutdown_payload(&target).as_bytes(),
                )?;
            }
        }
        Ok(target)
    }

    pub fn wake(&mut self, now_ms: u64) -> Result<HardwareAddress> {
        self.send(Command::Wake, now_ms)
    }

    pub fn shutdown(&mut self, now_ms: u64) -> Result<HardwareAddress> {
        self.send(Command::Shutdown, now_ms)
    }

    // The switch reports success without a target; the write is only dropped.
    pub fn switch_write(&mut self, on: bool, now_ms: u64) -> Result<Option<HardwareAddress>> {
        match self.send(Command::from_switch(on), now_ms) {
            Ok(target) => Ok(Some(target)),
            Err(Error::TargetNotConfigured) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn handle_intent(&mut self, intent: ButtonIntent, now_ms: u64) -> Result<IntentOutcome> {
        let command = match intent {
            ButtonIntent::Tap => Command::Wake,
            ButtonIntent::DoubleTap => Command::Shutdown,
            ButtonIntent::LongPress => {
                self.factory_reset()?;
                return Ok(IntentOutcome::FactoryReset);
            }
        };
        let target = self.send(command, now_ms)?;
        Ok(IntentOutcome::Sent(command, target))
    }

    pub fn factory_reset(&mut self) -> Result<()> {
        self.store.erase()?;
        self.presence = PresenceMonitor::new(self.presence.config.clone());
        Ok(())
    }

    pub fn heartbeat_datagram(&mut self, datagram: &[u8], now_ms: u64) -> Result<bool> {
        let Some(source) = parse_heartbeat(datagram) else {
            return Ok(false);
        };
        let target = self.store.get()?;
        Ok(self.presence.heartbeat_received(source, &target, now_ms))
    }

    pub fn is_online(&self, now_ms: u64) -> bool {
        self.presence.is_online(now_ms)
    }

    pub fn poll_online(&mut self, now_ms: u64) -> Option<bool> {
        self.presence.poll(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex};

    use super::*;
    use crate::store::{MemoryTargetStore, StoreFault};

    const TARGET: HardwareAddress = HardwareAddress::new([0x22, 0x33, 0x4D, 0x06, 0x43, 0xED]);

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(u16, Vec<u8>)>>,
        fail: bool,
    }

    impl DatagramTransport for RecordingTransport {
        fn send_broadcast(&self, port: u16, payload: &[u8]) -> Result<usize> {
            if self.fail {
                return Err(Error::SendFailed(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no route",
                )));
            }
            self.sent.lock().unwrap().push((port, payload.to_vec()));
            Ok(payload.len())
        }
    }

    fn dispatcher(
        store: MemoryTargetStore,
    ) -> CommandDispatcher<MemoryTargetStore, RecordingTransport> {
        CommandDispatcher::new(store, RecordingTransport::default(), &RuntimeConfig::default())
    }

    fn sent(
        dispatcher: &CommandDispatcher<MemoryTargetStore, RecordingTransport>,
    ) -> Vec<(u16, Vec<u8>)> {
        dispatcher.transport.sent.lock().unwrap().clone()
    }

    #[test]
    fn tap_sends_magic_packet_and_opens_grace_window() {
        let mut dispatcher = dispatcher(MemoryTargetStore::with_target(TARGET));
        let outcome = dispatcher.handle_intent(ButtonIntent::Tap, 1_000).unwrap();

        assert_eq!(outcome, IntentOutcome::Sent(Command::Wake, TARGET));
        let sent = sent(&dispatcher);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 9);
        assert_eq!(sent[0].1, build_wake_packet(&TARGET).to_vec());
        assert!(dispatcher.is_online(30_999));
        assert!(!dispatcher.is_online(31_000));
    }

    #[test]
    fn double_tap_sends_shutdown() {
        let mut dispatcher = dispatcher(MemoryTargetStore::with_target(TARGET));
        dispatcher.handle_intent(ButtonIntent::DoubleTap, 0).unwrap();

        assert_eq!(
            sent(&dispatcher),
            vec![(40_000, b"SHUTDOWN_ESP|22334D0643ED".to_vec())]
        );
        assert!(!dispatcher.is_online(0));
    }

    #[test]
    fn switch_write_maps_to_commands() {
        let mut dispatcher = dispatcher(MemoryTargetStore::with_target(TARGET));
        dispatcher.switch_write(true, 0).unwrap();
        dispatcher.switch_write(false, 10).unwrap();

        let ports: Vec<u16> = sent(&dispatcher).into_iter().map(|(port, _)| port).collect();
        assert_eq!(ports, vec![9, 40_000]);
    }

    #[test]
    fn switch_write_without_target_is_accepted() {
        let mut dispatcher = dispatcher(MemoryTargetStore::new());
        assert_eq!(dispatcher.switch_write(true, 0).unwrap(), None);
        assert_eq!(dispatcher.switch_write(false, 10).unwrap(), None);
        assert!(sent(&dispatcher).is_empty());
        assert!(!dispatcher.is_online(10));
    }

    #[test]
    fn shutdown_port_is_independent_of_heartbeat_listener() {
        let mut config = RuntimeConfig::default();
        config.network.heartbeat_port = 41_000;
        let mut dispatcher = CommandDispatcher::new(
            MemoryTargetStore::with_target(TARGET),
            RecordingTransport::default(),
            &config,
        );
        dispatcher.shutdown(0).unwrap();
        assert_eq!(sent(&dispatcher)[0].0, 40_000);
    }

    #[test]
    fn commands_without_target_are_no_ops() {
        let mut dispatcher = dispatcher(MemoryTargetStore::new());
        assert!(matches!(dispatcher.wake(0), Err(Error::TargetNotConfigured)));
        assert!(matches!(dispatcher.shutdown(0), Err(Error::TargetNotConfigured)));
        assert!(sent(&dispatcher).is_empty());
        assert!(!dispatcher.is_online(0));
    }

    #[test]
    fn failed_send_does_not_open_grace_window() {
        let mut dispatcher = CommandDispatcher::new(
            MemoryTargetStore::with_target(TARGET),
            RecordingTransport {
                fail: true,
                ..Default::default()
            },
            &RuntimeConfig::default(),
        );
        assert!(matches!(dispatcher.wake(0), Err(Error::SendFailed(_))));
        assert!(!dispatcher.is_online(0));
    }

    #[test]
    fn unavailable_store_fails_the_call_only() {
        let store = MemoryTargetStore::with_target(TARGET);
        store.inject_fault(StoreFault::Unavailable);
        let mut dispatcher = dispatcher(store);

        assert!(matches!(dispatcher.wake(0), Err(Error::StorageUnavailable { .. })));
        dispatcher.store().inject_fault(StoreFault::None);
        assert!(dispatcher.wake(1).is_ok());
    }

    #[test]
    fn heartbeat_datagrams_drive_presence_edges() {
        let mut dispatcher = dispatcher(MemoryTargetStore::with_target(TARGET));

        assert!(!dispatcher.heartbeat_datagram(b"HELLO", 0).unwrap());
        assert!(!dispatcher.heartbeat_datagram(b"HEARTBEAT|AABBCCDDEEFF", 0).unwrap());
        assert_eq!(dispatcher.poll_online(0), None);

        assert!(dispatcher.heartbeat_datagram(b"HEARTBEAT|22334d0643ed\n", 100).unwrap());
        assert_eq!(dispatcher.poll_online(100), Some(true));
        assert_eq!(dispatcher.poll_online(2_000), None);
        assert_eq!(dispatcher.poll_online(2_100), Some(false));
    }

    #[test]
    fn long_press_erases_target() {
        let mut dispatcher = dispatcher(MemoryTargetStore::with_target(TARGET));
        dispatcher.wake(0).unwrap();

        let outcome = dispatcher.handle_intent(ButtonIntent::LongPress, 10).unwrap();
        assert_eq!(outcome, IntentOutcome::FactoryReset);
        assert!(!dispatcher.store().get().unwrap().valid);
        assert!(!dispatcher.is_online(10));
    }
}
