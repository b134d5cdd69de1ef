//! Service runtime
//!
//! One event-loop task owns the [`ModbusSession`]. Everything else (the TCP
//! link, timers, API callers) talks to it through a single mpsc channel, so
//! engine state is only ever touched from that task.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_modbus::{
    CoilAction, EventSink, ModbusError, ModbusSession, Response, Scheduler, SessionStats,
    SignalValue, Task,
};

use crate::config::RelayConfig;
use crate::error::{RelaySrvError, Result};
use crate::link::{run_link, ChannelTransport, LinkEvent};

/// Capacity of the published-event broadcast
const EVENT_BUS_CAPACITY: usize = 256;

/// Input of the event loop
#[derive(Debug)]
pub enum Event {
    Link(LinkEvent),
    Task(Task),
    Command(Command),
}

/// Request from a [`ServiceHandle`]
pub enum Command {
    ReadCoils {
        start: u16,
        count: u16,
        reply: oneshot::Sender<relay_modbus::Result<Response>>,
    },
    ReadRegisters {
        start: u16,
        count: u16,
        reply: oneshot::Sender<relay_modbus::Result<Response>>,
    },
    WriteCoil {
        address: u16,
        state: bool,
        reply: oneshot::Sender<relay_modbus::Result<Response>>,
    },
    CoilAction {
        name: String,
        action: CoilAction,
        reply: oneshot::Sender<relay_modbus::Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    EventNames {
        reply: oneshot::Sender<Vec<String>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadCoils { start, count, .. } => write!(f, "ReadCoils({start}, {count})"),
            Self::ReadRegisters { start, count, .. } => {
                write!(f, "ReadRegisters({start}, {count})")
            },
            Self::WriteCoil { address, state, .. } => write!(f, "WriteCoil({address}, {state})"),
            Self::CoilAction { name, action, .. } => write!(f, "CoilAction({name}, {action})"),
            Self::Stats { .. } => f.write_str("Stats"),
            Self::EventNames { .. } => f.write_str("EventNames"),
        }
    }
}

/// Timer service: each task sleeps on the runtime, then comes back through
/// the event channel
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<Event>,
    token: CancellationToken,
}

impl TokioScheduler {
    pub fn new(events: mpsc::UnboundedSender<Event>, token: CancellationToken) -> Self {
        Self { events, token }
    }
}

impl Scheduler for TokioScheduler {
    fn run_after(&mut self, delay: Duration, task: Task) {
        let events = self.events.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(Event::Task(task));
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A published event as seen by subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedEvent {
    pub name: String,
    pub value: SignalValue,
    pub at: DateTime<Local>,
}

/// Sink that logs every event and fans it out to subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PublishedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for EventBus {
    fn publish(&mut self, event: &str, value: &SignalValue) {
        info!("{} = {}", event, value);
        // No subscribers is fine
        let _ = self.tx.send(PublishedEvent {
            name: event.to_string(),
            value: value.clone(),
            at: Local::now(),
        });
    }
}

type Session = ModbusSession<ChannelTransport, TokioScheduler, EventBus>;

/// Clonable API to a running service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    events: mpsc::UnboundedSender<Event>,
    bus: broadcast::Sender<PublishedEvent>,
    connected: watch::Receiver<bool>,
    token: CancellationToken,
}

impl ServiceHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.events
            .send(Event::Command(command))
            .map_err(|_| RelaySrvError::ServiceStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| RelaySrvError::ServiceStopped)
    }

    pub async fn read_coils(&self, start: u16, count: u16) -> Result<Vec<bool>> {
        let response = self
            .request(|reply| Command::ReadCoils { start, count, reply })
            .await??;
        match response {
            Response::Coils(bits) => Ok(bits),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let response = self
            .request(|reply| Command::ReadRegisters { start, count, reply })
            .await??;
        match response {
            Response::Registers(registers) => Ok(registers),
            other => Err(unexpected(other)),
        }
    }

    /// Write one coil; returns the state confirmed by the device
    pub async fn write_coil(&self, address: u16, state: bool) -> Result<bool> {
        let response = self
            .request(|reply| Command::WriteCoil {
                address,
                state,
                reply,
            })
            .await??;
        match response {
            Response::CoilWritten(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    /// Run an action on a writable coil by point name or label
    pub async fn coil_action(&self, name: &str, action: CoilAction) -> Result<()> {
        let name = name.to_string();
        Ok(self
            .request(|reply| Command::CoilAction {
                name,
                action,
                reply,
            })
            .await??)
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn event_names(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::EventNames { reply }).await
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.bus.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the device connection is up
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut connected = self.connected.clone();
        let outcome = tokio::time::timeout(limit, connected.wait_for(|up| *up))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelaySrvError::ServiceStopped),
            Err(_) => Err(RelaySrvError::Timeout(format!(
                "not connected after {:?}",
                limit
            ))),
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

fn unexpected(response: Response) -> RelaySrvError {
    RelaySrvError::Modbus(ModbusError::Malformed(format!(
        "unexpected response {:?}",
        response
    )))
}

/// A running service: the handle plus its tasks
#[derive(Debug)]
pub struct RelayService {
    handle: ServiceHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayService {
    /// Build the session and spawn the event loop and TCP link
    pub fn start(config: &RelayConfig, token: CancellationToken) -> Result<Self> {
        let banks = config.banks()?;
        let points = config.points();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let bus = EventBus::new(EVENT_BUS_CAPACITY);

        let session = ModbusSession::new(
            config.session_config(),
            &banks,
            &points,
            ChannelTransport::new(link_tx),
            TokioScheduler::new(event_tx.clone(), token.clone()),
            bus.clone(),
        );

        let handle = ServiceHandle {
            events: event_tx.clone(),
            bus: bus.tx.clone(),
            connected: connected_rx,
            token: token.clone(),
        };

        let event_loop = tokio::spawn(run_event_loop(
            session,
            event_rx,
            connected_tx,
            token.clone(),
        ));
        let link = tokio::spawn(run_link(config.link_config(), link_rx, event_tx, token));

        Ok(Self {
            handle,
            tasks: vec![event_loop, link],
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Wait for every task to finish (after shutdown)
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Service task failed: {}", e);
            }
        }
    }
}

async fn run_event_loop(
    mut session: Session,
    mut events: mpsc::UnboundedReceiver<Event>,
    connected: watch::Sender<bool>,
    token: CancellationToken,
) {
    session.start();

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(&mut session, event, &connected);
    }

    session.shutdown();
    connected.send_replace(false);
    info!("Event loop stopped");
}

fn handle_event(session: &mut Session, event: Event, connected: &watch::Sender<bool>) {
    match event {
        Event::Link(LinkEvent::Connected) => {
            session.on_connected();
            connected.send_replace(true);
        },
        Event::Link(LinkEvent::Disconnected) => {
            session.on_disconnected();
            connected.send_replace(false);
        },
        Event::Link(LinkEvent::Received(data)) => session.on_received(&data),
        Event::Link(LinkEvent::Sent(data)) => session.on_sent(&data),
        Event::Link(LinkEvent::TransportTimeout) => session.on_transport_timeout(),
        Event::Task(task) => session.on_task(task),
        Event::Command(command) => {
            debug!("Command: {:?}", command);
            handle_command(session, command);
        },
    }
}

fn handle_command(session: &mut Session, command: Command) {
    match command {
        Command::ReadCoils { start, count, reply } => {
            session.read_coils(start, count, Box::new(move |result| {
                let _ = reply.send(result);
            }));
        },
        Command::ReadRegisters { start, count, reply } => {
            session.read_registers(start, count, Box::new(move |result| {
                let _ = reply.send(result);
            }));
        },
        Command::WriteCoil {
            address,
            state,
            reply,
        } => {
            session.write_coil(address, state, Box::new(move |result| {
                let _ = reply.send(result);
            }));
        },
        Command::CoilAction {
            name,
            action,
            reply,
        } => {
            let _ = reply.send(session.coil_action(&name, action));
        },
        Command::Stats { reply } => {
            let _ = reply.send(session.stats());
        },
        Command::EventNames { reply } => {
            let _ = reply.send(session.event_names());
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scheduler_delivers_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx, CancellationToken::new());
        scheduler.run_after(Duration::from_millis(10), Task::StatusCheck);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Task(Task::StatusCheck)));
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut scheduler = TokioScheduler::new(tx, token.clone());
        scheduler.run_after(Duration::from_millis(50), Task::StatusCheck);
        token.cancel();
        drop(scheduler);

        // Every sender is gone once the timer task exits
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_event_bus_fans_out() {
        let mut bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish("Relay 1 State", &SignalValue::Bool(true));

        assert_eq!(first.recv().await.unwrap().name, "Relay 1 State");
        assert_eq!(second.recv().await.unwrap().value, SignalValue::Bool(true));
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_service() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_connected_tx, connected_rx) = watch::channel(false);
        let handle = ServiceHandle {
            events: tx,
            bus: EventBus::new(4).tx,
            connected: connected_rx,
            token: CancellationToken::new(),
        };
        drop(rx);
        assert_eq!(handle.read_coils(0, 1).await, Err(RelaySrvError::ServiceStopped));
    }

    #[tokio::test]
    async fn test_wait_connected_outcomes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let handle = ServiceHandle {
            events: tx,
            bus: EventBus::new(4).tx,
            connected: connected_rx,
            token: CancellationToken::new(),
        };

        assert!(matches!(
            handle.wait_connected(Duration::from_millis(20)).await,
            Err(RelaySrvError::Timeout(_))
        ));

        connected_tx.send_replace(true);
        assert_eq!(handle.wait_connected(Duration::from_millis(20)).await, Ok(()));

        connected_tx.send_replace(false);
        drop(connected_tx);
        assert_eq!(
            handle.wait_connected(Duration::from_secs(1)).await,
            Err(RelaySrvError::ServiceStopped)
        );
    }
}
