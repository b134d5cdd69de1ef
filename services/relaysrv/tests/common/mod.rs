//! Test Common Utilities
//!
//! In-process Modbus-TCP device simulator and helpers for relaysrv
//! integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use relay_modbus::SignalValue;
use relaysrv::config::TimingConfig;
use relaysrv::{PublishedEvent, RelayConfig};

const POINTS: usize = 64;

/// Device state shared between the simulator and the test
#[derive(Debug)]
pub struct SimState {
    coils: Mutex<Vec<bool>>,
    registers: Mutex<Vec<u16>>,
    connections: AtomicUsize,
    requests: AtomicUsize,
    mismatch_next: AtomicBool,
    silent: AtomicBool,
}

/// A Modbus-TCP slave on 127.0.0.1 serving coils and holding registers
pub struct Simulator {
    addr: SocketAddr,
    state: Arc<SimState>,
    task: JoinHandle<()>,
}

impl Simulator {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind simulator");
        let addr = listener.local_addr().expect("simulator address");
        let state = Arc::new(SimState {
            coils: Mutex::new(vec![false; POINTS]),
            registers: Mutex::new(vec![0; POINTS]),
            connections: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            mismatch_next: AtomicBool::new(false),
            silent: AtomicBool::new(false),
        });

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state.coils.lock().unwrap()[address as usize]
    }

    pub fn set_coil(&self, address: u16, state: bool) {
        self.state.coils.lock().unwrap()[address as usize] = state;
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.registers.lock().unwrap()[address as usize] = value;
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Answer the next request with a wrong transaction id
    pub fn mismatch_next(&self) {
        self.state.mismatch_next.store(true, Ordering::SeqCst);
    }

    /// Stop (or resume) answering requests
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<SimState>) {
    let mut request = [0u8; 12];
    loop {
        if stream.read_exact(&mut request).await.is_err() {
            return;
        }
        state.requests.fetch_add(1, Ordering::SeqCst);
        if state.silent.load(Ordering::SeqCst) {
            continue;
        }

        let mut tid = u16::from_be_bytes([request[0], request[1]]);
        if state.mismatch_next.swap(false, Ordering::SeqCst) {
            tid = tid.wrapping_add(1000);
        }
        let unit = request[6];
        let pdu = respond(&state, request[7], &request[8..12]);

        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(&pdu);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn respond(state: &SimState, function: u8, body: &[u8]) -> Vec<u8> {
    let address = u16::from_be_bytes([body[0], body[1]]) as usize;
    let value = u16::from_be_bytes([body[2], body[3]]);

    match function {
        0x01 => {
            let count = value as usize;
            let coils = state.coils.lock().unwrap();
            if address + count > coils.len() {
                return vec![function | 0x80, 0x02];
            }
            let mut packed = vec![0u8; count.div_ceil(8)];
            for (i, on) in coils[address..address + count].iter().enumerate() {
                if *on {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            let mut pdu = vec![function, packed.len() as u8];
            pdu.extend_from_slice(&packed);
            pdu
        },
        0x03 => {
            let count = value as usize;
            let registers = state.registers.lock().unwrap();
            if address + count > registers.len() {
                return vec![function | 0x80, 0x02];
            }
            let mut pdu = vec![function, (count * 2) as u8];
            for register in &registers[address..address + count] {
                pdu.extend_from_slice(&register.to_be_bytes());
            }
            pdu
        },
        0x05 => {
            let mut coils = state.coils.lock().unwrap();
            if address >= coils.len() || (value != 0xFF00 && value != 0x0000) {
                return vec![function | 0x80, 0x03];
            }
            coils[address] = value == 0xFF00;
            let mut pdu = vec![function];
            pdu.extend_from_slice(body);
            pdu
        },
        _ => vec![function | 0x80, 0x01],
    }
}

/// Configuration with short timers, pointed at `port`
pub fn test_config(port: u16) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.device.host = "127.0.0.1".to_string();
    config.device.port = port;
    config.device.profile = "adam-6060".to_string();
    config.timing = TimingConfig {
        bounce_ms: 200,
        read_only_poll_ms: 20,
        writable_poll_ms: 100,
        protocol_timeout_ms: 300,
        transport_timeout_ms: 2000,
        connect_timeout_ms: 500,
        reconnect_delay_ms: 50,
        status_check_interval_secs: 75,
    };
    config
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Wait for `name` to be published with `value`
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<PublishedEvent>,
    name: &str,
    value: &SignalValue,
    limit: Duration,
) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if event.name == name && &event.value == value => return true,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return false,
        }
    }
}
