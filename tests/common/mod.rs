//! Simulated inverter plant on a local TCP port
//!
//! Every unit id gets its own holding and input register bank. Unknown unit
//! ids answer with exception 0x0B (gateway target failed to respond), the way
//! the inverter's internal gateway reports a missing battery.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use solar_modbus::{Frame, MbapCodec};

pub const INVERTER_UNIT: u8 = 0x32;

#[derive(Debug, Default, Clone)]
pub struct Bank {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    /// Holding register writes are stored clamped to this value
    pub clamp: HashMap<u16, u16>,
}

#[derive(Debug, Default)]
struct State {
    units: HashMap<u8, Bank>,
    /// (unit, function, address) of every request seen
    requests: Vec<(u8, u8, u16)>,
    silent: bool,
}

pub struct SimulatedPlant {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    kick: broadcast::Sender<()>,
}

impl SimulatedPlant {
    /// Bind an ephemeral port and start accepting clients
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        let (kick, _) = broadcast::channel(4);

        let accept_state = state.clone();
        let accept_kick = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("simulator: client {} connected", peer);
                tokio::spawn(serve(stream, accept_state.clone(), accept_kick.subscribe()));
            }
        });

        Self { addr, state, kick }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn with_unit<R>(&self, unit: u8, f: impl FnOnce(&mut Bank) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.units.entry(unit).or_default())
    }

    pub fn set_holding(&self, unit: u8, address: u16, values: &[u16]) {
        self.with_unit(unit, |bank| {
            for (i, value) in values.iter().enumerate() {
                bank.holding.insert(address + i as u16, *value);
            }
        });
    }

    pub fn set_input(&self, unit: u8, address: u16, values: &[u16]) {
        self.with_unit(unit, |bank| {
            for (i, value) in values.iter().enumerate() {
                bank.input.insert(address + i as u16, *value);
            }
        });
    }

    pub fn holding(&self, unit: u8, address: u16) -> u16 {
        self.with_unit(unit, |bank| bank.holding.get(&address).copied().unwrap_or(0))
    }

    pub fn clamp(&self, unit: u8, address: u16, max: u16) {
        self.with_unit(unit, |bank| {
            bank.clamp.insert(address, max);
        });
    }

    /// Stop answering without closing the connection
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Close every open client connection; the listener keeps running
    pub fn disconnect_all(&self) {
        let _ = self.kick.send(());
    }

    pub fn requests(&self) -> Vec<(u8, u8, u16)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Inverter with serial SA1234G567 plus `batteries` packs with distinct serials
    pub fn populate(&self, batteries: usize) {
        self.set_holding(INVERTER_UNIT, 13, &ascii_words("SA1234G567"));
        self.set_holding(INVERTER_UNIT, 35, &[24, 3, 15, 12, 30, 0]);
        self.set_holding(INVERTER_UNIT, 110, &[4, 50, 50, 0, 4, 0, 100]);
        self.set_input(INVERTER_UNIT, 0, &[1, 14]);
        self.set_input(INVERTER_UNIT, 59, &[87]);
        for index in 0..batteries {
            let unit = INVERTER_UNIT + index as u8;
            self.set_input(unit, 60, &[3301 + index as u16]);
            self.set_input(unit, 100, &[90 - index as u16]);
            self.set_input(unit, 110, &ascii_words(&format!("BG1234G56{}", index)));
        }
        // Unit ids of the batteries after the last one must fail like absent packs
        for index in batteries.max(1)..8 {
            self.state.lock().unwrap().units.remove(&(INVERTER_UNIT + index as u8));
        }
    }
}

/// Pack an ASCII string two characters per register, high byte first
pub fn ascii_words(text: &str) -> Vec<u16> {
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let high = pair[0] as u16;
            let low = pair.get(1).copied().unwrap_or(0) as u16;
            (high << 8) | low
        })
        .collect()
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>, mut kick: broadcast::Receiver<()>) {
    let mut framed = Framed::new(stream, MbapCodec);
    loop {
        tokio::select! {
            _ = kick.recv() => break,
            request = framed.next() => {
                let Some(Ok(request)) = request else { break };
                let response = handle(&state, &request);
                if let Some(response) = response {
                    if framed.send(response).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn handle(state: &Mutex<State>, request: &Frame) -> Option<Frame> {
    let mut state = state.lock().unwrap();
    let payload = &request.payload;
    let address = if payload.len() >= 2 {
        u16::from_be_bytes([payload[0], payload[1]])
    } else {
        0
    };
    state.requests.push((request.unit_id, request.function_code, address));
    if state.silent {
        return None;
    }

    let exception = |code: u8| {
        Some(Frame::new(
            request.transaction_id,
            request.unit_id,
            request.function_code | 0x80,
            vec![code],
        ))
    };
    let Some(bank) = state.units.get_mut(&request.unit_id) else {
        return exception(0x0B);
    };
    if payload.len() < 4 {
        return exception(0x03);
    }
    let word = u16::from_be_bytes([payload[2], payload[3]]);

    let body = match request.function_code {
        0x03 | 0x04 => {
            if word == 0 || word > 125 {
                return exception(0x03);
            }
            let registers = if request.function_code == 0x03 {
                &bank.holding
            } else {
                &bank.input
            };
            let mut body = vec![(word * 2) as u8];
            for offset in 0..word {
                let value = registers.get(&(address + offset)).copied().unwrap_or(0);
                body.extend_from_slice(&value.to_be_bytes());
            }
            body
        }
        0x06 => {
            let stored = bank.clamp.get(&address).map_or(word, |max| word.min(*max));
            bank.holding.insert(address, stored);
            payload.clone()
        }
        _ => return exception(0x01),
    };

    Some(Frame::new(request.transaction_id, request.unit_id, request.function_code, body))
}
