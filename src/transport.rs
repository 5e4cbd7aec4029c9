//! # Modbus TCP Transport
//!
//! The transport owns one TCP connection to the inverter and correlates
//! requests with responses by MBAP transaction id.
//!
//! ## Design
//!
//! ```text
//!  caller A ──┐                         ┌──────────────────────────┐
//!  caller B ──┼─ send_request ─► table ─┤ write mutex ─► socket    │
//!  caller C ──┘        ▲                │                          │
//!                      │  oneshot       │ receive loop ◄─ socket   │
//!                      └──────────────── lookup by transaction id  │
//!                                       └──────────────────────────┘
//! ```
//!
//! - A pending transaction is registered **before** its bytes are written, so
//!   a fast response always finds its entry.
//! - Socket writes are serialized by an async mutex; several requests may be
//!   in flight at once (pipelining).
//! - A single spawned receive loop is the only place frames are decoded. It
//!   completes the matching pending entry; responses whose id matches nothing
//!   (late answers to timed-out requests, duplicates) are logged and dropped.
//! - Each request has one deadline covering the write lock, the socket write
//!   and the wait for the response. On expiry its entry is removed and
//!   `Timeout` is returned. A write that stalls past the deadline also kills
//!   the connection, since a partial frame may be on the wire.
//! - A caller that drops its request future releases the transaction id.
//! - When the connection is lost every pending request fails with
//!   `Connection` at once. Nothing reconnects or retries automatically; call
//!   [`ModbusTransport::reconnect`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use solar_modbus::transport::{ModbusTransport, TcpTransport};
//! use solar_modbus::protocol::ModbusFunction;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TcpTransport::new("192.168.1.20:8899".parse()?, Duration::from_secs(2)).await?;
//!
//!     let response = transport
//!         .send_request(0x32, ModbusFunction::ReadInputRegisters, vec![0, 0, 0, 60], Duration::from_millis(1500))
//!         .await?;
//!     println!("{:?}", response.parse_registers(60)?);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

use crate::codec::{encode_frame, Frame, MbapCodec};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{EventLogger, LogLevel, TelemetryEvent};
use crate::protocol::{ModbusFunction, ModbusResponse, UnitId};
use crate::utils::format::bytes_to_hex;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Completion = oneshot::Sender<ModbusResult<Frame>>;

/// Request/response transport used by the Modbus client
///
/// All methods take `&self`; implementations must allow concurrent callers.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Send one request PDU and wait for the matching response
    ///
    /// # Errors
    ///
    /// - `ModbusError::Timeout` - no response within `timeout`
    /// - `ModbusError::Connection` - not connected, or the connection was lost
    ///   while waiting
    /// - `ModbusError::Exception` - the device answered with an exception
    /// - `ModbusError::Protocol` - the response does not answer this request
    async fn send_request(
        &self,
        unit_id: UnitId,
        function: ModbusFunction,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse>;

    /// Check if the transport connection is active
    fn is_connected(&self) -> bool;

    /// Drop the current connection, failing anything pending, and connect again
    async fn reconnect(&self) -> ModbusResult<()>;

    /// Close the connection; pending requests fail with `Connection`
    async fn close(&self) -> ModbusResult<()>;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Frames whose transaction id matched nothing in flight
    pub unsolicited: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One request waiting for its response
#[derive(Debug)]
pub(crate) struct PendingTransaction {
    unit_id: UnitId,
    function: ModbusFunction,
    sent_at: Instant,
    completion: Completion,
}

/// Transaction id allocator and pending-request table
#[derive(Debug, Default)]
pub(crate) struct TransactionTable {
    last_id: u16,
    pending: HashMap<u16, PendingTransaction>,
}

impl TransactionTable {
    /// Allocate the next free id and register the request under it
    ///
    /// Ids increase by one, wrap at 16 bits, never use 0 and skip ids that
    /// are still in flight.
    pub(crate) fn register(
        &mut self,
        unit_id: UnitId,
        function: ModbusFunction,
    ) -> ModbusResult<(u16, oneshot::Receiver<ModbusResult<Frame>>)> {
        if self.pending.len() >= u16::MAX as usize {
            return Err(ModbusError::internal("every transaction id is in flight"));
        }

        let mut id = self.last_id;
        loop {
            id = id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                break;
            }
        }
        self.last_id = id;

        let (completion, receiver) = oneshot::channel();
        self.pending.insert(
            id,
            PendingTransaction {
                unit_id,
                function,
                sent_at: Instant::now(),
                completion,
            },
        );
        Ok((id, receiver))
    }

    /// Restart the request clock once the bytes are on the wire
    pub(crate) fn mark_sent(&mut self, transaction_id: u16) {
        if let Some(entry) = self.pending.get_mut(&transaction_id) {
            entry.sent_at = Instant::now();
        }
    }

    /// Hand a received frame to its pending request
    ///
    /// Returns the frame back when no request is waiting for its id.
    pub(crate) fn complete(&mut self, frame: Frame) -> Option<Frame> {
        let entry = match self.pending.remove(&frame.transaction_id) {
            Some(entry) => entry,
            None => return Some(frame),
        };

        debug!(
            "tid {} answered in {:?}",
            frame.transaction_id,
            entry.sent_at.elapsed()
        );

        let result = if frame.unit_id != entry.unit_id {
            Err(ModbusError::protocol(format!(
                "response for tid {} came from unit {} instead of {}",
                frame.transaction_id, frame.unit_id, entry.unit_id
            )))
        } else if frame.base_function_code() != entry.function.to_u8() {
            Err(ModbusError::protocol(format!(
                "response for tid {} has function 0x{:02X}, expected 0x{:02X}",
                frame.transaction_id,
                frame.function_code,
                entry.function.to_u8()
            )))
        } else {
            Ok(frame)
        };

        // The caller may have given up already.
        let _ = entry.completion.send(result);
        None
    }

    /// Forget a request, typically after its timeout fired
    pub(crate) fn cancel(&mut self, transaction_id: u16) -> bool {
        self.pending.remove(&transaction_id).is_some()
    }

    /// Fail every pending request with the same error
    pub(crate) fn fail_all(&mut self, error: &ModbusError) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.completion.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// State shared between callers and the receive loop
#[derive(Debug)]
struct Shared {
    table: Mutex<TransactionTable>,
    stats: Mutex<TransportStats>,
    packet_logging: AtomicBool,
    events: EventLogger,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, TransactionTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, TransportStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_packet(&self, direction: &str, frame: &Frame) {
        if self.packet_logging.load(Ordering::Relaxed) {
            info!(
                "[MODBUS-TCP] {} unit:{} {}",
                direction,
                frame.unit_id,
                bytes_to_hex(&encode_frame(frame))
            );
        }
    }

    fn record_sent(&self, frame: &Frame) {
        {
            let mut stats = self.stats();
            stats.requests_sent += 1;
            stats.bytes_sent += frame.wire_len() as u64;
        }
        self.log_packet("send", frame);
        if self.events.is_enabled(LogLevel::Debug) {
            self.events.emit(TelemetryEvent::FrameSent {
                transaction_id: frame.transaction_id,
                unit_id: frame.unit_id,
                function_code: frame.function_code,
                bytes: encode_frame(frame),
            });
        }
    }

    /// Route one decoded frame; runs on the receive loop only
    fn dispatch(&self, frame: Frame) {
        {
            let mut stats = self.stats();
            stats.responses_received += 1;
            stats.bytes_received += frame.wire_len() as u64;
        }
        self.log_packet("recv", &frame);
        if self.events.is_enabled(LogLevel::Debug) {
            self.events.emit(TelemetryEvent::FrameReceived {
                transaction_id: frame.transaction_id,
                unit_id: frame.unit_id,
                function_code: frame.function_code,
                bytes: encode_frame(&frame),
            });
        }

        let unsolicited = self.table().complete(frame);
        if let Some(frame) = unsolicited {
            self.stats().unsolicited += 1;
            warn!(
                "Discarding unsolicited frame tid:{} unit:{} fc:0x{:02X}",
                frame.transaction_id, frame.unit_id, frame.function_code
            );
            self.events.emit(TelemetryEvent::UnsolicitedFrame {
                transaction_id: frame.transaction_id,
                unit_id: frame.unit_id,
                function_code: frame.function_code,
            });
        }
    }

    fn fail_all(&self, reason: &str) {
        let error = ModbusError::connection(reason.to_string());
        let pending = self.table().fail_all(&error);
        if pending > 0 {
            self.stats().errors += pending as u64;
        }
        warn!("Connection lost: {} ({} pending)", reason, pending);
        self.events.emit(TelemetryEvent::ConnectionLost {
            reason: reason.to_string(),
            pending,
        });
    }
}

/// One live connection: the write half and the task reading the other half
struct Connection {
    writer: AsyncMutex<FramedWrite<BoxedWriter, MbapCodec>>,
    alive: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

impl Connection {
    fn spawn<S>(stream: S, shared: Arc<Shared>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);

        let alive = Arc::new(AtomicBool::new(true));
        let receiver = tokio::spawn(receive_loop(
            FramedRead::new(reader, MbapCodec),
            shared,
            alive.clone(),
        ));

        Self {
            writer: AsyncMutex::new(FramedWrite::new(writer, MbapCodec)),
            alive,
            receiver,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(mut reader: FramedRead<BoxedReader, MbapCodec>, shared: Arc<Shared>, alive: Arc<AtomicBool>) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(frame)) => shared.dispatch(frame),
            // A malformed frame leaves the byte stream unaligned, so it is fatal.
            Some(Err(e)) => break format!("receive failed: {}", e),
            None => break "connection closed by peer".to_string(),
        }
    };

    // Must be cleared before failing the table; see send_request.
    alive.store(false, Ordering::SeqCst);
    shared.fail_all(&reason);
}

/// Modbus TCP transport with pipelined requests
pub struct TcpTransport {
    pub address: Option<SocketAddr>,
    connect_timeout: Duration,
    connection: RwLock<Option<Arc<Connection>>>,
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Connect to a device
    pub async fn new(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        Self::connect(address, connect_timeout, EventLogger::disabled()).await
    }

    /// Connect to a device, reporting telemetry to `events`
    pub async fn connect(address: SocketAddr, connect_timeout: Duration, events: EventLogger) -> ModbusResult<Self> {
        let transport = Self {
            address: Some(address),
            connect_timeout,
            connection: RwLock::new(None),
            shared: Self::new_shared(events),
        };
        let stream = transport.open_stream().await?;
        transport.install(stream);
        Ok(transport)
    }

    /// Run the transport over an already established byte stream
    ///
    /// Such a transport cannot `reconnect()`.
    pub fn from_stream<S>(stream: S, events: EventLogger) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Self {
            address: None,
            connect_timeout: Duration::from_millis(crate::DEFAULT_CONNECT_TIMEOUT_MS),
            connection: RwLock::new(None),
            shared: Self::new_shared(events),
        };
        transport.install(stream);
        transport
    }

    fn new_shared(events: EventLogger) -> Arc<Shared> {
        Arc::new(Shared {
            table: Mutex::new(TransactionTable::default()),
            stats: Mutex::new(TransportStats::default()),
            packet_logging: AtomicBool::new(false),
            events,
        })
    }

    /// Enable or disable hex packet logging
    pub fn set_packet_logging(&self, enabled: bool) {
        self.shared.packet_logging.store(enabled, Ordering::Relaxed);
    }

    /// Number of requests currently waiting for a response
    pub fn pending_transactions(&self) -> usize {
        self.shared.table().len()
    }

    async fn open_stream(&self) -> ModbusResult<TcpStream> {
        let address = self
            .address
            .ok_or_else(|| ModbusError::configuration("transport was built from a stream and has no address"))?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ModbusError::timeout(format!("connect to {}", address), self.connect_timeout.as_millis() as u64))?
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", address);
        Ok(stream)
    }

    fn install<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Arc::new(Connection::spawn(stream, self.shared.clone()));
        let mut slot = self.connection.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(connection);
    }

    fn current(&self) -> ModbusResult<Arc<Connection>> {
        self.connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| ModbusError::connection("not connected"))
    }

    fn take(&self) -> Option<Arc<Connection>> {
        self.connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn shutdown(&self, reason: &str) {
        if let Some(connection) = self.take() {
            connection.alive.store(false, Ordering::SeqCst);
            connection.receiver.abort();
            let mut writer = connection.writer.lock().await;
            if let Err(e) = SinkExt::<Frame>::close(&mut *writer).await {
                debug!("Ignoring error while closing socket: {}", e);
            }
        }
        self.shared.fail_all(reason);
    }

    async fn exchange(
        &self,
        unit_id: UnitId,
        function: ModbusFunction,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        let connection = self.current()?;
        let (transaction_id, completion) = self.shared.table().register(unit_id, function)?;
        let guard = PendingGuard {
            shared: self.shared.as_ref(),
            transaction_id,
            armed: true,
        };

        // The receive loop clears `alive` before failing the table, so an
        // entry registered after that point is removed here.
        if !connection.is_alive() {
            return Err(ModbusError::connection("connection lost"));
        }

        let frame = Frame::new(transaction_id, unit_id, function.to_u8(), payload);
        self.shared.record_sent(&frame);

        let mut writer = match tokio::time::timeout_at(deadline, connection.writer.lock()).await {
            Ok(writer) => writer,
            Err(_) => return Err(self.timed_out(transaction_id, function, unit_id, timeout)),
        };
        let sent = tokio::time::timeout_at(deadline, writer.send(frame)).await;
        drop(writer);
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.shared.table().cancel(transaction_id);
                connection.alive.store(false, Ordering::SeqCst);
                self.shared.fail_all(&format!("write failed: {}", e));
                return Err(ModbusError::connection(format!("write failed: {}", e)));
            }
            Err(_) => {
                // Part of the frame may be on the wire; the stream is no longer aligned.
                self.shared.table().cancel(transaction_id);
                connection.alive.store(false, Ordering::SeqCst);
                connection.receiver.abort();
                self.shared.fail_all("write stalled past the request deadline");
                return Err(self.timed_out(transaction_id, function, unit_id, timeout));
            }
        }
        self.shared.table().mark_sent(transaction_id);

        match tokio::time::timeout_at(deadline, completion).await {
            Ok(Ok(result)) => {
                guard.disarm();
                let frame = result?;
                ModbusResponse::from_pdu(frame.unit_id, frame.function_code, &frame.payload)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(ModbusError::connection("request abandoned by transport"))
            }
            Err(_) => Err(self.timed_out(transaction_id, function, unit_id, timeout)),
        }
    }

    fn timed_out(&self, transaction_id: u16, function: ModbusFunction, unit_id: UnitId, timeout: Duration) -> ModbusError {
        self.shared.table().cancel(transaction_id);
        self.shared.stats().timeouts += 1;
        let timeout_ms = timeout.as_millis() as u64;
        self.shared.events.emit(TelemetryEvent::RequestTimeout {
            transaction_id,
            timeout_ms,
        });
        ModbusError::timeout(
            format!("{} tid:{} unit:{}", function, transaction_id, unit_id),
            timeout_ms,
        )
    }
}

/// Removes a pending entry when its caller goes away before completion
///
/// Dropping a `send_request` future (an outer `timeout`, a `select!` branch
/// losing) would otherwise leave the entry in the table until the
/// connection dies.
struct PendingGuard<'a> {
    shared: &'a Shared,
    transaction_id: u16,
    armed: bool,
}

impl PendingGuard<'_> {
    /// The entry already left the table through the receive loop or `fail_all`
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.table().cancel(self.transaction_id);
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn send_request(
        &self,
        unit_id: UnitId,
        function: ModbusFunction,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse> {
        let result = self.exchange(unit_id, function, payload, timeout).await;
        if let Err(ref e) = result {
            if !matches!(e, ModbusError::Connection { .. }) {
                // Connection failures are counted once per request in fail_all.
                self.shared.stats().errors += 1;
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.current().map(|c| c.is_alive()).unwrap_or(false)
    }

    async fn reconnect(&self) -> ModbusResult<()> {
        self.shutdown("reconnecting").await;
        let stream = self.open_stream().await?;
        self.install(stream);
        Ok(())
    }

    async fn close(&self) -> ModbusResult<()> {
        self.shutdown("connection closed by client").await;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.shared.stats().clone()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_transactions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn duplex_transport() -> (Arc<TcpTransport>, FramedRead<tokio::io::ReadHalf<DuplexStream>, MbapCodec>, tokio::io::WriteHalf<DuplexStream>) {
        let (client, device) = tokio::io::duplex(4096);
        let transport = Arc::new(TcpTransport::from_stream(client, EventLogger::disabled()));
        let (device_read, device_write) = tokio::io::split(device);
        (transport, FramedRead::new(device_read, MbapCodec), device_write)
    }

    fn register_reply(request: &Frame, value: u16) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        encode(request.transaction_id, request.unit_id, request.function_code, &[2, bytes[0], bytes[1]])
    }

    async fn read_one(transport: Arc<TcpTransport>, address: u16, timeout_ms: u64) -> ModbusResult<ModbusResponse> {
        let a = address.to_be_bytes();
        transport
            .send_request(
                0x32,
                ModbusFunction::ReadHoldingRegisters,
                vec![a[0], a[1], 0, 1],
                Duration::from_millis(timeout_ms),
            )
            .await
    }

    #[test]
    fn test_transaction_ids_wrap_and_skip_in_flight() {
        let mut table = TransactionTable::default();
        table.last_id = 0xFFFE;

        let (first, _rx1) = table.register(1, ModbusFunction::ReadInputRegisters).unwrap();
        let (second, _rx2) = table.register(1, ModbusFunction::ReadInputRegisters).unwrap();
        let (third, _rx3) = table.register(1, ModbusFunction::ReadInputRegisters).unwrap();
        assert_eq!((first, second, third), (0xFFFF, 1, 2));

        // Wrap around again while all three are still pending
        table.last_id = 0xFFFE;
        let (next, _rx4) = table.register(1, ModbusFunction::ReadInputRegisters).unwrap();
        assert_eq!(next, 3);
        assert_eq!(table.len(), 4);

        assert!(table.cancel(first));
        assert!(!table.cancel(first));
    }

    #[test]
    fn test_complete_rejects_wrong_function() {
        let mut table = TransactionTable::default();
        let (id, mut rx) = table.register(0x32, ModbusFunction::ReadHoldingRegisters).unwrap();

        let unsolicited = table.complete(Frame::new(id, 0x32, 0x04, vec![2, 0, 1]));
        assert!(unsolicited.is_none());
        assert!(matches!(rx.try_recv().unwrap(), Err(ModbusError::Protocol { .. })));

        // Already completed, so a second copy is unsolicited
        assert!(table.complete(Frame::new(id, 0x32, 0x03, vec![2, 0, 1])).is_some());
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (transport, mut device_rx, mut device_tx) = duplex_transport();

        let first = tokio::spawn(read_one(transport.clone(), 10, 1000));
        let second = tokio::spawn(read_one(transport.clone(), 20, 1000));

        let req_a = device_rx.next().await.unwrap().unwrap();
        let req_b = device_rx.next().await.unwrap().unwrap();
        let addr = |f: &Frame| u16::from_be_bytes([f.payload[0], f.payload[1]]);

        // Answer in reverse order, echoing the address as the value
        device_tx.write_all(&register_reply(&req_b, addr(&req_b))).await.unwrap();
        device_tx.write_all(&register_reply(&req_a, addr(&req_a))).await.unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.parse_registers(1).unwrap(), vec![10]);
        assert_eq!(second.parse_registers(1).unwrap(), vec![20]);
        assert_eq!(transport.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_frame_is_discarded() {
        let (transport, mut device_rx, mut device_tx) = duplex_transport();

        let pending = tokio::spawn(read_one(transport.clone(), 5, 1000));
        let request = device_rx.next().await.unwrap().unwrap();

        let stray = Frame::new(request.transaction_id.wrapping_add(100), 0x32, 0x03, vec![2, 0xDE, 0xAD]);
        device_tx.write_all(&encode_frame(&stray)).await.unwrap();
        device_tx.write_all(&register_reply(&request, 42)).await.unwrap();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.parse_registers(1).unwrap(), vec![42]);
        assert_eq!(transport.get_stats().unsolicited, 1);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_reply_is_unsolicited() {
        let (transport, mut device_rx, mut device_tx) = duplex_transport();

        let result = read_one(transport.clone(), 1, 50).await;
        assert!(matches!(result, Err(ModbusError::Timeout { timeout_ms: 50, .. })));
        assert_eq!(transport.pending_transactions(), 0);
        assert_eq!(transport.get_stats().timeouts, 1);

        let late = device_rx.next().await.unwrap().unwrap();
        device_tx.write_all(&register_reply(&late, 1)).await.unwrap();

        // The stream is ordered, so the late reply is routed before this one
        let next = tokio::spawn(read_one(transport.clone(), 2, 1000));
        let request = device_rx.next().await.unwrap().unwrap();
        assert_ne!(request.transaction_id, late.transaction_id);
        device_tx.write_all(&register_reply(&request, 2)).await.unwrap();

        assert_eq!(next.await.unwrap().unwrap().parse_registers(1).unwrap(), vec![2]);
        assert_eq!(transport.get_stats().unsolicited, 1);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_all_pending() {
        let (transport, mut device_rx, device_tx) = duplex_transport();

        let a = tokio::spawn(read_one(transport.clone(), 1, 5000));
        let b = tokio::spawn(read_one(transport.clone(), 2, 5000));
        device_rx.next().await.unwrap().unwrap();
        device_rx.next().await.unwrap().unwrap();

        drop(device_tx);
        drop(device_rx);

        assert!(matches!(a.await.unwrap(), Err(ModbusError::Connection { .. })));
        assert!(matches!(b.await.unwrap(), Err(ModbusError::Connection { .. })));
        assert!(!transport.is_connected());

        // No silent reconnect
        assert!(matches!(read_one(transport.clone(), 3, 100).await, Err(ModbusError::Connection { .. })));
        assert!(matches!(transport.reconnect().await, Err(ModbusError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_exception_response() {
        let (transport, mut device_rx, mut device_tx) = duplex_transport();

        let pending = tokio::spawn(read_one(transport.clone(), 900, 1000));
        let request = device_rx.next().await.unwrap().unwrap();
        device_tx
            .write_all(&encode(request.transaction_id, request.unit_id, 0x83, &[0x02]))
            .await
            .unwrap();

        match pending.await.unwrap() {
            Err(ModbusError::Exception { function, code, .. }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected exception, got {:?}", other),
        }
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_stream_is_fatal() {
        let (transport, mut device_rx, mut device_tx) = duplex_transport();

        let pending = tokio::spawn(read_one(transport.clone(), 1, 5000));
        device_rx.next().await.unwrap().unwrap();
        device_tx.write_all(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x05, 0x32]).await.unwrap();

        assert!(matches!(pending.await.unwrap(), Err(ModbusError::Connection { .. })));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stalled_write_honours_request_timeout() {
        // The device half is kept open but never read, so the 8-byte pipe fills up
        let (client, _device) = tokio::io::duplex(8);
        let transport = TcpTransport::from_stream(client, EventLogger::disabled());

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_request(
                0x32,
                ModbusFunction::WriteMultipleRegisters,
                vec![0; 200],
                Duration::from_millis(50),
            ),
        )
        .await
        .expect("send_request outlived its own timeout");

        assert!(matches!(result, Err(ModbusError::Timeout { timeout_ms: 50, .. })));
        assert_eq!(transport.pending_transactions(), 0);
        assert_eq!(transport.get_stats().timeouts, 1);
        // A half-written frame leaves the stream unusable
        assert!(!transport.is_connected());

        let next = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_request(0x32, ModbusFunction::ReadHoldingRegisters, vec![0, 0, 0, 1], Duration::from_millis(50)),
        )
        .await
        .expect("a later caller must not queue behind the stalled write");
        assert!(matches!(next, Err(ModbusError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_dropped_request_releases_transaction() {
        let (transport, mut device_rx, mut device_tx) = duplex_transport();

        let abandoned = tokio::time::timeout(Duration::from_millis(20), read_one(transport.clone(), 1, 5000)).await;
        assert!(abandoned.is_err());
        assert_eq!(transport.pending_transactions(), 0);

        // The request reached the device; its answer now matches nothing
        let request = device_rx.next().await.unwrap().unwrap();
        device_tx.write_all(&register_reply(&request, 7)).await.unwrap();

        let next = tokio::spawn(read_one(transport.clone(), 2, 1000));
        let request = device_rx.next().await.unwrap().unwrap();
        device_tx.write_all(&register_reply(&request, 8)).await.unwrap();
        assert_eq!(next.await.unwrap().unwrap().parse_registers(1).unwrap(), vec![8]);
        assert_eq!(transport.get_stats().unsolicited, 1);
        assert_eq!(transport.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_close() {
        let (transport, _device_rx, _device_tx) = duplex_transport();
        assert!(transport.is_connected());
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(read_one(transport.clone(), 1, 100).await, Err(ModbusError::Connection { .. })));
    }
}
