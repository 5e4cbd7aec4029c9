//! High-level Modbus client
//!
//! Builds request PDUs, hands them to a [`ModbusTransport`] and checks that
//! the answers fit: register reads must carry exactly the requested number of
//! registers, writes must echo the address and value/quantity that were sent.
//! All methods take `&self`, so one client can be shared behind an `Arc` by
//! the plant cache and the command dispatcher at the same time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, RegisterRange, RegisterType, UnitId};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};
use crate::logging::EventLogger;

/// Register-level Modbus operations used by the rest of the crate
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read holding registers (function code 0x03)
    async fn read_03(&self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Read input registers (function code 0x04)
    async fn read_04(&self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Write single register (function code 0x06)
    async fn write_06(&self, unit_id: UnitId, address: u16, value: u16) -> ModbusResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_10(&self, unit_id: UnitId, address: u16, values: &[u16]) -> ModbusResult<()>;

    /// Check if client is connected
    fn is_connected(&self) -> bool;

    /// Re-establish the connection
    async fn reconnect(&self) -> ModbusResult<()>;

    /// Close the client connection
    async fn close(&self) -> ModbusResult<()>;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;

    /// Read a whole register range with the matching function code
    async fn read_range(&self, unit_id: UnitId, range: &RegisterRange) -> ModbusResult<Vec<u16>> {
        range.validate()?;
        match range.register_type {
            RegisterType::Holding => self.read_03(unit_id, range.start, range.count).await,
            RegisterType::Input => self.read_04(unit_id, range.start, range.count).await,
        }
    }
}

/// Client that works with any transport
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: Arc<T>,
    request_timeout: Duration,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    /// Create a new generic client with the specified transport
    pub fn new(transport: T, request_timeout: Duration) -> Self {
        Self {
            transport: Arc::new(transport),
            request_timeout,
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Validate and send a request, returning the raw response
    pub async fn execute_request(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;
        let response = self
            .transport
            .send_request(request.unit_id, request.function, request.payload(), self.request_timeout)
            .await?;

        if response.function != request.function {
            return Err(ModbusError::protocol(format!(
                "expected {} in response, got {}",
                request.function, response.function
            )));
        }
        Ok(response)
    }

    async fn read_registers(&self, request: ModbusRequest) -> ModbusResult<Vec<u16>> {
        let quantity = request.quantity;
        let response = self.execute_request(request).await?;
        response.parse_registers(quantity)
    }

    async fn write_checked(&self, request: ModbusRequest, expected_echo: u16) -> ModbusResult<()> {
        let address = request.address;
        let response = self.execute_request(request).await?;
        let (echo_address, echo_value) = response.parse_echo()?;
        if echo_address != address || echo_value != expected_echo {
            return Err(ModbusError::protocol(format!(
                "write echo {}={} does not match request {}={}",
                echo_address, echo_value, address, expected_echo
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: ModbusTransport + Send + Sync> ModbusClient for GenericModbusClient<T> {
    async fn read_03(&self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_registers(ModbusRequest::new_read(
            unit_id,
            ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
        ))
        .await
    }

    async fn read_04(&self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_registers(ModbusRequest::new_read(
            unit_id,
            ModbusFunction::ReadInputRegisters,
            address,
            quantity,
        ))
        .await
    }

    async fn write_06(&self, unit_id: UnitId, address: u16, value: u16) -> ModbusResult<()> {
        self.write_checked(ModbusRequest::write_single(unit_id, address, value), value)
            .await
    }

    async fn write_10(&self, unit_id: UnitId, address: u16, values: &[u16]) -> ModbusResult<()> {
        let request = ModbusRequest::write_multiple(unit_id, address, values);
        let quantity = request.quantity;
        self.write_checked(request, quantity).await
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn reconnect(&self) -> ModbusResult<()> {
        self.transport.reconnect().await
    }

    async fn close(&self) -> ModbusResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

/// Modbus TCP client
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
}

impl ModbusTcpClient {
    /// Create a new TCP client
    pub async fn new(addr: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let transport = TcpTransport::new(addr, timeout).await?;
        Ok(Self::from_transport(transport, timeout))
    }

    /// Resolve `host:port` and connect, reporting telemetry to `events`
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        request_timeout: Duration,
        events: EventLogger,
    ) -> ModbusResult<Self> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ModbusError::configuration(format!("Cannot resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| ModbusError::configuration(format!("No address found for {}:{}", host, port)))?;

        let transport = TcpTransport::connect(addr, connect_timeout, events).await?;
        Ok(Self::from_transport(transport, request_timeout))
    }

    /// Create a new TCP client from address string
    pub async fn from_address(addr: &str, timeout: Duration) -> ModbusResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid address: {}", e)))?;
        Self::new(addr, timeout).await
    }

    /// Create a new TCP client from transport
    pub fn from_transport(transport: TcpTransport, request_timeout: Duration) -> Self {
        Self {
            inner: GenericModbusClient::new(transport, request_timeout),
        }
    }

    /// Enable or disable packet logging on existing client
    pub fn set_packet_logging(&self, enabled: bool) {
        self.inner.transport().set_packet_logging(enabled);
    }

    /// Execute a raw request
    pub async fn execute_request(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.inner.execute_request(request).await
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_03(&self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.inner.read_03(unit_id, address, quantity).await
    }

    async fn read_04(&self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.inner.read_04(unit_id, address, quantity).await
    }

    async fn write_06(&self, unit_id: UnitId, address: u16, value: u16) -> ModbusResult<()> {
        self.inner.write_06(unit_id, address, value).await
    }

    async fn write_10(&self, unit_id: UnitId, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.inner.write_10(unit_id, address, values).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn reconnect(&self) -> ModbusResult<()> {
        self.inner.reconnect().await
    }

    async fn close(&self) -> ModbusResult<()> {
        self.inner.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.inner.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport that answers from a script and records what was sent
    struct ScriptedTransport {
        sent: Mutex<Vec<(UnitId, ModbusFunction, Vec<u8>)>>,
        reply: Box<dyn Fn(ModbusFunction, &[u8]) -> ModbusResult<ModbusResponse> + Send + Sync>,
    }

    impl ScriptedTransport {
        fn new<F>(reply: F) -> Self
        where
            F: Fn(ModbusFunction, &[u8]) -> ModbusResult<ModbusResponse> + Send + Sync + 'static,
        {
            Self {
                sent: Mutex::new(Vec::new()),
                reply: Box::new(reply),
            }
        }
    }

    #[async_trait]
    impl ModbusTransport for ScriptedTransport {
        async fn send_request(
            &self,
            unit_id: UnitId,
            function: ModbusFunction,
            payload: Vec<u8>,
            _timeout: Duration,
        ) -> ModbusResult<ModbusResponse> {
            let reply = (self.reply)(function, &payload);
            self.sent.lock().unwrap().push((unit_id, function, payload));
            reply
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn reconnect(&self) -> ModbusResult<()> {
            Ok(())
        }

        async fn close(&self) -> ModbusResult<()> {
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn client<F>(reply: F) -> GenericModbusClient<ScriptedTransport>
    where
        F: Fn(ModbusFunction, &[u8]) -> ModbusResult<ModbusResponse> + Send + Sync + 'static,
    {
        GenericModbusClient::new(ScriptedTransport::new(reply), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_read_registers() {
        let client = client(|function, _| {
            Ok(ModbusResponse::new_success(0x32, function, vec![4, 0x42, 0x47, 0x31, 0x32]))
        });

        let registers = client.read_04(0x32, 110, 2).await.unwrap();
        assert_eq!(registers, vec![0x4247, 0x3132]);

        let sent = client.transport().sent.lock().unwrap();
        assert_eq!(sent[0], (0x32, ModbusFunction::ReadInputRegisters, vec![0x00, 0x6E, 0x00, 0x02]));
    }

    #[tokio::test]
    async fn test_short_read_is_rejected() {
        let client = client(|function, _| Ok(ModbusResponse::new_success(0x32, function, vec![2, 0x00, 0x01])));
        assert!(matches!(client.read_03(0x32, 0, 2).await, Err(ModbusError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_quantity_validated_before_sending() {
        let client = client(|function, _| Ok(ModbusResponse::new_success(0x32, function, vec![])));
        assert!(client.read_03(0x32, 0, 0).await.is_err());
        assert!(client.read_03(0x32, 0, 61).await.is_err());
        assert!(client.write_10(0x32, 0, &[]).await.is_err());
        assert!(client.transport().sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_echo_checked() {
        let client = client(|function, payload| Ok(ModbusResponse::new_success(0x32, function, payload.to_vec())));
        client.write_06(0x32, 116, 80).await.unwrap();

        let client = client_with_bad_echo();
        assert!(matches!(client.write_06(0x32, 116, 80).await, Err(ModbusError::Protocol { .. })));
    }

    fn client_with_bad_echo() -> GenericModbusClient<ScriptedTransport> {
        client(|function, _| Ok(ModbusResponse::new_success(0x32, function, vec![0x00, 0x74, 0x00, 0x4B])))
    }

    #[tokio::test]
    async fn test_write_multiple_echo() {
        let client = client(|function, payload| Ok(ModbusResponse::new_success(0x32, function, payload[..4].to_vec())));
        client.write_10(0x32, 35, &[24, 3, 14]).await.unwrap();

        let sent = client.transport().sent.lock().unwrap();
        assert_eq!(sent[0].2[..5], [0x00, 0x23, 0x00, 0x03, 0x06]);
    }

    #[tokio::test]
    async fn test_read_range_dispatches_by_type() {
        let client = client(|function, _| Ok(ModbusResponse::new_success(0x32, function, vec![2, 0, 9])));
        client.read_range(0x32, &RegisterRange::holding(0, 1)).await.unwrap();
        client.read_range(0x32, &RegisterRange::input(0, 1)).await.unwrap();

        let sent = client.transport().sent.lock().unwrap();
        assert_eq!(sent[0].1, ModbusFunction::ReadHoldingRegisters);
        assert_eq!(sent[1].1, ModbusFunction::ReadInputRegisters);
    }

    #[tokio::test]
    async fn test_exception_propagates() {
        let client = client(|function, _| Err(ModbusError::exception(function.to_u8(), 0x02)));
        assert!(matches!(
            client.read_03(0x32, 300, 10).await,
            Err(ModbusError::Exception { code: 0x02, .. })
        ));
    }
}
