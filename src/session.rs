//! One connected plant
//!
//! [`PlantClient`] ties the pieces together: a shared TCP client, the plant
//! cache on top of it and a command dispatcher that writes through the same
//! connection.
//!
//! ```rust,no_run
//! use solar_modbus::{Command, DeviceId};
//!
//! # async fn run() -> solar_modbus::ModbusResult<()> {
//! let plant = solar_modbus::connect("192.168.1.20", 502, 0x32).await?;
//! plant.refresh(true).await?;
//! println!("{}", plant.get(DeviceId::Inverter, "battery_percent")?);
//! plant.exec(&Command::SetBatterySocReserve(10)).await?;
//! # Ok(())
//! # }
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::MissedTickBehavior;

use crate::client::{ModbusClient, ModbusTcpClient};
use crate::command::{Command, CommandDispatcher, CommandReport};
use crate::config::ClientConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::EventLogger;
use crate::model::{init_builtin_models, lookup_model};
use crate::plant::{DeviceId, DeviceSnapshot, Plant};
use crate::register::DecodedField;

/// Connect with default timeouts and models
pub async fn connect(host: &str, port: u16, unit_id: u8) -> ModbusResult<PlantClient> {
    PlantClient::connect(host, port, unit_id).await
}

/// Read/write session against one inverter and its batteries
pub struct PlantClient {
    config: ClientConfig,
    plant: Arc<Plant>,
    dispatcher: CommandDispatcher,
}

impl PlantClient {
    pub async fn connect(host: &str, port: u16, unit_id: u8) -> ModbusResult<Self> {
        Self::with_config(ClientConfig::new(host, port, unit_id)).await
    }

    /// Open the TCP connection described by `config`
    pub async fn with_config(config: ClientConfig) -> ModbusResult<Self> {
        Self::with_config_and_events(config, EventLogger::console()).await
    }

    /// Like [`PlantClient::with_config`] but with a custom telemetry sink
    pub async fn with_config_and_events(config: ClientConfig, events: EventLogger) -> ModbusResult<Self> {
        config.validate()?;
        let client = ModbusTcpClient::connect(
            &config.host,
            config.port,
            config.connect_timeout(),
            config.request_timeout(),
            events.clone(),
        )
        .await?;
        client.set_packet_logging(config.packet_logging);
        info!("Connected to {}:{} unit {}", config.host, config.port, config.unit_id);

        Self::build(Arc::new(client), config, events)
    }

    /// Build a session on an existing client, for custom transports and tests
    pub fn from_client(client: Arc<dyn ModbusClient>, config: ClientConfig) -> ModbusResult<Self> {
        config.validate()?;
        Self::build(client, config, EventLogger::disabled())
    }

    fn build(client: Arc<dyn ModbusClient>, config: ClientConfig, events: EventLogger) -> ModbusResult<Self> {
        init_builtin_models();
        let inverter_model = lookup_model(&config.inverter_model)?;
        let battery_model = lookup_model(&config.battery_model)?;

        let plant = Arc::new(
            Plant::new(client, config.unit_id, inverter_model, battery_model)
                .with_max_batteries(config.max_batteries)
                .with_events(events),
        );
        let dispatcher = CommandDispatcher::new(plant.clone());

        Ok(Self {
            config,
            plant,
            dispatcher,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn plant(&self) -> &Arc<Plant> {
        &self.plant
    }

    /// Refresh the inverter and every battery
    pub async fn refresh(&self, full: bool) -> ModbusResult<()> {
        self.plant.refresh_all(full).await
    }

    pub async fn refresh_device(&self, device: DeviceId, full: bool) -> ModbusResult<Arc<DeviceSnapshot>> {
        self.plant.refresh(device, full).await
    }

    /// Poll the plant every `refresh_period` until `handler` breaks
    ///
    /// Starts with a full refresh, whose failure is returned. After that each
    /// tick runs an incremental refresh; a failed tick is logged and the
    /// cached snapshots stay in place. `handler` runs after the first refresh
    /// and after every tick, whether or not the tick succeeded.
    pub async fn watch<F>(&self, refresh_period: Duration, mut handler: F) -> ModbusResult<()>
    where
        F: FnMut(&Self) -> ControlFlow<()>,
    {
        if refresh_period.is_zero() {
            return Err(ModbusError::configuration("refresh period must be greater than zero"));
        }

        self.refresh(true).await?;
        if handler(self).is_break() {
            return Ok(());
        }

        let mut ticker = tokio::time::interval(refresh_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        info!("Watching plant every {:?}", refresh_period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh(false).await {
                warn!("Plant refresh failed, keeping cached data: {}", e);
            }
            if handler(self).is_break() {
                return Ok(());
            }
        }
    }

    /// Cached value of one field
    pub fn get(&self, device: DeviceId, field: &str) -> ModbusResult<DecodedField> {
        self.plant.get(device, field)
    }

    pub fn inverter(&self) -> Option<Arc<DeviceSnapshot>> {
        self.plant.inverter()
    }

    pub fn batteries(&self) -> Arc<Vec<Arc<DeviceSnapshot>>> {
        self.plant.batteries()
    }

    /// Validate and execute a control command
    pub async fn exec(&self, command: &Command) -> ModbusResult<CommandReport> {
        self.dispatcher.exec(command).await
    }

    pub fn is_connected(&self) -> bool {
        self.plant.client().is_connected()
    }

    /// Reconnect; cached snapshots stay as they are until the next refresh
    pub async fn reconnect(&self) -> ModbusResult<()> {
        self.plant.client().reconnect().await
    }

    pub async fn close(&self) -> ModbusResult<()> {
        self.plant.client().close().await
    }
}

impl std::fmt::Debug for PlantClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlantClient")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("unit_id", &self.config.unit_id)
            .field("plant", &self.plant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct Offline;

    #[async_trait]
    impl ModbusClient for Offline {
        async fn read_03(&self, _: u8, _: u16, _: u16) -> ModbusResult<Vec<u16>> {
            Err(ModbusError::connection("offline"))
        }
        async fn read_04(&self, _: u8, _: u16, _: u16) -> ModbusResult<Vec<u16>> {
            Err(ModbusError::connection("offline"))
        }
        async fn write_06(&self, _: u8, _: u16, _: u16) -> ModbusResult<()> {
            Err(ModbusError::connection("offline"))
        }
        async fn write_10(&self, _: u8, _: u16, _: &[u16]) -> ModbusResult<()> {
            Err(ModbusError::connection("offline"))
        }
        fn is_connected(&self) -> bool {
            false
        }
        async fn reconnect(&self) -> ModbusResult<()> {
            Err(ModbusError::connection("offline"))
        }
        async fn close(&self) -> ModbusResult<()> {
            Ok(())
        }
        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    /// Answers every read with zeros until told to fail
    #[derive(Default)]
    struct Scripted {
        failing: AtomicBool,
        reads: AtomicUsize,
    }

    impl Scripted {
        fn read(&self, quantity: u16) -> ModbusResult<Vec<u16>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ModbusError::connection("link down"));
            }
            Ok(vec![0; quantity as usize])
        }
    }

    #[async_trait]
    impl ModbusClient for Scripted {
        async fn read_03(&self, _: u8, _: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
            self.read(quantity)
        }
        async fn read_04(&self, _: u8, _: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
            self.read(quantity)
        }
        async fn write_06(&self, _: u8, _: u16, _: u16) -> ModbusResult<()> {
            Ok(())
        }
        async fn write_10(&self, _: u8, _: u16, _: &[u16]) -> ModbusResult<()> {
            Ok(())
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

    #[tokio::test(start_paused = true)]
    async fn test_watch_ticks_and_survives_failed_refresh() {
        let device = Arc::new(Scripted::default());
        let session = PlantClient::from_client(device.clone(), ClientConfig::default()).unwrap();
        let started = Instant::now();
        let mut seen = Vec::new();

        session
            .watch(Duration::from_secs(10), |s| {
                seen.push((started.elapsed(), s.inverter().is_some()));
                // only the first tick after the initial refresh fails
                device.failing.store(seen.len() == 1, Ordering::SeqCst);
                if seen.len() == 4 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await
            .unwrap();

        let secs: Vec<u64> = seen.iter().map(|(at, _)| at.as_secs()).collect();
        assert_eq!(secs, vec![0, 10, 20, 30]);
        // the failed tick kept the snapshot from the initial refresh
        assert!(seen.iter().all(|(_, cached)| *cached));
        let metrics = session.plant().metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.successful, 3);
    }

    #[tokio::test]
    async fn test_watch_rejects_zero_period_and_failed_start() {
        let session = PlantClient::from_client(Arc::new(Scripted::default()), ClientConfig::default()).unwrap();
        let err = session.watch(Duration::ZERO, |_| ControlFlow::Break(())).await.unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));

        let offline = PlantClient::from_client(Arc::new(Offline), ClientConfig::default()).unwrap();
        let mut calls = 0;
        let err = offline
            .watch(Duration::from_secs(1), |_| {
                calls += 1;
                ControlFlow::Continue(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_unknown_model_rejected() {
        let config = ClientConfig {
            battery_model: "hv-rack".to_string(),
            ..ClientConfig::default()
        };
        let err = PlantClient::from_client(Arc::new(Offline), config).unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let session = PlantClient::from_client(Arc::new(Offline), ClientConfig::default()).unwrap();
        assert!(!session.is_connected());
        assert!(session.inverter().is_none());
        assert!(matches!(session.refresh(true).await, Err(ModbusError::Connection { .. })));
        assert!(matches!(
            session.get(DeviceId::Inverter, "v_pv1"),
            Err(ModbusError::DeviceUnavailable { .. })
        ));
        // validation fails before anything reaches the wire
        assert!(matches!(
            session.exec(&Command::SetBatterySocReserve(101)).await,
            Err(ModbusError::OutOfRange { .. })
        ));
    }
}
