//! Host BLE backend on btleplug.
//!
//! btleplug is async; the stream contract is blocking. Each central owns a
//! small tokio runtime: blocking calls enter it with `block_on`, while
//! notification and disconnect watchers run on it as tasks and feed the
//! [`NotificationSink`] from there.

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::ble::{is_serial_service, BleCentral, BleConnection, BleDeviceInfo, BleError};
use crate::buffer::NotificationSink;
use crate::config::BleConfig;

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => BleError::PermissionDenied,
            btleplug::Error::DeviceNotFound => BleError::DeviceNotFound(String::new()),
            btleplug::Error::NotConnected => BleError::Disconnected,
            btleplug::Error::TimedOut(_) => BleError::Timeout,
            other => BleError::Gatt(other.to_string()),
        }
    }
}

pub struct BtleplugCentral {
    runtime: Arc<Runtime>,
    adapter: Adapter,
    connect_timeout: Duration,
}

impl BtleplugCentral {
    /// Use the first adapter the platform reports.
    pub fn new(config: &BleConfig) -> Result<Self, BleError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| BleError::ConnectionFailed(format!("runtime: {e}")))?;
        let adapter = runtime.block_on(async {
            let manager = Manager::new().await?;
            manager
                .adapters()
                .await?
                .into_iter()
                .next()
                .ok_or(BleError::BluetoothOff)
        })?;
        Ok(Self {
            runtime: Arc::new(runtime),
            adapter,
            connect_timeout: config.connect_timeout(),
        })
    }

    fn find(&self, address: &str) -> Result<Peripheral, BleError> {
        self.runtime.block_on(async {
            for peripheral in self.adapter.peripherals().await? {
                if peripheral.id().to_string() == address
                    || peripheral.address().to_string().eq_ignore_ascii_case(address)
                {
                    return Ok(peripheral);
                }
            }
            Err(BleError::DeviceNotFound(address.to_string()))
        })
    }
}

impl BleCentral for BtleplugCentral {
    type Connection = BtleplugConnection;

    fn scan(&mut self, timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError> {
        self.runtime.block_on(async {
            info!("scanning for {} ms", timeout.as_millis());
            self.adapter.start_scan(ScanFilter::default()).await?;
            tokio::time::sleep(timeout).await;
            self.adapter.stop_scan().await.ok();

            let mut found = Vec::new();
            for peripheral in self.adapter.peripherals().await? {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(name) = props.local_name else {
                    continue;
                };
                debug!("scan: {name} at {}", peripheral.id());
                found.push(BleDeviceInfo {
                    address: peripheral.id().to_string(),
                    name,
                    rssi: props.rssi.unwrap_or(i16::MIN),
                });
            }
            Ok::<_, BleError>(found)
        })
    }

    fn connect(&mut self, address: &str) -> Result<Self::Connection, BleError> {
        let peripheral = self.find(address)?;
        let name = self.runtime.block_on(async {
            tokio::time::timeout(self.connect_timeout, peripheral.connect())
                .await
                .map_err(|_| BleError::Timeout)??;
            let props = peripheral.properties().await?;
            Ok::<_, BleError>(props.and_then(|p| p.local_name))
        })?;
        info!("connected to {address}");
        Ok(BtleplugConnection {
            runtime: Arc::clone(&self.runtime),
            adapter: self.adapter.clone(),
            peripheral,
            address: address.to_string(),
            name,
            rx: None,
            tx: None,
            tasks: Vec::new(),
        })
    }
}

pub struct BtleplugConnection {
    runtime: Arc<Runtime>,
    adapter: Adapter,
    peripheral: Peripheral,
    address: String,
    name: Option<String>,
    rx: Option<Characteristic>,
    tx: Option<Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugConnection {
    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl BleConnection for BtleplugConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn discover_services(&mut self) -> Result<(), BleError> {
        let peripheral = self.peripheral.clone();
        self.runtime.block_on(async {
            // BlueZ reports the link before the GATT cache is populated
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
                .await
                .map_err(|_| BleError::Timeout)?
                .map_err(BleError::from)
        })?;

        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| is_serial_service(&s.uuid))
            .ok_or(BleError::ServiceNotFound)?;
        debug!("using serial service {}", service.uuid);

        let writable = CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE;
        let notifying = CharPropFlags::NOTIFY | CharPropFlags::INDICATE;
        let tx = service
            .characteristics
            .iter()
            .find(|c| c.properties.intersects(writable))
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound("write".into()))?;
        let rx = service
            .characteristics
            .iter()
            .find(|c| c.properties.intersects(notifying))
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound("notify".into()))?;
        self.tx = Some(tx);
        self.rx = Some(rx);
        Ok(())
    }

    fn subscribe(&mut self, sink: NotificationSink) -> Result<(), BleError> {
        let rx = self
            .rx
            .clone()
            .ok_or_else(|| BleError::CharacteristicNotFound("notify".into()))?;
        let peripheral = self.peripheral.clone();
        let mut notifications = self.runtime.block_on(async {
            peripheral.subscribe(&rx).await?;
            peripheral.notifications().await
        })?;

        let data_sink = sink.clone();
        self.tasks.push(self.runtime.spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == rx.uuid {
                    data_sink.deliver(&notification.value);
                }
            }
            debug!("notification stream ended");
            data_sink.link_lost();
        }));

        let adapter = self.adapter.clone();
        let id = self.peripheral.id();
        self.tasks.push(self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("cannot watch for disconnects: {e}");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id) {
                    info!("peripheral {id:?} disconnected");
                    sink.link_lost();
                    break;
                }
            }
        }));
        Ok(())
    }

    fn write_without_response(&mut self, data: &[u8]) -> Result<(), BleError> {
        let tx = self.tx.as_ref().ok_or(BleError::Disconnected)?;
        let kind = if tx.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.runtime
            .block_on(self.peripheral.write(tx, data, kind))
            .map_err(BleError::from)
    }

    fn disconnect(&mut self) -> Result<(), BleError> {
        self.stop_tasks();
        self.runtime
            .block_on(self.peripheral.disconnect())
            .map_err(BleError::from)
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
