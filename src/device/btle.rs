use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Duration};

use crate::device::constants::{make_spp_service_uuid, WRITE_DEADLINE};
use crate::device::transport::{Channel, Transport};
use crate::device::types::{AdapterStatus, DeviceHandle, DiscoveryEvent};
use crate::error::DeviceError;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

/// Bluetooth transport backed by btleplug.
///
/// The cane exposes its serial port as a GATT service carrying the serial port profile UUID: one
/// characteristic notifies the bytes the cane sends, another accepts the bytes written to it.
pub struct BtleTransport {
    manager: Manager,
    scan_timeout: Duration,
    // peripherals seen during discovery, keyed by the address in their DeviceHandle
    peripherals: PeripheralMap,
    scanning: Mutex<Option<Adapter>>,
}

impl BtleTransport {
    pub async fn new(scan_timeout: Duration) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;

        Ok(BtleTransport {
            manager,
            scan_timeout,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scanning: Mutex::new(None),
        })
    }

    async fn first_adapter(&self) -> Result<Adapter, DeviceError> {
        let adapters = self.manager.adapters().await?;
        adapters.into_iter().next()
            .ok_or_else(|| DeviceError::Transport("no bluetooth adapter".to_string()))
    }

    async fn start_discovery(&self) -> Result<BoxStream<'static, DiscoveryEvent>, DeviceError> {
        let adapter = self.first_adapter().await?;
        info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        self.scanning.lock().expect("Failed to lock scanning adapter").replace(adapter.clone());

        let peripherals = self.peripherals.clone();
        let found = stream::unfold((events, adapter, peripherals), |(mut events, adapter, peripherals)| async move {
            loop {
                let id = match events.next().await? {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };

                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(err) => {
                        warn!("Failed to look up discovered peripheral: {:?}", err);
                        continue;
                    },
                };

                match peripheral.properties().await {
                    Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
                    Ok(None) => debug!("Peripheral has no properties"),
                    Ok(Some(properties)) => {
                        let address = properties.address.to_string();
                        peripherals.lock().expect("Failed to lock peripherals")
                            .insert(address.clone(), peripheral);

                        let event = DiscoveryEvent::DeviceFound { name: properties.local_name, address };
                        return Some((event, (events, adapter, peripherals)));
                    },
                }
            }
        });

        Ok(found.take_until(Box::pin(sleep(self.scan_timeout))).boxed())
    }
}

impl Transport for BtleTransport {
    fn adapter_status(&self) -> BoxFuture<'_, AdapterStatus> {
        async move {
            match self.manager.adapters().await {
                Ok(adapters) if adapters.is_empty() => AdapterStatus::Unsupported,
                Ok(_) => AdapterStatus::Ready,
                Err(btleplug::Error::PermissionDenied) => AdapterStatus::Disabled,
                Err(err) => {
                    warn!("Failed to query bluetooth adapters: {:?}", err);
                    AdapterStatus::Unsupported
                },
            }
        }.boxed()
    }

    fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, DiscoveryEvent>, DeviceError>> {
        self.start_discovery().boxed()
    }

    fn stop_discovery(&self) -> BoxFuture<'_, ()> {
        async move {
            let adapter = self.scanning.lock().expect("Failed to lock scanning adapter").take();
            if let Some(adapter) = adapter {
                if let Err(err) = adapter.stop_scan().await {
                    warn!("Failed to stop scanning: {:?}", err);
                }
            }
        }.boxed()
    }

    fn open(&self, handle: &DeviceHandle) -> BoxFuture<'_, Result<Box<dyn Channel>, DeviceError>> {
        let address = handle.address.clone();

        async move {
            let peripheral = self.peripherals.lock().expect("Failed to lock peripherals")
                .get(&address)
                .cloned()
                .ok_or(DeviceError::UnknownDevice(address))?;

            let channel: Box<dyn Channel> = Box::new(BtleChannel::new(peripheral));
            Ok(channel)
        }.boxed()
    }
}

struct SerialCharacteristics {
    rx: Characteristic,
    tx: Characteristic,
}

pub struct BtleChannel {
    peripheral: Peripheral,
    characteristics: Mutex<Option<SerialCharacteristics>>,
    notifications: tokio::sync::Mutex<Option<NotificationStream>>,
}

impl BtleChannel {
    fn new(peripheral: Peripheral) -> Self {
        BtleChannel {
            peripheral,
            characteristics: Mutex::new(None),
            notifications: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect_serial_service(&self) -> Result<(), DeviceError> {
        let spp_service_uuid = make_spp_service_uuid();

        info!("Connecting to peripheral...");
        self.peripheral.connect().await?;

        info!("Connected; Discovering services...");
        self.peripheral.discover_services().await?;

        let service = self.peripheral.services()
            .into_iter()
            .find(|service| service.uuid == spp_service_uuid)
            .ok_or(DeviceError::MissingService(spp_service_uuid))?;

        let rx = service.characteristics.iter()
            .find(|c| c.properties.contains(CharPropFlags::NOTIFY))
            .cloned()
            .ok_or(DeviceError::MissingCharacteristic)?;
        let tx = service.characteristics.iter()
            .find(|c| c.properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE))
            .cloned()
            .ok_or(DeviceError::MissingCharacteristic)?;

        info!("Subscribing to characteristic {:?} {:?}", service.uuid, rx.uuid);
        self.peripheral.subscribe(&rx).await?;
        let notifications = self.peripheral.notifications().await?;

        *self.notifications.lock().await = Some(notifications);
        *self.characteristics.lock().expect("Failed to lock characteristics") = Some(SerialCharacteristics { rx, tx });
        Ok(())
    }
}

impl Channel for BtleChannel {
    fn handshake(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        self.connect_serial_service().boxed()
    }

    fn read(&self) -> BoxFuture<'_, Result<Vec<u8>, DeviceError>> {
        async move {
            let rx_uuid = self.characteristics.lock().expect("Failed to lock characteristics")
                .as_ref()
                .map(|c| c.rx.uuid)
                .ok_or(DeviceError::Closed)?;

            let mut notifications = self.notifications.lock().await;
            let notifications = notifications.as_mut().ok_or(DeviceError::Closed)?;

            loop {
                match notifications.next().await {
                    None => return Ok(Vec::new()),
                    Some(data) if data.uuid == rx_uuid => return Ok(data.value),
                    Some(data) => debug!("Ignoring notification from {:?}", data.uuid),
                }
            }
        }.boxed()
    }

    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), DeviceError>> {
        async move {
            let tx = self.characteristics.lock().expect("Failed to lock characteristics")
                .as_ref()
                .map(|c| c.tx.clone())
                .ok_or(DeviceError::Closed)?;

            let write_type = if tx.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
                WriteType::WithoutResponse
            } else {
                WriteType::WithResponse
            };

            match timeout(Duration::from_millis(WRITE_DEADLINE), self.peripheral.write(&tx, bytes, write_type)).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(DeviceError::Transport("Sending to the cane took too long".to_string())),
            }
        }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.characteristics.lock().expect("Failed to lock characteristics").take();
            self.notifications.lock().await.take();

            if self.peripheral.is_connected().await? {
                self.peripheral.disconnect().await?;
            }
            Ok(())
        }.boxed()
    }
}
