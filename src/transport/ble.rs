//! Bluetooth LE transport.
//!
//! The radio exposes one GATT service with three characteristics: packets
//! are written to `TORADIO`, read one at a time from `FROMRADIO` until an
//! empty read, and `FROMNUM` notifies whenever new packets are waiting.
//! BLE delivers whole packets, so no stream framing is involved.
//!
//! Disconnection is reported by the adapter as it happens, which is why
//! this transport opts out of the periodic health probe.

use std::future::Future;
use std::pin::Pin;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{BleConfig, Transport};

/// Radio GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1_b218_15a8_461f_9fa8_5dca_e273_eafd);
/// Packets to the radio.
pub const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c_76d2_129e_4dad_a1dd_7866_1244_01e7);
/// Packets from the radio.
pub const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55_e69e_4993_11ed_b878_0242_ac12_0002);
/// Pending-packet notifications.
pub const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9d_a18c_a800_4f66_a670_aa75_47e3_4453);

#[derive(Clone)]
struct Link {
    adapter: Adapter,
    peripheral: Peripheral,
    to_radio: Characteristic,
    from_radio: Characteristic,
    from_num: Characteristic,
}

/// Bluetooth LE transport.
pub struct BleTransport {
    config: BleConfig,
    link: Option<Link>,
}

impl BleTransport {
    /// Creates a new BLE transport.
    #[must_use]
    pub const fn new(config: BleConfig) -> Self {
        Self { config, link: None }
    }

    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral> {
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(Error::transport)?;
        tokio::time::sleep(self.config.scan_duration).await;
        if let Err(e) = adapter.stop_scan().await {
            tracing::debug!("stop scan: {}", e);
        }

        let wanted = self.config.address.to_ascii_lowercase();
        for peripheral in adapter.peripherals().await.map_err(Error::transport)? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let address = props.address.to_string().to_ascii_lowercase();
            let name = props.local_name.unwrap_or_default().to_ascii_lowercase();
            if address == wanted || name == wanted {
                return Ok(peripheral);
            }
        }

        Err(Error::transport(format!(
            "BLE device {} not found after {:?} scan",
            self.config.address, self.config.scan_duration
        )))
    }
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::transport(format!("radio is missing characteristic {uuid}")))
}

impl Transport for BleTransport {
    fn name(&self) -> &str {
        &self.config.address
    }

    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.link.is_some() {
                return Ok(());
            }

            tracing::info!("scanning for BLE radio {}", self.config.address);

            let manager = Manager::new().await.map_err(Error::transport)?;
            let adapter = manager
                .adapters()
                .await
                .map_err(Error::transport)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::transport("no Bluetooth adapter available"))?;

            let peripheral = self.find_peripheral(&adapter).await?;
            peripheral.connect().await.map_err(Error::transport)?;
            peripheral
                .discover_services()
                .await
                .map_err(Error::transport)?;

            let link = Link {
                to_radio: characteristic(&peripheral, TORADIO_UUID)?,
                from_radio: characteristic(&peripheral, FROMRADIO_UUID)?,
                from_num: characteristic(&peripheral, FROMNUM_UUID)?,
                adapter,
                peripheral,
            };
            link.peripheral
                .subscribe(&link.from_num)
                .await
                .map_err(Error::transport)?;

            self.link = Some(link);
            tracing::info!("connected to BLE radio {}", self.config.address);
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(link) = self.link.take() {
                tracing::info!("disconnecting BLE radio {}", self.config.address);
                if let Err(e) = link.peripheral.disconnect().await {
                    tracing::debug!("BLE disconnect: {}", e);
                }
            }
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let link = self.link.clone();
        Box::pin(async move {
            let link = link.ok_or(Error::NotConnected)?;
            tracing::trace!(packet = %hex::encode(&data), "writing to radio");
            link.peripheral
                .write(&link.to_radio, &data, WriteType::WithResponse)
                .await
                .map_err(Error::transport)
        })
    }

    fn start_reader(&mut self, packet_tx: mpsc::Sender<Bytes>) -> Result<JoinHandle<Result<()>>> {
        let link = self.link.clone().ok_or(Error::NotConnected)?;
        Ok(tokio::spawn(run_ble_reader(link, packet_tx)))
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn reports_disconnect(&self) -> bool {
        true
    }
}

/// Reads every packet currently waiting in `FROMRADIO`.
///
/// Returns false once the packet receiver is gone.
async fn drain_from_radio(link: &Link, packet_tx: &mpsc::Sender<Bytes>) -> Result<bool> {
    loop {
        let data = link
            .peripheral
            .read(&link.from_radio)
            .await
            .map_err(Error::transport)?;
        if data.is_empty() {
            return Ok(true);
        }
        tracing::trace!(packet = %hex::encode(&data), "read from radio");
        if packet_tx.send(Bytes::from(data)).await.is_err() {
            return Ok(false);
        }
    }
}

async fn run_ble_reader(link: Link, packet_tx: mpsc::Sender<Bytes>) -> Result<()> {
    let mut notifications = link
        .peripheral
        .notifications()
        .await
        .map_err(Error::transport)?;
    let mut adapter_events = link.adapter.events().await.map_err(Error::transport)?;
    let id = link.peripheral.id();

    if !drain_from_radio(&link, &packet_tx).await? {
        return Ok(());
    }

    loop {
        tokio::select! {
            notification = notifications.next() => {
                match notification {
                    Some(n) if n.uuid == FROMNUM_UUID => {
                        if !drain_from_radio(&link, &packet_tx).await? {
                            tracing::debug!("packet receiver dropped");
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                    None => return Err(Error::transport("BLE notification stream ended")),
                }
            }
            event = adapter_events.next() => {
                match event {
                    Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                        tracing::warn!("BLE radio disconnected");
                        return Err(Error::transport("BLE device disconnected"));
                    }
                    Some(_) => {}
                    None => return Err(Error::transport("BLE adapter event stream ended")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(
            FROMNUM_UUID.to_string(),
            "ed9da18c-a800-4f66-a670-aa7547e34453"
        );
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let mut transport = BleTransport::new(BleConfig::new("AA:BB:CC:DD:EE:FF"));
        assert!(transport.reports_disconnect());
        let err = transport.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
