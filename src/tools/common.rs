// Device selection shared by the tools

use idevice_lockdown::{
    pairing_file::PairingFile,
    provider::UsbmuxdProvider,
    usbmuxd::{Connection, UsbmuxdClient, UsbmuxdDevice},
};
use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Picks the device named by `udid`, or the first one attached over USB
pub async fn get_device(
    client: &UsbmuxdClient,
    udid: Option<&String>,
) -> Result<UsbmuxdDevice, String> {
    let devs = client
        .list_devices()
        .await
        .map_err(|e| format!("Unable to get devices from usbmuxd: {e}"))?;

    if let Some(udid) = udid {
        return devs
            .into_iter()
            .find(|d| &d.udid == udid || &d.serial_number == udid)
            .ok_or_else(|| format!("Device {udid} not found"));
    }

    let usb = devs
        .iter()
        .position(|d| d.connection_type == Connection::Usb)
        .unwrap_or(0);
    devs.into_iter()
        .nth(usb)
        .ok_or_else(|| "No devices connected!".to_string())
}

pub async fn get_provider(
    client: &UsbmuxdClient,
    udid: Option<&String>,
    pairing_file: Option<&String>,
    label: &str,
) -> Result<UsbmuxdProvider, String> {
    let dev = get_device(client, udid).await?;
    let provider = dev.to_provider(client.addr().clone(), label);
    match pairing_file {
        Some(path) => {
            let pairing_file = PairingFile::read_from_file(path)
                .map_err(|e| format!("Unable to read pairing file: {e}"))?;
            Ok(provider.with_pairing_file(pairing_file))
        }
        None => Ok(provider),
    }
}
