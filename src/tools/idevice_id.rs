// Lists the devices usbmuxd knows about

use std::ops::ControlFlow;

use clap::{Arg, Command};
use idevice_lockdown::usbmuxd::{Connection, UsbmuxdClient, UsbmuxdListenEvent};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("idevice_id")
        .about("List attached devices")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("Keep running and print attach and detach events")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("buid")
                .long("buid")
                .help("Print the host's system BUID")
                .action(clap::ArgAction::SetTrue),
        )
        .after_help("Set RUST_LOG to info, debug, warn, error, or trace to see more logs.")
        .get_matches();

    let client = UsbmuxdClient::from_env("idevice_id").expect("Bad USBMUXD_SOCKET_ADDRESS");

    if matches.get_flag("buid") {
        match client.read_buid().await {
            Ok(Some(buid)) => println!("{buid}"),
            Ok(None) => eprintln!("usbmuxd is not running"),
            Err(e) => eprintln!("Unable to read the BUID: {e}"),
        }
        return;
    }

    let devs = client.list_devices().await.expect("Failed to list devices");
    for dev in &devs {
        let kind = match &dev.connection_type {
            Connection::Usb => "USB".to_string(),
            Connection::Network(Some(ip)) => format!("Network {ip}"),
            Connection::Network(None) => "Network".to_string(),
            Connection::Unknown(c) => c.clone(),
        };
        println!("{} ({kind})", dev.udid);
    }

    if matches.get_flag("listen") {
        let res = client
            .listen_with(|event| {
                match event {
                    UsbmuxdListenEvent::Attached(dev) => {
                        println!("+ {} ({})", dev.udid, dev.device_id)
                    }
                    UsbmuxdListenEvent::Detached(id) => println!("- {id}"),
                    UsbmuxdListenEvent::Paired(id) => println!("* {id}"),
                }
                ControlFlow::Continue(())
            })
            .await;
        match res {
            Ok(_) => eprintln!("usbmuxd closed the connection"),
            Err(e) => eprintln!("Listening failed: {e}"),
        }
    }
}
