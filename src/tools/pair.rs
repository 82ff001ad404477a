// Pairs this host with a device and stores the record in usbmuxd

use clap::{Arg, Command};
use idevice_lockdown::{
    lockdown::{LockdownClient, PairingStatus},
    usbmuxd::UsbmuxdClient,
};

mod common;

const PAIR_ATTEMPTS: usize = 60;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("pair")
        .about("Pair with a device")
        .arg(
            Arg::new("udid")
                .value_name("UDID")
                .index(1)
                .help("UDID of the device, defaults to the first USB device"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Also write the pairing file here"),
        )
        .arg(
            Arg::new("no_save")
                .long("no-save")
                .help("Don't store the record in usbmuxd")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("validate")
                .long("validate")
                .help("Only check that the stored record is still trusted")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("unpair")
                .long("unpair")
                .help("Remove the stored record from the device and usbmuxd")
                .action(clap::ArgAction::SetTrue),
        )
        .after_help("Set RUST_LOG to info, debug, warn, error, or trace to see more logs.")
        .get_matches();

    let client = UsbmuxdClient::from_env("pair").expect("Bad USBMUXD_SOCKET_ADDRESS");
    let dev = match common::get_device(&client, matches.get_one::<String>("udid")).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let provider = dev.to_provider(client.addr().clone(), "pair");

    let mut lockdown_client = match LockdownClient::connect(&provider).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Unable to connect to lockdown: {e}");
            return;
        }
    };

    if matches.get_flag("validate") || matches.get_flag("unpair") {
        let pairing_file = match client.read_pair_record(&dev.udid).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                eprintln!("usbmuxd has no pairing record for {}", dev.udid);
                return;
            }
            Err(e) => {
                eprintln!("Unable to read the pairing record: {e}");
                return;
            }
        };
        if matches.get_flag("validate") {
            match lockdown_client.validate_pair(&pairing_file).await {
                Ok(true) => println!("Pairing record for {} is valid", dev.udid),
                Ok(false) => println!("Pairing record for {} is NOT valid", dev.udid),
                Err(e) => eprintln!("Validation failed: {e}"),
            }
        } else {
            lockdown_client
                .unpair(&pairing_file)
                .await
                .expect("Failed to unpair");
            client
                .delete_pair_record(&dev.udid)
                .await
                .expect("Failed to delete the pairing record");
            println!("Unpaired {}", dev.udid);
        }
        return;
    }

    let buid = client
        .read_buid()
        .await
        .expect("Failed to read the BUID")
        .expect("usbmuxd is not running");

    println!("Generating keys, this may take a moment");
    let mut pairing_file = lockdown_client
        .create_pairing_record(&buid)
        .await
        .expect("Failed to create a pairing record");

    println!("Accept the trust dialog on the device");
    let res = lockdown_client
        .pair_until_accepted(&pairing_file, PAIR_ATTEMPTS)
        .await
        .expect("Failed to pair");
    match res.map(|r| (r.status, r.escrow_bag)) {
        Some((PairingStatus::Success, escrow_bag)) => pairing_file.escrow_bag = escrow_bag,
        Some((status, _)) => {
            eprintln!("Pairing failed: {status:?}");
            return;
        }
        None => {
            eprintln!("The device closed the connection");
            return;
        }
    }

    // Test the new record
    let session = lockdown_client
        .start_session(&pairing_file)
        .await
        .expect("Pairing file test failed");
    lockdown_client
        .stop_session(&session.session_id)
        .await
        .expect("Failed to stop the test session");

    if let Some(path) = matches.get_one::<String>("output") {
        pairing_file
            .write_to_file(path)
            .expect("Failed to write the pairing file");
    }

    if !matches.get_flag("no_save") {
        client
            .save_pair_record(&dev.udid, Some(dev.device_id), &pairing_file)
            .await
            .expect("Failed to save the pairing record");
    }
    println!("Paired with {}", dev.udid);
}
