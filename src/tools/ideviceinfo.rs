// Prints lockdown values, like libimobiledevice's ideviceinfo

use clap::{Arg, Command};
use idevice_lockdown::{
    lockdown::LockdownClient, pretty_print_plist, provider::IdeviceProvider,
    usbmuxd::UsbmuxdClient,
};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("ideviceinfo")
        .about("Get information from the device")
        .arg(
            Arg::new("udid")
                .short('u')
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device, defaults to the first USB device"),
        )
        .arg(
            Arg::new("pairing_file")
                .long("pairing-file")
                .value_name("PATH")
                .help("Use this pairing file instead of the one usbmuxd stores"),
        )
        .arg(
            Arg::new("domain")
                .short('q')
                .long("domain")
                .value_name("DOMAIN")
                .help("Query this domain instead of the global one"),
        )
        .arg(
            Arg::new("key")
                .short('k')
                .long("key")
                .value_name("KEY")
                .help("Only print this key"),
        )
        .arg(
            Arg::new("simple")
                .short('s')
                .long("simple")
                .help("Don't start a session, only values readable without one are returned")
                .action(clap::ArgAction::SetTrue),
        )
        .after_help("Set RUST_LOG to info, debug, warn, error, or trace to see more logs.")
        .get_matches();

    let client = UsbmuxdClient::from_env("ideviceinfo").expect("Bad USBMUXD_SOCKET_ADDRESS");
    let provider = match common::get_provider(
        &client,
        matches.get_one::<String>("udid"),
        matches.get_one::<String>("pairing_file"),
        "ideviceinfo",
    )
    .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let mut lockdown_client = match LockdownClient::connect(&provider).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Unable to connect to lockdown: {e}");
            return;
        }
    };

    let session = if matches.get_flag("simple") {
        None
    } else {
        let pairing_file = provider
            .get_pairing_file()
            .await
            .expect("Failed to get the pairing file");
        Some(
            lockdown_client
                .start_session(&pairing_file)
                .await
                .expect("Failed to start a session"),
        )
    };

    let domain = matches.get_one::<String>("domain").map(String::as_str);
    let key = matches.get_one::<String>("key").map(String::as_str);
    match lockdown_client.get_value(domain, key).await {
        Ok(Some(v)) => println!("{}", pretty_print_plist(&v)),
        Ok(None) => eprintln!("No value"),
        Err(e) => eprintln!("GetValue failed: {e}"),
    }

    if let Some(session) = session {
        if let Err(e) = lockdown_client.stop_session(&session.session_id).await {
            eprintln!("Failed to stop the session: {e}");
        }
    }
}
