use std::{env, thread, time::Duration};

use tuhi_bridge::rest::Tuhi;

fn main() -> tuhi_bridge::Result<()> {
    env_logger::builder()
        .filter_module("tuhi_bridge", log::LevelFilter::Debug)
        .init();

    let tuhi = Tuhi::instance()?;
    if tuhi.manager().is_none() {
        eprintln!("tuhi is not running, no devices to show");
        return Ok(());
    }

    let devices = tuhi.list_devices()?;
    println!("{}", to_json(&devices));

    if env::args().any(|arg| arg == "--search") {
        tuhi.search_unregistered()?;
        println!("searching, put a device into pairing mode...");
        thread::sleep(Duration::from_secs(10));
        println!("{}", to_json(&tuhi.search_unregistered()?));
    }

    Ok(())
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("<unprintable: {}>", e))
}
