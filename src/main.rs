use ble_sensor_tools::commands;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Alarms(commands::alarms::Args),
    Decode(commands::decode::Args),
    Replay(commands::replay::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var("BLE_SENSOR_TOOLS_LOG").unwrap_or_default();
    let filter = filter_description
        .parse::<tracing_subscriber::filter::targets::Targets>()
        .expect("BLE_SENSOR_TOOLS_LOG is not a valid filter description");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Alarms(args) => end(commands::alarms::run(args)),
        Commands::Decode(args) => end(commands::decode::run(args)),
        Commands::Replay(args) => end(commands::replay::run(args)),
    }
}
