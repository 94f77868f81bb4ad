use std::env;

use zhonghong_vrf::{Event, GatewayClient, GatewayConfig, MessageLogMode};

#[tokio::main]
async fn main() -> zhonghong_vrf::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let Some(host) = args.get(1) else {
        eprintln!("usage: monitor <gateway-ip> [--log <file>]");
        std::process::exit(2);
    };
    let log_path = args
        .iter()
        .position(|a| a == "--log")
        .and_then(|i| args.get(i + 1));

    let config = GatewayConfig::new(host.clone());
    let mut builder = GatewayClient::builder(host.clone()).on_event(|event| match event {
        Event::DeviceAdded { identity } => println!("[{identity}] added"),
        Event::PowerChanged { identity, on } => {
            println!("[{identity}] power {}", if *on { "on" } else { "off" })
        }
        Event::ModeChanged { identity, mode } => {
            println!("[{identity}] mode {}", mode.as_str().unwrap_or("unknown"))
        }
        Event::FanChanged { identity, fan } => {
            println!("[{identity}] fan {}", fan.as_str().unwrap_or("unknown"))
        }
        Event::TargetTemperatureChanged { identity, temperature } => {
            println!("[{identity}] target {temperature:?}\u{00b0}C")
        }
        Event::CurrentTemperatureChanged { identity, temperature } => {
            println!("[{identity}] room {temperature:?}\u{00b0}C")
        }
        Event::AlarmChanged { identity, code } => println!("[{identity}] alarm {code}"),
        Event::ControlIndexAssigned { identity, index } => println!("[{identity}] idx {index}"),
    });
    if let Some(path) = log_path {
        builder = builder.message_log(MessageLogMode::Diffed, path.clone());
    }
    let client = builder.build()?;

    println!("Discovering {host}...");
    let discovery = client.discover().await?;
    println!(
        "{} fw {} | {} | {} units",
        discovery.info.model,
        discovery.info.firmware,
        discovery.info.brand.name(),
        discovery.devices.len()
    );

    client.start();

    let mut tick = tokio::time::interval(config.refresh_interval());
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                if let Err(e) = client.refresh_all().await {
                    eprintln!("Refresh error: {e}");
                }
                let stale = client.stale_devices(config.refresh_interval() * 3);
                if !stale.is_empty() {
                    println!("No updates from {stale:?}");
                }
            }
        }
    }

    client.stop().await;
    Ok(())
}
