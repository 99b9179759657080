//! A thin terminal driver for the `daqnet` library, standing in for the
//! out-of-scope visualization surface while exercising every plotter
//! operation from a real call site.
use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use daqnet::config::Config;
use daqnet::csv::FileCsvSink;
use daqnet::plotter::Plotter;

#[derive(Parser)]
#[command(name = "daqnet-plotter", about = "Drive a daqnet sampling device from the terminal")]
struct Cli {
    #[command(flatten)]
    net: NetArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct NetArgs {
    /// Device command port (device listens, plotter sends).
    #[arg(long, default_value_t = Config::default().command_port)]
    command_port: u16,
    /// Plotter's source port for command replies.
    #[arg(long, default_value_t = Config::default().reply_port)]
    reply_port: u16,
    /// Data port the plotter listens on for DATA/TRIGGER packets.
    #[arg(long, default_value_t = Config::default().data_port)]
    data_port: u16,
    /// Per-attempt command reply timeout, in milliseconds.
    #[arg(long, default_value_t = Config::default().reply_timeout.as_millis() as u64)]
    reply_timeout_ms: u64,
}

impl NetArgs {
    fn into_config(self) -> Config {
        Config {
            command_port: self.command_port,
            reply_port: self.reply_port,
            data_port: self.data_port,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            ..Config::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// PING a device and report round-trip success.
    Ping { device: Ipv4Addr },
    /// GET_ID and print the device's identification record.
    GetId { device: Ipv4Addr },
    /// REGISTER_RECEIVER for (ip, port); port 0 asks the device to use the
    /// sender's own address.
    RegisterReceiver { device: Ipv4Addr, ip: Ipv4Addr, port: u16 },
    /// REMOVE_RECEIVER for (ip, port).
    RemoveReceiver { device: Ipv4Addr, ip: Ipv4Addr, port: u16 },
    /// GET_RECEIVERS and print the device's current receiver list.
    ListReceivers { device: Ipv4Addr },
    /// START_SAMPLING. `num_packets = 0` means continuous.
    StartSampling {
        device: Ipv4Addr,
        #[arg(long, default_value_t = 0)]
        num_packets: u32,
    },
    /// START_ON_TRIGGER. `num_packets = 0` means continuous once triggered.
    StartOnTrigger {
        device: Ipv4Addr,
        #[arg(long, default_value_t = 0)]
        num_packets: u32,
    },
    /// STOP_SAMPLING and report the device's packets_sent count.
    StopSampling { device: Ipv4Addr },
    /// FORCE_TRIGGER.
    ForceTrigger { device: Ipv4Addr },
    /// Dump the device's current ring buffers to `<out_dir>/<device>.csv`.
    SaveCsv {
        device: Ipv4Addr,
        #[arg(long, default_value = ".")]
        out_dir: String,
    },
    /// Clear a device's ring/reorder buffers and counters.
    Clear { device: Ipv4Addr },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = cli.net.into_config();
    let plotter = Plotter::connect(config)?;

    match cli.command {
        Command::Ping { device } => {
            plotter.ping(device)?;
            println!("{device}: PING ok");
        }
        Command::GetId { device } => {
            let id = plotter.get_id(device)?;
            println!("{device}: {id:#?}");
        }
        Command::RegisterReceiver { device, ip, port } => {
            let registered = plotter.register_receiver(device, ip, port)?;
            println!(
                "{device}: registered {}:{} at index {}",
                registered.addr.ip, registered.addr.port, registered.index
            );
        }
        Command::RemoveReceiver { device, ip, port } => {
            let removed = plotter.remove_receiver(device, ip, port)?;
            println!("{device}: removed {}:{}", removed.ip, removed.port);
        }
        Command::ListReceivers { device } => {
            for receiver in plotter.list_receivers(device)? {
                println!("{device}: {}:{}", receiver.ip, receiver.port);
            }
        }
        Command::StartSampling { device, num_packets } => {
            plotter.start_sampling(device, num_packets)?;
            println!("{device}: sampling started (num_packets={num_packets})");
        }
        Command::StartOnTrigger { device, num_packets } => {
            plotter.start_on_trigger(device, num_packets)?;
            println!("{device}: armed for trigger (num_packets={num_packets})");
        }
        Command::StopSampling { device } => {
            let packets_sent = plotter.stop_sampling(device)?;
            println!("{device}: stopped, packets_sent={packets_sent}");
        }
        Command::ForceTrigger { device } => {
            plotter.force_trigger(device)?;
            println!("{device}: trigger forced");
        }
        Command::SaveCsv { device, out_dir } => {
            std::fs::create_dir_all(&out_dir)?;
            let sink = FileCsvSink::new(out_dir.clone());
            plotter.save_buffer_to_csv(device, &sink)?;
            println!("{device}: buffer saved to {out_dir}/{device}.csv");
        }
        Command::Clear { device } => {
            plotter.clear(device);
            println!("{device}: cleared");
        }
    }

    Ok(())
}
