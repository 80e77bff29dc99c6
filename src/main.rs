// 试验台控制台
// Interactive operator console: commands on stdin, events on the log

use anyhow::Context;
use bench_console::drivers::{MockTransport, ModbusTransport, TcpTransport};
use bench_console::events::next_event;
use bench_console::storage::MemoryStore;
use bench_console::types::{LinkEvent, StoreEvent, TestEvent, WriteVerified};
use bench_console::{Console, ConsoleConfig, OperatorCommand, TestMode};
use chrono::{Duration as ChronoDuration, Local};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Turbostarter test bench operator console", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// PLC address, overrides the configuration
    #[arg(long)]
    host: Option<String>,

    /// Modbus TCP port, overrides the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Run against the built-in simulated PLC
    #[arg(long, default_value_t = false)]
    simulate: bool,
}

const HELP: &str = "\
commands:
  connect | disconnect
  reset             allow new connection attempts
  mode <1-5>        start a test procedure
  stop-test         stop the running test
  ready | start | stop | restart | interrupt | exit
  status | sessions | help | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConsoleConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ConsoleConfig::default(),
    };
    let mut config = config
        .with_endpoint(args.host, args.port)
        .context("invalid connection endpoint")?;

    let transport: Arc<dyn ModbusTransport> = if args.simulate {
        log::info!("Using simulated PLC");
        config.connection.host = "127.0.0.1".to_string();
        Arc::new(MockTransport::new())
    } else {
        Arc::new(TcpTransport::new(
            config.connection.unit_id,
            Duration::from_millis(config.connection.request_timeout_ms),
            config.connection.request_retries,
        ))
    };

    let console = Console::new(config, transport, Box::new(MemoryStore::new()))
        .context("starting persistence worker")?;
    console.start();
    spawn_reporters(&console);

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        match command {
            "connect" => {
                if let Err(e) = console.connect().await {
                    println!("connect failed: {}", e);
                }
            }
            "reset" => {
                console.reset_connection_attempts();
                println!("connection attempts reset");
            }
            "disconnect" => console.disconnect().await,
            "mode" => {
                let mode = words
                    .next()
                    .and_then(|w| w.parse::<u16>().ok())
                    .map(TestMode::from_value);
                match mode {
                    Some(Ok(mode)) => {
                        if let Err(e) = console.start_test(mode) {
                            println!("cannot start test: {}", e);
                        }
                    }
                    Some(Err(e)) => println!("{}", e),
                    None => println!("usage: mode <1-5>"),
                }
            }
            "stop-test" => {
                if !console.stop_test() {
                    println!("no test running");
                }
            }
            "status" => match serde_json::to_string_pretty(&console.status()) {
                Ok(text) => println!("{}", text),
                Err(e) => println!("status unavailable: {}", e),
            },
            "sessions" => {
                let now = Local::now();
                if let Err(e) = console.load_sessions(now - ChronoDuration::days(30), now, None) {
                    println!("{}", e);
                }
            }
            "help" => println!("{}", HELP),
            "quit" => break,
            other => match other.parse::<OperatorCommand>() {
                Ok(cmd) => {
                    if !console.trigger(cmd) {
                        println!("'{}' not allowed in state {}", other, console.control_state());
                    }
                }
                Err(e) => println!("{}", e),
            },
        }
    }

    console.shutdown().await;
    Ok(())
}

/// Print the notifications an operator cares about
fn spawn_reporters(console: &Console) {
    let events = console.events();

    let mut link_rx = events.subscribe_link();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut link_rx).await {
            match event {
                LinkEvent::Connecting { attempt } => println!("connecting (attempt {})", attempt),
                LinkEvent::Connected => println!("connected"),
                LinkEvent::Disconnected => println!("disconnected"),
                LinkEvent::Failed(reason) => println!("connection failed: {}", reason),
            }
        }
    });

    let mut verified_rx = events.subscribe_verified();
    tokio::spawn(async move {
        while let Some(WriteVerified { name, value, success, .. }) = next_event(&mut verified_rx).await {
            if !success {
                println!("write {} = {} NOT confirmed", name, value);
            }
        }
    });

    let mut control_rx = events.subscribe_control();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut control_rx).await {
            println!("{:?}", event);
        }
    });

    let mut test_rx = events.subscribe_tests();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut test_rx).await {
            match event {
                TestEvent::Started(mode) => println!("test mode {} running", mode),
                TestEvent::Stopped => println!("test stopped"),
            }
        }
    });

    let mut store_rx = events.subscribe_store();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut store_rx).await {
            match event {
                StoreEvent::SessionsLoaded(sessions) => {
                    for s in sessions {
                        println!("#{} {} {} -> {:?}", s.id, s.test_type, s.start_time, s.end_time);
                    }
                }
                StoreEvent::Failed(reason) => println!("store error: {}", reason),
                _ => {}
            }
        }
    });
}
