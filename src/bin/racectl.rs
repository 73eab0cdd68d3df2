//! Race timer operator tool
//!
//! Usage:
//!   cargo run --bin racectl -- load              # POST /command/load
//!   cargo run --bin racectl -- status            # GET /status
//!   cargo run --bin racectl -- run               # load, wait for ready, start, wait for result
//!   cargo run --bin racectl -- watch             # print MQTT events
//!   cargo run --bin racectl -- probe --device /dev/ttyUSB0 load
//!
//! `probe` talks to the timing device directly, bypassing the server, and
//! prints every device line with the time since the command was written.

use anyhow::Context;
use clap::{Parser, Subcommand};
use race_timer::domain::types::Command;
use race_timer::io::serial_link::{command_frame, parse_line};
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;

#[derive(Parser, Debug)]
#[command(name = "racectl", about = "Race timer operator tool")]
struct Args {
    /// Base URL of the race timer HTTP adapter
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Prepare a race
    Load,
    /// Start a ready race
    Start,
    /// Abort and return to idle
    Reset,
    /// Device and race status
    Status,
    /// Finished races of this session
    Races,
    /// Drive one full race and print the result
    Run {
        /// Give up waiting for a state after this many seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
    /// Print outbound events from the MQTT broker
    Watch {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value = "1883")]
        port: u16,
        #[arg(long, default_value = "race")]
        prefix: String,
    },
    /// Send one command straight to the timing device
    Probe {
        #[arg(long, default_value = "/dev/ttyUSB0")]
        device: String,
        #[arg(long, default_value = "115200")]
        baud: u32,
        /// load, start or reset
        command: String,
        /// Keep printing device lines for this many seconds
        #[arg(long, default_value = "5")]
        listen_secs: u64,
    },
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string() })
    }

    async fn command(&self, name: &str) -> anyhow::Result<Value> {
        let url = format!("{}/command/{}", self.base, name);
        let resp = self.http.post(&url).send().await.with_context(|| format!("POST {}", url))?;
        let status = resp.status();
        let body: Value = serde_json::from_str(&resp.text().await?)
            .with_context(|| format!("POST {} returned non-JSON ({})", url, status))?;
        Ok(body)
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.base, path);
        let resp = self.http.get(&url).send().await.with_context(|| format!("GET {}", url))?;
        anyhow::ensure!(resp.status().is_success(), "GET {} failed: {}", url, resp.status());
        Ok(serde_json::from_str(&resp.text().await?)?)
    }

    async fn state(&self) -> anyhow::Result<String> {
        let status = self.get("/status").await?;
        Ok(status["state"].as_str().unwrap_or("unknown").to_string())
    }

    async fn wait_for(&self, wanted: &[&str], timeout: Duration) -> anyhow::Result<String> {
        let deadline = Instant::now() + timeout;
        let mut last = String::new();
        while Instant::now() < deadline {
            let state = self.state().await?;
            if state != last {
                println!("  STATE: {}", state);
                last = state.clone();
            }
            if wanted.contains(&state.as_str()) {
                return Ok(state);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("timed out waiting for {:?} (last state {})", wanted, last)
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn ensure_success(name: &str, body: &Value) -> anyhow::Result<()> {
    if body["success"] == true {
        return Ok(());
    }
    anyhow::bail!("{} failed: {}", name, body["error"].as_str().unwrap_or("unknown error"))
}

async fn send_command(url: &str, name: &str) -> anyhow::Result<()> {
    let body = Client::new(url)?.command(name).await?;
    print_json(&body);
    ensure_success(name, &body)
}

async fn run_race(client: &Client, timeout: Duration) -> anyhow::Result<()> {
    let start = Instant::now();

    let load = client.command("load").await?;
    ensure_success("load", &load)?;
    println!("[{:>6}ms] LOAD acked race_id={}", start.elapsed().as_millis(), load["race_id"]);

    client.wait_for(&["ready"], timeout).await?;
    println!("[{:>6}ms] READY", start.elapsed().as_millis());

    let go = client.command("start").await?;
    ensure_success("start", &go)?;
    let race_start = Instant::now();
    println!("[{:>6}ms] START acked in {}us", start.elapsed().as_millis(), go["ack_latency_us"]);

    let end = client.wait_for(&["finished", "error"], timeout).await?;
    println!("[{:>6}ms] {}", race_start.elapsed().as_millis(), end.to_uppercase());

    let races = client.get("/races").await?;
    if let Some(result) = races.as_array().and_then(|r| r.last()) {
        println!("\n============================================================");
        println!("RESULT");
        println!("============================================================");
        println!("  Race:    {}", result["race_id"]);
        println!("  Car 1:   {} ms", result["car1_time_ms"]);
        println!("  Car 2:   {} ms", result["car2_time_ms"]);
        println!("  Winner:  {}", result["winner"].as_str().unwrap_or("?"));
    }
    Ok(())
}

async fn watch(host: &str, port: u16, prefix: &str) -> anyhow::Result<()> {
    let mut mqtt_options = MqttOptions::new("racectl", host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    client.subscribe(format!("{}/#", prefix), QoS::AtLeastOnce).await?;

    println!("Watching {}/# on {}:{} (Ctrl+C to stop)", prefix, host, port);
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => println!("connected"),
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                println!(
                    "{} {} {}",
                    chrono::Utc::now().format("%H:%M:%S%.3f"),
                    publish.topic,
                    String::from_utf8_lossy(&publish.payload)
                );
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("mqtt error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn probe(device: &str, baud: u32, command: Command, listen: Duration) -> anyhow::Result<()> {
    let port = tokio_serial::new(device, baud)
        .open_native_async()
        .with_context(|| format!("Failed to open serial device {}", device))?;
    let (reader, mut writer) = tokio::io::split(port);
    let mut lines = BufReader::new(reader).lines();

    let frame = command_frame(command);
    let start = Instant::now();
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    println!("[{:>8}us] SENT {}", start.elapsed().as_micros(), frame.trim_end());

    let deadline = tokio::time::Instant::now() + listen;
    loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Err(_) => break,
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                println!("device closed the link");
                break;
            }
            Ok(Err(e)) => return Err(e.into()),
        };
        match parse_line(&line) {
            Ok(message) => println!("[{:>8}us] {:?}", start.elapsed().as_micros(), message),
            Err(e) => println!("[{:>8}us] UNPARSED {} ({})", start.elapsed().as_micros(), line, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.action {
        Action::Load => send_command(&args.url, "load").await?,
        Action::Start => send_command(&args.url, "start").await?,
        Action::Reset => send_command(&args.url, "reset").await?,
        Action::Status => print_json(&Client::new(&args.url)?.get("/status").await?),
        Action::Races => print_json(&Client::new(&args.url)?.get("/races").await?),
        Action::Run { timeout_secs } => {
            run_race(&Client::new(&args.url)?, Duration::from_secs(timeout_secs)).await?
        }
        Action::Watch { host, port, prefix } => watch(&host, port, &prefix).await?,
        Action::Probe { device, baud, command, listen_secs } => {
            let command: Command = command.parse()?;
            probe(&device, baud, command, Duration::from_secs(listen_secs)).await?
        }
    }
    Ok(())
}
