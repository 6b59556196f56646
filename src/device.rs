use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::config::ModelProfile;

/// EiBotBoard USB identifiers (Microchip VID, EBB PID).
const EBB_VID: u16 = 0x04d8;
const EBB_PID: u16 = 0xfd92;
const EBB_BAUD: u32 = 9600;
/// Stepper resolution at 16x microstepping.
const STEPS_PER_MM: f64 = 80.0;
/// Slack allowed before a move counts as out of bounds, in mm.
const TRAVEL_SLACK_MM: f64 = 0.5;
const READ_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to enumerate plotters: {0}")]
    Enumerate(String),
    #[error("failed to open plotter session: {0}")]
    OpenFailed(String),
    #[error("no plotter session open")]
    NotConnected,
    #[error("plotter I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for plotter response")]
    Timeout,
    #[error("plotter rejected command {command:?}: {reply}")]
    Rejected { command: String, reply: String },
    #[error(
        "move to ({x:.1}, {y:.1}) mm is outside the {travel_x:.0}x{travel_y:.0} mm travel area"
    )]
    OutOfBounds {
        x: f64,
        y: f64,
        travel_x: f64,
        travel_y: f64,
    },
    #[error("failed to read plot source {path:?}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parameters for one full plot pass.
#[derive(Debug, Clone)]
pub struct PlotParams {
    pub source: PathBuf,
    /// 0 plots every layer; a positive value selects that single layer.
    pub layer: u32,
    pub profile: ModelProfile,
    /// Reject motion outside the profile's travel area instead of sending it.
    pub clip_to_travel: bool,
}

/// One-shot commands issued outside a plot pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualCommand {
    /// De-energize the X/Y steppers ("EM,0,0").
    DisableMotors,
}

/// A single device-run invocation.
#[derive(Debug, Clone)]
pub enum RunRequest {
    Plot(PlotParams),
    Manual(ManualCommand),
}

/// The device driver capability the arbitration core depends on.
///
/// Everything the gate, job, and probe logic needs from the hardware goes
/// through these five operations, so the core can be exercised against a
/// scripted driver without a plotter attached.
#[async_trait]
pub trait PlotterDriver: Send + Sync {
    /// Enumerate attached plotters without opening an exclusive session.
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError>;

    /// Open the exclusive session. Idempotent while a session is live.
    async fn open(&self) -> Result<(), DeviceError>;

    /// Close the exclusive session.
    async fn close(&self) -> Result<(), DeviceError>;

    /// Send one raw command and return the device's reply line.
    async fn raw_query(&self, command: &str) -> Result<String, DeviceError>;

    /// Execute a configured run (a plot pass or a manual command).
    async fn configure_and_run(&self, request: &RunRequest) -> Result<(), DeviceError>;
}

/// Serial driver for EiBotBoard-based plotters.
pub struct EbbDriver {
    /// Explicit serial port; autodetected from USB enumeration when unset.
    port_override: Option<String>,
    session: Mutex<Option<BufReader<SerialStream>>>,
}

impl EbbDriver {
    pub fn new(port_override: Option<String>) -> Self {
        Self {
            port_override,
            session: Mutex::new(None),
        }
    }

    fn enumerate() -> Result<Vec<(String, String)>, DeviceError> {
        let ports =
            tokio_serial::available_ports().map_err(|e| DeviceError::Enumerate(e.to_string()))?;

        let mut found = Vec::new();
        for port in ports {
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                if usb.vid == EBB_VID && usb.pid == EBB_PID {
                    // Prefer the device's advertised product string as the
                    // label; fall back to the OS port path.
                    let label = usb
                        .product
                        .clone()
                        .unwrap_or_else(|| port.port_name.clone());
                    found.push((port.port_name.clone(), label));
                }
            }
        }
        Ok(found)
    }

    async fn exchange(
        reader: &mut BufReader<SerialStream>,
        command: &str,
    ) -> Result<String, DeviceError> {
        let stream = reader.get_mut();
        stream.write_all(command.trim_end().as_bytes()).await?;
        stream.write_all(b"\r").await?;
        stream.flush().await?;

        let mut line = String::new();
        let read = tokio::time::timeout(
            Duration::from_millis(READ_TIMEOUT_MS),
            reader.read_line(&mut line),
        )
        .await;

        match read {
            Ok(Ok(0)) => Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "plotter connection closed",
            ))),
            Ok(Ok(_)) => Ok(line.trim().to_string()),
            Ok(Err(e)) => Err(DeviceError::Io(e)),
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    /// Error replies start with '!'; everything else counts as an ack.
    fn expect_ok(command: &str, reply: &str) -> Result<(), DeviceError> {
        if reply.starts_with('!') {
            return Err(DeviceError::Rejected {
                command: command.to_string(),
                reply: reply.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PlotterDriver for EbbDriver {
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(Self::enumerate()?
            .into_iter()
            .map(|(_, label)| label)
            .collect())
    }

    async fn open(&self) -> Result<(), DeviceError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let port = match &self.port_override {
            Some(port) => port.clone(),
            None => Self::enumerate()?
                .into_iter()
                .map(|(port, _)| port)
                .next()
                .ok_or_else(|| DeviceError::OpenFailed("no plotter attached".to_string()))?,
        };

        tracing::debug!("Opening plotter session on {}", port);
        let stream = tokio_serial::new(&port, EBB_BAUD)
            .open_native_async()
            .map_err(|e| DeviceError::OpenFailed(format!("{}: {}", port, e)))?;
        *session = Some(BufReader::new(stream));
        drop(session);

        // Let the CDC port settle before the first command.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let mut session = self.session.lock().await;
        if session.take().is_some() {
            tracing::debug!("Plotter session closed");
        }
        Ok(())
    }

    async fn raw_query(&self, command: &str) -> Result<String, DeviceError> {
        let mut session = self.session.lock().await;
        let reader = session.as_mut().ok_or(DeviceError::NotConnected)?;
        Self::exchange(reader, command).await
    }

    async fn configure_and_run(&self, request: &RunRequest) -> Result<(), DeviceError> {
        match request {
            RunRequest::Manual(command) => {
                let wire = match command {
                    ManualCommand::DisableMotors => "EM,0,0",
                };
                let mut session = self.session.lock().await;
                let reader = session.as_mut().ok_or(DeviceError::NotConnected)?;
                let reply = Self::exchange(reader, wire).await?;
                Self::expect_ok(wire, &reply)
            }
            RunRequest::Plot(params) => {
                let program = tokio::fs::read_to_string(&params.source)
                    .await
                    .map_err(|e| DeviceError::Source {
                        path: params.source.clone(),
                        source: e,
                    })?;
                let commands = select_layer(&program, params.layer);
                tracing::info!(
                    "Streaming {} commands from {}",
                    commands.len(),
                    params.source.display()
                );

                let mut session = self.session.lock().await;
                let reader = session.as_mut().ok_or(DeviceError::NotConnected)?;
                let mut tracker = TravelTracker::new(&params.profile);
                for command in commands {
                    if params.clip_to_travel {
                        tracker.check(command)?;
                    }
                    let reply = Self::exchange(reader, command).await?;
                    Self::expect_ok(command, &reply)?;
                }
                Ok(())
            }
        }
    }
}

/// Pick the command lines belonging to the requested layer.
///
/// Sections are introduced by `;layer N` marker lines; commands before the
/// first marker always run. Layer 0 selects the whole program. Other comment
/// lines are dropped.
fn select_layer(program: &str, layer: u32) -> Vec<&str> {
    let mut selected = Vec::new();
    let mut current: Option<u32> = None;

    for line in program.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(";layer") {
            current = rest.trim().parse().ok();
            continue;
        }
        if line.starts_with(';') {
            continue;
        }
        if layer == 0 || current.is_none() || current == Some(layer) {
            selected.push(line);
        }
    }
    selected
}

/// Extract the (Δx, Δy) step counts from an SM or XM motion command.
fn parse_move(command: &str) -> Option<(i64, i64)> {
    let mut fields = command.split(',').map(str::trim);
    let opcode = fields.next()?.to_ascii_uppercase();
    let _duration = fields.next()?;
    let a: i64 = fields.next()?.parse().ok()?;
    let b: i64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);

    match opcode.as_str() {
        "SM" => Some((a, b)),
        // XM carries mixed-axis steps: a = x + y, b = x - y.
        "XM" => Some(((a + b) / 2, (a - b) / 2)),
        _ => None,
    }
}

/// Tracks cumulative pen position against the profile's travel area.
struct TravelTracker {
    x: f64,
    y: f64,
    travel_x: Option<f64>,
    travel_y: Option<f64>,
}

impl TravelTracker {
    fn new(profile: &ModelProfile) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            travel_x: profile.travel_x,
            travel_y: profile.travel_y,
        }
    }

    /// Fails before the command is sent if it would leave the travel area.
    fn check(&mut self, command: &str) -> Result<(), DeviceError> {
        let Some((dx, dy)) = parse_move(command) else {
            return Ok(());
        };
        self.x += dx as f64 / STEPS_PER_MM;
        self.y += dy as f64 / STEPS_PER_MM;

        if let (Some(travel_x), Some(travel_y)) = (self.travel_x, self.travel_y) {
            if self.x < -TRAVEL_SLACK_MM
                || self.y < -TRAVEL_SLACK_MM
                || self.x > travel_x + TRAVEL_SLACK_MM
                || self.y > travel_y + TRAVEL_SLACK_MM
            {
                return Err(DeviceError::OutOfBounds {
                    x: self.x,
                    y: self.y,
                    travel_x,
                    travel_y,
                });
            }
        }
        Ok(())
    }
}
