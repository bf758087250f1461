//! Interactive terminal client for BLE smart scales.
//!
//! Usage:
//!   cargo run --bin tui               # scan with the system Bluetooth adapter
//!   cargo run --bin tui -- --simulate # use the built-in simulated scale
//!   cargo run --bin tui -- --debug    # debug logs to app.log
//!
//! Keys (device list)
//! ------------------
//!   ↑ / ↓    navigate list
//!   Enter    connect to highlighted device
//!   q / Esc  quit
//!
//! Keys (connecting / connected / error)
//! -------------------------------------
//!   b / B    read battery level (connected only)
//!   q / Esc  disconnect and go back to the device list
//!
//! Ctrl-C quits from anywhere.

use std::io;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, info, warn};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use scale_rs::adapter::GattCharacteristic;
use scale_rs::cli::{Cli, LogSettings};
use scale_rs::identity::IdentityKey;
use scale_rs::manufacturer::manufacturer_name;
use scale_rs::parse::now_ms;
use scale_rs::protocol::{characteristic_name, display_uuid};
use scale_rs::prelude::*;
use scale_rs::{logging, sim};

// ── Constants ─────────────────────────────────────────────────────────────────

const TITLE: &str = "⚖  Gourmetmiles Smart Scale BLE Client";

/// Braille spinner frames cycled at ~100 ms intervals to indicate background activity.
const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Render / input poll period (~30 FPS).
const TICK: Duration = Duration::from_millis(33);

/// Battery levels at or below this are shown in yellow.
const LOW_BATTERY: u8 = 20;

// ── App state (shared with the event-forwarding tasks via Arc<Mutex<_>>) ──────

#[derive(Clone, Debug, PartialEq)]
enum Screen {
    DeviceList,
    Connecting(String),
    Connected,
    Error(String),
}

struct App {
    screen: Screen,
    /// Latest debounced discovery snapshot.
    devices: Vec<TrackedDevice>,
    cursor: usize,
    /// Identity under the cursor, so the highlight follows the device when
    /// the list reshuffles underneath it.
    selected: Option<IdentityKey>,
    /// Transient footer message (e.g. a failed battery read).
    message: Option<String>,
    simulated: bool,
}

impl App {
    fn new(simulated: bool) -> Self {
        Self {
            screen: Screen::DeviceList,
            devices: Vec::new(),
            cursor: 0,
            selected: None,
            message: None,
            simulated,
        }
    }

    fn set_devices(&mut self, devices: Vec<TrackedDevice>) {
        self.devices = devices;
        let follow = self
            .selected
            .as_ref()
            .and_then(|key| self.devices.iter().position(|d| &d.identity == key));
        self.cursor = follow.unwrap_or(self.cursor.min(self.devices.len().saturating_sub(1)));
        self.selected = self.devices.get(self.cursor).map(|d| d.identity.clone());
    }

    fn move_cursor(&mut self, up: bool) {
        if up {
            self.cursor = self.cursor.saturating_sub(1);
        } else if self.cursor + 1 < self.devices.len() {
            self.cursor += 1;
        }
        self.selected = self.devices.get(self.cursor).map(|d| d.identity.clone());
    }

    fn reset_to_list(&mut self) {
        self.screen = Screen::DeviceList;
        self.devices.clear();
        self.cursor = 0;
        self.selected = None;
        self.message = None;
    }
}

fn lock(app: &Mutex<App>) -> MutexGuard<'_, App> {
    app.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Event forwarding ──────────────────────────────────────────────────────────

fn spawn_discovery_task(
    mut found: Subscription<DiscoveryEvent>,
    app: Arc<Mutex<App>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = found.recv().await {
            match event {
                DiscoveryEvent::Discovered(d) => debug!("TUI: discovered {}", d.name()),
                DiscoveryEvent::Updated(list) => lock(&app).set_devices(list),
            }
        }
    })
}

fn spawn_scale_task(mut events: Subscription<ScaleEvent>, app: Arc<Mutex<App>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let mut s = lock(&app);
            let active = matches!(s.screen, Screen::Connecting(_) | Screen::Connected);
            match event {
                ScaleEvent::Connected(_) if active => {
                    s.screen = Screen::Connected;
                    s.message = None;
                }
                ScaleEvent::Disconnected if active => {
                    s.screen = Screen::Error("Device disconnected".into());
                }
                ScaleEvent::Error(message) if active => s.screen = Screen::Error(message),
                ScaleEvent::Battery(_) => s.message = None,
                _ => {}
            }
        }
    })
}

// ── Operator intents ──────────────────────────────────────────────────────────

/// What the operator asked for.  Handled one at a time, in order.
#[derive(Debug)]
enum Intent {
    /// Stop scanning and connect to the device.
    Connect(TrackedDevice),
    /// Drop the current connection (if any) and resume scanning.
    Back,
}

/// Apply intents in arrival order.
///
/// The connect future is polled here rather than spawned, ahead of the next
/// intent, so a `Back` always finds the session already `Connecting` and its
/// `disconnect()` cancels the setup.  The stale setup is then driven to the
/// end so it can release the peripheral it may have opened.
async fn run_intents<A: Adapter>(
    mut intents: mpsc::UnboundedReceiver<Intent>,
    app: Arc<Mutex<App>>,
    discovery: Arc<DiscoverySession<A>>,
    scale: Arc<ConnectionSession<A>>,
) {
    let mut connecting: Option<BoxFuture<'static, ()>> = None;
    loop {
        let intent = tokio::select! {
            biased;
            () = poll_connect(&mut connecting), if connecting.is_some() => {
                connecting = None;
                continue;
            }
            intent = intents.recv() => match intent {
                Some(intent) => intent,
                None => break,
            },
        };
        debug!("TUI: intent {intent:?}");

        match intent {
            Intent::Connect(device) => {
                if connecting.is_some() {
                    warn!("TUI: already connecting; ignoring {}", device.name());
                    continue;
                }
                discovery.stop().await;
                connecting = Some(Box::pin(connect(device, Arc::clone(&app), Arc::clone(&scale))));
            }
            Intent::Back => {
                scale.disconnect().await;
                match discovery.start().await {
                    Ok(()) | Err(ScaleError::AlreadyActive) => {}
                    Err(e) => warn!("TUI: could not restart discovery: {e}"),
                }
                if let Some(stale) = connecting.take() {
                    stale.await;
                }
            }
        }
    }
}

async fn poll_connect(connecting: &mut Option<BoxFuture<'static, ()>>) {
    if let Some(f) = connecting.as_mut() {
        f.await;
    }
}

async fn connect<A: Adapter>(
    device: TrackedDevice,
    app: Arc<Mutex<App>>,
    scale: Arc<ConnectionSession<A>>,
) {
    match scale.connect(&device).await {
        Ok(()) => {}
        Err(ScaleError::AlreadyConnecting) => {
            // Refused before any event went out; the screen would wait forever.
            warn!("TUI: {} refused: adapter busy", device.name());
            let mut s = lock(&app);
            if matches!(s.screen, Screen::Connecting(_)) {
                s.screen = Screen::Error(ScaleError::AlreadyConnecting.to_string());
            }
        }
        Err(e) => warn!("TUI: connect to {} failed: {e}", device.name()),
    }
}

fn read_battery<A: Adapter>(app: &Arc<Mutex<App>>, scale: &Arc<ConnectionSession<A>>) {
    let app = Arc::clone(app);
    let scale = Arc::clone(scale);
    tokio::spawn(async move {
        if let Err(e) = scale.read_battery().await {
            lock(&app).message = Some(e.to_string());
        }
    });
}

// ── Rendering ─────────────────────────────────────────────────────────────────

/// Return the current braille spinner frame based on wall-clock milliseconds.
fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

fn draw(frame: &mut Frame, app: &App, scan: ScanState, window: Duration, status: &ConnectionStatus) {
    let [header, body, footer] = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(3),
    ])
    .areas(frame.area());

    draw_header(frame, header, app, scan, window);
    match &app.screen {
        Screen::DeviceList => draw_device_list(frame, body, app, scan),
        Screen::Connecting(name) => {
            let text = Line::from(vec![
                Span::styled(spinner_str(), Style::default().fg(Color::Yellow)),
                Span::raw(format!(" Connecting to {name}…")),
            ]);
            frame.render_widget(
                Paragraph::new(text).block(Block::default().borders(Borders::ALL)),
                body,
            );
        }
        Screen::Connected => draw_scale(frame, body, status),
        Screen::Error(message) => {
            let lines = vec![
                Line::from(Span::styled(
                    format!("⚠  {message}"),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                )),
                Line::from(""),
                Line::from(Span::styled(
                    "Go back and try selecting another device.",
                    Style::default().fg(Color::DarkGray),
                )),
            ];
            frame.render_widget(
                Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Error ")),
                body,
            );
        }
    }
    draw_footer(frame, footer, app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App, scan: ScanState, window: Duration) {
    let (scan_text, scan_color) = match scan {
        ScanState::Scanning => (format!("{} Scanning", spinner_str()), Color::Yellow),
        ScanState::Starting => (format!("{} Waiting for adapter", spinner_str()), Color::Yellow),
        ScanState::Stopped => ("Scan stopped".to_owned(), Color::DarkGray),
    };
    let mut spans = vec![
        Span::styled(TITLE, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw("   "),
        Span::styled(scan_text, Style::default().fg(scan_color)),
        Span::styled(
            format!("   window {:.1} s", window.as_secs_f64()),
            Style::default().fg(Color::DarkGray),
        ),
    ];
    if app.simulated {
        spans.push(Span::styled("   [SIMULATED]", Style::default().fg(Color::Magenta)));
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn device_row(d: &TrackedDevice, selected: bool) -> ListItem<'static> {
    let marker = if selected { "▶ " } else { "  " };
    let name_style = if selected {
        Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::White)
    };
    let adv = &d.advertisement;
    let address = adv.usable_address().unwrap_or("(no address)").to_owned();
    let rssi = adv.rssi.map(|r| format!("{r:4} dBm")).unwrap_or_else(|| "   - dBm".into());
    let mfg = manufacturer_name(adv);
    let seen = tokio::time::Instant::now().saturating_duration_since(d.last_seen);

    ListItem::new(Line::from(vec![
        Span::styled(format!("{marker}{:<28}", d.name()), name_style),
        Span::styled(format!("{address:<20}"), Style::default().fg(Color::DarkGray)),
        Span::styled(format!("{rssi}  "), Style::default().fg(Color::Blue)),
        Span::styled(format!("{mfg:<24}  "), Style::default().fg(Color::DarkGray)),
        Span::styled(
            format!("seen {:.1} s ago", seen.as_secs_f64()),
            Style::default().fg(Color::DarkGray),
        ),
    ]))
}

fn draw_device_list(frame: &mut Frame, area: Rect, app: &App, scan: ScanState) {
    if app.devices.is_empty() {
        let lines = vec![
            Line::from(Span::styled(
                if scan == ScanState::Stopped {
                    "Not scanning.".to_owned()
                } else {
                    format!("{} Scanning for devices…", spinner_str())
                },
                Style::default().fg(Color::Yellow),
            )),
            Line::from(Span::styled("Found 0 devices", Style::default().fg(Color::DarkGray))),
        ];
        frame.render_widget(
            Paragraph::new(lines).block(Block::default().borders(Borders::ALL)),
            area,
        );
        return;
    }

    let items: Vec<ListItem> = app
        .devices
        .iter()
        .enumerate()
        .map(|(i, d)| device_row(d, i == app.cursor))
        .collect();
    let title = format!(" Available Devices ({}) ", app.devices.len());
    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(Span::styled(title, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))),
    );
    let mut state = ListState::default();
    state.select(Some(app.cursor));
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_scale(frame: &mut Frame, area: Rect, status: &ConnectionStatus) {
    let label = Style::default().fg(Color::White);
    let dim = Style::default().fg(Color::DarkGray);

    let state_color = match status.state {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Connecting => Color::Yellow,
        _ => Color::Red,
    };
    let field = |name: &'static str, value: String| {
        Line::from(vec![Span::styled(name, label), Span::styled(value, dim)])
    };

    let mut lines = Vec::new();
    match &status.device {
        Some(d) => {
            let adv = &d.advertisement;
            lines.push(Line::from(vec![
                Span::styled("Name:         ", label),
                Span::styled(d.name().to_owned(), Style::default().fg(Color::Green)),
            ]));
            lines.push(field("Platform ID:  ", adv.peripheral_id.clone()));
            lines.push(field(
                "Address:      ",
                adv.usable_address().unwrap_or("(no address)").to_owned(),
            ));
            lines.push(field("Manufacturer: ", manufacturer_name(adv)));
            lines.push(field(
                "TX power:     ",
                adv.tx_power.map_or_else(|| "-".to_owned(), |p| format!("{p}dBm")),
            ));
            let services = if adv.services.is_empty() {
                "-".to_owned()
            } else {
                adv.services.join(", ")
            };
            lines.push(field("Services:     ", services));
        }
        None => lines.push(field("Name:         ", "?".to_owned())),
    }
    lines.push(Line::from(vec![
        Span::styled("Status:       ", label),
        Span::styled(status.state.label(), Style::default().fg(state_color)),
    ]));
    lines.push(Line::from(""));

    match (&status.weight, status.has_weight) {
        (Some(w), _) => {
            let age = (now_ms() - w.timestamp).max(0.0) / 1000.0;
            lines.push(Line::from(vec![
                Span::styled("Weight:       ", label),
                Span::styled(
                    format!("{:.3} kg ({:.1} g)", w.kg, w.grams),
                    Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
                ),
                Span::styled(format!("   updated {age:.1} s ago"), dim),
            ]));
        }
        (None, true) => lines.push(Line::from(vec![
            Span::styled("Weight:       ", label),
            Span::styled("waiting for data…", dim),
        ])),
        (None, false) => lines.push(Line::from(vec![
            Span::styled("Weight:       ", label),
            Span::styled("not available on this device", dim),
        ])),
    }

    match (&status.battery, status.has_battery) {
        (Some(b), _) => {
            let color = if b.level > LOW_BATTERY { Color::Green } else { Color::Yellow };
            lines.push(Line::from(vec![
                Span::styled("Battery:      ", label),
                Span::styled(
                    format!("{}%", b.level),
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                ),
            ]));
        }
        (None, true) => lines.push(Line::from(vec![
            Span::styled("Battery:      ", label),
            Span::styled("press B to read", dim),
        ])),
        (None, false) => lines.push(Line::from(vec![
            Span::styled("Battery:      ", label),
            Span::styled("not available on this device", dim),
        ])),
    }

    if !status.characteristics.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Characteristics",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )));
        lines.extend(status.characteristics.iter().map(characteristic_row));
    }

    frame.render_widget(
        Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Scale Information "),
        ),
        area,
    );
}

fn characteristic_row(c: &GattCharacteristic) -> Line<'static> {
    let name = characteristic_name(&c.uuid).unwrap_or("");
    Line::from(vec![
        Span::styled(
            format!("  {:<6} {:<38}", display_uuid(&c.service), display_uuid(&c.uuid)),
            Style::default().fg(Color::White),
        ),
        Span::styled(format!("{name:<20}"), Style::default().fg(Color::Green)),
        Span::styled(c.properties.to_string(), Style::default().fg(Color::DarkGray)),
    ])
}

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let help = match app.screen {
        Screen::DeviceList => "↑↓ Select • Enter Connect • Q Exit",
        Screen::Connecting(_) => "Q Cancel",
        Screen::Connected => "B Battery • Q Back • Ctrl-C Exit",
        Screen::Error(_) => "Q Back • Try selecting another device",
    };
    let mut spans = vec![Span::styled(help, Style::default().fg(Color::DarkGray))];
    if let Some(message) = &app.message {
        spans.push(Span::raw("   "));
        spans.push(Span::styled(message.clone(), Style::default().fg(Color::Yellow)));
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

// ── Main loop ─────────────────────────────────────────────────────────────────

fn ui_loop<A: Adapter, B: Backend>(
    terminal: &mut Terminal<B>,
    app: &Arc<Mutex<App>>,
    discovery: &Arc<DiscoverySession<A>>,
    scale: &Arc<ConnectionSession<A>>,
    intents: &mpsc::UnboundedSender<Intent>,
) -> Result<()> {
    let window = discovery.config().presence_window;
    let back = || {
        lock(app).reset_to_list();
        let _ = intents.send(Intent::Back);
    };
    loop {
        // ── 1. Render ────────────────────────────────────────────────────────
        let scan = discovery.state();
        let status = scale.status();
        {
            let s = lock(app);
            terminal.draw(|f| draw(f, &s, scan, window, &status))?;
        }

        // ── 2. Handle keyboard ───────────────────────────────────────────────
        if !event::poll(TICK)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        // In raw mode Ctrl+C is not SIGINT; it arrives as a key event.
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Ok(());
        }

        let screen = lock(app).screen.clone();
        match screen {
            Screen::DeviceList => match key.code {
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(()),
                KeyCode::Up => lock(app).move_cursor(true),
                KeyCode::Down => lock(app).move_cursor(false),
                KeyCode::Enter => {
                    let picked = {
                        let mut s = lock(app);
                        let picked = s.devices.get(s.cursor).cloned();
                        if let Some(d) = &picked {
                            s.screen = Screen::Connecting(d.name().to_owned());
                            s.message = None;
                        }
                        picked
                    };
                    if let Some(device) = picked {
                        info!("TUI: connecting to {} [{}]", device.name(), device.identity);
                        let _ = intents.send(Intent::Connect(device));
                    }
                }
                _ => {}
            },
            Screen::Connected => match key.code {
                KeyCode::Char('b') | KeyCode::Char('B') => read_battery(app, scale),
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => back(),
                _ => {}
            },
            Screen::Connecting(_) | Screen::Error(_) => {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc) {
                    back();
                }
            }
        }
    }
}

async fn run_tui<A: Adapter>(adapter: Arc<A>, cli: &Cli) -> Result<()> {
    let discovery = Arc::new(DiscoverySession::new(
        Arc::clone(&adapter),
        DiscoveryConfig {
            presence_window: cli.presence_window(),
            ..Default::default()
        },
    ));
    let scale = Arc::new(ConnectionSession::new(adapter, ConnectionConfig::default()));
    let app = Arc::new(Mutex::new(App::new(cli.simulate)));

    let (intents, intent_rx) = mpsc::unbounded_channel();
    let tasks = [
        spawn_discovery_task(discovery.subscribe(), Arc::clone(&app)),
        spawn_scale_task(scale.subscribe(), Arc::clone(&app)),
        tokio::spawn(run_intents(
            intent_rx,
            Arc::clone(&app),
            Arc::clone(&discovery),
            Arc::clone(&scale),
        )),
    ];

    // Scan start waits for the adapter; run it off the render loop.
    {
        let discovery = Arc::clone(&discovery);
        tokio::spawn(async move {
            if let Err(e) = discovery.start().await {
                warn!("TUI: discovery failed to start: {e}");
            }
        });
    }

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = ui_loop(&mut terminal, &app, &discovery, &scale, &intents);

    // ── Teardown ──────────────────────────────────────────────────────────────
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    for task in tasks {
        task.abort();
    }
    scale.disconnect().await;
    discovery.stop().await;
    info!("TUI: exiting");
    result
}

// ── Entry point ───────────────────────────────────────────────────────────────

async fn run(cli: Cli) -> Result<()> {
    // Logs never go to the terminal; see scale_rs::logging.
    let log = LogSettings::from_env(&cli);
    logging::init(&log).context("could not create log file")?;

    if cli.simulate {
        let adapter = SimAdapter::new();
        let demo = sim::spawn_demo(&adapter);
        let result = run_tui(Arc::new(adapter), &cli).await;
        demo.abort();
        result
    } else {
        let adapter = BtleplugAdapter::new()
            .await
            .context("Bluetooth is not available")?;
        run_tui(Arc::new(adapter), &cli).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    use std::io::IsTerminal as _;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if !io::stdout().is_terminal() {
        eprintln!("Error: the scale-rs tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
