use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};

use crate::acquire::RetryPrompt;
use crate::app::{PackageSummary, ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::domain::OutputMode;
use crate::error::ScenarioLinkError;
use crate::selection::{SelectionEvent, SelectionModel, ToggleOutcome};

type Backend = CrosstermBackend<Stdout>;

const EVENTS_MAX: usize = 6;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Fetch,
    Verify,
    Assemble,
    Store,
    Generate,
}

impl Phase {
    const ALL: [Phase; 6] = [
        Phase::Resolve,
        Phase::Fetch,
        Phase::Verify,
        Phase::Assemble,
        Phase::Store,
        Phase::Generate,
    ];

    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Fetch => "Fetch",
            Phase::Verify => "Verify",
            Phase::Assemble => "Assemble",
            Phase::Store => "Store",
            Phase::Generate => "Generate",
        }
    }
}

struct PendingRetry {
    error: String,
    attempt: u32,
    reply: Sender<bool>,
}

struct AppState {
    status: String,
    phase: Phase,
    transfer_percent: Option<u8>,
    retries: u32,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    started: Instant,
    pending_retry: Option<PendingRetry>,
}

/// Interactive front end. Long work runs on a worker thread while this
/// thread keeps drawing progress and answers retry prompts.
pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<AppState>>,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                state.phase = phase;
                state.status = payload.to_string();
                state.transfer_percent = None;
            } else if let Some(percent) = parse_percent(&message) {
                state.transfer_percent = Some(percent);
            } else if message.starts_with("retry") {
                state.retries = state.retries.saturating_add(1);
            }
            if let Some(elapsed) = event.elapsed {
                push_log(
                    &mut state.logs,
                    format!("[{}] {message} ({} ms)", timestamp(), elapsed.as_millis()),
                );
            } else {
                push_log(&mut state.logs, format!("[{}] {message}", timestamp()));
            }
            push_event(&mut state.events, message);
        }
    }
}

/// Parks the worker until the foreground answers the y/n prompt.
struct TuiRetryPrompt {
    state: Arc<Mutex<AppState>>,
}

impl RetryPrompt for TuiRetryPrompt {
    fn retry(&self, error: &ScenarioLinkError, attempt: u32) -> bool {
        let (reply, answer) = mpsc::channel();
        match self.state.lock() {
            Ok(mut state) => {
                state.pending_retry = Some(PendingRetry {
                    error: error.to_string(),
                    attempt,
                    reply,
                });
            }
            Err(_) => return false,
        }
        answer.recv().unwrap_or(false)
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(AppState {
                status: "ready".to_string(),
                phase: Phase::Resolve,
                transfer_percent: None,
                retries: 0,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                started: Instant::now(),
                pending_retry: None,
            })),
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink, &dyn RetryPrompt) -> Result<R, ScenarioLinkError>
            + Send
            + 'static,
        R: Send + 'static,
    {
        if let Ok(mut state) = self.state.lock() {
            state.started = Instant::now();
        }
        let mut terminal = enter_terminal()?;

        let (tx, rx) = mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let prompt = TuiRetryPrompt {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink, &prompt)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_progress(frame, self.kind, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                leave_terminal()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_running_key(key.code);
                    }
                }
            }
            tick = tick.wrapping_add(1);
        }
    }

    /// Lets the user toggle scenarios and pick the output mode. Returns
    /// `None` when cancelled.
    pub fn select_scenarios(
        &mut self,
        package: &PackageSummary,
        model: &mut SelectionModel,
    ) -> miette::Result<Option<OutputMode>> {
        let available = Arc::new(AtomicBool::new(model.superstructure_available()));
        let flag = available.clone();
        model.subscribe(move |event| {
            if let SelectionEvent::SuperstructureAvailability(value) = event {
                flag.store(*value, Ordering::Relaxed);
            }
        });

        let mut terminal = enter_terminal()?;
        let mut cursor = ListState::default().with_selected(Some(0));
        let mut mode = OutputMode::Databases;
        let mut notice = String::new();

        let chosen = loop {
            if !available.load(Ordering::Relaxed) {
                mode = OutputMode::Databases;
            }
            terminal
                .draw(|frame| {
                    draw_checklist(frame, package, model, mode, &notice, &mut cursor)
                })
                .into_diagnostic()?;

            if !event::poll(Duration::from_millis(120)).into_diagnostic()? {
                continue;
            }
            let Event::Key(key) = event::read().into_diagnostic()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let selected = cursor.selected().unwrap_or(0);
            match key.code {
                KeyCode::Up | KeyCode::Char('k') => cursor.select_previous(),
                KeyCode::Down | KeyCode::Char('j') => {
                    if selected + 1 < model.len() {
                        cursor.select_next();
                    }
                }
                KeyCode::Char(' ') => {
                    notice = match model.toggle(selected) {
                        Ok(ToggleOutcome::Rejected) => {
                            "at least one scenario must stay included".to_string()
                        }
                        Ok(_) => String::new(),
                        Err(err) => err.to_string(),
                    };
                }
                KeyCode::Char('s') => {
                    if available.load(Ordering::Relaxed) {
                        mode = match mode {
                            OutputMode::Databases => OutputMode::Superstructure,
                            OutputMode::Superstructure => OutputMode::Databases,
                        };
                        notice.clear();
                    } else {
                        notice = "superstructure needs more than one scenario".to_string();
                    }
                }
                KeyCode::Enter if !model.is_empty_selection() => break Some(mode),
                KeyCode::Char('q') | KeyCode::Esc => break None,
                _ => {}
            }
        };

        leave_terminal()?;
        Ok(chosen)
    }

    pub fn confirm(&mut self, question: &str) -> miette::Result<bool> {
        let mut terminal = enter_terminal()?;
        let confirmed = loop {
            terminal
                .draw(|frame| {
                    let area = frame.area();
                    draw_question(frame, area, "Confirm", &[question.to_string()]);
                })
                .into_diagnostic()?;

            if event::poll(Duration::from_millis(100)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    match key.code {
                        KeyCode::Char('y') | KeyCode::Char('Y') => break true,
                        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => break false,
                        _ => {}
                    }
                }
            }
        };
        leave_terminal()?;
        Ok(confirmed)
    }

    /// The worker is never abandoned: leaving early would strand its staging
    /// directory. Declining a retry prompt is the way to stop.
    fn handle_running_key(&self, code: KeyCode) {
        if self.answer_retry(code) {
            return;
        }
        if !matches!(code, KeyCode::Char('q') | KeyCode::Esc) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            push_log(
                &mut state.logs,
                format!(
                    "[{}] still running; answer n at a retry prompt to stop",
                    timestamp()
                ),
            );
        }
    }

    fn answer_retry(&self, code: KeyCode) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.pending_retry.is_none() {
            return false;
        }
        let answer = match code {
            KeyCode::Char('y') | KeyCode::Char('Y') => true,
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => false,
            _ => return true,
        };
        if let Some(pending) = state.pending_retry.take() {
            let _ = pending.reply.send(answer);
        }
        true
    }
}

fn enter_terminal() -> miette::Result<Terminal<Backend>> {
    let mut stdout = io::stdout();
    enable_raw_mode().into_diagnostic()?;
    stdout.execute(EnterAlternateScreen).into_diagnostic()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout)).into_diagnostic()?;
    terminal.clear().into_diagnostic()?;
    Ok(terminal)
}

fn leave_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(LeaveAlternateScreen)
        .into_diagnostic()?;
    Ok(())
}

fn draw_progress(frame: &mut ratatui::Frame, kind: ProgressSinkKind, state: &AppState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(8),
            Constraint::Min(3),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(kind, tick), chunks[0]);
    frame.render_widget(draw_status(state), chunks[1]);
    frame.render_widget(draw_logs(state, chunks[2]), chunks[2]);

    if let Some(pending) = &state.pending_retry {
        let area = centered(frame.area(), 70, 7);
        draw_question(
            frame,
            area,
            "Download failed",
            &[
                pending.error.clone(),
                format!("Attempt {} failed. Retry? (y/n)", pending.attempt),
            ],
        );
    }
}

fn draw_header(kind: ProgressSinkKind, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match kind {
        ProgressSinkKind::Catalog => "Catalog",
        ProgressSinkKind::Fetch => "Fetch",
        ProgressSinkKind::Generate => "Generate",
        ProgressSinkKind::Cache => "Cache",
    };
    Paragraph::new(Line::from(vec![
        Span::styled(
            "SCENARIOLINK",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]))
    .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status(state: &AppState) -> Paragraph<'static> {
    let phases: Vec<Span> = Phase::ALL
        .iter()
        .flat_map(|phase| {
            let style = if *phase == state.phase {
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            [Span::styled(phase.label(), style), Span::raw("  ")]
        })
        .collect();
    let transfer = state
        .transfer_percent
        .map(|percent| format!("{} {percent:>3}%", progress_bar(percent)))
        .unwrap_or_else(|| "--".to_string());

    let mut lines = vec![
        Line::from(phases),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(vec![
            Span::styled("Transfer: ", Style::default().fg(Color::Gray)),
            Span::raw(transfer),
            Span::styled("   Retries: ", Style::default().fg(Color::Gray)),
            Span::raw(state.retries.to_string()),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", state.started.elapsed().as_secs())),
        ]),
    ];
    for event in state.events.iter().rev().take(3) {
        lines.push(Line::from(format!("- {event}")));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::BOTTOM))
        .wrap(Wrap { trim: true })
}

fn draw_logs(state: &AppState, area: Rect) -> Paragraph<'static> {
    let visible = area.height.saturating_sub(2) as usize;
    let skip = state.logs.len().saturating_sub(visible);
    let lines: Vec<Line> = state
        .logs
        .iter()
        .skip(skip)
        .map(|line| Line::from(line.clone()))
        .collect();
    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Log"))
}

fn draw_checklist(
    frame: &mut ratatui::Frame,
    package: &PackageSummary,
    model: &SelectionModel,
    mode: OutputMode,
    notice: &str,
    cursor: &mut ListState,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(frame.area());

    let title = package.name.clone().unwrap_or_else(|| package.path.clone());
    let header = Paragraph::new(vec![
        Line::from(Span::styled(
            title,
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(format!("dependencies: {}", package.dependencies.join(", "))),
    ])
    .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, chunks[0]);

    let items: Vec<ListItem> = package
        .scenarios
        .iter()
        .map(|row| {
            let mark = if model.is_included(row.index) { "[x]" } else { "[ ]" };
            let description = row.description.as_deref().unwrap_or_default();
            ListItem::new(Line::from(vec![
                Span::raw(format!("{mark} {:<32} ", row.name)),
                Span::styled(description.to_string(), Style::default().fg(Color::Gray)),
            ]))
        })
        .collect();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(
            "Scenarios ({}/{} included)",
            model.included_count(),
            model.len()
        )))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, chunks[1], cursor);

    let mode_style = if model.superstructure_available() {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let footer = Paragraph::new(vec![
        Line::from(vec![
            Span::raw("Output: "),
            Span::styled(mode.to_string(), mode_style),
            Span::styled(format!("   {notice}"), Style::default().fg(Color::Yellow)),
        ]),
        Line::from("space toggle  s superstructure  enter generate  q cancel"),
    ]);
    frame.render_widget(footer, chunks[2]);
}

fn draw_question(frame: &mut ratatui::Frame, area: Rect, title: &str, lines: &[String]) {
    let text: Vec<Line> = lines.iter().map(|line| Line::from(line.clone())).collect();
    let block = Block::default().borders(Borders::ALL).title(title.to_string());
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(text)
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true })
            .block(block),
        area,
    );
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn progress_bar(percent: u8) -> String {
    let total = 10;
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (label, payload) = rest.split_once(';')?;
    let phase = Phase::ALL
        .into_iter()
        .find(|phase| phase.label() == label.trim())?;
    Some((phase, payload.trim()))
}

fn parse_percent(message: &str) -> Option<u8> {
    let rest = message.strip_prefix("download ")?;
    let start = rest.rfind('(')?;
    let value = rest[start + 1..].strip_suffix("%)")?;
    value.parse::<u8>().ok().map(|percent| percent.min(100))
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}

fn push_log(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > LOGS_MAX {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phase_prefix() {
        assert_eq!(
            parse_phase("phase=Verify; checking a.zip (md5)"),
            Some((Phase::Verify, "checking a.zip (md5)"))
        );
        assert_eq!(parse_phase("phase=Unknown; x"), None);
        assert_eq!(parse_phase("download a.zip 1/2 bytes (50%)"), None);
    }

    #[test]
    fn parses_transfer_percent() {
        assert_eq!(parse_percent("download a.zip 512/1024 bytes (50%)"), Some(50));
        assert_eq!(parse_percent("download a.zip 512 bytes"), None);
    }

    #[test]
    fn quit_key_does_not_abandon_running_work() {
        let tui = Tui::new(ProgressSinkKind::Fetch);
        tui.handle_running_key(KeyCode::Char('q'));
        tui.handle_running_key(KeyCode::Esc);

        let state = tui.state.lock().unwrap();
        assert_eq!(state.logs.len(), 2);
        assert!(state.logs[0].contains("still running"));
        assert!(state.pending_retry.is_none());
    }

    #[test]
    fn log_timestamp_is_wall_clock_time() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 8);
        assert!(chrono::NaiveTime::parse_from_str(&stamp, "%H:%M:%S").is_ok());
    }

    #[test]
    fn retry_prompt_waits_for_answer() {
        let tui = Tui::new(ProgressSinkKind::Fetch);
        let prompt = TuiRetryPrompt {
            state: tui.state.clone(),
        };
        let worker = thread::spawn(move || {
            prompt.retry(&ScenarioLinkError::Network("timeout".to_string()), 1)
        });
        loop {
            if tui.state.lock().unwrap().pending_retry.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(tui.answer_retry(KeyCode::Char('y')));
        assert!(worker.join().unwrap());
    }
}
