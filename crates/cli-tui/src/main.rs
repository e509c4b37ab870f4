use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use pipeline::{scratch::format_age, FileLedger, PipelineConfig, WorkItem, WorkStatus};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::System;
use humansize::{format_size, DECIMAL};
use walkdir::WalkDir;

struct App {
    items: Vec<WorkItem>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    ledger: Option<FileLedger>,
    ledger_dir: PathBuf,
    scratch_dir: PathBuf,
    scratch_files: usize,
    scratch_bytes: u64,
}

impl App {
    fn new(ledger_dir: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            items: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            ledger: FileLedger::open(&ledger_dir).ok(),
            ledger_dir,
            scratch_dir,
            scratch_files: 0,
            scratch_bytes: 0,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_all();

        // An unreadable ledger shows as an empty table
        self.items = self
            .ledger
            .as_ref()
            .and_then(|ledger| ledger.load_all().ok())
            .unwrap_or_default();
        self.items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let (files, bytes) = scratch_usage(&self.scratch_dir);
        self.scratch_files = files;
        self.scratch_bytes = bytes;
    }

    fn count_by_status(&self, status: WorkStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    fn in_flight(&self) -> usize {
        self.items.iter().filter(|i| i.status.is_in_flight()).count()
    }
}

/// Number and total size of the files under the scratch directory
fn scratch_usage(dir: &Path) -> (usize, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .fold((0, 0), |(files, bytes), m| (files + 1, bytes + m.len()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Same default location the daemon packaging installs to
    let default_config_path = PathBuf::from("/etc/svpd/config.toml");
    let config_path = match args.config.as_deref() {
        Some(path) => Some(path),
        None if default_config_path.exists() => Some(default_config_path.as_path()),
        None => None,
    };

    let cfg = PipelineConfig::load_config(config_path)
        .context("Failed to load configuration")?;

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg.ledger_dir.clone(), cfg.scratch_dir.clone());

    loop {
        app.refresh();
        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(250))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => app.refresh(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// Social video processor TUI monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // CPU / memory / scratch
            Constraint::Min(3),    // item table
            Constraint::Length(3), // status counts
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_item_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let scratch = Paragraph::new(format!(
        "{} file(s), {}",
        app.scratch_files,
        format_size(app.scratch_bytes, DECIMAL)
    ))
    .block(Block::default().borders(Borders::ALL).title("Scratch"))
    .style(Style::default().fg(if app.scratch_files > 0 { Color::Magenta } else { Color::Reset }));
    f.render_widget(scratch, chunks[2]);
}

fn status_label(status: WorkStatus) -> (&'static str, Color) {
    match status {
        WorkStatus::Pending => ("PEND", Color::Reset),
        WorkStatus::Downloading => ("DL", Color::Yellow),
        WorkStatus::Transcribing => ("TRANS", Color::Yellow),
        WorkStatus::Processing => ("PROC", Color::Yellow),
        WorkStatus::Saving => ("SAVE", Color::Yellow),
        WorkStatus::Completed => ("OK", Color::Green),
        WorkStatus::Failed => ("FAIL", Color::Red),
    }
}

fn render_item_table(f: &mut Frame, app: &mut App, area: Rect) {
    // Top border, header and bottom border take three lines
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "TAG", "URL", "AGE", "RQ", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = Utc::now();
    let rows: Vec<Row> = if app.items.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No items".to_string(),
            format!("Dir: {}", app.ledger_dir.display()),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.items
            .iter()
            .take(max_data_rows)
            .map(|item| {
                let (label, color) = status_label(item.status);
                let age = format_age((now - item.updated_at).to_std().unwrap_or_default());
                Row::new(vec![
                    label.to_string(),
                    truncate_string(&item.tag, 14),
                    truncate_string(&item.source_url, 60),
                    age,
                    item.retry_count.to_string(),
                    truncate_string(item.error_message.as_deref().unwrap_or("-"), 50),
                ])
                .style(Style::default().fg(color))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(14),
        Constraint::Percentage(40),
        Constraint::Length(12),
        Constraint::Length(3),
        Constraint::Percentage(30),
    ];

    let shown = if app.items.is_empty() { 0 } else { rows.len() };
    let title = format!("Items ({}/{})", shown, app.items.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let dir_display = app.ledger_dir.display().to_string();
    let status_text = format!(
        "Total: {} | In flight: {} | Pending: {} | Completed: {} | Failed: {} | Dir: {} | q=quit r=refresh",
        app.items.len(),
        app.in_flight(),
        app.count_by_status(WorkStatus::Pending),
        app.count_by_status(WorkStatus::Completed),
        app.count_by_status(WorkStatus::Failed),
        truncate_string(&dir_display, 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Shorten `s` to at most `max_len` characters, marking the cut with "..."
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("cooking", 14), "cooking");
        assert_eq!(
            truncate_string("https://tiktok.com/@someone/video/123", 20),
            "https://tiktok.co..."
        );
    }

    #[test]
    fn test_scratch_usage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video-a.mp4"), vec![0u8; 1500]).unwrap();
        std::fs::write(dir.path().join("audio-a.wav"), vec![0u8; 500]).unwrap();
        assert_eq!(scratch_usage(dir.path()), (2, 2000));
        assert_eq!(scratch_usage(&dir.path().join("missing")), (0, 0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_truncate_never_exceeds_limit(s in "\\PC{0,80}", max_len in 3usize..60) {
            let out = truncate_string(&s, max_len);
            prop_assert!(out.chars().count() <= max_len);
            if s.chars().count() <= max_len {
                prop_assert_eq!(out, s);
            }
        }
    }
}
