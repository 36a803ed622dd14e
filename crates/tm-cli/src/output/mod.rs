//! Output formatting utilities for the CLI
//!
//! Session summaries are rendered as tables; status lines are colored and
//! prefixed the same way across every command.

use tabled::{settings::Style, Table, Tabled};
use tm_mux::{Limit, Muxer};

/// Snapshot of one session's counters
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub library: String,
    pub remote: String,
    pub streams: (u64, u64),
    pub traffic: (u64, u64),
    pub limit: Limit,
}

impl SessionSummary {
    /// Capture the current counters of `mux`
    pub fn capture(id: impl Into<String>, mux: &dyn Muxer) -> Self {
        Self {
            id: id.into(),
            library: mux.library().to_string(),
            remote: mux
                .remote_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "-".to_string()),
            streams: mux.num_streams(),
            traffic: mux.traffic(),
            limit: mux.limit(),
        }
    }
}

/// Format session summaries as an ASCII table
pub fn format_sessions(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "No active sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "BACKEND")]
        library: String,
        #[tabled(rename = "REMOTE")]
        remote: String,
        #[tabled(rename = "STREAMS (TOTAL/ACTIVE)")]
        streams: String,
        #[tabled(rename = "RX")]
        rx: String,
        #[tabled(rename = "TX")]
        tx: String,
        #[tabled(rename = "LIMIT")]
        limit: String,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            id: s.id.clone(),
            library: s.library.clone(),
            remote: s.remote.clone(),
            streams: format!("{}/{}", s.streams.0, s.streams.1),
            rx: format_bytes(s.traffic.0),
            tx: format_bytes(s.traffic.1),
            limit: match s.limit {
                Limit::Infinite => "unlimited".to_string(),
                Limit::Bps(rate) => format!("{}/s", format_bytes(rate as u64)),
            },
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix, to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow, to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
