//! Terminal output
//!
//! [`ConsoleUi`] is the operator-facing progress sink handed to the
//! adapter. The `print_*` helpers serve the non-provisioning commands.

use std::io::{self, BufRead, Write};

use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};

use sp_core::Ui;

/// Prefix of headline lines
const SAY_PREFIX: &str = "==> ";

/// Ui writing to the process's stdout and stderr
#[derive(Debug, Clone, Default)]
pub struct ConsoleUi {
    /// Print machine-readable events as CSV lines
    machine_readable: bool,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine_readable(mut self, enabled: bool) -> Self {
        self.machine_readable = enabled;
        self
    }
}

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(
            stdout,
            SetAttribute(Attribute::Bold),
            Print(SAY_PREFIX),
            Print(message),
            SetAttribute(Attribute::Reset),
            Print("\n")
        );
    }

    fn message(&self, message: &str) {
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "    {}", message);
    }

    fn error(&self, message: &str) {
        let mut stderr = io::stderr();
        let _ = crossterm::execute!(
            stderr,
            SetForegroundColor(Color::Red),
            Print(SAY_PREFIX),
            Print(message),
            ResetColor,
            Print("\n")
        );
    }

    fn ask(&self, query: &str) -> io::Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "{} ", query)?;
        stdout.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end().to_string())
    }

    fn machine(&self, kind: &str, args: &[&str]) {
        if !self.machine_readable {
            return;
        }
        let escaped: Vec<String> = args.iter().map(|arg| arg.replace(',', "\\,")).collect();
        println!("{},{}", kind, escaped.join(","));
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    let mut stdout = io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
pub fn print_error(msg: &str) {
    let mut stderr = io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow on stderr
pub fn print_warning(msg: &str) {
    let mut stderr = io::stderr();
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
    let mut stdout = io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
