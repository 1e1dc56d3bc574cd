use nu_ansi_term::{Color, Style};
use std::fmt::Display;
use std::io::IsTerminal;

/// Text-mode report printer; colors only when stdout is a terminal.
pub struct Ui {
    palette: Palette,
    paint: bool,
}

impl Ui {
    pub fn new(plain: bool) -> Self {
        let paint = !plain && std::io::stdout().is_terminal();

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        let palette = if paint {
            Palette::dark()
        } else {
            Palette::plain()
        };
        Self { palette, paint }
    }

    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(&str, String)> = rows
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        let key_width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            if self.paint {
                println!(
                    "  {} {}",
                    self.palette.key.paint(format!("{key:>key_width$}:")),
                    self.palette.value.paint(value)
                );
            } else {
                println!("  {key:>key_width$}: {value}");
            }
        }
    }

    pub fn list<I>(&self, title: &str, entries: I)
    where
        I: IntoIterator<Item = String>,
    {
        let entries: Vec<String> = entries.into_iter().collect();
        self.heading(title);
        if entries.is_empty() {
            println!("  (none)");
        }
        for entry in entries {
            println!("  {entry}");
        }
    }

    pub fn success(&self, message: &str) {
        println!("{} {message}", self.palette.success.paint(SUCCESS_ICON));
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", self.palette.warn.paint(WARNING_ICON));
    }

    fn heading(&self, title: &str) {
        println!("{}", self.palette.heading.paint(format!("{HEADING_ICON} {title}")));
    }
}

struct Palette {
    heading: Style,
    key: Style,
    value: Style,
    success: Style,
    warn: Style,
}

impl Palette {
    fn dark() -> Self {
        Self {
            heading: Style::new().fg(Color::Purple).bold(),
            key: Style::new().fg(Color::LightBlue).bold(),
            value: Style::new().fg(Color::White),
            success: Style::new().fg(Color::LightGreen).bold(),
            warn: Style::new().fg(Color::Yellow).bold(),
        }
    }

    fn plain() -> Self {
        Self {
            heading: Style::new(),
            key: Style::new(),
            value: Style::new(),
            success: Style::new(),
            warn: Style::new(),
        }
    }
}

const HEADING_ICON: &str = "▸";
const SUCCESS_ICON: &str = "✔";
const WARNING_ICON: &str = "⚠";
