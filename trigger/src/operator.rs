//! Terminal preview window.
//!
//! Thumbnails are drawn with half-block characters: each cell shows two
//! vertical pixels, the upper one as foreground and the lower one as
//! background colour.

use std::io::{self, Stdout, Write};

use anyhow::{Context, Result};
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use crossterm::{execute, queue};
use tracing::warn;

use snapcam_common::pipeline::Frame;

use crate::controller::{Decision, Operator};

const HELP: &str = "y = save   q = quit   any other key = discard";

/// Map a key press onto a decision.  Case-insensitive.
pub fn classify_key(c: char) -> Decision {
    match c.to_ascii_lowercase() {
        'y' => Decision::Confirm,
        'q' => Decision::Quit,
        _ => Decision::Discard,
    }
}

/// Largest (columns, rows) that fits a `width`×`height` image into a
/// `cols`×`rows` cell area, keeping the aspect ratio.  Rows count cells,
/// each two pixels tall.
pub fn fit_dimensions(width: u32, height: u32, cols: u16, rows: u16) -> (u16, u16) {
    if width == 0 || height == 0 || cols == 0 || rows == 0 {
        return (0, 0);
    }
    let aspect = width as f64 / height as f64;
    let term_w = cols as f64;
    let term_h = rows as f64 * 2.0;

    let (w, h) = if term_w / term_h > aspect {
        (term_h * aspect, term_h)
    } else {
        (term_w, term_w / aspect)
    };
    ((w as u16).clamp(1, cols), ((h / 2.0) as u16).clamp(1, rows))
}

/// Full-screen terminal operator.  Restores the terminal on drop.
pub struct TerminalOperator {
    out: Stdout,
    status: String,
}

impl TerminalOperator {
    pub fn open() -> Result<Self> {
        let mut out = io::stdout();
        enable_raw_mode().context("Cannot switch terminal to raw mode")?;
        execute!(out, EnterAlternateScreen, Hide)?;
        Ok(Self {
            out,
            status: String::new(),
        })
    }

    fn draw(&mut self, id: &str, frame: &Frame) -> Result<()> {
        let (cols, rows) = terminal::size()?;
        // Two lines at the bottom: status and help.
        let area_rows = rows.saturating_sub(2);
        let (w, h) = fit_dimensions(frame.width(), frame.height(), cols, area_rows);

        queue!(self.out, ResetColor, Clear(ClearType::All))?;
        if w > 0 && h > 0 {
            let x0 = (cols - w) / 2;
            let y0 = (area_rows - h) / 2;
            let x_scale = frame.width() as f64 / w as f64;
            let y_scale = frame.height() as f64 / (h as f64 * 2.0);

            for ty in 0..h {
                queue!(self.out, MoveTo(x0, y0 + ty))?;
                for tx in 0..w {
                    let sx = (tx as f64 * x_scale) as u32;
                    let top = sample(frame, sx, (ty as f64 * 2.0 * y_scale) as u32);
                    let bottom = sample(frame, sx, ((ty as f64 * 2.0 + 1.0) * y_scale) as u32);
                    queue!(
                        self.out,
                        SetForegroundColor(top),
                        SetBackgroundColor(bottom),
                        Print('▀')
                    )?;
                }
            }
        }

        let line = format!("{id}  {}", self.status);
        queue!(
            self.out,
            ResetColor,
            MoveTo(0, rows.saturating_sub(2)),
            Print(truncate(&line, cols)),
            MoveTo(0, rows.saturating_sub(1)),
            Print(truncate(HELP, cols))
        )?;
        self.out.flush()?;
        Ok(())
    }

    fn read_decision(&mut self) -> Result<Decision> {
        loop {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            return Ok(match key.code {
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    Decision::Quit
                }
                KeyCode::Char(c) => classify_key(c),
                _ => Decision::Discard,
            });
        }
    }
}

impl Operator for TerminalOperator {
    fn decide(&mut self, id: &str, thumbnail: &Frame) -> Result<Decision> {
        self.draw(id, thumbnail)?;
        let decision = self.read_decision()?;
        self.status.clear();
        Ok(decision)
    }

    fn status(&mut self, message: &str) {
        self.status = message.to_string();
        let Ok((cols, rows)) = terminal::size() else {
            return;
        };
        let res = queue!(
            self.out,
            ResetColor,
            MoveTo(0, rows.saturating_sub(2)),
            Clear(ClearType::CurrentLine),
            Print(truncate(message, cols))
        )
        .and_then(|_| self.out.flush());
        if let Err(e) = res {
            warn!("Cannot update status line: {e}");
        }
    }
}

impl Drop for TerminalOperator {
    fn drop(&mut self) {
        let _ = execute!(self.out, ResetColor, Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

fn sample(frame: &Frame, x: u32, y: u32) -> Color {
    let x = x.min(frame.width().saturating_sub(1));
    let y = y.min(frame.height().saturating_sub(1));
    let [r, g, b] = frame.get_pixel(x, y).0;
    Color::Rgb { r, g, b }
}

fn truncate(s: &str, cols: u16) -> String {
    s.chars().take(cols as usize).collect()
}
