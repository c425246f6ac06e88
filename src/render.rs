//! Terminal display for the meter and stats panel
//!
//! The meter has one cell per level step. A level of `n` lights cells
//! `0..n`; the peak-hold is drawn as a single marker cell.
//!
//! The display runs on the alternate screen and every frame repaints every
//! row, so stray stderr output is gone by the next frame.

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::{execute, queue};
use std::io::{self, Write};

use crate::models::{ChannelLevel, LevelState};
use crate::stats::StatsPanel;

/// Cells in one meter row; a full-scale reading lights all of them
pub const METER_CELLS: usize = 41;

const GREEN_BELOW: usize = 30;
const YELLOW_BELOW: usize = 36;
const RED_BELOW: usize = 39;

/// Scale labels, drawn every fourth cell
const SCALE_START_DB: i32 = -40;
const SCALE_STEP_DB: i32 = 4;

const LIT: char = '█';
const UNLIT: char = '·';
const PEAK: char = '▌';

pub trait Renderer {
    fn draw_levels(&mut self, levels: &LevelState);
    fn draw_stats(&mut self, panel: &StatsPanel);
    /// Push everything drawn so far to the output
    fn present(&mut self) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterCell {
    Off,
    Lit(Color),
    Peak(Color),
}

pub fn cell_color(index: usize) -> Color {
    match index {
        i if i < GREEN_BELOW => Color::Green,
        i if i < YELLOW_BELOW => Color::Yellow,
        i if i < RED_BELOW => Color::Red,
        _ => Color::White,
    }
}

pub fn meter_cells(level: &ChannelLevel) -> Vec<MeterCell> {
    let lit = level.instant.clamp(0, METER_CELLS as i32) as usize;
    let peak = level.peak.floor() as usize;

    (0..METER_CELLS)
        .map(|i| {
            if i < lit {
                MeterCell::Lit(cell_color(i))
            } else if peak > 0 && i == peak.min(METER_CELLS - 1) {
                MeterCell::Peak(cell_color(i))
            } else {
                MeterCell::Off
            }
        })
        .collect()
}

/// The `-40 ... 0` scale line under the meters
pub fn scale_line() -> String {
    let mut line = String::new();
    let mut db = SCALE_START_DB;
    while db <= 0 {
        line.push_str(&format!("{:<4}", db));
        db += SCALE_STEP_DB;
    }
    line.trim_end().to_string()
}

/// Full-screen renderer writing ANSI sequences to `W`
pub struct TerminalRenderer<W: Write> {
    out: W,
    station: String,
    levels: LevelState,
    panel: Option<StatsPanel>,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(mut out: W, station: impl Into<String>) -> io::Result<Self> {
        execute!(out, EnterAlternateScreen, Hide, Clear(ClearType::All))?;
        Ok(Self {
            out,
            station: station.into(),
            levels: LevelState::default(),
            panel: None,
        })
    }

    fn meter_row(&mut self, label: &str, level: &ChannelLevel) -> io::Result<()> {
        queue!(self.out, ResetColor, Print(format!("{} ", label)))?;
        for cell in meter_cells(level) {
            match cell {
                MeterCell::Off => queue!(self.out, ResetColor, Print(UNLIT))?,
                MeterCell::Lit(color) => queue!(self.out, SetForegroundColor(color), Print(LIT))?,
                MeterCell::Peak(color) => queue!(self.out, SetForegroundColor(color), Print(PEAK))?,
            }
        }
        queue!(
            self.out,
            ResetColor,
            Print(format!(" {:>4}", level.instant)),
            Clear(ClearType::UntilNewLine),
            Print("\r\n")
        )
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        queue!(
            self.out,
            ResetColor,
            Print(text),
            Clear(ClearType::UntilNewLine),
            Print("\r\n")
        )
    }

    #[cfg(test)]
    fn output(&self) -> &W {
        &self.out
    }
}

impl<W: Write> Renderer for TerminalRenderer<W> {
    fn draw_levels(&mut self, levels: &LevelState) {
        self.levels = *levels;
    }

    fn draw_stats(&mut self, panel: &StatsPanel) {
        self.panel = Some(panel.clone());
    }

    fn present(&mut self) -> io::Result<()> {
        let levels = self.levels;
        queue!(self.out, MoveTo(0, 0))?;

        let station = self.station.clone();
        self.line(&station)?;
        self.line("")?;
        self.meter_row("L", &levels.left)?;
        self.line(&format!("  {}", scale_line()))?;
        self.meter_row("R", &levels.right)?;
        self.line("")?;

        if let Some(panel) = self.panel.clone() {
            let marker = if panel.stale { " (stale)" } else { "" };
            self.line(&format!("{}{}", panel.title, marker))?;
            self.line(&format!("Server Start:  {}", panel.server_start))?;
            self.line(&format!("Stream Service Start:  {}", panel.stream_start))?;
            self.line(&format!(
                "Current Listeners:  {}    Peak Listeners:  {}",
                panel.current_listeners, panel.peak_listeners
            ))?;
            self.line(&format!("Slow Listeners:  {}", panel.slow_listeners))?;
        }

        queue!(self.out, Clear(ClearType::FromCursorDown))?;
        self.out.flush()
    }
}

impl<W: Write> Drop for TerminalRenderer<W> {
    fn drop(&mut self) {
        let _ = execute!(self.out, ResetColor, Show, LeaveAlternateScreen);
    }
}

/// Keeps the terminal in raw mode so single key presses reach the quit watcher
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            log::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}
