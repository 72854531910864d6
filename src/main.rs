// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Application entry point and event loop.
//!
//! This module:
//! - parses CLI args (library directory + optional start chapter)
//! - sets up file logging and the tokio runtime that runs page-list loads
//! - runs the main input loop (vim-like scrolling + counts)
//! - redraws only when the reader reports a change

mod app;
mod config;
mod controller;
mod fetch;
mod model;
mod prefetch;
mod ui;
mod window;

use std::io::{Stdout, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{LevelFilter, info};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::crossterm::event::{self, Event, KeyCode, KeyEventKind};

use crate::app::Reader;
use crate::config::Config;
use crate::controller::ChapterStreamController;
use crate::fetch::{DirectoryFetcher, PageFetcher, discover_chapters};
use crate::prefetch::ImagePrefetcher;

#[derive(Parser, Debug)]
#[command(name = "cflow", about = "Continuous chapter reader in Terminal")]
struct Cli {
    /// Library directory; each sub-directory is a chapter
    library: PathBuf,

    /// Chapter to start at (1-based position in the library)
    #[arg(short, long)]
    chapter: Option<usize>,
}

impl Cli {
    fn start_index(&self) -> usize {
        self.chapter.unwrap_or(1).saturating_sub(1)
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let Some(path) = config.log_destination() else {
        return Ok(());
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let level = if config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load();
    init_logging(&config)?;

    let chapters = discover_chapters(&cli.library)?;
    info!(
        "library {:?}: {} chapters, starting at {}",
        cli.library,
        chapters.len(),
        cli.start_index() + 1
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()?;

    let (prefetcher, prefetched) = ImagePrefetcher::spawn(config.prefetch_threads);
    let fetcher: Arc<dyn PageFetcher> = Arc::new(DirectoryFetcher);
    let controller =
        ChapterStreamController::new(fetcher, Box::new(prefetcher), runtime.handle().clone());

    init_terminal()?;
    let result = Terminal::new(CrosstermBackend::new(stdout()))
        .map_err(anyhow::Error::from)
        .and_then(|mut terminal| {
            let size = terminal.size()?;
            let mut reader = Reader::new(
                &config,
                controller,
                Some(prefetched),
                (size.width, size.height.saturating_sub(1)),
            );
            reader.open(chapters, cli.start_index());
            run(&mut terminal, &mut reader)
        });
    restore_terminal();

    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

fn run(terminal: &mut Terminal<CrosstermBackend<Stdout>>, reader: &mut Reader) -> Result<()> {
    let mut count: u32 = 0;
    let mut dirty = true;

    loop {
        // Apply finished loads, prefetched sizes and a due scroll stop.
        dirty |= reader.tick();

        // Process all pending events first (drain the queue)
        while event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if let KeyCode::Char(c) = key.code
                        && c.is_ascii_digit()
                    {
                        // Vim-like count prefix: `1..9` start, `0` continues (not a command on its own).
                        if c != '0' || count != 0 {
                            count = count
                                .saturating_mul(10)
                                .saturating_add((c as u8 - b'0') as u32);
                            continue;
                        }
                    }

                    let n = f64::from(count.max(1));
                    match key.code {
                        KeyCode::Char('q') => reader.should_quit = true,
                        KeyCode::Char('j') | KeyCode::Down => reader.scroll_by(n),
                        KeyCode::Char('k') | KeyCode::Up => reader.scroll_by(-n),
                        KeyCode::Char(' ') | KeyCode::PageDown => {
                            for _ in 0..count.max(1) {
                                reader.page_down();
                            }
                        }
                        KeyCode::Backspace | KeyCode::PageUp => {
                            for _ in 0..count.max(1) {
                                reader.page_up();
                            }
                        }
                        KeyCode::Char('g') => reader.go_top(),
                        KeyCode::Char('G') => reader.go_bottom(),
                        KeyCode::Char('n') => reader.jump_chapter(count.max(1) as isize),
                        KeyCode::Char('p') => reader.jump_chapter(-(count.max(1) as isize)),
                        _ => {}
                    }
                    count = 0;
                    dirty = true;
                }
                Event::Resize(w, h) => {
                    reader.resize(w, h.saturating_sub(1));
                    dirty = true;
                }
                _ => {}
            }
        }

        if reader.should_quit {
            break;
        }

        // First render of a page is where its real size becomes known.
        dirty |= reader.measure_visible();

        if dirty {
            terminal.draw(|frame| ui::draw(frame, reader))?;
            dirty = false;
        }

        // Wait for next event or load result.
        let _ = event::poll(Duration::from_millis(16));
    }

    Ok(())
}

fn init_terminal() -> std::io::Result<()> {
    use ratatui::crossterm::{
        cursor::{Hide, MoveTo},
        execute,
        terminal::{Clear, ClearType, EnterAlternateScreen, enable_raw_mode},
    };

    enable_raw_mode()?;
    execute!(stdout(), EnterAlternateScreen)?;
    execute!(stdout(), Clear(ClearType::All), MoveTo(0, 0), Hide)?;
    Ok(())
}

fn restore_terminal() {
    use ratatui::crossterm::{
        cursor::Show,
        execute,
        terminal::{LeaveAlternateScreen, disable_raw_mode},
    };

    let _ = disable_raw_mode();
    let _ = execute!(stdout(), LeaveAlternateScreen);
    let _ = execute!(stdout(), Show);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_library_path() {
        let cli = Cli::try_parse_from(["cflow", "/home/user/manga"]).unwrap();
        assert_eq!(cli.library, PathBuf::from("/home/user/manga"));
        assert_eq!(cli.chapter, None);
        assert_eq!(cli.start_index(), 0);
    }

    #[test]
    fn test_cli_parses_start_chapter() {
        let cli = Cli::try_parse_from(["cflow", "lib", "--chapter", "5"]).unwrap();
        assert_eq!(cli.chapter, Some(5));
        assert_eq!(cli.start_index(), 4);

        let cli = Cli::try_parse_from(["cflow", "lib", "-c", "0"]).unwrap();
        assert_eq!(cli.start_index(), 0);
    }

    #[test]
    fn test_cli_requires_library_argument() {
        let result = Cli::try_parse_from(["cflow"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_rejects_non_numeric_chapter() {
        let result = Cli::try_parse_from(["cflow", "lib", "--chapter", "two"]);
        assert!(result.is_err());
    }
}
