// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Application state and orchestration.
//!
//! `Reader` owns:
//! - the chapter stream controller (buffers + loads)
//! - the virtualized scroll window (rendered sections + sizes)
//! - the receiving side of the prefetcher
//! - the scroll-stop latch
//!
//! Everything here runs on the UI thread. Loads finish on the tokio runtime and only surface
//! through `tick()`.

use std::time::{Duration, Instant};

use log::debug;

use crate::config::Config;
use crate::controller::{ChapterStreamController, ControllerEvent};
use crate::model::{Chapter, ChapterPosition};
use crate::prefetch::{ImagePrefetcher, PrefetchResults};
use crate::window::{Edge, SizeUpdate, VirtualizedScrollWindow};

pub struct Reader {
    pub controller: ChapterStreamController,
    pub window: VirtualizedScrollWindow,
    pub should_quit: bool,
    prefetched: Option<PrefetchResults>,
    scroll_stop_delay: Duration,
    stop_due: Option<Instant>,
}

impl Reader {
    /// `viewport` is the page area in cells (status row excluded).
    pub fn new(
        config: &Config,
        mut controller: ChapterStreamController,
        prefetched: Option<PrefetchResults>,
        viewport: (u16, u16),
    ) -> Self {
        let (width, height) = viewport;
        controller.set_preferred_group(config.preferred_group.clone());
        let window = VirtualizedScrollWindow::new(
            config.window_layout(f64::from(width.max(1))),
            f64::from(height.max(1)),
        );
        Self {
            controller,
            window,
            should_quit: false,
            prefetched,
            scroll_stop_delay: Duration::from_millis(config.scroll_stop_ms),
            stop_due: None,
        }
    }

    /// Install the chapter list and start reading at `start`.
    pub fn open(&mut self, chapters: Vec<Chapter>, start: usize) {
        self.window.reset();
        self.stop_due = None;
        self.controller.set_chapters(chapters, start);
    }

    /// Apply finished loads, prefetched sizes and a due scroll stop.
    /// Returns `true` when something on screen may have changed.
    pub fn tick(&mut self) -> bool {
        let mut changed = false;

        for event in self.controller.poll() {
            let arrived = matches!(event, ControllerEvent::BufferSet(_));
            if let Some(update) = self.window.apply_event(event, &self.controller) {
                debug!("layout update: offset {:.1}", update.scroll_offset);
                changed = true;
            }
            // New content while idle counts as a stop so the window can extend.
            if arrived {
                self.stop_due.get_or_insert_with(Instant::now);
                changed = true;
            }
        }

        if let Some(results) = &self.prefetched {
            while let Some(result) = results.try_recv() {
                if let Some(SizeUpdate::Relayout { .. }) =
                    self.window.record_size_for_url(&result.url, result.size)
                {
                    changed = true;
                }
            }
        }

        if self.stop_due.is_some_and(|due| Instant::now() >= due) {
            self.stop_due = None;
            if self.window.on_scroll_stop(&mut self.controller).is_some() {
                changed = true;
            }
        }

        changed
    }

    /// Measure visible pages that have no size yet. Returns `true` if any relayout happened.
    pub fn measure_visible(&mut self) -> bool {
        let pending: Vec<(usize, usize, String)> = self
            .window
            .visible_items()
            .into_iter()
            .filter(|v| !v.measured)
            .filter_map(|v| v.page.url().map(|url| (v.section, v.item, url.to_string())))
            .collect();

        let mut changed = false;
        for (section, item, url) in pending {
            let Some(size) = ImagePrefetcher::measure(&url) else {
                continue;
            };
            if let SizeUpdate::Relayout { .. } = self.window.record_image_size(section, item, size) {
                changed = true;
            }
        }
        changed
    }

    fn latch_scroll(&mut self) {
        self.stop_due = Some(Instant::now() + self.scroll_stop_delay);
    }

    pub fn scroll_by(&mut self, rows: f64) {
        self.window.scroll_by(rows, &mut self.controller);
        self.latch_scroll();
    }

    pub fn page_down(&mut self) {
        self.scroll_by(self.window.viewport_height());
    }

    pub fn page_up(&mut self) {
        self.scroll_by(-self.window.viewport_height());
    }

    pub fn go_top(&mut self) {
        self.window.scroll_to(0.0, &mut self.controller);
        self.latch_scroll();
    }

    pub fn go_bottom(&mut self) {
        self.window.scroll_to(f64::MAX, &mut self.controller);
        self.latch_scroll();
    }

    /// Jump `delta` chapters away from the selected one. Out-of-range jumps are ignored.
    pub fn jump_chapter(&mut self, delta: isize) {
        let Some(target) = self
            .controller
            .selected_index()
            .and_then(|i| i.checked_add_signed(delta))
            .filter(|i| *i < self.controller.chapters().len())
        else {
            return;
        };
        self.window.reset();
        self.stop_due = None;
        self.controller.select_chapter(target);
    }

    pub fn resize(&mut self, width: u16, height: u16) {
        self.window
            .set_viewport(f64::from(width.max(1)), f64::from(height.max(1)));
    }

    pub fn status_text(&self) -> String {
        let Some(chapter) = self.controller.selected_chapter() else {
            return "no chapters".to_string();
        };
        let pages = self
            .controller
            .curr_chapter()
            .iter()
            .filter(|p| !p.is_chapter_end())
            .count();
        let page = if pages == 0 {
            "-".to_string()
        } else {
            (self.controller.index() + 1).min(pages).to_string()
        };

        let mut status = format!(
            "[ch {}] {}/{} p {}/{} sections:{}",
            chapter.number,
            chapter.index + 1,
            self.controller.chapters().len(),
            page,
            pages,
            self.window.sections().len(),
        );

        if self.controller.has_pending_load(ChapterPosition::Curr) {
            status.push_str(" loading");
        }
        if self.window.is_loading(Edge::Head) {
            status.push_str(" ↑");
        }
        if self.window.is_loading(Edge::Tail) {
            status.push_str(" ↓");
        }
        status
    }
}
