// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Drawing.
//!
//! The window already knows which pages intersect the viewport and where; this module only clips
//! them to the page area and paints one bordered box per page plus the status row.

use std::path::Path;

use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph};

use crate::app::Reader;
use crate::model::PageContent;
use crate::window::VisibleItem;

/// Rows of `area` covered by an item, with flags for edges cut off by the viewport.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Clipped {
    rect: Rect,
    top_cut: bool,
    bottom_cut: bool,
}

fn clip(area: Rect, top: f64, height: f64) -> Option<Clipped> {
    let start = top.round() as i64;
    let end = (top + height).round() as i64;
    let y0 = start.max(0);
    let y1 = end.min(i64::from(area.height));
    if y1 <= y0 {
        return None;
    }
    Some(Clipped {
        rect: Rect::new(area.x, area.y + y0 as u16, area.width, (y1 - y0) as u16),
        top_cut: start < 0,
        bottom_cut: end > i64::from(area.height),
    })
}

pub fn draw(frame: &mut Frame, reader: &Reader) {
    let [pages_area, status_area] =
        Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(frame.area());

    for item in reader.window.visible_items() {
        let Some(clipped) = clip(pages_area, item.top, item.height) else {
            continue;
        };
        match &item.page.content {
            PageContent::ChapterEnd => draw_end_marker(frame, reader, &item, clipped.rect),
            PageContent::Image(url) => draw_page(frame, &item, url, clipped),
        }
    }

    let status = Paragraph::new(reader.status_text())
        .style(Style::default().add_modifier(Modifier::REVERSED));
    frame.render_widget(status, status_area);
}

fn draw_page(frame: &mut Frame, item: &VisibleItem<'_>, url: &str, clipped: Clipped) {
    let mut borders = Borders::LEFT | Borders::RIGHT;
    if !clipped.top_cut {
        borders |= Borders::TOP;
    }
    if !clipped.bottom_cut {
        borders |= Borders::BOTTOM;
    }
    let name = Path::new(url)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(url);

    let mut block = Block::default().borders(borders);
    if !clipped.top_cut {
        block = block.title(format!(" {name} "));
    }
    let detail = if item.measured {
        format!("{} rows", item.height.round())
    } else {
        "measuring...".to_string()
    };
    let body = Paragraph::new(detail)
        .alignment(Alignment::Center)
        .block(block);
    frame.render_widget(body, clipped.rect);
}

fn draw_end_marker(frame: &mut Frame, reader: &Reader, item: &VisibleItem<'_>, rect: Rect) {
    let chapters = reader.controller.chapters();
    let number = |index: usize| {
        chapters
            .get(index)
            .map(|c| c.number.clone())
            .unwrap_or_else(|| "?".to_string())
    };
    let text = format!(
        "End of chapter {}  /  next: chapter {}",
        number(item.chapter_index),
        number(item.chapter_index + 1)
    );
    let marker = Paragraph::new(Line::from(text))
        .alignment(Alignment::Center)
        .style(Style::default().add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::TOP | Borders::BOTTOM));
    frame.render_widget(marker, rect);
}
