// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Virtualized scroll window.
//!
//! The window renders at most `MAX_SECTIONS` chapter sections and slides over the chapter list as
//! the reader scrolls:
//! - the section under the viewport midpoint decides the current chapter (shifts the controller)
//! - scroll-stop at the head/tail prepends/appends the neighbor chapter, loading it first if needed
//! - every insert/evict keeps the visible content where it was on screen
//!
//! Heights are in layout rows. Until a page's image size is known a placeholder aspect ratio is used.

use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use crate::controller::{ChapterStreamController, ControllerEvent};
use crate::model::{ChapterPosition, Page};

pub const MAX_SECTIONS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }

    /// Height over width.
    pub fn ratio(&self) -> f64 {
        f64::from(self.height) / f64::from(self.width)
    }
}

/// Measured sizes keyed by (section slot, item index).
#[derive(Debug, Default)]
pub struct ImageSizeCache {
    sizes: HashMap<(usize, usize), ImageSize>,
}

impl ImageSizeCache {
    pub fn get(&self, section: usize, item: usize) -> Option<ImageSize> {
        self.sizes.get(&(section, item)).copied()
    }

    /// Returns `false` on a cache hit (the entry is left untouched).
    pub fn insert(&mut self, section: usize, item: usize, size: ImageSize) -> bool {
        if self.sizes.contains_key(&(section, item)) {
            return false;
        }
        self.sizes.insert((section, item), size);
        true
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn clear(&mut self) {
        self.sizes.clear();
    }

    /// A section was pushed at the front: every slot moves down by one.
    fn shift_for_prepend(&mut self) {
        self.sizes = self
            .sizes
            .drain()
            .map(|((section, item), size)| ((section + 1, item), size))
            .collect();
    }

    /// Drop `slot` and close the gap it leaves.
    fn remove_section(&mut self, slot: usize) {
        self.sizes = self
            .sizes
            .drain()
            .filter_map(|((section, item), size)| match section.cmp(&slot) {
                std::cmp::Ordering::Less => Some(((section, item), size)),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(((section - 1, item), size)),
            })
            .collect();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowLayout {
    /// Content width in columns.
    pub width: f64,
    /// Terminal cell height/width.
    pub cell_aspect_ratio: f64,
    /// Height/width assumed for pages not measured yet.
    pub placeholder_aspect_ratio: f64,
    /// Rows taken by the end-of-chapter marker.
    pub end_marker_height: f64,
}

impl Default for WindowLayout {
    fn default() -> Self {
        Self {
            width: 80.0,
            cell_aspect_ratio: 2.0,
            placeholder_aspect_ratio: 1.5,
            end_marker_height: 3.0,
        }
    }
}

impl WindowLayout {
    fn image_height(&self, ratio: f64) -> f64 {
        (self.width * ratio / self.cell_aspect_ratio).max(1.0)
    }
}

/// One chapter's pages as rendered by the window.
#[derive(Clone, Debug)]
pub struct Section {
    pub chapter_index: usize,
    pub pages: Vec<Page>,
}

impl Section {
    pub fn new(chapter_index: usize, pages: Vec<Page>) -> Self {
        Self {
            chapter_index,
            pages,
        }
    }

    fn same_content(&self, pages: &[Page]) -> bool {
        self.pages.len() == pages.len()
            && self
                .pages
                .iter()
                .zip(pages)
                .all(|(a, b)| a.content == b.content)
    }
}

/// Result of one layout transaction. Offset corrections are never animated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayoutUpdate {
    pub scroll_offset: f64,
    pub animated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Head,
    Tail,
}

impl Edge {
    fn position(self) -> ChapterPosition {
        match self {
            Edge::Head => ChapterPosition::Prev,
            Edge::Tail => ChapterPosition::Next,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUpdate {
    /// Already cached (or not in the window): nothing to relayout.
    Hit,
    Relayout { section: usize, item: usize },
}

#[derive(Clone, Debug)]
pub struct VisibleItem<'a> {
    pub section: usize,
    pub item: usize,
    pub chapter_index: usize,
    pub page: &'a Page,
    /// Top edge relative to the viewport (negative when partly scrolled off).
    pub top: f64,
    pub height: f64,
    pub measured: bool,
}

/// Page under the viewport top and how far into it the viewport starts.
struct Anchor {
    page_id: u64,
    section: usize,
    delta: f64,
}

pub struct VirtualizedScrollWindow {
    sections: VecDeque<Section>,
    current: usize,
    sizes: ImageSizeCache,
    layout: WindowLayout,
    scroll_offset: f64,
    viewport_height: f64,
    loading_head: bool,
    loading_tail: bool,
    /// Edge the reader last scrolled toward.
    heading: Option<Edge>,
}

impl VirtualizedScrollWindow {
    pub fn new(layout: WindowLayout, viewport_height: f64) -> Self {
        Self {
            sections: VecDeque::with_capacity(MAX_SECTIONS + 1),
            current: 0,
            sizes: ImageSizeCache::default(),
            layout,
            scroll_offset: 0.0,
            viewport_height,
            loading_head: false,
            loading_tail: false,
            heading: None,
        }
    }

    pub fn sections(&self) -> &VecDeque<Section> {
        &self.sections
    }

    pub fn current_section(&self) -> usize {
        self.current
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    pub fn viewport_height(&self) -> f64 {
        self.viewport_height
    }

    pub fn image_sizes(&self) -> &ImageSizeCache {
        &self.sizes
    }

    pub fn is_loading(&self, edge: Edge) -> bool {
        match edge {
            Edge::Head => self.loading_head,
            Edge::Tail => self.loading_tail,
        }
    }

    /// Drop every section, e.g. before jumping to another chapter.
    pub fn reset(&mut self) {
        self.sections.clear();
        self.sizes.clear();
        self.current = 0;
        self.scroll_offset = 0.0;
        self.loading_head = false;
        self.loading_tail = false;
        self.heading = None;
    }

    fn set_loading(&mut self, edge: Edge, loading: bool) {
        match edge {
            Edge::Head => self.loading_head = loading,
            Edge::Tail => self.loading_tail = loading,
        }
    }

    /// Resize the viewport, keeping the top visible page in place.
    pub fn set_viewport(&mut self, width: f64, height: f64) {
        if width == self.layout.width && height == self.viewport_height {
            return;
        }
        let anchor = self.capture_anchor();
        self.layout.width = width.max(1.0);
        self.viewport_height = height.max(1.0);
        self.restore_anchor(anchor);
    }

    pub fn item_height(&self, section: usize, item: usize) -> f64 {
        let Some(page) = self.sections.get(section).and_then(|s| s.pages.get(item)) else {
            return 0.0;
        };
        if page.is_chapter_end() {
            return self.layout.end_marker_height;
        }
        match self.sizes.get(section, item) {
            Some(size) => self.layout.image_height(size.ratio()),
            None => self.layout.image_height(self.layout.placeholder_aspect_ratio),
        }
    }

    pub fn section_height(&self, section: usize) -> f64 {
        let Some(s) = self.sections.get(section) else {
            return 0.0;
        };
        (0..s.pages.len())
            .map(|item| self.item_height(section, item))
            .sum()
    }

    pub fn content_height(&self) -> f64 {
        (0..self.sections.len())
            .map(|section| self.section_height(section))
            .sum()
    }

    fn section_top(&self, section: usize) -> f64 {
        (0..section).map(|s| self.section_height(s)).sum()
    }

    fn item_top(&self, section: usize, item: usize) -> f64 {
        self.section_top(section) + (0..item).map(|i| self.item_height(section, i)).sum::<f64>()
    }

    fn max_offset(&self) -> f64 {
        (self.content_height() - self.viewport_height).max(0.0)
    }

    /// Section containing content position `y` (the last one when `y` is past the end).
    fn section_at(&self, y: f64) -> Option<usize> {
        let mut top = 0.0;
        for section in 0..self.sections.len() {
            let height = self.section_height(section);
            if y < top + height {
                return Some(section);
            }
            top += height;
        }
        self.sections.len().checked_sub(1)
    }

    fn item_at(&self, section: usize, y: f64) -> Option<usize> {
        let pages = self.sections.get(section)?.pages.len();
        let mut top = self.section_top(section);
        for item in 0..pages {
            let height = self.item_height(section, item);
            if y < top + height {
                return Some(item);
            }
            top += height;
        }
        pages.checked_sub(1)
    }

    fn slot_of(&self, chapter_index: usize) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.chapter_index == chapter_index)
    }

    fn capture_anchor(&self) -> Option<Anchor> {
        let section = self.section_at(self.scroll_offset)?;
        let item = self.item_at(section, self.scroll_offset)?;
        let page = &self.sections[section].pages[item];
        Some(Anchor {
            page_id: page.id,
            section,
            delta: self.scroll_offset - self.item_top(section, item),
        })
    }

    fn restore_anchor(&mut self, anchor: Option<Anchor>) {
        let Some(anchor) = anchor else {
            return;
        };
        let found = self.sections.iter().enumerate().find_map(|(s, section)| {
            section
                .pages
                .iter()
                .position(|p| p.id == anchor.page_id)
                .map(|i| (s, i))
        });
        self.scroll_offset = match found {
            Some((section, item)) => {
                self.item_top(section, item) + anchor.delta.min(self.item_height(section, item))
            }
            None => self.section_top(anchor.section.min(self.sections.len().saturating_sub(1))),
        };
        self.scroll_offset = self.scroll_offset.clamp(0.0, self.max_offset());
    }

    /// Pages intersecting the viewport, top to bottom.
    pub fn visible_items(&self) -> Vec<VisibleItem<'_>> {
        let view_top = self.scroll_offset;
        let view_bottom = view_top + self.viewport_height;
        let mut items = Vec::new();
        let mut y = 0.0;
        for (s, section) in self.sections.iter().enumerate() {
            for (i, page) in section.pages.iter().enumerate() {
                let height = self.item_height(s, i);
                if y + height > view_top && y < view_bottom {
                    items.push(VisibleItem {
                        section: s,
                        item: i,
                        chapter_index: section.chapter_index,
                        page,
                        top: y - view_top,
                        height,
                        measured: page.is_chapter_end() || self.sizes.get(s, i).is_some(),
                    });
                }
                y += height;
                if y >= view_bottom {
                    return items;
                }
            }
        }
        items
    }

    /// Move the viewport and follow chapter boundary crossings.
    /// Returns `true` when the current chapter changed.
    pub fn scroll_to(&mut self, offset: f64, ctrl: &mut ChapterStreamController) -> bool {
        if offset < self.scroll_offset || offset <= 0.0 {
            self.heading = Some(Edge::Head);
        } else if offset > self.scroll_offset || offset >= self.max_offset() {
            self.heading = Some(Edge::Tail);
        }
        self.scroll_offset = offset.clamp(0.0, self.max_offset());
        let crossed = self.sync_current(ctrl);
        self.sync_page_index(ctrl);
        crossed
    }

    pub fn scroll_by(&mut self, delta: f64, ctrl: &mut ChapterStreamController) -> bool {
        self.scroll_to(self.scroll_offset + delta, ctrl)
    }

    fn sync_current(&mut self, ctrl: &mut ChapterStreamController) -> bool {
        let midpoint = self.scroll_offset + self.viewport_height / 2.0;
        let Some(mid) = self.section_at(midpoint) else {
            return false;
        };
        if mid == self.current {
            return false;
        }
        let target = self.sections[mid].chapter_index;
        self.follow(target, ctrl);
        info!(
            "crossed into section {mid} (chapter index {target}) from section {}",
            self.current
        );
        self.current = mid;
        true
    }

    /// Shift the controller until `target` is selected. A shift drops the load queued on the side
    /// it moves away from, so that edge's guard goes with it.
    fn follow(&mut self, target: usize, ctrl: &mut ChapterStreamController) {
        while let Some(selected) = ctrl.selected_index() {
            if selected > target {
                ctrl.shift_left();
                self.loading_tail = false;
            } else if selected < target {
                ctrl.shift_right();
                self.loading_head = false;
            } else {
                break;
            }
            if ctrl.selected_index() == Some(selected) {
                break;
            }
        }
    }

    fn sync_page_index(&self, ctrl: &mut ChapterStreamController) {
        let midpoint = self.scroll_offset + self.viewport_height / 2.0;
        if self.section_at(midpoint) != Some(self.current) {
            return;
        }
        if let Some(item) = self.item_at(self.current, midpoint) {
            ctrl.set_index(item);
        }
    }

    fn head_visible(&self) -> bool {
        !self.sections.is_empty() && self.scroll_offset < self.section_height(0)
    }

    fn tail_visible(&self) -> bool {
        let Some(last) = self.sections.len().checked_sub(1) else {
            return false;
        };
        self.scroll_offset + self.viewport_height > self.section_top(last)
    }

    /// Extend the window at whichever edge the reader has reached, the edge scrolled toward first.
    pub fn on_scroll_stop(&mut self, ctrl: &mut ChapterStreamController) -> Option<LayoutUpdate> {
        ctrl.selected_index()?;
        let order = match self.heading {
            Some(Edge::Tail) => [Edge::Tail, Edge::Head],
            _ => [Edge::Head, Edge::Tail],
        };
        let mut update = None;
        for edge in order {
            if let Some(extended) = self.extend_edge(edge, ctrl) {
                update = Some(extended);
            }
        }
        update
    }

    fn extend_edge(&mut self, edge: Edge, ctrl: &mut ChapterStreamController) -> Option<LayoutUpdate> {
        let visible = match edge {
            Edge::Head => self.head_visible(),
            Edge::Tail => self.tail_visible(),
        };
        if !visible {
            return None;
        }
        let slot = match edge {
            Edge::Head => 0,
            Edge::Tail => self.sections.len() - 1,
        };
        let edge_chapter = self.sections[slot].chapter_index;
        let neighbor = match edge {
            Edge::Head => edge_chapter.checked_sub(1)?,
            Edge::Tail => edge_chapter + 1,
        };
        if neighbor >= ctrl.chapters().len() {
            return None;
        }
        // At capacity an insert evicts the far edge; only do that when heading this way.
        if self.sections.len() >= MAX_SECTIONS && self.heading != Some(edge) {
            return None;
        }

        if ctrl.selected_index() != Some(edge_chapter) {
            let opposite = match edge {
                Edge::Head => Edge::Tail,
                Edge::Tail => Edge::Head,
            };
            if self.is_loading(opposite) {
                return None;
            }
            debug!("{edge:?} reached; selecting edge chapter index {edge_chapter}");
            self.follow(edge_chapter, ctrl);
            self.current = slot;
        }

        let position = edge.position();
        if !ctrl.buffer(position).is_empty() {
            let section = Section::new(neighbor, ctrl.buffer(position).to_vec());
            return Some(match edge {
                Edge::Head => self.prepend_section(section),
                Edge::Tail => self.append_section(section),
            });
        }
        if self.is_loading(edge) {
            return None;
        }
        self.set_loading(edge, true);
        if ctrl.has_pending_load(position) {
            debug!("{edge:?} reached; waiting for chapter index {neighbor}");
        } else {
            debug!("{edge:?} reached; loading chapter index {neighbor}");
            ctrl.fetch_task(edge == Edge::Tail, None);
        }
        None
    }

    /// Follow a controller event. Insertions requested by an edge load happen here.
    pub fn apply_event(
        &mut self,
        event: ControllerEvent,
        ctrl: &ChapterStreamController,
    ) -> Option<LayoutUpdate> {
        match event {
            ControllerEvent::BufferSet(position) => {
                let chapter_index = ctrl.position_index(position)?;
                let pages = ctrl.buffer(position);
                if let Some(slot) = self.slot_of(chapter_index) {
                    if self.sections[slot].same_content(pages) {
                        return None;
                    }
                    return Some(self.replace_section(slot, pages.to_vec()));
                }
                if self.sections.is_empty() && position == ChapterPosition::Curr {
                    info!("window opened at chapter index {chapter_index}");
                    self.sections
                        .push_back(Section::new(chapter_index, pages.to_vec()));
                    self.current = 0;
                    self.scroll_offset = 0.0;
                    return Some(LayoutUpdate {
                        scroll_offset: 0.0,
                        animated: false,
                    });
                }
                let selected = ctrl.selected_index()?;
                let update = match position {
                    ChapterPosition::Prev
                        if self.loading_head
                            && self.sections.front().is_some_and(|s| s.chapter_index == selected) =>
                    {
                        Some(self.prepend_section(Section::new(chapter_index, pages.to_vec())))
                    }
                    ChapterPosition::Next
                        if self.loading_tail
                            && self.sections.back().is_some_and(|s| s.chapter_index == selected) =>
                    {
                        Some(self.append_section(Section::new(chapter_index, pages.to_vec())))
                    }
                    _ => None,
                };
                self.settle_edge(position);
                update
            }
            ControllerEvent::LoadFailed(position) => {
                self.settle_edge(position);
                None
            }
            ControllerEvent::FetchSettled { forward, outcome } => {
                debug!("edge fetch settled (forward={forward}): {outcome:?}");
                if forward {
                    self.loading_tail = false;
                } else {
                    self.loading_head = false;
                }
                None
            }
        }
    }

    /// The load an edge was waiting on has landed (or failed).
    fn settle_edge(&mut self, position: ChapterPosition) {
        match position {
            ChapterPosition::Prev => self.loading_head = false,
            ChapterPosition::Next => self.loading_tail = false,
            ChapterPosition::Curr => {}
        }
    }

    /// Insert at the head without moving what is on screen; evicts the tail past `MAX_SECTIONS`.
    pub fn prepend_section(&mut self, section: Section) -> LayoutUpdate {
        let old_height = self.content_height();
        info!("prepend chapter index {}", section.chapter_index);
        self.sections.push_front(section);
        self.sizes.shift_for_prepend();
        if self.sections.len() > 1 {
            self.current += 1;
        }
        let new_height = self.content_height();
        self.scroll_offset += new_height - old_height;

        if self.sections.len() > MAX_SECTIONS {
            let last = self.sections.len() - 1;
            if let Some(evicted) = self.sections.pop_back() {
                info!("evict tail chapter index {}", evicted.chapter_index);
            }
            self.sizes.remove_section(last);
            self.current = self.current.min(last - 1);
        }
        // Short content cannot keep the view in place; never leave blank rows below it.
        self.scroll_offset = self.scroll_offset.min(self.max_offset());
        LayoutUpdate {
            scroll_offset: self.scroll_offset,
            animated: false,
        }
    }

    /// Insert at the tail; evicting the head past `MAX_SECTIONS` pulls the offset up by its height.
    pub fn append_section(&mut self, section: Section) -> LayoutUpdate {
        info!("append chapter index {}", section.chapter_index);
        self.sections.push_back(section);

        if self.sections.len() > MAX_SECTIONS {
            let evicted_height = self.section_height(0);
            if let Some(evicted) = self.sections.pop_front() {
                info!("evict head chapter index {}", evicted.chapter_index);
            }
            self.sizes.remove_section(0);
            self.current = self.current.saturating_sub(1);
            self.scroll_offset = (self.scroll_offset - evicted_height).max(0.0);
        }
        LayoutUpdate {
            scroll_offset: self.scroll_offset,
            animated: false,
        }
    }

    /// Swap a section's pages wholesale. Cached sizes are dropped; the top visible page stays put.
    pub fn replace_section(&mut self, slot: usize, pages: Vec<Page>) -> LayoutUpdate {
        let anchor = self.capture_anchor();
        if let Some(section) = self.sections.get_mut(slot) {
            info!("replace chapter index {}", section.chapter_index);
            section.pages = pages;
        }
        self.sizes.clear();
        self.restore_anchor(anchor);
        LayoutUpdate {
            scroll_offset: self.scroll_offset,
            animated: false,
        }
    }

    /// Record a measured image size. Only the first measurement of an item triggers a relayout;
    /// items entirely above the viewport also move the offset so nothing on screen shifts.
    pub fn record_image_size(&mut self, section: usize, item: usize, size: ImageSize) -> SizeUpdate {
        let in_window = self
            .sections
            .get(section)
            .and_then(|s| s.pages.get(item))
            .is_some_and(|p| !p.is_chapter_end());
        if !in_window {
            return SizeUpdate::Hit;
        }
        let top = self.item_top(section, item);
        let old_height = self.item_height(section, item);
        if !self.sizes.insert(section, item, size) {
            return SizeUpdate::Hit;
        }
        let new_height = self.item_height(section, item);
        if top + old_height <= self.scroll_offset {
            self.scroll_offset = (self.scroll_offset + new_height - old_height).max(0.0);
        }
        SizeUpdate::Relayout { section, item }
    }

    /// Record a size reported for a page URL (e.g. by the prefetcher).
    pub fn record_size_for_url(&mut self, url: &str, size: ImageSize) -> Option<SizeUpdate> {
        let (section, item) = self.sections.iter().enumerate().find_map(|(s, section)| {
            section
                .pages
                .iter()
                .position(|p| p.url() == Some(url))
                .map(|i| (s, i))
        })?;
        Some(self.record_image_size(section, item, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::controller::tests::{ScriptedFetcher, chapters, controller, settle};

    /// 10 columns, square cells, square placeholders: every unmeasured page is 10 rows.
    fn layout() -> WindowLayout {
        WindowLayout {
            width: 10.0,
            cell_aspect_ratio: 1.0,
            placeholder_aspect_ratio: 1.0,
            end_marker_height: 2.0,
        }
    }

    fn pages(count: usize) -> Vec<Page> {
        (0..count)
            .map(|i| Page::from_content(format!("p{i}.png")))
            .collect()
    }

    fn window_with(sections: &[usize]) -> VirtualizedScrollWindow {
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        for (chapter, count) in sections.iter().enumerate() {
            window.sections.push_back(Section::new(chapter, pages(*count)));
        }
        window
    }

    fn chapter_indices(window: &VirtualizedScrollWindow) -> Vec<usize> {
        window.sections().iter().map(|s| s.chapter_index).collect()
    }

    async fn pump(window: &mut VirtualizedScrollWindow, ctrl: &mut ChapterStreamController) {
        for event in settle(ctrl).await {
            window.apply_event(event, ctrl);
        }
    }

    #[test]
    fn test_image_size_rejects_zero() {
        assert!(ImageSize::new(0, 10).is_none());
        assert_eq!(ImageSize::new(10, 20).unwrap().ratio(), 2.0);
    }

    #[test]
    fn test_cache_insert_reports_hit() {
        let mut cache = ImageSizeCache::default();
        let size = ImageSize::new(1, 2).unwrap();
        assert!(cache.insert(0, 1, size));
        assert!(!cache.insert(0, 1, ImageSize::new(5, 5).unwrap()));
        assert_eq!(cache.get(0, 1), Some(size));
    }

    #[test]
    fn test_cache_follows_prepend_and_eviction() {
        let mut cache = ImageSizeCache::default();
        let size = ImageSize::new(1, 2).unwrap();
        cache.insert(0, 0, size);
        cache.insert(1, 3, size);

        cache.shift_for_prepend();
        assert_eq!(cache.get(0, 0), None);
        assert_eq!(cache.get(1, 0), Some(size));
        assert_eq!(cache.get(2, 3), Some(size));

        cache.remove_section(1);
        assert_eq!(cache.get(1, 3), Some(size));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_heights_use_placeholder_until_measured() {
        let mut window = window_with(&[3]);
        assert_eq!(window.section_height(0), 30.0);
        window.record_image_size(0, 1, ImageSize::new(100, 250).unwrap());
        assert_eq!(window.item_height(0, 1), 25.0);
        assert_eq!(window.section_height(0), 45.0);
    }

    #[test]
    fn test_chapter_end_uses_marker_height() {
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        let mut list = pages(1);
        list.push(Page::chapter_end());
        window.sections.push_back(Section::new(0, list));
        assert_eq!(window.section_height(0), 12.0);
        assert_eq!(
            window.record_image_size(0, 1, ImageSize::new(1, 1).unwrap()),
            SizeUpdate::Hit
        );
    }

    #[test]
    fn test_prepend_preserves_visible_content() {
        let mut window = window_with(&[5, 5]);
        window.scroll_offset = 25.0;
        window.record_image_size(0, 0, ImageSize::new(10, 20).unwrap());
        let offset = window.scroll_offset;

        let mut head = Section::new(9, pages(3));
        head.pages.push(Page::chapter_end());
        let update = window.prepend_section(head);
        // 3 placeholders (30) + end marker (2)
        assert_eq!(update.scroll_offset, offset + 32.0);
        assert!(!update.animated);
        assert_eq!(window.current_section(), 1);
        // The measured page moved with its section.
        assert_eq!(window.image_sizes().get(1, 0), ImageSize::new(10, 20));
    }

    #[test]
    fn test_prepend_evicts_tail_at_capacity() {
        let mut window = window_with(&[2, 2, 2]);
        window.scroll_offset = 5.0;
        window.record_image_size(2, 0, ImageSize::new(1, 1).unwrap());
        window.prepend_section(Section::new(7, pages(1)));
        assert_eq!(chapter_indices(&window), vec![7, 0, 1]);
        assert_eq!(window.scroll_offset(), 15.0);
        assert!(window.image_sizes().is_empty());
    }

    #[test]
    fn test_append_eviction_subtracts_head_height() {
        let mut window = window_with(&[8, 4, 4]);
        window.current = 2;
        window.scroll_offset = 500.0;
        assert_eq!(window.section_height(0), 80.0);

        let update = window.append_section(Section::new(3, pages(2)));
        assert_eq!(update.scroll_offset, 420.0);
        assert_eq!(chapter_indices(&window), vec![1, 2, 3]);
        assert_eq!(window.current_section(), 1);
    }

    #[test]
    fn test_append_eviction_clamps_negative_offset() {
        // Head section measured at 800 rows, offset 500: 500 - 800 clamps to 0.
        let mut window = window_with(&[8, 4, 4]);
        for item in 0..8 {
            window.record_image_size(0, item, ImageSize::new(1, 10).unwrap());
        }
        assert_eq!(window.section_height(0), 800.0);
        window.scroll_offset = 500.0;

        let update = window.append_section(Section::new(3, pages(1)));
        assert_eq!(update.scroll_offset, 0.0);
    }

    #[test]
    fn test_window_never_exceeds_three_sections() {
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        for step in 0..12 {
            if step % 3 == 0 {
                window.prepend_section(Section::new(100 + step, pages(2)));
            } else {
                window.append_section(Section::new(step, pages(2)));
            }
            assert!(window.sections().len() <= MAX_SECTIONS);
            assert!(window.current_section() < window.sections().len().max(1));
        }
    }

    #[test]
    fn test_measure_twice_relayouts_once() {
        let mut window = window_with(&[3]);
        let size = ImageSize::new(10, 30).unwrap();
        assert_eq!(
            window.record_image_size(0, 2, size),
            SizeUpdate::Relayout {
                section: 0,
                item: 2
            }
        );
        assert_eq!(window.record_image_size(0, 2, size), SizeUpdate::Hit);
    }

    #[test]
    fn test_measuring_item_above_viewport_keeps_view() {
        let mut window = window_with(&[5]);
        window.scroll_offset = 25.0;
        window.record_image_size(0, 0, ImageSize::new(10, 40).unwrap());
        assert_eq!(window.scroll_offset(), 55.0);
        // Below the viewport top: no correction.
        window.record_image_size(0, 4, ImageSize::new(10, 40).unwrap());
        assert_eq!(window.scroll_offset(), 55.0);
    }

    #[test]
    fn test_measuring_partly_visible_top_item_keeps_offset() {
        let mut window = window_with(&[5]);
        window.scroll_offset = 25.0;
        // Page 2 spans 20..30, so it is cut by the viewport top but not above it.
        window.record_image_size(0, 2, ImageSize::new(10, 40).unwrap());
        assert_eq!(window.scroll_offset(), 25.0);
        assert_eq!(window.item_height(0, 2), 40.0);
    }

    #[test]
    fn test_prepend_clamps_offset_to_short_content() {
        let mut window = window_with(&[1]);
        let update = window.prepend_section(Section::new(7, pages(1)));
        assert_eq!(window.content_height(), 20.0);
        assert_eq!(update.scroll_offset, 0.0);
    }

    #[test]
    fn test_record_size_for_url() {
        let mut window = window_with(&[3]);
        let update = window.record_size_for_url("p1.png", ImageSize::new(1, 1).unwrap());
        assert_eq!(
            update,
            Some(SizeUpdate::Relayout {
                section: 0,
                item: 1
            })
        );
        assert!(
            window
                .record_size_for_url("missing.png", ImageSize::new(1, 1).unwrap())
                .is_none()
        );
    }

    #[test]
    fn test_visible_items_are_clipped_to_viewport() {
        let mut window = window_with(&[5]);
        window.scroll_offset = 15.0;
        let visible = window.visible_items();
        let items: Vec<usize> = visible.iter().map(|v| v.item).collect();
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(visible[0].top, -5.0);
        assert!(!visible[0].measured);
    }

    #[test]
    fn test_set_viewport_keeps_anchor_page() {
        let mut window = window_with(&[5]);
        window.scroll_offset = 25.0; // halfway into page 2
        window.set_viewport(20.0, 30.0);
        // Pages are now 20 rows each: page 2 starts at 40.
        assert_eq!(window.scroll_offset(), 45.0);
    }

    #[tokio::test]
    async fn test_curr_buffer_opens_window() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;

        assert_eq!(chapter_indices(&window), vec![2]);
        assert_eq!(window.current_section(), 0);
        assert_eq!(window.scroll_offset(), 0.0);
    }

    #[tokio::test]
    async fn test_scroll_stop_extends_both_edges() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;

        window.on_scroll_stop(&mut ctrl);
        // Each section: two pages (20) + end marker (2). The prepend would put the offset at 22,
        // but with only 44 rows of content the deepest offset is 14.
        assert_eq!(chapter_indices(&window), vec![1, 2, 3]);
        assert_eq!(window.scroll_offset(), 14.0);
        assert_eq!(window.current_section(), 1);
        assert_eq!(ctrl.selected_index(), Some(2));
    }

    #[tokio::test]
    async fn test_crossing_into_tail_shifts_and_slides_window() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;
        window.on_scroll_stop(&mut ctrl);

        // Content is 66 rows; the deepest offset is 36, midpoint 51 lies in the tail section.
        assert!(window.scroll_to(60.0, &mut ctrl));
        assert_eq!(window.scroll_offset(), 36.0);
        assert_eq!(ctrl.selected_index(), Some(3));
        assert_eq!(window.current_section(), 2);

        pump(&mut window, &mut ctrl).await;
        let update = window.on_scroll_stop(&mut ctrl).unwrap();
        assert_eq!(chapter_indices(&window), vec![2, 3, 4]);
        assert_eq!(update.scroll_offset, 14.0);
        assert_eq!(window.current_section(), 1);
    }

    #[tokio::test]
    async fn test_crossing_into_head_shifts_left() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;
        window.on_scroll_stop(&mut ctrl);

        assert!(window.scroll_to(0.0, &mut ctrl));
        assert_eq!(ctrl.selected_index(), Some(1));
        assert_eq!(window.current_section(), 0);
        assert!(ctrl.has_pending_load(ChapterPosition::Prev));

        pump(&mut window, &mut ctrl).await;
        window.on_scroll_stop(&mut ctrl);
        assert_eq!(chapter_indices(&window), vec![0, 1, 2]);
        assert_eq!(window.scroll_offset(), 22.0);
    }

    #[tokio::test]
    async fn test_empty_edge_loads_once_then_prepends() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let gate = fetcher.gate("ch1");
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;

        window.on_scroll_stop(&mut ctrl);
        assert!(window.is_loading(Edge::Head));
        assert_eq!(chapter_indices(&window), vec![2, 3]);
        pump(&mut window, &mut ctrl).await;

        // The edge waits on the load started with the chapter instead of issuing another.
        window.on_scroll_stop(&mut ctrl);
        pump(&mut window, &mut ctrl).await;
        let ch1_calls = |f: &ScriptedFetcher| {
            f.calls.lock().unwrap().iter().filter(|c| *c == "ch1").count()
        };
        assert_eq!(ch1_calls(&fetcher), 1);

        let offset = window.scroll_offset();
        gate.notify_one();
        pump(&mut window, &mut ctrl).await;
        assert_eq!(chapter_indices(&window), vec![1, 2, 3]);
        assert_eq!(window.scroll_offset(), offset + 22.0);
        assert!(!window.is_loading(Edge::Head));
    }

    #[tokio::test]
    async fn test_short_chapters_reach_both_ends() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        for i in 0..5 {
            fetcher.respond(&format!("ch{i}"), Some(vec![format!("ch{i}/p1.png")]));
        }
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;

        // 12-row sections: all three fit in the viewport, so the midpoint never reaches an end.
        window.on_scroll_stop(&mut ctrl);
        assert_eq!(chapter_indices(&window), vec![1, 2, 3]);
        assert!(window.scroll_offset() <= window.max_offset());

        window.scroll_to(0.0, &mut ctrl);
        window.on_scroll_stop(&mut ctrl);
        pump(&mut window, &mut ctrl).await;
        assert_eq!(chapter_indices(&window), vec![0, 1, 2]);
        assert_eq!(ctrl.selected_index(), Some(1));
        assert!(window.scroll_offset() <= window.max_offset());

        for _ in 0..3 {
            window.scroll_to(f64::MAX, &mut ctrl);
            window.on_scroll_stop(&mut ctrl);
            pump(&mut window, &mut ctrl).await;
        }
        // The head is still on screen, but the reader is heading down: no bounce back.
        assert!(window.head_visible());
        assert_eq!(chapter_indices(&window), vec![2, 3, 4]);
        assert_eq!(ctrl.selected_index(), Some(3));
        assert!(!window.is_loading(Edge::Tail));
        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|c| *c == "ch0").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "ch4").count(), 1);
    }

    #[tokio::test]
    async fn test_failed_edge_load_retries_on_next_stop() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond("ch1", None);
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;

        window.on_scroll_stop(&mut ctrl);
        pump(&mut window, &mut ctrl).await;
        assert!(!window.is_loading(Edge::Head));
        assert_eq!(window.sections().front().unwrap().chapter_index, 2);

        window.on_scroll_stop(&mut ctrl);
        assert!(window.is_loading(Edge::Head));
        pump(&mut window, &mut ctrl).await;
        let calls = fetcher
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == "ch1")
            .count();
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_reloaded_section_is_replaced_wholesale() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(5), 2);
        pump(&mut window, &mut ctrl).await;
        window.record_image_size(0, 0, ImageSize::new(10, 10).unwrap());

        // Same content again: nothing to do.
        ctrl.set_curr_chapter(vec!["ch2/p1.png".to_string(), "ch2/p2.png".to_string()]);
        for event in ctrl.poll() {
            assert!(window.apply_event(event, &ctrl).is_none());
        }
        assert_eq!(window.image_sizes().len(), 1);

        ctrl.set_curr_chapter(vec!["ch2/new.png".to_string()]);
        for event in ctrl.poll() {
            window.apply_event(event, &ctrl);
        }
        assert_eq!(window.sections()[0].pages.len(), 2);
        assert!(window.image_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_scroll_updates_controller_page_index() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "ch0",
            Some((0..6).map(|i| format!("ch0/{i}.png")).collect()),
        );
        let (mut ctrl, _) = controller(&fetcher);
        let mut window = VirtualizedScrollWindow::new(layout(), 30.0);
        ctrl.set_chapters(chapters(1), 0);
        pump(&mut window, &mut ctrl).await;

        window.scroll_to(20.0, &mut ctrl);
        // Midpoint 35 falls in page 3.
        assert_eq!(ctrl.index(), 3);
    }
}
