// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Chapter streaming controller.
//!
//! `ChapterStreamController` owns:
//! - the chapter list and the selected chapter
//! - the prev/curr/next page buffers
//! - the load-task registry (at most one live task per `ChapterPosition`)
//! - the prefetcher driven after each buffer update
//!
//! Loads run on the tokio runtime; their results come back over a channel and are applied by
//! `poll()` on the caller's thread, so buffers are only ever mutated from one place.
//! A load checks for cancellation before fetching, after fetching, and (in `poll()`) right
//! before its result is assigned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::fetch::PageFetcher;
use crate::model::{Chapter, ChapterPosition, FetchParams, Page};
use crate::prefetch::Prefetcher;

/// How a load (or a directional fetch) settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed,
    /// Nothing to load: no neighbor chapter, or a chapter without source variants.
    Skipped,
    Cancelled,
}

/// Called on the polling thread once a load settles. Never called for cancelled loads.
pub type Completion = Box<dyn FnOnce(LoadOutcome) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    BufferSet(ChapterPosition),
    LoadFailed(ChapterPosition),
    FetchSettled { forward: bool, outcome: LoadOutcome },
}

struct CancelFlag(AtomicBool);

impl CancelFlag {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct LoadTask {
    id: u64,
    cancel: Arc<CancelFlag>,
    handle: JoinHandle<()>,
    completion: Option<Completion>,
}

impl LoadTask {
    fn cancel(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct LoadResult {
    id: u64,
    urls: Option<Vec<String>>,
}

/// The running `fetch_task`, tied to the load it started.
struct DirectionalTask {
    forward: bool,
    load_id: u64,
    completion: Option<Completion>,
}

pub struct ChapterStreamController {
    chapters: Vec<Chapter>,
    selected: Option<usize>,
    preferred_group: Option<String>,
    prev_chapter: Vec<Page>,
    curr_chapter: Vec<Page>,
    next_chapter: Vec<Page>,
    index: usize,
    tasks: HashMap<ChapterPosition, LoadTask>,
    directional: Option<DirectionalTask>,
    next_task_id: u64,
    fetcher: Arc<dyn PageFetcher>,
    prefetcher: Box<dyn Prefetcher>,
    runtime: Handle,
    result_tx: UnboundedSender<LoadResult>,
    result_rx: UnboundedReceiver<LoadResult>,
    events: Vec<ControllerEvent>,
}

impl ChapterStreamController {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        prefetcher: Box<dyn Prefetcher>,
        runtime: Handle,
    ) -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            chapters: Vec::new(),
            selected: None,
            preferred_group: None,
            prev_chapter: Vec::new(),
            curr_chapter: Vec::new(),
            next_chapter: Vec::new(),
            index: 0,
            tasks: HashMap::new(),
            directional: None,
            next_task_id: 1,
            fetcher,
            prefetcher,
            runtime,
            result_tx,
            result_rx,
            events: Vec::new(),
        }
    }

    pub fn set_preferred_group(&mut self, group: Option<String>) {
        self.preferred_group = group;
    }

    /// Install the chapter list and enter `selected` (clamped into range).
    pub fn set_chapters(&mut self, chapters: Vec<Chapter>, selected: usize) {
        self.selected = if chapters.is_empty() {
            None
        } else {
            Some(selected.min(chapters.len() - 1))
        };
        self.chapters = chapters;
        self.reset_state();
    }

    /// Jump to an arbitrary chapter and reload everything around it.
    pub fn select_chapter(&mut self, index: usize) {
        if self.chapters.is_empty() {
            return;
        }
        self.selected = Some(index.min(self.chapters.len() - 1));
        self.reset_state();
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn selected_chapter(&self) -> Option<&Chapter> {
        self.chapters.get(self.selected?)
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    /// List index of the chapter that belongs in `position`'s buffer.
    pub fn position_index(&self, position: ChapterPosition) -> Option<usize> {
        let index = self.selected?.checked_add_signed(position.offset())?;
        (index < self.chapters.len()).then_some(index)
    }

    pub fn prev_chapter(&self) -> &[Page] {
        &self.prev_chapter
    }

    pub fn curr_chapter(&self) -> &[Page] {
        &self.curr_chapter
    }

    pub fn next_chapter(&self) -> &[Page] {
        &self.next_chapter
    }

    pub fn buffer(&self, position: ChapterPosition) -> &[Page] {
        match position {
            ChapterPosition::Prev => &self.prev_chapter,
            ChapterPosition::Curr => &self.curr_chapter,
            ChapterPosition::Next => &self.next_chapter,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn has_pending_load(&self, position: ChapterPosition) -> bool {
        self.tasks.contains_key(&position)
    }

    pub fn has_pending_loads(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Record the active page within the current chapter.
    pub fn set_index(&mut self, index: usize) {
        if self.index == index {
            return;
        }
        self.index = index;
        self.preload_adjacent_pages();
    }

    /// Start loading `params` into `position`, replacing any load already running there.
    /// Returns the new task's id.
    pub fn load_pages(
        &mut self,
        params: FetchParams,
        position: ChapterPosition,
        completion: Option<Completion>,
    ) -> u64 {
        self.cancel_load(position);

        let id = self.next_task_id;
        self.next_task_id += 1;
        debug!("load {id}: {position:?} <- {}", params.as_str());

        let cancel = Arc::new(CancelFlag::new());
        let task_cancel = Arc::clone(&cancel);
        let fetcher = Arc::clone(&self.fetcher);
        let result_tx = self.result_tx.clone();
        let handle = self.runtime.spawn(async move {
            tokio::task::yield_now().await;
            if task_cancel.is_cancelled() {
                debug!("load {id} cancelled before fetch");
                return;
            }
            let urls = fetcher.fetch_page_list(&params).await;
            if task_cancel.is_cancelled() {
                debug!("load {id} cancelled after fetch");
                return;
            }
            let _ = result_tx.send(LoadResult { id, urls });
        });

        self.tasks.insert(
            position,
            LoadTask {
                id,
                cancel,
                handle,
                completion,
            },
        );
        id
    }

    /// Apply finished loads and return what changed since the last poll.
    pub fn poll(&mut self) -> Vec<ControllerEvent> {
        while let Ok(result) = self.result_rx.try_recv() {
            self.apply_result(result);
        }
        std::mem::take(&mut self.events)
    }

    fn apply_result(&mut self, result: LoadResult) {
        let Some(position) = self.position_of(result.id) else {
            debug!("discarding stale load {}", result.id);
            return;
        };
        let Some(task) = self.tasks.remove(&position) else {
            return;
        };
        if task.cancel.is_cancelled() {
            debug!("load {} cancelled before assignment", result.id);
            return;
        }

        let outcome = match result.urls {
            Some(urls) => {
                self.set_chapter(position, urls);
                LoadOutcome::Loaded
            }
            None => {
                warn!("load {} for {position:?} failed; keeping buffer", result.id);
                self.events.push(ControllerEvent::LoadFailed(position));
                LoadOutcome::Failed
            }
        };
        if let Some(completion) = task.completion {
            completion(outcome);
        }
        self.settle_directional(result.id, outcome);
    }

    fn position_of(&self, id: u64) -> Option<ChapterPosition> {
        self.tasks
            .iter()
            .find(|(_, task)| task.id == id)
            .map(|(position, _)| *position)
    }

    fn cancel_load(&mut self, position: ChapterPosition) {
        if let Some(task) = self.tasks.remove(&position) {
            debug!("cancel load {} ({position:?})", task.id);
            task.cancel();
            self.settle_directional(task.id, LoadOutcome::Cancelled);
        }
    }

    fn cancel_all(&mut self) {
        for position in ChapterPosition::ALL {
            self.cancel_load(position);
        }
        self.cancel_directional();
    }

    /// Detach the running directional fetch. Its load keeps running; only the completion is dropped.
    fn cancel_directional(&mut self) {
        if let Some(previous) = self.directional.take() {
            debug!("cancel directional fetch (forward={})", previous.forward);
            self.events.push(ControllerEvent::FetchSettled {
                forward: previous.forward,
                outcome: LoadOutcome::Cancelled,
            });
        }
    }

    fn settle_directional(&mut self, load_id: u64, outcome: LoadOutcome) {
        if !self
            .directional
            .as_ref()
            .is_some_and(|d| d.load_id == load_id)
        {
            return;
        }
        let Some(directional) = self.directional.take() else {
            return;
        };
        if outcome != LoadOutcome::Cancelled
            && let Some(completion) = directional.completion
        {
            completion(outcome);
        }
        self.events.push(ControllerEvent::FetchSettled {
            forward: directional.forward,
            outcome,
        });
    }

    fn params_for(&self, index: usize) -> Option<FetchParams> {
        let chapter = self.chapters.get(index)?;
        chapter
            .source_for(self.preferred_group.as_deref())
            .map(|source| source.params.clone())
    }

    /// Clear everything and load the selected chapter with both neighbors.
    pub fn reset_state(&mut self) {
        self.cancel_all();
        self.prev_chapter.clear();
        self.curr_chapter.clear();
        self.next_chapter.clear();
        self.index = 0;
        self.prefetcher.stop();

        let Some(selected) = self.selected else {
            return;
        };
        info!("entering chapter index {selected}");
        if let Some(params) = self.params_for(selected) {
            self.load_pages(params, ChapterPosition::Curr, None);
        }
        self.fetch_prev(None);
        self.fetch_next(None);
    }

    /// Load the chapter after the selected one into `Next`.
    pub fn fetch_next(&mut self, completion: Option<Completion>) -> Option<u64> {
        let params = self.params_for(self.selected? + 1)?;
        Some(self.load_pages(params, ChapterPosition::Next, completion))
    }

    /// Load the chapter before the selected one into `Prev`.
    pub fn fetch_prev(&mut self, completion: Option<Completion>) -> Option<u64> {
        let params = self.params_for(self.selected?.checked_sub(1)?)?;
        Some(self.load_pages(params, ChapterPosition::Prev, completion))
    }

    /// (Re)load the neighbor in the given direction, replacing any running directional fetch.
    pub fn fetch_task(&mut self, forward: bool, completion: Option<Completion>) {
        self.cancel_directional();
        let position = if forward {
            ChapterPosition::Next
        } else {
            ChapterPosition::Prev
        };
        self.cancel_load(position);

        let load_id = if forward {
            self.fetch_next(None)
        } else {
            self.fetch_prev(None)
        };
        match load_id {
            Some(load_id) => {
                self.directional = Some(DirectionalTask {
                    forward,
                    load_id,
                    completion,
                });
            }
            None => {
                debug!("nothing to fetch (forward={forward})");
                if let Some(completion) = completion {
                    completion(LoadOutcome::Skipped);
                }
                self.events.push(ControllerEvent::FetchSettled {
                    forward,
                    outcome: LoadOutcome::Skipped,
                });
            }
        }
    }

    /// Move one chapter back: curr becomes next, prev becomes curr.
    pub fn shift_left(&mut self) {
        let Some(selected) = self.selected else {
            return;
        };
        if selected == 0 {
            warn!("shift_left ignored: already at the first chapter");
            return;
        }
        self.cancel_load(ChapterPosition::Next);
        self.move_task(ChapterPosition::Curr, ChapterPosition::Next);
        self.move_task(ChapterPosition::Prev, ChapterPosition::Curr);

        self.next_chapter = std::mem::take(&mut self.curr_chapter);
        self.curr_chapter = std::mem::take(&mut self.prev_chapter);
        self.selected = Some(selected - 1);
        self.index = self.curr_chapter.len().saturating_sub(1);
        info!("shifted left to chapter index {}", selected - 1);

        self.fetch_prev(None);
        self.preload_adjacent_pages();
    }

    /// Move one chapter forward: curr becomes prev, next becomes curr.
    pub fn shift_right(&mut self) {
        let Some(selected) = self.selected else {
            return;
        };
        if selected + 1 >= self.chapters.len() {
            warn!("shift_right ignored: already at the last chapter");
            return;
        }
        self.cancel_load(ChapterPosition::Prev);
        self.move_task(ChapterPosition::Curr, ChapterPosition::Prev);
        self.move_task(ChapterPosition::Next, ChapterPosition::Curr);

        self.prev_chapter = std::mem::take(&mut self.curr_chapter);
        self.curr_chapter = std::mem::take(&mut self.next_chapter);
        self.selected = Some(selected + 1);
        self.index = 0;
        info!("shifted right to chapter index {}", selected + 1);

        self.fetch_next(None);
        self.preload_adjacent_pages();
    }

    /// In-flight loads follow their chapter when the buffers rotate.
    fn move_task(&mut self, from: ChapterPosition, to: ChapterPosition) {
        if let Some(task) = self.tasks.remove(&from) {
            self.tasks.insert(to, task);
        }
    }

    fn set_chapter(&mut self, position: ChapterPosition, urls: Vec<String>) {
        match position {
            ChapterPosition::Prev => self.set_prev_chapter(urls),
            ChapterPosition::Curr => self.set_curr_chapter(urls),
            ChapterPosition::Next => self.set_next_chapter(urls),
        }
    }

    pub fn set_prev_chapter(&mut self, urls: Vec<String>) {
        self.prev_chapter = self.build_pages(ChapterPosition::Prev, urls);
        self.after_set(ChapterPosition::Prev);
    }

    pub fn set_curr_chapter(&mut self, urls: Vec<String>) {
        self.curr_chapter = self.build_pages(ChapterPosition::Curr, urls);
        self.index = self.index.min(self.curr_chapter.len().saturating_sub(1));
        self.after_set(ChapterPosition::Curr);
    }

    pub fn set_next_chapter(&mut self, urls: Vec<String>) {
        self.next_chapter = self.build_pages(ChapterPosition::Next, urls);
        self.after_set(ChapterPosition::Next);
    }

    fn after_set(&mut self, position: ChapterPosition) {
        self.events.push(ControllerEvent::BufferSet(position));
        self.preload_adjacent_pages();
    }

    /// Fresh pages for `position`, ending with the end marker when another chapter follows.
    fn build_pages(&self, position: ChapterPosition, urls: Vec<String>) -> Vec<Page> {
        let mut pages: Vec<Page> = urls.into_iter().map(Page::from_content).collect();
        let has_successor = self
            .position_index(position)
            .is_some_and(|index| index + 1 < self.chapters.len());
        if has_successor && !pages.last().is_some_and(Page::is_chapter_end) {
            pages.push(Page::chapter_end());
        }
        pages
    }

    /// Up to two pages ahead, one behind, and the first page of the next chapter.
    fn adjacent_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .curr_chapter
            .iter()
            .skip(self.index + 1)
            .chain(self.next_chapter.iter())
            .filter_map(Page::url)
            .take(2)
            .map(str::to_string)
            .collect();
        let behind = self
            .curr_chapter
            .iter()
            .take(self.index)
            .rev()
            .chain(self.prev_chapter.iter().rev())
            .find_map(Page::url);
        if let Some(url) = behind {
            urls.push(url.to_string());
        }
        if let Some(first_next) = self.next_chapter.iter().find_map(Page::url)
            && !urls.iter().any(|u| u == first_next)
        {
            urls.push(first_next.to_string());
        }
        urls
    }

    fn preload_adjacent_pages(&mut self) {
        let urls = self.adjacent_urls();
        self.prefetcher.stop();
        if !urls.is_empty() {
            self.prefetcher.start(urls);
        }
    }
}

impl Drop for ChapterStreamController {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.cancel();
        }
    }
}
