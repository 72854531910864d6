// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Chapter and page values shared by the controller and the scroll window.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel content marking the boundary rendered after a chapter's last page.
pub const CHAPTER_END: &str = "CHAPTER_END";

/// Opaque fetch token handed to the `PageFetcher`.
///
/// Only the fetch collaborator interprets the value; the streaming core passes it through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FetchParams(String);

impl FetchParams {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One source of a chapter (e.g. a scanlation group's release).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceVariant {
    pub params: FetchParams,
    pub group: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chapter {
    pub id: String,
    pub number: String,
    pub index: usize,
    pub sources: Option<Vec<SourceVariant>>,
}

impl Chapter {
    /// Pick the variant to load: the preferred group when present, otherwise the first one.
    /// `None` means there is nothing to load for this chapter.
    pub fn source_for(&self, preferred_group: Option<&str>) -> Option<&SourceVariant> {
        let sources = self.sources.as_deref()?;
        preferred_group
            .and_then(|group| sources.iter().find(|s| s.group == group))
            .or_else(|| sources.first())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageContent {
    Image(String),
    ChapterEnd,
}

static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A displayable unit within a chapter. Equality is by `id` only.
#[derive(Clone, Debug)]
pub struct Page {
    pub id: u64,
    pub content: PageContent,
}

impl Page {
    pub fn new(content: PageContent) -> Self {
        Self {
            id: NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed),
            content,
        }
    }

    /// Build a page from raw fetch output. The `CHAPTER_END` string maps to the sentinel.
    pub fn from_content(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw == CHAPTER_END {
            Self::new(PageContent::ChapterEnd)
        } else {
            Self::new(PageContent::Image(raw))
        }
    }

    pub fn chapter_end() -> Self {
        Self::new(PageContent::ChapterEnd)
    }

    pub fn is_chapter_end(&self) -> bool {
        matches!(self.content, PageContent::ChapterEnd)
    }

    pub fn url(&self) -> Option<&str> {
        match &self.content {
            PageContent::Image(url) => Some(url),
            PageContent::ChapterEnd => None,
        }
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Page {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChapterPosition {
    Prev,
    Curr,
    Next,
}

impl ChapterPosition {
    pub const ALL: [ChapterPosition; 3] = [
        ChapterPosition::Prev,
        ChapterPosition::Curr,
        ChapterPosition::Next,
    ];

    /// Chapter index offset relative to the selected chapter.
    pub fn offset(self) -> isize {
        match self {
            ChapterPosition::Prev => -1,
            ChapterPosition::Curr => 0,
            ChapterPosition::Next => 1,
        }
    }
}
