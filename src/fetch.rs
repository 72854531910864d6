// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Page-list fetching.
//!
//! The controller only knows the `PageFetcher` trait. `DirectoryFetcher` is the local
//! implementation used by the binary: a chapter variant is a directory of images and its
//! fetch parameter is that directory's path.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};

use crate::model::{Chapter, FetchParams, SourceVariant};

/// Resolves a chapter's fetch parameters into an ordered list of page URLs.
///
/// `None` means the fetch failed; the caller must not clear what it already has.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page_list(&self, params: &FetchParams) -> Option<Vec<String>>;
}

const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Group label used for images placed directly in a chapter directory.
pub const LOCAL_GROUP: &str = "local";

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("Not a chapter directory: {:?}", dir);
    }
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();
    images.sort();
    Ok(images)
}

fn list_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Reads page lists from local chapter directories.
#[derive(Clone, Debug, Default)]
pub struct DirectoryFetcher;

impl DirectoryFetcher {
    fn read_pages(dir: &Path) -> Result<Vec<String>> {
        let images = list_images(dir)?;
        if images.is_empty() {
            anyhow::bail!("No image files found in chapter: {:?}", dir);
        }
        Ok(images
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }
}

#[async_trait]
impl PageFetcher for DirectoryFetcher {
    async fn fetch_page_list(&self, params: &FetchParams) -> Option<Vec<String>> {
        let dir = PathBuf::from(params.as_str());
        let joined = tokio::task::spawn_blocking(move || Self::read_pages(&dir)).await;
        match joined {
            Ok(Ok(pages)) => {
                debug!("fetched {} pages from {}", pages.len(), params.as_str());
                Some(pages)
            }
            Ok(Err(e)) => {
                warn!("page list fetch failed: {e:#}");
                None
            }
            Err(e) => {
                warn!("page list fetch task failed: {e}");
                None
            }
        }
    }
}

/// Trailing digits of a directory name ("ch012" -> "12"), if any.
fn trailing_number(name: &str) -> Option<String> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    let trimmed = digits.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed }.to_string())
}

/// A variant for `dir` when it holds images. Unreadable directories are skipped with a warning.
fn read_variant(dir: &Path, group: String) -> Option<SourceVariant> {
    match list_images(dir) {
        Ok(images) if !images.is_empty() => Some(SourceVariant {
            params: FetchParams::new(dir.to_string_lossy()),
            group,
        }),
        Ok(_) => None,
        Err(e) => {
            warn!("skipping unreadable chapter source {:?}: {e:#}", dir);
            None
        }
    }
}

fn chapter_variants(dir: &Path) -> Vec<SourceVariant> {
    let mut variants: Vec<SourceVariant> = read_variant(dir, LOCAL_GROUP.to_string())
        .into_iter()
        .collect();
    let subdirs = match list_subdirs(dir) {
        Ok(subdirs) => subdirs,
        Err(e) => {
            warn!("cannot list chapter directory {:?}: {e:#}", dir);
            return variants;
        }
    };
    for sub in subdirs {
        let group = sub
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(LOCAL_GROUP)
            .to_string();
        variants.extend(read_variant(&sub, group));
    }
    variants
}

/// Build the ordered chapter list from a library directory.
///
/// Every sub-directory is a chapter, sorted by name. Chapters without images are kept with no
/// variants so chapter numbering stays stable.
pub fn discover_chapters(root: &Path) -> Result<Vec<Chapter>> {
    if !root.is_dir() {
        anyhow::bail!("Library path is not a directory: {:?}", root);
    }
    let chapters: Vec<Chapter> = list_subdirs(root)?
        .into_iter()
        .enumerate()
        .map(|(index, dir)| {
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            Chapter {
                id: name.clone(),
                number: trailing_number(&name).unwrap_or_else(|| (index + 1).to_string()),
                index,
                sources: Some(chapter_variants(&dir)),
            }
        })
        .collect();
    if chapters.is_empty() {
        anyhow::bail!("No chapter directories found in: {:?}", root);
    }
    Ok(chapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(&PathBuf::from("test.png")));
        assert!(is_image_file(&PathBuf::from("test.JPEG")));
        assert!(is_image_file(&PathBuf::from("test.webp")));
        assert!(!is_image_file(&PathBuf::from("test.txt")));
        assert!(!is_image_file(&PathBuf::from("noextension")));
    }

    #[test]
    fn test_trailing_number() {
        assert_eq!(trailing_number("ch012").as_deref(), Some("12"));
        assert_eq!(trailing_number("chapter 7").as_deref(), Some("7"));
        assert_eq!(trailing_number("000").as_deref(), Some("0"));
        assert_eq!(trailing_number("extra"), None);
    }

    #[test]
    fn test_discover_chapters_with_variants() {
        let root = scratch("cflow_test_discover");
        let ch1 = root.join("ch001");
        let ch2 = root.join("ch002");
        let empty = root.join("bonus");
        fs::create_dir_all(&ch1).unwrap();
        fs::create_dir_all(ch2.join("groupA")).unwrap();
        fs::create_dir_all(&empty).unwrap();
        File::create(ch1.join("01.png")).unwrap();
        File::create(ch2.join("groupA").join("01.jpg")).unwrap();

        let chapters = discover_chapters(&root).unwrap();
        assert_eq!(chapters.len(), 3);
        // Sorted by name: bonus, ch001, ch002
        assert_eq!(chapters[0].id, "bonus");
        assert_eq!(chapters[0].number, "1");
        assert!(chapters[0].source_for(None).is_none());
        assert_eq!(chapters[1].number, "1");
        assert_eq!(chapters[1].source_for(None).unwrap().group, LOCAL_GROUP);
        assert_eq!(chapters[2].index, 2);
        assert_eq!(chapters[2].source_for(None).unwrap().group, "groupA");

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_unreadable_variant_is_skipped() {
        assert!(read_variant(Path::new("/nonexistent/cflow/variant"), "g".to_string()).is_none());
        assert!(chapter_variants(Path::new("/nonexistent/cflow/chapter")).is_empty());
    }

    #[test]
    fn test_discover_chapters_empty_root_error() {
        let root = scratch("cflow_test_discover_empty");
        assert!(discover_chapters(&root).is_err());
        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_directory_fetcher_lists_sorted_images() {
        let dir = scratch("cflow_test_fetch");
        File::create(dir.join("b.png")).unwrap();
        File::create(dir.join("a.jpg")).unwrap();
        File::create(dir.join("notes.txt")).unwrap();

        let pages = DirectoryFetcher
            .fetch_page_list(&FetchParams::new(dir.to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].ends_with("a.jpg"));
        assert!(pages[1].ends_with("b.png"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_directory_fetcher_missing_dir_is_none() {
        let result = DirectoryFetcher
            .fetch_page_list(&FetchParams::new("/nonexistent/cflow/chapter"))
            .await;
        assert!(result.is_none());
    }
}
