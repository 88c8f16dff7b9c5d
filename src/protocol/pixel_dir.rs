//! File-based pixel exchange between phases.
//!
//! For page `i` (1-based) a pixel directory holds:
//!
//! ```text
//! page-{i}.rgb      raw RGB bytes
//! page-{i}.width    decimal text
//! page-{i}.height   decimal text
//! ```
//!
//! The reader validates that the directory contains exactly these three
//! files for every `i` in `1..=n` and nothing else, before trusting any of
//! them. Pages are then read one at a time.

use super::{check_page_count, page_byte_len, Page};
use crate::error::ConversionError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Part {
    Rgb,
    Width,
    Height,
}

fn parse_name(name: &str) -> Option<(u16, Part)> {
    let rest = name.strip_prefix("page-")?;
    let (num, ext) = rest.split_once('.')?;
    let part = match ext {
        "rgb" => Part::Rgb,
        "width" => Part::Width,
        "height" => Part::Height,
        _ => return None,
    };
    // Reject "+1", "01" and friends so each page has exactly one spelling.
    if num.is_empty() || num.starts_with('0') || !num.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, part))
}

/// A directory of pages following the `page-{i}.*` contract.
#[derive(Debug, Clone)]
pub struct PixelDir {
    root: PathBuf,
}

impl PixelDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn file(&self, index: u16, ext: &str) -> PathBuf {
        self.root.join(format!("page-{index}.{ext}"))
    }

    /// Deposit one page. The pixel file is written before its geometry files.
    pub async fn write_page(&self, page: &Page) -> std::io::Result<()> {
        fs::write(self.file(page.index, "rgb"), &page.pixels).await?;
        fs::write(self.file(page.index, "width"), page.width.to_string()).await?;
        fs::write(self.file(page.index, "height"), page.height.to_string()).await
    }

    /// Validate the file set and return the page count.
    pub async fn scan(&self) -> Result<u16, ConversionError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|_| ConversionError::NoPageCount)?;
        let mut seen: BTreeMap<u16, Vec<Part>> = BTreeMap::new();
        let mut total = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|_| ConversionError::NoPageCount)?
        {
            total += 1;
            let name = entry.file_name();
            let parsed = name.to_str().and_then(parse_name);
            let Some((index, part)) = parsed else {
                return Err(ConversionError::PageCountMismatch);
            };
            seen.entry(index).or_default().push(part);
            // Stop before a hostile directory makes the map large.
            if seen.len() > usize::from(super::MAX_PAGES) {
                return Err(ConversionError::MaxPages);
            }
        }

        if total == 0 {
            return Err(ConversionError::NoPageCount);
        }
        let count = u16::try_from(seen.len()).map_err(|_| ConversionError::MaxPages)?;
        check_page_count(count)?;

        for (expected, (index, parts)) in (1..=count).zip(seen.iter_mut()) {
            parts.sort();
            if *index != expected || parts.as_slice() != [Part::Rgb, Part::Width, Part::Height] {
                return Err(ConversionError::PageCountMismatch);
            }
        }
        Ok(count)
    }

    async fn read_dimension(&self, index: u16, ext: &str) -> Result<u16, ConversionError> {
        let text = fs::read_to_string(self.file(index, ext))
            .await
            .map_err(|_| ConversionError::Pages)?;
        // Longer than any valid u16 means the file is not what it claims.
        if text.len() > 8 {
            return Err(ConversionError::Pages);
        }
        text.trim().parse().map_err(|_| ConversionError::Pages)
    }

    /// Read and validate page `index`.
    pub async fn read_page(&self, index: u16) -> Result<Page, ConversionError> {
        let width = self.read_dimension(index, "width").await?;
        let height = self.read_dimension(index, "height").await?;
        let len = page_byte_len(width, height)?;

        let rgb = self.file(index, "rgb");
        let meta = fs::metadata(&rgb).await.map_err(|_| ConversionError::Pages)?;
        if meta.len() != len as u64 {
            return Err(ConversionError::Pages);
        }
        let pixels = fs::read(&rgb).await.map_err(|_| ConversionError::Pages)?;
        Page::new(index, width, height, pixels)
    }
}
