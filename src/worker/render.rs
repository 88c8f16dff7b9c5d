//! PDF rasterization via pdfium.
//!
//! ## Why one blocking task per document?
//!
//! pdfium is a C++ library with process-wide state: it is bound once and
//! every call blocks. The whole document (open, count, render every page)
//! therefore runs inside a single `spawn_blocking` task, which hands pages
//! to the async side through a channel of capacity 1. The renderer never
//! gets more than one page ahead of the writer, so memory stays bounded to
//! roughly one page however long the document is.
//!
//! If the receiver goes away (timeout, broken pipe), the next send fails
//! and the task stops after the page it is currently rendering.

use crate::error::ConversionError;
use crate::protocol::{check_page_count, Page, MAX_PAGE_HEIGHT, MAX_PAGE_WIDTH};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Fixed rasterization resolution.
pub const RENDER_DPI: f32 = 150.0;

/// PDF user-space units per inch.
pub const POINTS_PER_INCH: f32 = 72.0;

/// Directory holding the pdfium shared library, when not on the default
/// search path.
pub const PDFIUM_LIB_DIR_ENV: &str = "PDFIUM_LIB_DIR";

/// What the rasterizer reports, in order: the page count once, then every
/// page.
#[derive(Debug)]
pub enum RenderEvent {
    PageCount(u16),
    Page(Page),
}

fn bind() -> Result<Pdfium, ConversionError> {
    let bindings = match std::env::var_os(PDFIUM_LIB_DIR_ENV) {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
            &PathBuf::from(dir),
        ))
        .or_else(|_| Pdfium::bind_to_system_library()),
        None => Pdfium::bind_to_system_library(),
    };
    bindings.map(Pdfium::new).map_err(|e| {
        warn!("Could not load pdfium: {:?}", e);
        ConversionError::ConverterProc
    })
}

/// Rasterize `pdf` on a blocking thread. Results arrive on the returned
/// channel; the first error ends the stream.
pub fn render_document(pdf: PathBuf) -> mpsc::Receiver<Result<RenderEvent, ConversionError>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = render_blocking(&pdf, &tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });
    rx
}

fn render_blocking(
    pdf: &Path,
    tx: &mpsc::Sender<Result<RenderEvent, ConversionError>>,
) -> Result<(), ConversionError> {
    let pdfium = bind()?;
    let document = pdfium.load_pdf_from_file(pdf, None).map_err(|e| {
        warn!("pdfium could not open the document: {:?}", e);
        ConversionError::DocCorrupted
    })?;

    let pages = document.pages();
    let count = u16::try_from(pages.len()).map_err(|_| ConversionError::MaxPages)?;
    // Checked before a single page is rendered.
    let count = check_page_count(count)?;
    info!("PDF loaded: {} pages", count);
    if tx.blocking_send(Ok(RenderEvent::PageCount(count))).is_err() {
        return Ok(());
    }

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(RENDER_DPI / POINTS_PER_INCH)
        .set_maximum_width(i32::from(MAX_PAGE_WIDTH))
        .set_maximum_height(i32::from(MAX_PAGE_HEIGHT));

    for idx in 0..count {
        let page = pages.get(idx).map_err(|e| {
            warn!("Page {} could not be loaded: {:?}", idx + 1, e);
            ConversionError::DocCorrupted
        })?;
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            warn!("Page {} could not be rendered: {:?}", idx + 1, e);
            ConversionError::DocCorrupted
        })?;
        let rgb = bitmap.as_image().into_rgb8();
        let width = u16::try_from(rgb.width()).map_err(|_| ConversionError::MaxPageWidth)?;
        let height = u16::try_from(rgb.height()).map_err(|_| ConversionError::MaxPageHeight)?;
        debug!("Rendered page {} → {}x{} px", idx + 1, width, height);

        let page = Page::new(idx + 1, width, height, rgb.into_raw())?;
        if tx.blocking_send(Ok(RenderEvent::Page(page))).is_err() {
            debug!("Page receiver closed; stopping after page {}", idx + 1);
            return Ok(());
        }
    }
    Ok(())
}

/// Page edge length in points for an edge of `pixels` rendered at
/// [`RENDER_DPI`].
pub fn pixels_to_points(pixels: u16) -> f32 {
    f32::from(pixels) * POINTS_PER_INCH / RENDER_DPI
}
