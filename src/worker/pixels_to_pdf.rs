//! Phase B: RGB pixels → flat PDF.
//!
//! Every output page is a single image XObject (DeviceRGB, 8 bits per
//! component, Flate-compressed) drawn over the whole page. With OCR, the
//! page comes from Tesseract instead: the same image plus an invisible text
//! layer. Nothing from the original document can reach the output: the only
//! input is the validated pixel stream.

use super::command::ToolRun;
use super::render::pixels_to_points;
use super::{ProgressReporter, WorkerEnv};
use crate::error::ConversionError;
use crate::isolation::SAFE_PDF_NAME;
use crate::ocr::OcrLanguage;
use crate::protocol::pixel_dir::PixelDir;
use crate::protocol::{read_page, read_page_count, Page};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const TESSERACT: &str = "tesseract";

/// Share of the overall progress spent building pages.
const PAGES_SHARE: f32 = 45.0;

fn pdf_error(context: &str, e: lopdf::Error) -> ConversionError {
    warn!("{}: {}", context, e);
    ConversionError::Unexpected
}

/// Builds the output PDF one page at a time.
pub struct PdfAssembler {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl Default for PdfAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfAssembler {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Append a page showing `page` as one full-page image.
    pub fn add_image_page(&mut self, page: &Page) -> Result<(), ConversionError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&page.pixels).map_err(|e| {
            warn!("Compressing page {}: {}", page.index, e);
            ConversionError::Unexpected
        })?;
        let compressed = encoder.finish().map_err(|e| {
            warn!("Compressing page {}: {}", page.index, e);
            ConversionError::Unexpected
        })?;

        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(page.width),
                "Height" => i64::from(page.height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8_i64,
                "Filter" => "FlateDecode",
            },
            compressed,
        )
        .with_compression(false);
        let image_id = self.doc.add_object(image);

        let width = pixels_to_points(page.width);
        let height = pixels_to_points(page.height);
        let content = format!("q {width:.4} 0 0 {height:.4} 0 0 cm /Im0 Do Q");
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(width.into()),
                Object::Real(height.into()),
            ],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
            "Contents" => content_id,
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    /// Append every page of an existing PDF (an OCR result).
    pub fn append_pdf(&mut self, bytes: &[u8]) -> Result<(), ConversionError> {
        let mut other = Document::load_mem(bytes).map_err(|e| pdf_error("loading an OCR page", e))?;
        other.renumber_objects_with(self.doc.max_id + 1);

        let pages: Vec<ObjectId> = other.get_pages().into_values().collect();
        if pages.is_empty() {
            return Err(ConversionError::Unexpected);
        }
        for &page_id in &pages {
            let inherited: Vec<(&str, Object)> = ["MediaBox", "Resources", "CropBox", "Rotate"]
                .into_iter()
                .filter_map(|key| {
                    inherited_attribute(&other, page_id, key.as_bytes()).map(|v| (key, v))
                })
                .collect();
            let dict = other
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| pdf_error("reading an OCR page", e))?;
            for (key, value) in inherited {
                if dict.get(key.as_bytes()).is_err() {
                    dict.set(key, value);
                }
            }
            dict.set("Parent", self.pages_id);
            self.kids.push(page_id.into());
        }

        // The fragment's own catalog and page tree become unreachable and are
        // dropped by `prune_objects` in `finish`.
        let max_id = other.objects.keys().map(|(id, _)| *id).max().unwrap_or(0);
        self.doc.max_id = self.doc.max_id.max(max_id);
        self.doc.objects.extend(other.objects);
        Ok(())
    }

    /// Close the page tree and serialize the compressed document.
    pub fn finish(mut self) -> Result<Vec<u8>, ConversionError> {
        let count = self.kids.len() as i64;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => self.kids,
            "Count" => count,
        };
        self.doc.objects.insert(self.pages_id, Object::Dictionary(pages));
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        self.doc.prune_objects();
        self.doc.renumber_objects();
        self.doc.compress();

        let mut buf = Vec::new();
        self.doc.save_to(&mut buf).map_err(|e| {
            warn!("Serializing the PDF: {}", e);
            ConversionError::Unexpected
        })?;
        Ok(buf)
    }
}

fn internal_io(context: &str, e: std::io::Error) -> ConversionError {
    warn!("{}: {}", context, e);
    ConversionError::Unexpected
}

/// Look `key` up on a page or, failing that, on its ancestors.
fn inherited_attribute(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    // Bounded walk: page trees are shallow, cycles are not.
    for _ in 0..32 {
        if let Ok(value) = current.get(key) {
            return Some(value.clone());
        }
        let parent = current.get(b"Parent").and_then(Object::as_reference).ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Where pages come from.
enum PageSource<R> {
    Stream(R),
    Directory(PixelDir),
}

impl<R: AsyncRead + Unpin> PageSource<R> {
    async fn page_count(&mut self) -> Result<u16, ConversionError> {
        match self {
            PageSource::Stream(reader) => read_page_count(reader).await,
            PageSource::Directory(dir) => dir.scan().await,
        }
    }

    async fn page(&mut self, index: u16) -> Result<Page, ConversionError> {
        match self {
            PageSource::Stream(reader) => read_page(reader, index).await,
            PageSource::Directory(dir) => dir.read_page(index).await,
        }
    }
}

/// OCR one page with Tesseract and return the resulting single-page PDF.
async fn ocr_page(
    page: &Page,
    language: OcrLanguage,
    scratch: &Path,
    env: &WorkerEnv,
) -> Result<Vec<u8>, ConversionError> {
    let png = scratch.join(format!("page-{}.png", page.index));
    let base = scratch.join(format!("page-{}", page.index));
    let pdf = base.with_extension("pdf");

    let image = image::RgbImage::from_raw(
        u32::from(page.width),
        u32::from(page.height),
        page.pixels.clone(),
    )
    .ok_or(ConversionError::Pages)?;
    let png_path = png.clone();
    tokio::task::spawn_blocking(move || image.save_with_format(&png_path, image::ImageFormat::Png))
        .await
        .map_err(|e| {
            warn!("PNG encoder task failed: {}", e);
            ConversionError::Unexpected
        })?
        .map_err(|e| {
            warn!("Writing page {} as PNG: {}", page.index, e);
            ConversionError::Unexpected
        })?;

    let timeout = env.timeouts.timeout(page.pixels.len() as u64, Some(1));
    ToolRun::new(TESSERACT, &pdf, ConversionError::ConverterProc)
        .arg(&png)
        .arg(&base)
        .arg("-l")
        .arg(language.code())
        .arg("--dpi")
        .arg("150")
        .arg("pdf")
        .timeout(timeout)
        .run()
        .await?;

    let bytes = tokio::fs::read(&pdf)
        .await
        .map_err(|e| internal_io("reading the OCR result", e))?;
    let _ = tokio::fs::remove_file(&png).await;
    let _ = tokio::fs::remove_file(&pdf).await;
    Ok(bytes)
}

/// Rebuild a PDF from the pages on `input` (or in `PIXELS_DIR`), writing it
/// to `output` (or to `SAFE_OUTPUT_DIR`).
pub async fn run<R, W>(
    input: R,
    mut output: W,
    env: &WorkerEnv,
    progress: &mut ProgressReporter,
) -> Result<(), ConversionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut source = match &env.pixels_dir {
        Some(dir) => PageSource::Directory(PixelDir::new(dir)),
        None => PageSource::Stream(input),
    };
    let scratch = tempfile::tempdir().map_err(|e| internal_io("creating a scratch directory", e))?;

    // ── Step 1: Validate the page count ──────────────────────────────────
    let count = source.page_count().await?;
    info!("Rebuilding {} pages", count);
    let step = PAGES_SHARE / f32::from(count);
    let searchable = if env.ocr_language.is_some() { "searchable " } else { "" };

    // ── Step 2: One PDF page per pixel page ──────────────────────────────
    let mut assembler = PdfAssembler::new();
    for index in 1..=count {
        let page = source.page(index).await?;
        match env.ocr_language {
            Some(language) => {
                let fragment = ocr_page(&page, language, scratch.path(), env).await?;
                assembler.append_pdf(&fragment)?;
            }
            None => assembler.add_image_page(&page)?,
        }
        debug!("Page {} → {}x{} px", index, page.width, page.height);
        progress.advance(
            step,
            &format!("Converting page {index}/{count} from pixels to {searchable}PDF"),
        );
    }

    // ── Step 3: Merge and compress ───────────────────────────────────────
    progress.advance(0.0, "Merging and compressing the PDF");
    let pdf = tokio::task::spawn_blocking(move || assembler.finish())
        .await
        .map_err(|e| {
            warn!("PDF writer task failed: {}", e);
            ConversionError::Unexpected
        })??;

    // ── Step 4: Hand the PDF back ────────────────────────────────────────
    match &env.safe_output_dir {
        Some(dir) => tokio::fs::write(dir.join(SAFE_PDF_NAME), &pdf)
            .await
            .map_err(|e| internal_io("writing the safe PDF", e))?,
        None => {
            output
                .write_all(&pdf)
                .await
                .map_err(|_| ConversionError::ConverterProc)?;
            output
                .flush()
                .await
                .map_err(|_| ConversionError::ConverterProc)?;
        }
    }
    progress.advance(100.0, "Safe PDF created");
    Ok(())
}
