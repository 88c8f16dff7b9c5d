//! Phase A: untrusted document → RGB pixels.

use super::command::ToolRun;
use super::mime::{self, ConversionPath, SNIFF_LEN};
use super::render::{self, RenderEvent};
use super::{ProgressReporter, WorkerEnv};
use crate::error::ConversionError;
use crate::isolation::qubes::running_on_qubes;
use crate::protocol::{write_page, write_page_count};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const LIBREOFFICE: &str = "libreoffice";
pub const GRAPHICSMAGICK: &str = "gm";

/// Share of the overall progress spent rasterizing pages.
const PAGES_SHARE: f32 = 45.0;

fn internal(context: &str, e: std::io::Error) -> ConversionError {
    warn!("{}: {}", context, e);
    ConversionError::Unexpected
}

async fn read_head(path: &Path) -> Result<Vec<u8>, ConversionError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| internal("opening the spooled document", e))?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .await
        .map_err(|e| internal("reading the spooled document", e))?;
    Ok(head)
}

/// Bring the document to PDF along `path`. Returns the PDF to rasterize.
async fn to_pdf(
    path: ConversionPath,
    input: &Path,
    workdir: &Path,
    timeout: Option<Duration>,
) -> Result<PathBuf, ConversionError> {
    match path {
        ConversionPath::NativePdf => Ok(input.to_path_buf()),
        ConversionPath::OfficeSuite => {
            // LibreOffice names its output after the input file.
            let output = input.with_extension("pdf");
            ToolRun::new(LIBREOFFICE, &output, ConversionError::LibreofficeFailure)
                .arg("--headless")
                .arg("--safe-mode")
                .arg("--convert-to")
                .arg("pdf")
                .arg("--outdir")
                .arg(workdir)
                .arg(input)
                .timeout(timeout)
                .run()
                .await?;
            Ok(output)
        }
        ConversionPath::RasterTool => {
            let output = input.with_extension("pdf");
            ToolRun::new(GRAPHICSMAGICK, &output, ConversionError::ConverterProc)
                .arg("convert")
                .arg(input)
                .arg(&output)
                .timeout(timeout)
                .run()
                .await?;
            Ok(output)
        }
    }
}

async fn next_event(
    events: &mut mpsc::Receiver<Result<RenderEvent, ConversionError>>,
    deadline: Option<Instant>,
) -> Result<RenderEvent, ConversionError> {
    let received = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| ConversionError::ConversionTimeout)?,
        None => events.recv().await,
    };
    match received {
        Some(event) => event,
        // The renderer stopped without saying why.
        None => Err(ConversionError::Unexpected),
    }
}

/// Convert the document on `input` and stream its pages to `output`.
pub async fn run<R, W>(
    mut input: R,
    mut output: W,
    env: &WorkerEnv,
    progress: &mut ProgressReporter,
) -> Result<(), ConversionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // ── Step 1: Spool the document ───────────────────────────────────────
    let tmp = tempfile::tempdir().map_err(|e| internal("creating a scratch directory", e))?;
    let spooled = tmp.path().join("input_file");
    let mut file = tokio::fs::File::create(&spooled)
        .await
        .map_err(|e| internal("creating the spool file", e))?;
    let size = tokio::io::copy(&mut input, &mut file)
        .await
        .map_err(|e| internal("reading the document from stdin", e))?;
    file.flush()
        .await
        .map_err(|e| internal("writing the spool file", e))?;
    drop(file);
    debug!("Received {} bytes", size);

    // ── Step 2: Classify by content ──────────────────────────────────────
    let head = read_head(&spooled).await?;
    let (mime_type, path) = mime::classify(&head, running_on_qubes())?;
    info!("Detected {} → {:?}", mime_type, path);

    // ── Step 3: Convert to PDF ───────────────────────────────────────────
    let timeout = env.timeouts.timeout(size, None);
    let pdf = to_pdf(path, &spooled, tmp.path(), timeout).await?;
    progress.advance(3.0, "Converted document to PDF");

    // ── Step 4: Count pages ──────────────────────────────────────────────
    let mut events = render::render_document(pdf);
    let deadline = timeout.map(|t| Instant::now() + t);
    let count = match next_event(&mut events, deadline).await? {
        RenderEvent::PageCount(count) => count,
        RenderEvent::Page(_) => return Err(ConversionError::NoPageCount),
    };
    progress.advance(2.0, "Calculating number of pages");

    // ── Step 5: Rasterize, one page at a time ────────────────────────────
    let timeout = env.timeouts.timeout(size, Some(u32::from(count)));
    let deadline = timeout.map(|t| Instant::now() + t);
    write_page_count(&mut output, count).await?;
    let step = PAGES_SHARE / f32::from(count);
    for expected in 1..=count {
        let page = match next_event(&mut events, deadline).await? {
            RenderEvent::Page(page) if page.index == expected => page,
            _ => return Err(ConversionError::PageCountMismatch),
        };
        write_page(&mut output, &page).await?;
        progress.advance(step, &format!("Converting page {expected}/{count} to pixels"));
    }
    output
        .flush()
        .await
        .map_err(|_| ConversionError::ConverterProc)?;

    progress.advance(0.0, "Converted document to pixels");
    Ok(())
}
