//! Binary wire protocol for pixel data crossing the sandbox boundary.
//!
//! ```text
//! u16 page_count                     (big-endian)
//! repeat page_count times:
//!     u16 width                      (big-endian)
//!     u16 height                     (big-endian)
//!     width * height * 3 bytes       (8-bit RGB, no padding)
//! ```
//!
//! ## Trust model
//!
//! Everything on this stream is produced by an untrusted worker. The reader
//! therefore checks every declared number against a fixed bound *before* it
//! allocates anything sized by that number, and then counts the bytes it
//! actually received: a short read is a fatal [`ConversionError::Pages`],
//! never a silently truncated page.
//!
//! The format carries no version byte. A future revision should prepend a
//! fixed magic/version field rather than reinterpret this layout.

pub mod pixel_dir;

use crate::error::ConversionError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest page count a reader accepts.
pub const MAX_PAGES: u16 = 10_000;
/// Largest page width, in pixels, a reader accepts.
pub const MAX_PAGE_WIDTH: u16 = 10_000;
/// Largest page height, in pixels, a reader accepts.
pub const MAX_PAGE_HEIGHT: u16 = 10_000;
/// Bytes per pixel (RGB24).
pub const BYTES_PER_PIXEL: usize = 3;

/// One rasterized page.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based position in the document.
    pub index: u16,
    pub width: u16,
    pub height: u16,
    /// Exactly `width * height * 3` bytes.
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels", &format_args!("<{} bytes>", self.pixels.len()))
            .finish()
    }
}

impl Page {
    /// Build a page, checking geometry and buffer length.
    pub fn new(index: u16, width: u16, height: u16, pixels: Vec<u8>) -> Result<Self, ConversionError> {
        let expected = page_byte_len(width, height)?;
        if pixels.len() != expected {
            return Err(ConversionError::Pages);
        }
        Ok(Self {
            index,
            width,
            height,
            pixels,
        })
    }
}

/// Check a declared page count against `[1, MAX_PAGES]`.
pub fn check_page_count(count: u16) -> Result<u16, ConversionError> {
    if count == 0 || count > MAX_PAGES {
        return Err(ConversionError::MaxPages);
    }
    Ok(count)
}

/// Check declared geometry and return the pixel buffer length it implies.
pub fn page_byte_len(width: u16, height: u16) -> Result<usize, ConversionError> {
    if width == 0 || width > MAX_PAGE_WIDTH {
        return Err(ConversionError::MaxPageWidth);
    }
    if height == 0 || height > MAX_PAGE_HEIGHT {
        return Err(ConversionError::MaxPageHeight);
    }
    Ok(usize::from(width) * usize::from(height) * BYTES_PER_PIXEL)
}

/// Map a read failure on the untrusted stream.
///
/// EOF means the producer stopped early; anything else means the stream
/// itself broke.
fn read_error(e: io::Error, on_eof: ConversionError) -> ConversionError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        on_eof
    } else {
        ConversionError::ConverterProc
    }
}

fn write_error(_: io::Error) -> ConversionError {
    ConversionError::ConverterProc
}

/// Read and validate the page count header.
pub async fn read_page_count<R>(reader: &mut R) -> Result<u16, ConversionError>
where
    R: AsyncRead + Unpin,
{
    let count = reader
        .read_u16()
        .await
        .map_err(|e| read_error(e, ConversionError::NoPageCount))?;
    check_page_count(count)
}

/// Read one page. `index` is the 1-based position the caller expects next.
pub async fn read_page<R>(reader: &mut R, index: u16) -> Result<Page, ConversionError>
where
    R: AsyncRead + Unpin,
{
    let width = reader
        .read_u16()
        .await
        .map_err(|e| read_error(e, ConversionError::Pages))?;
    let height = reader
        .read_u16()
        .await
        .map_err(|e| read_error(e, ConversionError::Pages))?;
    let len = page_byte_len(width, height)?;

    // Bounded by MAX_PAGE_WIDTH * MAX_PAGE_HEIGHT * 3.
    let mut pixels = Vec::with_capacity(len);
    let read = (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut pixels)
        .await
        .map_err(|e| read_error(e, ConversionError::Pages))?;
    if read != len {
        return Err(ConversionError::Pages);
    }

    Ok(Page {
        index,
        width,
        height,
        pixels,
    })
}

/// Write the page count header.
pub async fn write_page_count<W>(writer: &mut W, count: u16) -> Result<(), ConversionError>
where
    W: AsyncWrite + Unpin,
{
    check_page_count(count)?;
    writer.write_u16(count).await.map_err(write_error)
}

/// Write one fully materialized page.
pub async fn write_page<W>(writer: &mut W, page: &Page) -> Result<(), ConversionError>
where
    W: AsyncWrite + Unpin,
{
    if page.pixels.len() != page_byte_len(page.width, page.height)? {
        return Err(ConversionError::Pages);
    }
    writer.write_u16(page.width).await.map_err(write_error)?;
    writer.write_u16(page.height).await.map_err(write_error)?;
    writer.write_all(&page.pixels).await.map_err(write_error)
}
