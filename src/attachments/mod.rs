//! Attachment processor: detect MIME type, classify kind, extract text
//! from plain/PDF/DOCX/XLSX documents, normalize, and enforce size caps.
//!
//! Every failure becomes an [`AttachmentError`] whose `user_message`
//! names the file and the concrete reason, so the model can relay it
//! verbatim instead of guessing.

use std::io::Read;
use std::path::Path;

use calamine::{Data, Reader as CalamineReader, Xlsx};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use tracing::warn;

use crate::bus::{Attachment, AttachmentError, AttachmentKind};

const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 4 * 1024 * 1024;
const DEFAULT_MAX_TEXT_CHARS: usize = 60_000;

/// Tuning knobs for [`Processor`]. Zero values select the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorOptions {
    pub max_file_size_bytes: u64,
    pub max_text_chars: usize,
}

pub struct Processor {
    max_file_size_bytes: u64,
    max_text_chars: usize,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new(ProcessorOptions::default())
    }
}

impl Processor {
    pub fn new(opts: ProcessorOptions) -> Self {
        Self {
            max_file_size_bytes: if opts.max_file_size_bytes == 0 {
                DEFAULT_MAX_FILE_SIZE_BYTES
            } else {
                opts.max_file_size_bytes
            },
            max_text_chars: if opts.max_text_chars == 0 {
                DEFAULT_MAX_TEXT_CHARS
            } else {
                opts.max_text_chars
            },
        }
    }

    /// Process a list of filesystem paths into attachments and errors.
    ///
    /// A single path can yield both: audio/video files return a stub
    /// attachment plus a not-supported error.
    pub async fn process(&self, paths: &[String]) -> (Vec<Attachment>, Vec<AttachmentError>) {
        let mut attachments = Vec::new();
        let mut errors = Vec::new();

        for path in paths {
            if path.is_empty() {
                continue;
            }
            let (attachment, err) = self.process_one(Path::new(path)).await;
            if let Some(a) = attachment {
                attachments.push(a);
            }
            if let Some(e) = err {
                errors.push(e);
            }
        }

        (attachments, errors)
    }

    async fn process_one(&self, path: &Path) -> (Option<Attachment>, Option<AttachmentError>) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                return (
                    None,
                    Some(build_error(
                        &name,
                        "file_unreadable",
                        &e.to_string(),
                        format!("Attachment \"{name}\" was received but cannot be read."),
                    )),
                );
            }
        };

        let ext = extension_lower(&name);
        let media_type = detect_media_type(path, &ext).await;
        let kind = classify_kind(&media_type, &ext);

        let mut attachment = Attachment {
            name: name.clone(),
            media_type: media_type.clone(),
            size_bytes: meta.len(),
            local_path: Some(path.display().to_string()),
            kind,
            text_content: None,
        };

        match kind {
            AttachmentKind::Image => return (Some(attachment), None),
            AttachmentKind::Audio => {
                return (
                    Some(attachment),
                    Some(build_error(
                        &name,
                        "audio_not_supported",
                        "",
                        format!(
                            "Audio attachment \"{name}\" was received but direct audio \
                             understanding is not supported in this path."
                        ),
                    )),
                );
            }
            AttachmentKind::Video => {
                return (
                    Some(attachment),
                    Some(build_error(
                        &name,
                        "video_not_supported",
                        "",
                        format!(
                            "Video attachment \"{name}\" was received but direct video \
                             understanding is not supported in this path."
                        ),
                    )),
                );
            }
            _ => {}
        }

        let doc_type = match detect_document_type(&media_type, &ext) {
            Some(dt) => dt,
            None => {
                return (
                    Some(attachment),
                    Some(build_error(
                        &name,
                        "unsupported_type",
                        &media_type,
                        format!(
                            "Attachment \"{name}\" type ({media_type}) is not supported for \
                             content understanding."
                        ),
                    )),
                );
            }
        };

        if meta.len() > self.max_file_size_bytes {
            return (
                Some(attachment),
                Some(build_error(
                    &name,
                    "file_too_large",
                    &format!("{} bytes", meta.len()),
                    format!(
                        "Attachment \"{name}\" is too large to parse. Please upload a \
                         smaller file."
                    ),
                )),
            );
        }

        let text = match self.extract_text(path, doc_type).await {
            Ok(t) => t,
            Err(e) => {
                warn!(name = %name, media_type = %media_type, error = %e, "failed to parse attachment");
                return (
                    Some(attachment),
                    Some(build_error(
                        &name,
                        "parse_failed",
                        &e.to_string(),
                        format!(
                            "Attachment \"{name}\" ({media_type}) was received but could not \
                             be parsed: {e}. The file may use an unsupported encoding or \
                             structure."
                        ),
                    )),
                );
            }
        };

        let text = normalize_text(&text);
        if text.is_empty() {
            return (
                Some(attachment),
                Some(build_error(
                    &name,
                    "empty_content",
                    "",
                    format!("Attachment \"{name}\" was received but contains no extractable text."),
                )),
            );
        }

        let chars = text.chars().count();
        if chars > self.max_text_chars {
            return (
                Some(attachment),
                Some(build_error(
                    &name,
                    "text_too_large",
                    &format!("{chars} chars"),
                    format!(
                        "Attachment \"{name}\" content is too large for direct understanding. \
                         Please split or simplify it."
                    ),
                )),
            );
        }

        attachment.text_content = Some(text);
        (Some(attachment), None)
    }

    async fn extract_text(&self, path: &Path, doc_type: DocumentType) -> anyhow::Result<String> {
        match doc_type {
            DocumentType::PlainText => {
                let data = tokio::fs::read(path).await?;
                Ok(decode_text_bytes(&data))
            }
            DocumentType::Pdf => extract_pdf_text(path, self.max_text_chars).await,
            DocumentType::Docx => {
                let data = tokio::fs::read(path).await?;
                extract_docx_text(&data)
            }
            DocumentType::Xlsx => {
                let data = tokio::fs::read(path).await?;
                extract_xlsx_text(&data)
            }
        }
    }
}

fn build_error(name: &str, code: &str, reason: &str, user_message: String) -> AttachmentError {
    AttachmentError {
        name: name.to_string(),
        code: code.to_string(),
        reason: reason.to_string(),
        user_message,
    }
}

fn extension_lower(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// MIME detection
// ---------------------------------------------------------------------------

/// Sniff the first 512 bytes of a file, with known false positives
/// corrected (WEBP, zip-container office documents, text/plain hits on
/// binary office extensions). Falls back to the extension table.
async fn detect_media_type(path: &Path, ext: &str) -> String {
    let head = match read_head(path, 512).await {
        Ok(h) if !h.is_empty() => h,
        _ => return media_type_from_ext(ext),
    };

    let mut content_type = sniff_content_type(&head);

    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        content_type = "image/webp".to_string();
    }

    if content_type.is_empty() || content_type == "application/octet-stream" {
        return media_type_from_ext(ext);
    }

    let ext_type = media_type_from_ext(ext);
    if ext_type != "application/octet-stream" {
        // Office docs are zip containers; short binary payloads can sniff
        // as text/plain. Keep the extension-derived type in both cases.
        if content_type == "text/plain" && matches!(ext, ".pdf" | ".docx" | ".xlsx") {
            return ext_type;
        }
        if content_type == "application/zip" && matches!(ext, ".docx" | ".xlsx") {
            return ext_type;
        }
    }

    content_type
}

async fn read_head(path: &Path, n: usize) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut f = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; n];
    let mut read = 0;
    loop {
        let got = f.read(&mut buf[read..]).await?;
        if got == 0 {
            break;
        }
        read += got;
        if read == n {
            break;
        }
    }
    buf.truncate(read);
    Ok(buf)
}

/// Minimal content sniffer covering the signatures this pipeline cares
/// about. Unknown binary data maps to application/octet-stream.
pub fn sniff_content_type(buf: &[u8]) -> String {
    if buf.is_empty() {
        return String::new();
    }

    const SIGS: &[(&[u8], &str)] = &[
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"BM", "image/bmp"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"OggS", "audio/ogg"),
        (b"ID3", "audio/mpeg"),
        (b"fLaC", "audio/flac"),
        (b"\x1A\x45\xDF\xA3", "video/webm"),
    ];
    for (sig, ty) in SIGS {
        if buf.starts_with(sig) {
            return (*ty).to_string();
        }
    }

    if buf.len() >= 12 && &buf[..4] == b"RIFF" {
        match &buf[8..12] {
            b"WEBP" => return "image/webp".to_string(),
            b"WAVE" => return "audio/wav".to_string(),
            b"AVI " => return "video/avi".to_string(),
            _ => {}
        }
    }
    if buf.len() >= 12 && &buf[4..8] == b"ftyp" {
        return "video/mp4".to_string();
    }
    if buf.starts_with(b"\xFF\xFB") || buf.starts_with(b"\xFF\xF3") || buf.starts_with(b"\xFF\xF2")
    {
        return "audio/mpeg".to_string();
    }

    // UTF BOMs and binary-free prefixes read as text.
    if buf.starts_with(b"\xEF\xBB\xBF") || buf.starts_with(b"\xFE\xFF") || buf.starts_with(b"\xFF\xFE")
    {
        return "text/plain".to_string();
    }
    let looks_text = buf
        .iter()
        .all(|&b| b == b'\t' || b == b'\n' || b == b'\r' || (0x20..0xFF).contains(&b));
    if looks_text {
        return "text/plain".to_string();
    }

    "application/octet-stream".to_string()
}

/// Infer MIME type from a file name only.
///
/// Used when a channel has name metadata but no readable payload (lazy
/// file references).
pub fn infer_media_type_from_name(file_name: &str) -> String {
    media_type_from_ext(&extension_lower(file_name))
}

/// Infer attachment kind from a file name only, using the same rules as
/// the processor so callers cannot drift.
pub fn infer_kind_from_name(file_name: &str) -> AttachmentKind {
    let ext = extension_lower(file_name);
    classify_kind(&media_type_from_ext(&ext), &ext)
}

fn media_type_from_ext(ext: &str) -> String {
    let ty = match ext {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".bmp" => "image/bmp",
        ".mp3" => "audio/mpeg",
        ".ogg" => "audio/ogg",
        ".wav" => "audio/wav",
        ".m4a" => "audio/mp4",
        ".amr" => "audio/amr",
        ".flac" => "audio/flac",
        ".mp4" => "video/mp4",
        ".mov" => "video/quicktime",
        ".avi" => "video/avi",
        ".mkv" => "video/x-matroska",
        ".webm" => "video/webm",
        ".doc" => "application/msword",
        ".docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ".xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".csv" => "text/csv",
        ".md" | ".txt" | ".log" => "text/plain",
        ".html" | ".htm" => "text/html",
        ".json" => "application/json",
        ".pdf" => "application/pdf",
        ".zip" => "application/zip",
        _ => "application/octet-stream",
    };
    ty.to_string()
}

fn classify_kind(media_type: &str, ext: &str) -> AttachmentKind {
    if media_type.starts_with("image/") {
        return AttachmentKind::Image;
    }
    if media_type.starts_with("audio/") {
        return AttachmentKind::Audio;
    }
    if media_type.starts_with("video/") {
        return AttachmentKind::Video;
    }

    match ext {
        ".jpg" | ".jpeg" | ".png" | ".gif" | ".webp" | ".bmp" => return AttachmentKind::Image,
        ".mp3" | ".ogg" | ".wav" | ".m4a" | ".amr" | ".flac" => return AttachmentKind::Audio,
        ".mp4" | ".mov" | ".avi" | ".mkv" | ".webm" => return AttachmentKind::Video,
        _ => {}
    }

    if !media_type.is_empty() {
        return AttachmentKind::Document;
    }
    AttachmentKind::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentType {
    PlainText,
    Pdf,
    Docx,
    Xlsx,
}

fn detect_document_type(media_type: &str, ext: &str) -> Option<DocumentType> {
    if media_type.starts_with("text/") {
        return Some(DocumentType::PlainText);
    }

    match ext {
        ".txt" | ".md" | ".csv" | ".log" => return Some(DocumentType::PlainText),
        ".pdf" => return Some(DocumentType::Pdf),
        ".docx" => return Some(DocumentType::Docx),
        ".xlsx" => return Some(DocumentType::Xlsx),
        _ => {}
    }

    match media_type {
        "application/pdf" => Some(DocumentType::Pdf),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            Some(DocumentType::Docx)
        }
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
            Some(DocumentType::Xlsx)
        }
        "application/json" => Some(DocumentType::PlainText),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Text extraction
// ---------------------------------------------------------------------------

/// Decode raw bytes into text: BOM-aware UTF-16, a zero-byte heuristic
/// for BOM-less UTF-16, then UTF-8 with U+FFFD replacement.
fn decode_text_bytes(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    if data.len() >= 2 {
        if data[0] == 0xFE && data[1] == 0xFF {
            return decode_utf16(&data[2..], true);
        }
        if data[0] == 0xFF && data[1] == 0xFE {
            return decode_utf16(&data[2..], false);
        }
    }

    if looks_like_utf16(data) {
        return decode_utf16(data, true);
    }

    String::from_utf8_lossy(data).into_owned()
}

/// UTF-16 heuristic: more than 12.5 % zero bytes at odd offsets within
/// the first 200 bytes.
fn looks_like_utf16(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let sample = data.len().min(200);
    let zero_count = data[..sample].iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
    zero_count > sample / 8
}

fn decode_utf16(data: &[u8], big_endian: bool) -> String {
    let even = data.len() - data.len() % 2;
    if even == 0 {
        return String::new();
    }
    let words: Vec<u16> = data[..even]
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&words)
}

/// Extract plain text from a PDF, capped at 4 bytes per allowed rune.
///
/// pdf-extract is CPU-bound and synchronous, so it runs on the blocking
/// pool.
async fn extract_pdf_text(path: &Path, max_text_chars: usize) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| anyhow::anyhow!("pdf extraction task failed: {e}"))?
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if text.trim().is_empty() {
        anyhow::bail!("no extractable text found in PDF");
    }

    // Worst-case 4 UTF-8 bytes per rune, mirroring the read cap applied
    // to the extraction stream.
    let byte_cap = max_text_chars.saturating_mul(4);
    if text.len() > byte_cap {
        let mut end = byte_cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        return Ok(text[..end].to_string());
    }
    Ok(text)
}

/// Walk `word/document.xml` inside the DOCX zip container: text runs
/// concatenate, tabs and explicit breaks map to their characters, and
/// paragraphs end with a single newline. Hyperlink children are nested
/// elements, so their text events are collected naturally.
fn extract_docx_text(data: &[u8]) -> anyhow::Result<String> {
    let cursor = std::io::Cursor::new(data);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|e| anyhow::anyhow!("failed to open docx archive: {e}"))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| anyhow::anyhow!("docx missing document.xml: {e}"))?
        .read_to_string(&mut xml)
        .map_err(|e| anyhow::anyhow!("failed to read document.xml: {e}"))?;

    let mut reader = XmlReader::from_str(&xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => append_newline(&mut out),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => append_newline(&mut out),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_text_run {
                    if let Ok(content) = t.unescape() {
                        out.push_str(&content);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("docx xml parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Newline only when the buffer is non-empty and doesn't already end
/// with one — paragraphs never double up.
fn append_newline(out: &mut String) {
    if out.is_empty() || out.ends_with('\n') {
        return;
    }
    out.push('\n');
}

/// Per sheet: a `[sheet: <name>]` header, then each non-empty row as
/// `<A1-ref>=<trimmed-value>` cells joined by tabs. Blank rows skipped.
fn extract_xlsx_text(data: &[u8]) -> anyhow::Result<String> {
    let cursor = std::io::Cursor::new(data.to_vec());
    let mut workbook: Xlsx<_> =
        Xlsx::new(cursor).map_err(|e| anyhow::anyhow!("failed to read xlsx workbook: {e}"))?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        anyhow::bail!("worksheets not found");
    }

    let mut out = String::new();
    for (index, sheet) in sheet_names.iter().enumerate() {
        if index > 0 {
            out.push_str("\n\n");
        }
        out.push_str("[sheet: ");
        out.push_str(sheet);
        out.push_str("]\n");

        let range = match workbook.worksheet_range(sheet) {
            Ok(r) => r,
            Err(e) => anyhow::bail!("failed to read sheet {sheet}: {e}"),
        };

        for (row_index, row) in range.rows().enumerate() {
            let mut parts: Vec<String> = Vec::new();
            for (col_index, cell) in row.iter().enumerate() {
                let value = cell_to_string(cell);
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                parts.push(format!("{}={}", cell_name(col_index, row_index), value));
            }
            if !parts.is_empty() {
                out.push_str(&parts.join("\t"));
                out.push('\n');
            }
        }
    }

    Ok(out)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(v) => format!("{v}"),
        Data::Int(v) => format!("{v}"),
        Data::Bool(b) => (if *b { "true" } else { "false" }).to_string(),
        Data::Error(e) => format!("#{e:?}"),
        Data::DateTime(v) => format!("{}", v.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// Spreadsheet cell label from zero-based coordinates, e.g. (0,0) → "A1".
fn cell_name(col: usize, row: usize) -> String {
    let mut letters = String::new();
    let mut c = col;
    loop {
        letters.insert(0, (b'A' + (c % 26) as u8) as char);
        if c < 26 {
            break;
        }
        c = c / 26 - 1;
    }
    format!("{letters}{}", row + 1)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// CRLF→LF, per-line trim, collapse blank-line runs to one, overall trim.
/// Idempotent: `normalize_text(normalize_text(t)) == normalize_text(t)`.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0;
    for line in text.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push("");
            continue;
        }
        blank_run = 0;
        out.push(trimmed);
    }

    out.join("\n").trim().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
