//! Plain-text extraction from uploaded documents
//!
//! `.docx` files are read as zip archives and the text runs of
//! `word/document.xml` are collected with an XML pull parser; `.txt` files
//! are returned as they are. The kind is decided from the file name alone,
//! before anything is read.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("unsupported file type: {0}")]
    UnsupportedExtension(String),

    #[error("could not read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not extract text: {0}")]
    Extraction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Office Open XML word processing document
    Word,
    PlainText,
}

impl DocumentKind {
    /// Case-insensitive match on the extension.
    pub fn from_file_name(file_name: &str) -> Result<Self, ImportError> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| ImportError::UnsupportedExtension("(no extension)".to_string()))?;

        match extension.to_ascii_lowercase().as_str() {
            "docx" => Ok(DocumentKind::Word),
            "txt" => Ok(DocumentKind::PlainText),
            _ => Err(ImportError::UnsupportedExtension(format!(".{}", extension))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentImporter;

impl DocumentImporter {
    pub fn new() -> Self {
        Self
    }

    pub async fn import_path(&self, path: &Path) -> Result<String, ImportError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let kind = DocumentKind::from_file_name(file_name)?;

        let bytes = tokio::fs::read(path).await?;
        debug!(file = %path.display(), size = bytes.len(), ?kind, "importing document");

        match kind {
            DocumentKind::PlainText => plain_text(bytes),
            // Unzipping is blocking work.
            DocumentKind::Word => tokio::task::spawn_blocking(move || extract_docx_text(&bytes))
                .await
                .map_err(|e| ImportError::Extraction(e.to_string()))?,
        }
    }

    pub fn import_bytes(&self, file_name: &str, bytes: &[u8]) -> Result<String, ImportError> {
        match DocumentKind::from_file_name(file_name)? {
            DocumentKind::PlainText => plain_text(bytes.to_vec()),
            DocumentKind::Word => extract_docx_text(bytes),
        }
    }
}

fn plain_text(bytes: Vec<u8>) -> Result<String, ImportError> {
    String::from_utf8(bytes)
        .map_err(|e| ImportError::Extraction(format!("text file is not UTF-8: {}", e)))
}

/// Text of a `.docx`: runs joined, one line per paragraph, tabs and
/// breaks kept.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, ImportError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ImportError::Extraction(format!("not a Word document: {}", e)))?;
    let mut entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ImportError::Extraction(format!("missing word/document.xml: {}", e)))?;

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| ImportError::Extraction(e.to_string()))?;

    document_xml_text(&xml)
}

fn document_xml_text(xml: &str) -> Result<String, ImportError> {
    let mut reader = Reader::from_str(xml);

    let mut text = String::new();
    let mut in_run_text = false;
    // Tab stop definitions live in <w:tabs> and are not content.
    let mut in_tab_stops = false;
    // Word repeats drawings and text boxes in <mc:Fallback> for older readers.
    let mut fallback_depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            ImportError::Extraction(format!(
                "malformed document.xml at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Eof => break,
            Event::Start(tag) if tag.name().as_ref() == b"mc:Fallback" => fallback_depth += 1,
            Event::End(tag) if tag.name().as_ref() == b"mc:Fallback" => {
                fallback_depth = fallback_depth.saturating_sub(1)
            }
            _ if fallback_depth > 0 => {}
            Event::Start(tag) => match tag.name().as_ref() {
                b"w:t" => in_run_text = true,
                b"w:tabs" => in_tab_stops = true,
                b"w:tab" if !in_tab_stops => text.push('\t'),
                b"w:br" | b"w:cr" => text.push('\n'),
                _ => {}
            },
            Event::Empty(tag) => match tag.name().as_ref() {
                b"w:tab" if !in_tab_stops => text.push('\t'),
                b"w:br" | b"w:cr" | b"w:p" => text.push('\n'),
                _ => {}
            },
            Event::End(tag) => match tag.name().as_ref() {
                b"w:t" => in_run_text = false,
                b"w:tabs" => in_tab_stops = false,
                b"w:p" => text.push('\n'),
                _ => {}
            },
            Event::Text(chars) if in_run_text => {
                let chars = chars
                    .unescape()
                    .map_err(|e| ImportError::Extraction(e.to_string()))?;
                text.push_str(&chars);
            }
            Event::CData(chars) if in_run_text => {
                text.push_str(&String::from_utf8_lossy(&chars.into_inner()));
            }
            // Comments, processing instructions and the declaration.
            _ => {}
        }
    }

    let trimmed = text.trim_end_matches('\n').len();
    text.truncate(trimmed);
    Ok(text)
}

/// One import at a time with the transient flags a form shows.
#[derive(Debug, Default)]
pub struct ImportSession {
    importer: DocumentImporter,
    loading: Arc<AtomicBool>,
    error: Mutex<Option<String>>,
}

struct LoadingGuard(Arc<AtomicBool>);

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ImportSession {
    pub fn new(importer: DocumentImporter) -> Self {
        Self {
            importer,
            ..Default::default()
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Shared handle to the loading flag, for observers.
    pub fn loading_flag(&self) -> Arc<AtomicBool> {
        self.loading.clone()
    }

    /// Message of the last failed import, cleared when a new one starts.
    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Imports `path` and hands the text to `on_text`. The loading flag is
    /// reset however the import ends, including when the future is dropped.
    pub async fn import_with<F>(&self, path: &Path, on_text: F) -> Result<(), ImportError>
    where
        F: FnOnce(String),
    {
        self.set_error(None);
        self.loading.store(true, Ordering::SeqCst);
        let guard = LoadingGuard(self.loading.clone());

        let result = self.importer.import_path(path).await;
        drop(guard);

        match result {
            Ok(text) => {
                on_text(text);
                Ok(())
            }
            Err(e) => {
                self.set_error(Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn set_error(&self, message: Option<String>) {
        *self
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = message;
    }
}
