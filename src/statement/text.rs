//! Bounded PDF text extraction.
//!
//! `pdf-extract` can panic or spin on malformed documents. Extraction runs on
//! its own thread; a panic, an error, an empty result or a missed deadline all
//! come back as [`IngestError::DocumentUnreadable`].

use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::errors::{IngestError, Result};

/// PDF magic bytes
const PDF_MAGIC: &[u8] = b"%PDF";
/// Maximum PDF file size (100 MB)
const MAX_PDF_SIZE: usize = 100 * 1024 * 1024;

fn validate_pdf(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.len() < 8 {
        return Err("file too small for a PDF".to_string());
    }
    if bytes.len() > MAX_PDF_SIZE {
        return Err(format!(
            "PDF too large ({} MB, maximum {} MB)",
            bytes.len() / (1024 * 1024),
            MAX_PDF_SIZE / (1024 * 1024)
        ));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err("missing PDF header".to_string());
    }
    Ok(())
}

/// Extract the text layer of a PDF within `timeout`.
pub fn extract_text(path: &Path, timeout: Duration) -> Result<String> {
    let unreadable = |reason: String| IngestError::DocumentUnreadable { path: path.to_path_buf(), reason };

    let bytes = std::fs::read(path)?;
    validate_pdf(&bytes).map_err(unreadable)?;

    let (tx, rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("pdf-extract".to_string())
        .spawn(move || {
            let result = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| e.to_string());
            // the receiver is gone once the deadline has passed
            let _ = tx.send(result);
        })?;

    let text = match rx.recv_timeout(timeout) {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return Err(unreadable(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            log::warn!("PDF extraction of {} exceeded {:?}, abandoning worker", path.display(), timeout);
            return Err(unreadable(format!("extraction timed out after {}s", timeout.as_secs())));
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = worker.join();
            return Err(unreadable("extraction panicked".to_string()));
        }
    };

    if text.trim().is_empty() {
        return Err(unreadable("no text layer".to_string()));
    }
    log::debug!("Extracted {} characters from {}", text.len(), path.display());
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_pdf() {
        assert!(validate_pdf(b"%PDF-1.7 ....").is_ok());
        assert!(validate_pdf(b"%PDF").is_err());
        assert!(validate_pdf(b"PK\x03\x04 not a pdf").is_err());
    }

    #[test]
    fn test_non_pdf_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("releve.pdf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"this is plain text, not a pdf").unwrap();

        let err = extract_text(&path, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.code(), "document_unreadable");
    }

    #[test]
    fn test_missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_text(&dir.path().join("absent.pdf"), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), "io");
    }
}
