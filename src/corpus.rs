//! Corpus loading: directory scan plus PDF text extraction.
//!
//! Scans the configured corpus directory for matching files (default
//! `**/*.pdf`), extracts plain text from each, and returns [`Document`]s in
//! deterministic path order. A file whose text cannot be extracted is
//! skipped with a warning; an unreadable corpus is an error.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::models::Document;

/// Corpus-level failures that prevent indexing from starting.
#[derive(Debug)]
pub enum CorpusError {
    /// The corpus directory does not exist.
    NotFound(String),
    /// The directory exists but contains no files matching the include globs.
    EmptyCorpus(String),
}

impl std::fmt::Display for CorpusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorpusError::NotFound(dir) => write!(f, "corpus directory not found: {}", dir),
            CorpusError::EmptyCorpus(dir) => {
                write!(f, "no matching documents found in corpus directory: {}", dir)
            }
        }
    }
}

impl std::error::Error for CorpusError {}

/// Scan the corpus directory and extract text from every matching file.
pub fn load_corpus(config: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &config.dir;
    if !root.exists() {
        return Err(CorpusError::NotFound(root.display().to_string()).into());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut paths: Vec<std::path::PathBuf> = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if include_set.is_match(relative.to_string_lossy().as_ref()) {
            paths.push(path.to_path_buf());
        }
    }

    if paths.is_empty() {
        return Err(CorpusError::EmptyCorpus(root.display().to_string()).into());
    }

    // Sort for deterministic ordering
    paths.sort();

    let mut documents = Vec::new();
    for path in &paths {
        let relative = path.strip_prefix(root).unwrap_or(path);
        match extract_document(path, &relative.to_string_lossy()) {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                tracing::warn!("skipping {}: {}", path.display(), e);
            }
        }
    }

    Ok(documents)
}

fn extract_document(path: &Path, relative: &str) -> Result<Document> {
    let bytes = std::fs::read(path)?;
    let text = extract_pdf_text(&bytes)?;
    Ok(Document {
        path: relative.to_string(),
        text,
    })
}

/// Extract plain text from PDF bytes.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| anyhow::anyhow!("PDF extraction failed: {}", e))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus_config(dir: &Path) -> CorpusConfig {
        CorpusConfig {
            dir: dir.to_path_buf(),
            include_globs: vec!["**/*.pdf".to_string()],
        }
    }

    /// Minimal valid PDF containing the given phrase. Builds the body then
    /// an xref with correct byte offsets so pdf-extract can parse it.
    fn minimal_pdf_with_phrase(phrase: &str) -> Vec<u8> {
        let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET\n", phrase);
        let mut out = Vec::new();
        out.extend_from_slice(b"%PDF-1.4\n");
        let o1 = out.len();
        out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        let o2 = out.len();
        out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
        let o3 = out.len();
        out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
        let o4 = out.len();
        out.extend_from_slice(
            format!("4 0 obj << /Length {} >> stream\n{}endstream endobj\n", stream.len(), stream)
                .as_bytes(),
        );
        let o5 = out.len();
        out.extend_from_slice(
            b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
        );
        let xref_start = out.len();
        out.extend_from_slice(b"xref\n0 6\n");
        out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
        for offset in [o1, o2, o3, o4, o5] {
            out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
        out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
        out.extend_from_slice(b"%%EOF\n");
        out
    }

    #[test]
    fn missing_directory_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let config = corpus_config(&tmp.path().join("nope"));
        let err = load_corpus(&config).unwrap_err();
        assert!(err.downcast_ref::<CorpusError>().is_some());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn directory_without_pdfs_is_empty_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "not a pdf").unwrap();
        let config = corpus_config(tmp.path());
        let err = load_corpus(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CorpusError>(),
            Some(CorpusError::EmptyCorpus(_))
        ));
    }

    #[test]
    fn loads_pdf_text_in_path_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("b.pdf"),
            minimal_pdf_with_phrase("section two"),
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("a.pdf"),
            minimal_pdf_with_phrase("section one"),
        )
        .unwrap();

        let docs = load_corpus(&corpus_config(tmp.path())).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].path, "a.pdf");
        assert!(docs[0].text.contains("section one"));
        assert!(docs[1].text.contains("section two"));
    }

    #[test]
    fn unparseable_pdf_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.pdf"), b"not a pdf").unwrap();
        std::fs::write(
            tmp.path().join("good.pdf"),
            minimal_pdf_with_phrase("rent is deductible"),
        )
        .unwrap();

        let docs = load_corpus(&corpus_config(tmp.path())).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "good.pdf");
    }
}
