use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::preprocess::{DocumentFormat, DocumentUnreadable};

/// Raw bytes behind a `document_ref`, with the format they are declared as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDocument {
    pub bytes: Vec<u8>,
    pub format: DocumentFormat,
}

/// Turns an opaque document reference into bytes. Storage backends plug in here.
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    async fn resolve(&self, document_ref: &str) -> Result<ResolvedDocument, DocumentUnreadable>;
}

/// Treats references as file paths, optionally relative to a root directory.
/// The format comes from the file extension; unknown extensions are read as plain text.
#[derive(Debug, Clone, Default)]
pub struct FsDocumentResolver {
    root: Option<PathBuf>,
}

impl FsDocumentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn path_for(&self, document_ref: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(document_ref),
            None => Path::new(document_ref).to_path_buf(),
        }
    }
}

#[async_trait]
impl DocumentResolver for FsDocumentResolver {
    async fn resolve(&self, document_ref: &str) -> Result<ResolvedDocument, DocumentUnreadable> {
        let path = self.path_for(document_ref);
        let bytes = tokio::fs::read(&path).await.map_err(|err| {
            DocumentUnreadable::new(format!("cannot read {}: {err}", path.display()))
        })?;
        let format = DocumentFormat::from_path(&path).unwrap_or(DocumentFormat::PlainText);
        debug!(path = %path.display(), bytes = bytes.len(), ?format, "document resolved");
        Ok(ResolvedDocument { bytes, format })
    }
}

/// In-process document store keyed by reference.
#[derive(Debug, Default)]
pub struct MemoryDocumentResolver {
    documents: RwLock<HashMap<String, ResolvedDocument>>,
}

impl MemoryDocumentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        document_ref: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        format: DocumentFormat,
    ) {
        self.documents.write().insert(
            document_ref.into(),
            ResolvedDocument {
                bytes: bytes.into(),
                format,
            },
        );
    }
}

#[async_trait]
impl DocumentResolver for MemoryDocumentResolver {
    async fn resolve(&self, document_ref: &str) -> Result<ResolvedDocument, DocumentUnreadable> {
        match self.documents.read().get(document_ref) {
            Some(document) => Ok(document.clone()),
            None => Err(DocumentUnreadable::new(format!("missing `{document_ref}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_resolver_infers_format_from_extension() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("terms.md"), "# Terms").unwrap();
        std::fs::write(temp.path().join("notes.log"), "plain").unwrap();
        let resolver = FsDocumentResolver::with_root(temp.path());

        let doc = resolver.resolve("terms.md").await.unwrap();
        assert_eq!(doc.format, DocumentFormat::Markdown);
        assert_eq!(doc.bytes, b"# Terms");

        let doc = resolver.resolve("notes.log").await.unwrap();
        assert_eq!(doc.format, DocumentFormat::PlainText);
    }

    #[tokio::test]
    async fn missing_file_is_unreadable() {
        let temp = tempfile::tempdir().unwrap();
        let err = FsDocumentResolver::with_root(temp.path())
            .resolve("absent.txt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
    }

    #[tokio::test]
    async fn memory_resolver_returns_inserted_documents() {
        let resolver = MemoryDocumentResolver::new();
        resolver.insert("doc-1", "hello", DocumentFormat::PlainText);
        assert_eq!(resolver.resolve("doc-1").await.unwrap().bytes, b"hello");
        assert!(resolver.resolve("doc-2").await.is_err());
    }
}
