use crate::error::LedgerError;
use serde::{Deserialize, Serialize};

pub const MAX_DOCUMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Reference to a blob held by the document store. Content is never read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofDocument {
    pub url: String,
    pub mimetype: String,
    pub size_bytes: u64,
}

impl ProofDocument {
    pub fn new(url: impl Into<String>, mimetype: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            url: url.into(),
            mimetype: mimetype.into(),
            size_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentPolicy {
    pub max_bytes: u64,
    pub allowed_mimetypes: Vec<String>,
}

impl Default for DocumentPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_DOCUMENT_BYTES,
            allowed_mimetypes: ["image/jpeg", "image/png", "image/webp", "application/pdf"]
                .iter()
                .map(|value| value.to_string())
                .collect(),
        }
    }
}

impl DocumentPolicy {
    pub fn validate(&self, document: &ProofDocument) -> Result<(), LedgerError> {
        if document.url.trim().is_empty() {
            return Err(LedgerError::Validation("document url is required".to_string()));
        }
        if document.size_bytes == 0 || document.size_bytes > self.max_bytes {
            return Err(LedgerError::Validation(format!(
                "document '{}' size {} bytes outside 1..={}",
                document.url, document.size_bytes, self.max_bytes
            )));
        }
        let mimetype = document.mimetype.to_ascii_lowercase();
        if !self.allowed_mimetypes.iter().any(|allowed| *allowed == mimetype) {
            return Err(LedgerError::Validation(format!(
                "document '{}' has unsupported mimetype '{}'",
                document.url, document.mimetype
            )));
        }
        Ok(())
    }

    pub fn validate_all(&self, documents: &[ProofDocument], required: bool) -> Result<(), LedgerError> {
        if required && documents.is_empty() {
            return Err(LedgerError::Validation(
                "at least one proof document is required".to_string(),
            ));
        }
        documents.iter().try_for_each(|document| self.validate(document))
    }
}
