use crate::error::MailError;
use crate::model::Attachment;

pub const DEFAULT_MAX_COUNT: usize = 10;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 25 * 1024 * 1024;

/// What a quote tool mails out: offers, scans, product sheets.
pub const DEFAULT_ALLOWED_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "text/plain",
    "text/csv",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Attachment constraints checked before any network or persistence
/// activity. Pure and synchronous.
#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    pub max_count: usize,
    pub max_attachment_bytes: usize,
    pub max_total_bytes: usize,
    pub allowed_types: Vec<String>,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            allowed_types: DEFAULT_ALLOWED_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AttachmentPolicy {
    /// Returns the first violated constraint, naming it.
    pub fn validate(&self, attachments: &[Attachment]) -> Result<(), MailError> {
        if attachments.len() > self.max_count {
            return Err(MailError::Validation(format!(
                "too many attachments: {} (max {})",
                attachments.len(),
                self.max_count
            )));
        }

        let mut total = 0usize;
        for attachment in attachments {
            let content_type = normalize_content_type(&attachment.content_type);
            if !self.allowed_types.iter().any(|t| t == &content_type) {
                return Err(MailError::Validation(format!(
                    "attachment '{}' has disallowed content type '{}'",
                    attachment.filename, content_type
                )));
            }

            let size = attachment.effective_size();
            if size > self.max_attachment_bytes {
                return Err(MailError::Validation(format!(
                    "attachment '{}' is {} bytes (max {} per attachment)",
                    attachment.filename, size, self.max_attachment_bytes
                )));
            }
            total += size;
        }

        if total > self.max_total_bytes {
            return Err(MailError::Validation(format!(
                "attachments total {} bytes (max {})",
                total, self.max_total_bytes
            )));
        }

        Ok(())
    }
}

/// Lowercase and strip parameters, e.g. `Text/Plain; charset=utf-8`.
fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or(raw)
        .trim()
        .to_ascii_lowercase()
}
