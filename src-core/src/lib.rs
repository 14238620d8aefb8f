pub mod attachments;
pub mod error;
pub mod model;
pub mod parse;
pub mod store;
pub mod threading;

pub use attachments::AttachmentPolicy;
pub use error::MailError;
pub use model::{Attachment, EmailAddress, Message, MessageStatus};
pub use parse::ParsedInbound;
pub use store::{MemoryStore, MessageStore, SortField, SortOrder};
