pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod imap;
pub mod poller;
pub mod smtp;

pub use api::{EmailApi, ListQuery, PatchRequest, RateLimiter};
pub use config::{ImapConfig, SmtpConfig};
pub use connection::ConnectionManager;
pub use dispatcher::{DeliveryReceipt, Dispatcher, RetryPolicy};
pub use imap::{ImapInbox, InboundSource, RawInbound};
pub use poller::{PollOutcome, Poller};
pub use smtp::{OutboundTransport, OutgoingMail, SmtpOutbound};
