use base64::Engine;
use chrono::{DateTime, Utc};

use crate::error::MailError;
use crate::model::{Attachment, EmailAddress};

/// Typed intermediate form of a fetched inbound message. All protocol-format
/// handling happens here; thread resolution and persistence only ever see
/// this struct.
#[derive(Debug, Clone)]
pub struct ParsedInbound {
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl ParsedInbound {
    pub fn from_rfc822(raw: &[u8]) -> Result<Self, MailError> {
        let parsed = mailparse::parse_mail(raw)
            .map_err(|e| MailError::Parse(format!("failed to parse message: {}", e)))?;

        let headers = &parsed.headers;
        let get_header = |name: &str| -> Option<String> {
            headers
                .iter()
                .find(|h| h.get_key().eq_ignore_ascii_case(name))
                .map(|h| h.get_value())
        };

        let subject = get_header("Subject").unwrap_or_else(|| "(No Subject)".to_string());
        let message_id = get_header("Message-ID").map(|v| normalize_message_id(&v));
        let in_reply_to = get_header("In-Reply-To").map(|v| normalize_message_id(&v));
        let references = get_header("References")
            .map(|v| parse_references(&v))
            .unwrap_or_default();

        let date = get_header("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0));

        let from = parse_address_header(get_header("From").as_deref());
        let to = parse_address_list(get_header("To").as_deref());

        let mut text = None;
        let mut html = None;
        let mut attachments = Vec::new();
        walk_mime_parts(&parsed, &mut text, &mut html, &mut attachments);

        Ok(Self {
            message_id,
            in_reply_to,
            references,
            subject,
            from,
            to,
            date,
            // Plain-text body preferred; fall back to the HTML part verbatim.
            text: text.or(html),
            attachments,
        })
    }

    /// Reference chain ordered oldest-first, In-Reply-To last, deduplicated.
    /// Resolvers scan it from the end so the most direct parent wins.
    pub fn reference_chain(&self) -> Vec<String> {
        let mut chain = self.references.clone();
        if let Some(ref irt) = self.in_reply_to {
            chain.retain(|r| r != irt);
            chain.push(irt.clone());
        }
        chain
    }
}

/// Strip angle brackets and surrounding whitespace from a Message-ID token.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

fn parse_references(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(normalize_message_id)
        .filter(|r| !r.is_empty())
        .collect()
}

fn parse_address_header(value: Option<&str>) -> EmailAddress {
    match value {
        Some(v) if !v.trim().is_empty() => match mailparse::addrparse(v) {
            Ok(addrs) => addrs
                .iter()
                .next()
                .map(|a| match a {
                    mailparse::MailAddr::Single(info) => EmailAddress {
                        name: info.display_name.clone(),
                        address: info.addr.clone(),
                    },
                    mailparse::MailAddr::Group(group) => group
                        .addrs
                        .first()
                        .map(|info| EmailAddress {
                            name: info.display_name.clone(),
                            address: info.addr.clone(),
                        })
                        .unwrap_or_default(),
                })
                .unwrap_or_default(),
            Err(_) => EmailAddress {
                name: None,
                address: v.trim().to_string(),
            },
        },
        _ => EmailAddress::default(),
    }
}

fn parse_address_list(value: Option<&str>) -> Vec<EmailAddress> {
    match value {
        Some(v) if !v.trim().is_empty() => match mailparse::addrparse(v) {
            Ok(addrs) => addrs
                .iter()
                .flat_map(|a| match a {
                    mailparse::MailAddr::Single(info) => vec![EmailAddress {
                        name: info.display_name.clone(),
                        address: info.addr.clone(),
                    }],
                    mailparse::MailAddr::Group(group) => group
                        .addrs
                        .iter()
                        .map(|info| EmailAddress {
                            name: info.display_name.clone(),
                            address: info.addr.clone(),
                        })
                        .collect(),
                })
                .collect(),
            Err(_) => vec![EmailAddress {
                name: None,
                address: v.trim().to_string(),
            }],
        },
        _ => Vec::new(),
    }
}

fn walk_mime_parts(
    part: &mailparse::ParsedMail,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
) {
    let content_type = part.ctype.mimetype.to_lowercase();

    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_mime_parts(sub, text_body, html_body, attachments);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let is_attachment = disposition.disposition == mailparse::DispositionType::Attachment;
    let is_inline_non_text = disposition.disposition == mailparse::DispositionType::Inline
        && !content_type.starts_with("text/");

    if is_attachment || is_inline_non_text {
        if let Ok(body) = part.get_body_raw() {
            let filename = disposition
                .params
                .get("filename")
                .or_else(|| part.ctype.params.get("name"))
                .cloned()
                .unwrap_or_else(|| "attachment".to_string());

            attachments.push(Attachment {
                filename,
                content_type: content_type.clone(),
                size: Some(body.len()),
                content: base64::engine::general_purpose::STANDARD.encode(&body),
            });
        }
    } else if content_type == "text/plain" && text_body.is_none() {
        *text_body = part.get_body().ok();
    } else if content_type == "text/html" && html_body.is_none() {
        *html_body = part.get_body().ok();
    }
}
