use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use mailparse::{
    addrparse_header, dateparse, parse_mail, DispositionType, MailAddr, MailHeader, MailHeaderMap,
    ParsedMail,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::core::error::{CoreError, CoreResult};
use crate::tickets::{InboundAttachment, InboundMessage};

static MESSAGE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^<>\s]+>").expect("valid message id regex"));

/// One address header, raw and split into bare addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressList {
    pub raw: String,
    /// Lowercased.
    pub addresses: Vec<String>,
}

impl AddressList {
    pub fn address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for address in &self.addresses {
            if let Some((_, domain)) = address.rsplit_once('@') {
                if !domain.is_empty() && !domains.iter().any(|d| d == domain) {
                    domains.push(domain.to_string());
                }
            }
        }
        domains
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub subject: String,
    pub from: AddressList,
    pub to: AddressList,
    pub cc: AddressList,
    pub bcc: AddressList,
    pub reply_to: AddressList,
    pub sender: AddressList,
    pub message_id: Option<String>,
    /// `In-Reply-To` then `References`, deduplicated in order.
    pub references: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// Preferred HTML body with `cid:` images inlined; plain text is escaped into HTML.
    pub body_html: String,
    pub body_text: String,
    /// Lowercased header names; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<InboundAttachment>,
}

impl ParsedEmail {
    pub fn into_inbound(self) -> InboundMessage {
        InboundMessage {
            subject: self.subject,
            from: self.from.address().unwrap_or_default().to_string(),
            body_html: self.body_html,
            message_id: self.message_id,
            references: self.references,
            cc: self.cc.addresses,
            date: self.date,
            attachments: self.attachments,
        }
    }
}

struct InlineImage {
    content_id: String,
    mimetype: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct Collected {
    html: Option<String>,
    text: Option<String>,
    inline: Vec<InlineImage>,
    attachments: Vec<InboundAttachment>,
}

/// Parses a raw RFC 822 message. Inline images larger than `inline_limit` bytes stay as `cid:` links.
pub fn parse_message(raw: &[u8], inline_limit: usize) -> CoreResult<ParsedEmail> {
    let parsed = parse_mail(raw)
        .map_err(|e| CoreError::validation(format!("Failed to parse email: {}", e)))?;

    let headers = &parsed.headers;
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|v| message_ids(&v).into_iter().next());

    let mut references = Vec::new();
    for name in ["In-Reply-To", "References"] {
        for value in headers.get_all_values(name) {
            for id in message_ids(&value) {
                if !references.contains(&id) {
                    references.push(id);
                }
            }
        }
    }

    let date = headers
        .get_first_value("Date")
        .and_then(|v| dateparse(&v).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    let mut header_map: BTreeMap<String, String> = BTreeMap::new();
    for header in headers.iter() {
        let key = header.get_key().to_lowercase();
        let value = header.get_value();
        header_map
            .entry(key)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let mut collected = Collected::default();
    collect_parts(&parsed, &mut collected);

    let body_text = collected.text.clone().unwrap_or_default();
    let body_html = match collected.html {
        Some(html) => inline_images(html, &collected.inline, inline_limit),
        None => text_to_html(&body_text),
    };

    Ok(ParsedEmail {
        subject,
        from: address_list(headers, "From"),
        to: address_list(headers, "To"),
        cc: address_list(headers, "Cc"),
        bcc: address_list(headers, "Bcc"),
        reply_to: address_list(headers, "Reply-To"),
        sender: address_list(headers, "Sender"),
        message_id,
        references,
        date,
        body_html,
        body_text,
        headers: header_map,
        attachments: collected.attachments,
    })
}

fn collect_parts(part: &ParsedMail<'_>, out: &mut Collected) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, out);
        }
        return;
    }

    let mimetype = part.ctype.mimetype.to_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    if disposition.disposition == DispositionType::Attachment {
        match part.get_body_raw() {
            Ok(data) => out.attachments.push(InboundAttachment {
                filename: filename.unwrap_or_else(|| "attachment".to_string()),
                content_type: mimetype,
                data,
            }),
            Err(e) => warn!("Skipping undecodable attachment: {}", e),
        }
        return;
    }

    if mimetype.starts_with("image/") {
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|cid| cid.trim().trim_start_matches('<').trim_end_matches('>').to_string());
        match (content_id, part.get_body_raw()) {
            (Some(content_id), Ok(data)) if !content_id.is_empty() => out.inline.push(InlineImage {
                content_id,
                mimetype,
                data,
            }),
            (_, Ok(data)) if filename.is_some() => out.attachments.push(InboundAttachment {
                filename: filename.unwrap_or_default(),
                content_type: mimetype,
                data,
            }),
            _ => debug!("Dropping unreferenced inline image part"),
        }
        return;
    }

    match mimetype.as_str() {
        "text/html" if out.html.is_none() => out.html = part.get_body().ok(),
        "text/plain" if out.text.is_none() => out.text = part.get_body().ok(),
        _ => {
            if let Some(filename) = filename {
                if let Ok(data) = part.get_body_raw() {
                    out.attachments.push(InboundAttachment {
                        filename,
                        content_type: mimetype,
                        data,
                    });
                }
            }
        }
    }
}

fn inline_images(mut html: String, images: &[InlineImage], limit: usize) -> String {
    for image in images {
        let reference = format!("cid:{}", image.content_id);
        if !html.contains(&reference) {
            continue;
        }
        if image.data.len() > limit {
            warn!(
                "Inline image {} is {} bytes, over the {} byte limit",
                image.content_id,
                image.data.len(),
                limit
            );
            continue;
        }
        let uri = format!("data:{};base64,{}", image.mimetype, BASE64.encode(&image.data));
        html = html.replace(&reference, &uri);
    }
    html
}

fn address_list(headers: &[MailHeader<'_>], name: &str) -> AddressList {
    let mut list = AddressList::default();
    for header in headers.iter().filter(|h| h.get_key().eq_ignore_ascii_case(name)) {
        let value = header.get_value();
        if !list.raw.is_empty() {
            list.raw.push_str(", ");
        }
        list.raw.push_str(value.trim());

        match addrparse_header(header) {
            Ok(parsed) => {
                for addr in parsed.iter() {
                    match addr {
                        MailAddr::Single(info) => push_address(&mut list.addresses, &info.addr),
                        MailAddr::Group(group) => {
                            for info in &group.addrs {
                                push_address(&mut list.addresses, &info.addr);
                            }
                        }
                    }
                }
            }
            Err(e) => debug!("Unparseable {} header {:?}: {}", name, value, e),
        }
    }
    list
}

fn push_address(addresses: &mut Vec<String>, addr: &str) {
    let addr = addr.trim().to_lowercase();
    if !addr.is_empty() && !addresses.contains(&addr) {
        addresses.push(addr);
    }
}

/// Bracketed ids from a header value; a bare value counts as one id.
pub fn message_ids(value: &str) -> Vec<String> {
    let found: Vec<String> = MESSAGE_ID_RE
        .find_iter(value)
        .map(|m| m.as_str().to_string())
        .collect();
    if !found.is_empty() {
        return found;
    }
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        Vec::new()
    } else {
        vec![trimmed.to_string()]
    }
}

fn text_to_html(text: &str) -> String {
    let mut html = String::with_capacity(text.len());
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            html.push_str("<br>\n");
        }
        for c in line.chars() {
            match c {
                '&' => html.push_str("&amp;"),
                '<' => html.push_str("&lt;"),
                '>' => html.push_str("&gt;"),
                '"' => html.push_str("&quot;"),
                _ => html.push(c),
            }
        }
    }
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = "From: Alice Example <Alice@Acme.example>\r\n\
To: support@desk.example\r\n\
Cc: bob@acme.example, \"Support\" <support@desk.example>\r\n\
Subject: =?UTF-8?Q?Printer_down_=E2=9C=97?=\r\n\
Message-ID: <m2@acme.example>\r\n\
In-Reply-To: <m1@x>\r\n\
References: <m0@x> <m1@x>\r\n\
Date: Wed, 01 May 2024 10:00:00 +0000\r\n\
X-Priority: 1\r\n\
\r\n\
Still broken <again>\r\n\
second line\r\n";

    #[test]
    fn test_plain_message_headers_and_body() {
        let email = parse_message(PLAIN.as_bytes(), 1024).unwrap();
        assert_eq!(email.subject, "Printer down \u{2717}");
        assert_eq!(email.from.address(), Some("alice@acme.example"));
        assert_eq!(email.from.domains(), vec!["acme.example".to_string()]);
        assert_eq!(email.cc.addresses, vec!["bob@acme.example", "support@desk.example"]);
        assert_eq!(email.message_id.as_deref(), Some("<m2@acme.example>"));
        assert_eq!(email.references, vec!["<m1@x>", "<m0@x>"]);
        assert_eq!(email.date.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(email.headers.get("x-priority").map(String::as_str), Some("1"));
        assert_eq!(email.body_html, "Still broken &lt;again&gt;<br>\nsecond line");
        assert!(email.attachments.is_empty());
    }

    #[test]
    fn test_html_preferred_with_inline_cid_and_attachment() {
        let raw = "From: alice@acme.example\r\n\
Subject: Screens\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/related; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain body\r\n\
--inner\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>See <img src=\"cid:shot1\"></p>\r\n\
--inner\r\n\
Content-Type: image/png\r\n\
Content-ID: <shot1>\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8=\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--outer--\r\n";

        let email = parse_message(raw.as_bytes(), 1024).unwrap();
        assert_eq!(email.body_text.trim(), "plain body");
        assert!(email
            .body_html
            .contains("<img src=\"data:image/png;base64,aGVsbG8=\">"));
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "report.pdf");
        assert_eq!(email.attachments[0].content_type, "application/pdf");
        assert_eq!(email.attachments[0].data, b"%PDF-".to_vec());

        let capped = parse_message(raw.as_bytes(), 2).unwrap();
        assert!(capped.body_html.contains("cid:shot1"));
    }

    #[test]
    fn test_message_ids() {
        assert_eq!(message_ids("<a@x>  <b@y>"), vec!["<a@x>", "<b@y>"]);
        assert_eq!(message_ids(" bare@id "), vec!["bare@id"]);
        assert!(message_ids("not an id").is_empty());
    }

    #[test]
    fn test_into_inbound_uses_first_sender() {
        let inbound = parse_message(PLAIN.as_bytes(), 1024).unwrap().into_inbound();
        assert_eq!(inbound.from, "alice@acme.example");
        assert_eq!(inbound.references.len(), 2);
        assert_eq!(inbound.cc.len(), 2);
    }
}
