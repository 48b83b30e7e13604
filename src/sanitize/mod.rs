use html2text::from_read;
use mailparse::{DispositionType, ParsedMail};

const WRAP_WIDTH: usize = 80;

/// A message body reduced to what the reader shows.
#[derive(Debug)]
pub struct RenderedBody {
    pub text: String,
    pub attachments: Vec<String>,
}

impl RenderedBody {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Parse a raw RFC 822 message and render its readable part.
///
/// Never fails: unparseable input comes back as lossy UTF-8.
pub fn render_message(raw: &[u8]) -> RenderedBody {
    match mailparse::parse_mail(raw) {
        Ok(parsed) => RenderedBody {
            text: extract_text(&parsed).unwrap_or_else(|| String::from_utf8_lossy(raw).to_string()),
            attachments: attachment_names(&parsed),
        },
        Err(_) => RenderedBody {
            text: String::from_utf8_lossy(raw).to_string(),
            attachments: Vec::new(),
        },
    }
}

pub fn render_plain_text(raw: &[u8]) -> String {
    render_message(raw).text
}

/// Decode RFC 2047 encoded words (`=?UTF-8?Q?...?=`) in a header value.
pub fn decode_mime_header(header: &str) -> Option<String> {
    let line = format!("Subject: {header}");
    mailparse::parse_header(line.as_bytes())
        .ok()
        .map(|(h, _)| h.get_value())
}

fn part_text(part: &ParsedMail) -> Option<String> {
    match part.get_body() {
        Ok(body) => Some(body),
        Err(_) => part
            .get_body_raw()
            .ok()
            .map(|raw| String::from_utf8_lossy(&raw).to_string()),
    }
}

/// First text/plain leaf wins; otherwise the first text/html leaf rendered
/// to plain text.
fn extract_text(parsed: &ParsedMail) -> Option<String> {
    if let Some(plain) = find_leaf(parsed, "text/plain") {
        return part_text(plain);
    }
    if let Some(html) = find_leaf(parsed, "text/html") {
        return part_text(html).map(|h| html_to_text(h.as_bytes()));
    }
    if parsed.subparts.is_empty() {
        return part_text(parsed);
    }
    None
}

fn find_leaf<'a>(parsed: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        let is_attachment =
            parsed.get_content_disposition().disposition == DispositionType::Attachment;
        return (!is_attachment && parsed.ctype.mimetype.eq_ignore_ascii_case(mimetype))
            .then_some(parsed);
    }
    parsed
        .subparts
        .iter()
        .find_map(|part| find_leaf(part, mimetype))
}

fn attachment_names(parsed: &ParsedMail) -> Vec<String> {
    let mut out = Vec::new();
    collect_attachments(parsed, &mut out);
    out
}

fn collect_attachments(part: &ParsedMail, out: &mut Vec<String>) {
    let disposition = part.get_content_disposition();
    if disposition.disposition == DispositionType::Attachment {
        let name = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| part.ctype.mimetype.clone());
        out.push(name);
    }
    for sub in &part.subparts {
        collect_attachments(sub, out);
    }
}

fn html_to_text(html: &[u8]) -> String {
    from_read(html, WRAP_WIDTH).unwrap_or_default()
}
