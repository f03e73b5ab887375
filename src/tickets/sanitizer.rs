use scraper::{ElementRef, Html, Node};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SanitizedHtml {
    pub safe_html: String,
    pub plain_text: String,
    pub has_content: bool,
    pub has_image: bool,
}

impl SanitizedHtml {
    /// Worth persisting as a reply.
    pub fn is_meaningful(&self) -> bool {
        self.has_content || self.has_image
    }
}

pub trait HtmlSanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> SanitizedHtml;
}

const ALLOWED_TAGS: &[&str] = &[
    "a", "b", "blockquote", "br", "code", "div", "em", "h1", "h2", "h3", "h4", "h5", "h6", "hr",
    "i", "img", "li", "ol", "p", "pre", "s", "span", "strong", "table", "tbody", "td", "th",
    "thead", "tr", "u", "ul",
];

/// Dropped together with everything inside them.
const STRIPPED_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "head", "title", "noscript", "template",
];

const VOID_TAGS: &[&str] = &["br", "hr", "img"];

const BLOCK_TAGS: &[&str] = &[
    "blockquote", "br", "div", "h1", "h2", "h3", "h4", "h5", "h6", "hr", "li", "p", "pre", "tr",
];

fn allowed_attribute(tag: &str, attr: &str) -> bool {
    matches!(
        (tag, attr),
        ("a", "href" | "title")
            | ("img", "src" | "alt" | "width" | "height")
            | ("td" | "th", "colspan" | "rowspan")
    )
}

fn allowed_url(attr: &str, value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    match attr {
        "href" => ["http://", "https://", "mailto:"]
            .iter()
            .any(|p| lower.starts_with(p)),
        "src" => ["http://", "https://", "data:image/", "cid:"]
            .iter()
            .any(|p| lower.starts_with(p)),
        _ => true,
    }
}

/// Allow-list sanitizer: unknown tags are unwrapped, dangerous ones removed.
#[derive(Debug, Default, Clone)]
pub struct AllowlistSanitizer;

impl AllowlistSanitizer {
    pub fn new() -> Self {
        Self
    }
}

impl HtmlSanitizer for AllowlistSanitizer {
    fn sanitize(&self, html: &str) -> SanitizedHtml {
        let fragment = Html::parse_fragment(html);
        let mut out = Output::default();
        walk(fragment.root_element(), &mut out);

        let plain_text = collapse_whitespace(&out.text);
        SanitizedHtml {
            safe_html: out.html.trim().to_string(),
            has_content: !plain_text.is_empty(),
            has_image: out.has_image,
            plain_text,
        }
    }
}

#[derive(Default)]
struct Output {
    html: String,
    text: String,
    has_image: bool,
}

fn walk(element: ElementRef<'_>, out: &mut Output) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let text: &str = text;
                out.html.push_str(&escape(text));
                out.text.push_str(text);
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    emit_element(child, out);
                }
            }
            _ => {}
        }
    }
}

fn emit_element(element: ElementRef<'_>, out: &mut Output) {
    let tag = element.value().name().to_ascii_lowercase();
    if STRIPPED_TAGS.contains(&tag.as_str()) {
        return;
    }
    if !ALLOWED_TAGS.contains(&tag.as_str()) {
        walk(element, out);
        return;
    }

    let mut attrs = String::new();
    let mut has_src = false;
    for (name, value) in element.value().attrs() {
        let name = name.to_ascii_lowercase();
        if !allowed_attribute(&tag, &name) || !allowed_url(&name, value) {
            continue;
        }
        has_src |= name == "src";
        attrs.push_str(&format!(" {}=\"{}\"", name, escape(value)));
    }

    if tag == "img" {
        if !has_src {
            return;
        }
        out.has_image = true;
    }

    out.html.push_str(&format!("<{tag}{attrs}>"));
    if VOID_TAGS.contains(&tag.as_str()) {
        if BLOCK_TAGS.contains(&tag.as_str()) {
            out.text.push('\n');
        }
        return;
    }
    walk(element, out);
    out.html.push_str(&format!("</{tag}>"));
    if BLOCK_TAGS.contains(&tag.as_str()) {
        out.text.push('\n');
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Collapses runs of spaces inside lines and drops blank lines.
fn collapse_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
