use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, html};

/// Schemes a link or image in an answer may point at.
const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "mailto"];

/// Render an answer to HTML for the chat widget.
///
/// Raw HTML in the answer is shown as text, never injected. Link and image
/// targets outside `http`, `https` and `mailto` (or relative) become `#`.
#[must_use]
pub fn render_markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(text, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: safe_url(dest_url),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Image {
            link_type,
            dest_url: safe_url(dest_url),
            title,
            id,
        }),
        other => other,
    });

    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

fn safe_url(url: CowStr<'_>) -> CowStr<'_> {
    // Browsers ignore whitespace and control characters inside a scheme.
    let compact: String = url
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();

    let scheme_end = compact.find(':');
    let path_start = compact.find(['/', '?', '#']);
    let scheme = match (scheme_end, path_start) {
        (Some(colon), Some(path)) if path < colon => None,
        (Some(colon), _) => Some(&compact[..colon]),
        (None, _) => None,
    };

    match scheme {
        None => url,
        Some(s) if ALLOWED_SCHEMES.iter().any(|a| s.eq_ignore_ascii_case(a)) => url,
        Some(_) => CowStr::Borrowed("#"),
    }
}
