//! Image references in model answers.

use std::sync::LazyLock;

use regex::Regex;

static IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://[^\s)]+\.(?:png|jpg|jpeg|gif|webp|svg)(?:\?[^\s)]*)?")
        .expect("image URL pattern is valid")
});

/// Answer text with bare image URLs turned into markdown images, plus every
/// image URL in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedImages {
    pub text: String,
    pub images: Vec<String>,
}

/// Find image URLs in `text`.
///
/// A URL that already sits inside markdown link syntax (`](` right before it)
/// is kept as is; a bare URL is replaced by a clickable image block.
#[must_use]
pub fn extract_images(text: &str) -> ExtractedImages {
    let mut out = String::with_capacity(text.len());
    let mut images: Vec<String> = Vec::new();
    let mut last = 0;

    for m in IMAGE_URL.find_iter(text) {
        let url = m.as_str();
        out.push_str(&text[last..m.start()]);

        if text[..m.start()].ends_with("](") {
            out.push_str(url);
        } else {
            out.push_str("\n\n📸 **Click image to view full size:**\n\n![Generated Image](");
            out.push_str(url);
            out.push_str(")\n\n");
        }
        last = m.end();

        if !images.iter().any(|seen| seen == url) {
            images.push(url.to_string());
        }
    }
    out.push_str(&text[last..]);

    ExtractedImages { text: out, images }
}
