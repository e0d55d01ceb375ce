//! Banner composition: gradient background, generated image, tagline.
//!
//! Banners are SVG documents so they can be composed without a raster
//! pipeline. The generated image is embedded as a base64 data URI.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use streamdigest_ingest::escape_html;
use streamdigest_providers::GeneratedImage;
use streamdigest_shared::BannerArtifact;

pub const SVG_MEDIA_TYPE: &str = "image/svg+xml";

/// Purple gradient pairs, cycled by candidate index.
const GRADIENTS: [((u8, u8, u8), (u8, u8, u8)); 3] = [
    ((59, 16, 142), (139, 69, 185)),
    ((45, 12, 108), (103, 51, 154)),
    ((75, 20, 180), (150, 80, 200)),
];

const TEXT_X: u32 = 80;
const IMAGE_MARGIN: u32 = 15;

/// Compose banner candidate `index`. Without an image only the gradient and
/// the tagline are drawn.
pub fn compose_banner(
    tagline: &str,
    image: Option<&GeneratedImage>,
    index: usize,
    width: u32,
    height: u32,
) -> BannerArtifact {
    let ((r1, g1, b1), (r2, g2, b2)) = GRADIENTS[index % GRADIENTS.len()];
    let gradient_id = format!("bg{index}");

    let mut svg = String::with_capacity(1024);
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    ));
    svg.push_str(&format!(
        r#"<defs><linearGradient id="{gradient_id}" x1="0" y1="0" x2="1" y2="0"><stop offset="0" stop-color="rgb({r1},{g1},{b1})"/><stop offset="1" stop-color="rgb({r2},{g2},{b2})"/></linearGradient></defs>"#
    ));
    svg.push_str(&format!(
        r#"<rect width="{width}" height="{height}" fill="url(#{gradient_id})"/>"#
    ));

    if let Some(image) = image {
        // Right side, slightly below centre.
        let img_w = width * 55 / 100;
        let img_h = height * 95 / 100;
        let x = width.saturating_sub(img_w + IMAGE_MARGIN);
        let y = (height - img_h) / 2 + IMAGE_MARGIN;
        svg.push_str(&format!(
            r#"<image x="{x}" y="{y}" width="{img_w}" height="{img_h}" preserveAspectRatio="xMidYMid meet" href="data:{};base64,{}"/>"#,
            image.media_type,
            BASE64.encode(&image.bytes)
        ));
    }

    let font_size = if height <= 350 { 28 } else { 30 };
    let text_y = (height / 2).saturating_sub(50);
    let (text_x, anchor, line_width) = if image.is_some() {
        let line_width = if tagline.chars().count() > 20 { 10 } else { 13 };
        (TEXT_X, "start", line_width)
    } else {
        (width / 2, "middle", 24)
    };

    svg.push_str(&format!(
        r##"<text x="{text_x}" y="{text_y}" fill="#ffffff" font-family="Helvetica, Arial, sans-serif" font-weight="bold" font-size="{font_size}" text-anchor="{anchor}">"##
    ));
    for (i, line) in wrap_words(tagline, line_width).iter().enumerate() {
        let dy = if i == 0 { "0" } else { "1.2em" };
        svg.push_str(&format!(
            r#"<tspan x="{text_x}" dy="{dy}">{}</tspan>"#,
            escape_html(line)
        ));
    }
    svg.push_str("</text></svg>");

    BannerArtifact {
        media_type: SVG_MEDIA_TYPE.to_string(),
        bytes: svg.into_bytes(),
    }
}

/// Greedy word wrap. Words are never split, so a long word gets its own line.
fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
