//! Prompt construction and output cleanup for generated artifacts.

use std::sync::LazyLock;

use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;

use streamdigest_shared::{ArtifactType, ContentItem, DateRange, PromptParams};

pub const TAGLINE_SYSTEM: &str = "You are an expert copywriter specializing in concise, \
engaging marketing copy. Your task is to generate short and compelling banner taglines for a \
streaming newsletter that highlights shows and movies for the upcoming week.";

pub const INTRO_SYSTEM: &str =
    "You are an expert copywriter specializing in concise, engaging marketing copy for streaming newsletters.";

const TAGLINE_BASE_TEMPERATURE: f32 = 0.8;
const INTRO_BASE_TEMPERATURE: f32 = 0.7;
const MAX_TEMPERATURE: f32 = 2.0;

const TAGLINE_MAX_TOKENS: u32 = 30;
const INTRO_MAX_TOKENS: u32 = 120;

/// Square size requested from the image service.
pub const BANNER_IMAGE_SIZE: u32 = 512;

const MAX_HIGHLIGHTS: usize = 3;

const SHIRT_COLORS: [&str; 7] = ["yellow", "green", "black", "blue", "orange", "red", "pink"];
const SUBJECTS: [&str; 2] = ["man", "woman"];
const ACTIVITIES: [&str; 3] = [
    "holding a bowl of popcorn",
    "holding a bowl of nachos",
    "holding a tv remote as if changing the channel",
];

/// Tagline prompt: mentions the month of the range and a few featured titles.
pub fn tagline_params(range: &DateRange, items: &[ContentItem], version: &str) -> PromptParams {
    let month = range.start.format("%B");
    let highlights: Vec<&str> = items
        .iter()
        .map(|i| i.title.as_str())
        .take(MAX_HIGHLIGHTS)
        .collect();
    let highlights = if highlights.is_empty() {
        String::new()
    } else {
        format!("\nFeatured shows include: {}", highlights.join(", "))
    };

    let prompt = format!(
        "Generate a short and engaging banner tagline for a streaming newsletter highlighting \
shows and movies for the upcoming week{highlights}.

The tagline should be concise (maximum 4-5 words), exciting, and relevant to new releases. \
It should create anticipation and align with past examples like:
1. Your streaming spree for {month}.
2. Catch up on this week's releases.
3. Stream this week's best picks.

Generate exactly ONE tagline. Do not include numbering, quotes, or any explanation. Just the tagline text."
    );

    PromptParams {
        system: Some(TAGLINE_SYSTEM.to_string()),
        prompts: vec![prompt],
        version: version.to_string(),
    }
}

/// Intro prompt. Deliberately generic: no show names.
pub fn intro_params(version: &str) -> PromptParams {
    let prompt = "Generate a short and engaging streaming newsletter body introduction in maximum \
of two lines (one small paragraph).

The tone should be exciting and inviting, highlighting how users can stream the latest shows and \
movies from anywhere, ensuring they never miss out on global content. Keep it concise and \
action-driven, encouraging users to click 'Watch Now' for seamless access.

Use variations like:
- \"Unlock endless entertainment! Stream the latest shows and movies from anywhere, ensuring you \
never miss out on global content. Click 'Watch Now' for seamless access!\"
- \"Never miss out on the hottest releases this week! Stream anywhere and enjoy global content \
effortlessly. Click 'Watch Now' and dive into a world of entertainment.\"
- \"Get ready for your weekly dose of entertainment! Access the latest releases from anywhere in \
the world. Click 'Watch Now' to start streaming!\"

Generate exactly ONE body text that is generic and does NOT mention any specific show names. \
Do not include numbering, quotes, or any explanation. You may use one appropriate emoji if needed.";

    PromptParams {
        system: Some(INTRO_SYSTEM.to_string()),
        prompts: vec![prompt.to_string()],
        version: version.to_string(),
    }
}

/// Banner prompts, one per activity, each with a random subject and shirt colour.
pub fn banner_params<R: Rng + ?Sized>(version: &str, rng: &mut R) -> PromptParams {
    let prompts = ACTIVITIES
        .iter()
        .map(|activity| {
            let subject = SUBJECTS.choose(rng).copied().unwrap_or("woman");
            let color = SHIRT_COLORS.choose(rng).copied().unwrap_or("blue");
            banner_prompt(subject, color, activity)
        })
        .collect();

    PromptParams {
        system: None,
        prompts,
        version: version.to_string(),
    }
}

fn banner_prompt(subject: &str, shirt_color: &str, activity: &str) -> String {
    format!(
        "A young {subject} sitting while watching something on TV, with an expression of joy. \
Their body language conveys engagement, sitting straight and facing directly forward. \
They are {activity}. Their posture reflects interest. \
Clothing is casual, such as a t-shirt or a sweater in {shirt_color} color, avoiding white color. \
There is only one person in the image, upper body visible above the waist, photographed against \
a pure white background (RGB 255,255,255) with absolutely no shadows, shading, gradients, or text. \
The background must be completely flat white with no visual distractions. \
The subject should have smooth, straight, or slightly wavy hair with a neat and natural appearance. \
Their facial features should be clearly visible with a natural and relaxed expression. \
All elements must be in sharp focus with high clarity, no motion blur, and distinct edges."
    )
}

/// Sampling temperature for candidate `index`: `base + 0.1 * index`.
pub fn temperature(artifact: ArtifactType, index: usize) -> f32 {
    let base = match artifact {
        ArtifactType::Intro => INTRO_BASE_TEMPERATURE,
        _ => TAGLINE_BASE_TEMPERATURE,
    };
    (base + 0.1 * index as f32).min(MAX_TEMPERATURE)
}

pub fn max_tokens(artifact: ArtifactType) -> u32 {
    match artifact {
        ArtifactType::Intro => INTRO_MAX_TOKENS,
        _ => TAGLINE_MAX_TOKENS,
    }
}

/// Seed for banner candidate `index`; distinct per candidate.
pub fn banner_seed(index: usize) -> u64 {
    (index as u64 + 1) * 1000
}

/// Normalize raw service output for `artifact`.
pub fn clean_text(artifact: ArtifactType, raw: &str) -> String {
    match artifact {
        ArtifactType::Intro => clean_intro(raw),
        _ => clean_tagline(raw),
    }
}

/// Strip quotes and list markers, collapse whitespace, capitalize.
pub fn clean_tagline(raw: &str) -> String {
    let text = strip_decoration(raw);
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Like [`clean_tagline`], and make sure the text talks about streaming.
pub fn clean_intro(raw: &str) -> String {
    let text = strip_decoration(raw);
    if text.to_lowercase().contains("stream") {
        return text;
    }
    if text.contains("entertainment") {
        text.replacen("entertainment", "streaming entertainment", 1)
    } else {
        format!("{} Start streaming now!", text.trim_end())
    }
}

fn strip_decoration(raw: &str) -> String {
    static LIST_MARKER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[\d.\-*•)]+\s*").expect("valid regex"));

    let unquoted = raw.trim().trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”'));
    let unlisted = LIST_MARKER_RE.replace(unquoted.trim_start(), "");
    unlisted
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
