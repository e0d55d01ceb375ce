//! Clients for the external services StreamDigest consumes.
//!
//! This crate provides:
//! - [`TextGenerator`], [`ImageGenerator`], [`LinkShortener`] — capability traits
//! - [`OpenAiTextGenerator`] — chat-completions text generation
//! - [`FluxImageGenerator`] — asynchronous image generation (submit, poll, download)
//! - [`HttpLinkShortener`] / [`PassthroughShortener`] — link shortening

mod http;
pub mod image;
pub mod shortener;
pub mod text;
pub mod traits;

pub use image::FluxImageGenerator;
pub use shortener::HttpLinkShortener;
pub use text::OpenAiTextGenerator;
pub use traits::{
    GeneratedImage, ImageGenerator, ImageRequest, LinkShortener, PassthroughShortener,
    TextGenerator, TextRequest,
};
