pub mod image_fetcher;
pub mod prompt_sources;

pub use image_fetcher::{render_url_template, UrlTemplateImageFetcher};
pub use prompt_sources::{parse_prompt_output, CommandPromptGenerator, PromptFileGenerator};

use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ProviderAdapterError {
    #[error("invalid url template: {0}")]
    Template(String),
    #[error("rendered url is invalid: {0}")]
    Url(#[from] url::ParseError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("prompt source {0} has no usable lines")]
    EmptyPromptSource(String),
}
