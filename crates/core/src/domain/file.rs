use serde::{Deserialize, Serialize};

/// Format hint for a file part (spec §3). Distinguishing `Image`/`Audio` from
/// a generic `Document` lets adapters apply per-format constraints (e.g. "no
/// PDFs without `supports_input_pdf`") without re-parsing the content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Image,
    Audio,
    Pdf,
    Document,
}

/// A file attached to a message, either inline or by reference.
///
/// Invariant (spec §3): at least one of `data`/`url` must be set; this is
/// enforced by [`File::new_inline`]/[`File::new_url`] rather than by the
/// type itself, since both constructors are the only sanctioned way to
/// build one outside of deserialization (where a malformed file with
/// neither is simply unusable and caught by [`File::is_valid`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
}

impl File {
    pub fn new_inline(data: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            url: None,
            content_type: Some(content_type.into()),
            format: None,
        }
    }

    pub fn new_url(url: impl Into<String>) -> Self {
        Self {
            data: None,
            url: Some(url.into()),
            content_type: None,
            format: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.is_some() || self.url.is_some()
    }

    pub fn is_inline(&self) -> bool {
        self.data.is_some()
    }

    /// Whether the runner must fetch the bytes before handing this file to
    /// `provider` for `model` (spec §3: "when a provider cannot consume it
    /// by URL, when the format is audio, or when the content type is
    /// missing and must be sniffed").
    pub fn requires_downloading(&self, provider_can_use_url: bool) -> bool {
        if self.is_inline() {
            return false;
        }

        if !provider_can_use_url {
            return true;
        }

        if self.format == Some(FileFormat::Audio) {
            return true;
        }

        self.content_type.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_file_never_needs_download() {
        let file = File::new_inline("YWJj", "image/png");
        assert!(!file.requires_downloading(false));
    }

    #[test]
    fn url_file_needs_download_when_provider_cannot_use_urls() {
        let file = File::new_url("https://example.com/a.png");
        assert!(file.requires_downloading(false));
        assert!(!file.requires_downloading(true));
    }

    #[test]
    fn audio_url_always_needs_download() {
        let mut file = File::new_url("https://example.com/a.wav");
        file.format = Some(FileFormat::Audio);
        assert!(file.requires_downloading(true));
    }

    #[test]
    fn missing_content_type_needs_sniffing() {
        let file = File::new_url("https://example.com/a");
        assert!(file.requires_downloading(true));
    }
}
