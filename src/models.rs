use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MIME_TYPE: &str = "image/jpeg";
pub const MAX_ITEM_CHARS: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image payload is empty")]
    Empty,
    #[error("image payload is not valid base64")]
    InvalidBase64,
    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),
}

/// The photo handed over by whatever picked it. Data is kept base64-encoded
/// because that is the form the vision API wants it in.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    data_base64: String,
    mime_type: String,
    display_uri: Option<String>,
}

impl ImagePayload {
    #[cfg(test)]
    pub fn from_bytes(bytes: &[u8], mime_type: Option<&str>) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self {
            data_base64: BASE64.encode(bytes),
            mime_type: normalize_mime(mime_type)?,
            display_uri: None,
        })
    }

    /// Accepts bare base64 or a full `data:<mime>;base64,` URL. A mime type
    /// embedded in the data URL wins over the hint.
    pub fn from_base64(encoded: &str, mime_type: Option<&str>) -> Result<Self, ImageError> {
        let trimmed = encoded.trim();
        let (embedded_mime, body) = match trimmed
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
        {
            Some((mime, body)) => (Some(mime), body),
            None => (None, trimmed),
        };
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(ImageError::Empty);
        }
        let decoded = BASE64
            .decode(compact.as_bytes())
            .map_err(|_| ImageError::InvalidBase64)?;
        if decoded.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self {
            data_base64: compact,
            mime_type: normalize_mime(embedded_mime.or(mime_type))?,
            display_uri: None,
        })
    }

    pub fn with_display_uri(mut self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.display_uri = Some(uri).filter(|u| !u.trim().is_empty());
        self
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn display_uri(&self) -> Option<&str> {
        self.display_uri.as_deref()
    }

    pub fn encoded_len(&self) -> usize {
        self.data_base64.len()
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }
}

fn normalize_mime(mime_type: Option<&str>) -> Result<String, ImageError> {
    let mime = mime_type
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
    if !mime.starts_with("image/") {
        return Err(ImageError::UnsupportedMime(mime));
    }
    Ok(mime)
}

/// One clothing item as the model described it, cleaned for search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescription(String);

impl ItemDescription {
    /// Normalizes a single line of model output. Returns `None` for lines
    /// that are blank once the bullet marker and whitespace are gone.
    pub fn from_line(line: &str) -> Option<Self> {
        let trimmed = line.trim_start();
        let unbulleted = trimmed
            .strip_prefix(['-', '•', '*'])
            .unwrap_or(trimmed);
        let text = unbulleted.trim();
        if text.is_empty() {
            return None;
        }
        let capped = match text.char_indices().nth(MAX_ITEM_CHARS) {
            Some((cut, _)) => text[..cut].trim_end(),
            None => text,
        };
        Some(Self(capped.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Retailer {
    #[serde(rename = "ASOS")]
    Asos,
    #[serde(rename = "H&M")]
    HAndM,
    #[serde(rename = "Zara")]
    Zara,
}

impl Retailer {
    pub fn name(&self) -> &'static str {
        match self {
            Retailer::Asos => "ASOS",
            Retailer::HAndM => "H&M",
            Retailer::Zara => "Zara",
        }
    }
}

impl fmt::Display for Retailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetailerLink {
    pub retailer: Retailer,
    pub url: String,
    pub item: ItemDescription,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultEntry {
    /// The uploaded photo, shown while the run is working.
    Echo {
        image_uri: Option<String>,
        message: String,
    },
    Product {
        description: String,
        retailer: Retailer,
        link: String,
        preview: String,
    },
    Failure {
        message: String,
    },
}

impl ResultEntry {
    pub fn echo(image: &ImagePayload) -> Self {
        ResultEntry::Echo {
            image_uri: image.display_uri().map(str::to_string),
            message: "Analyzing outfit...".into(),
        }
    }

    pub fn product(link: RetailerLink, preview: String) -> Self {
        ResultEntry::Product {
            description: link.item.as_str().to_string(),
            retailer: link.retailer,
            link: link.url,
            preview,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ResultEntry::Failure {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitImageRequest {
    pub image_base64: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub display_uri: Option<String>,
}

impl SubmitImageRequest {
    pub fn into_payload(self) -> Result<ImagePayload, ImageError> {
        let payload = ImagePayload::from_base64(&self.image_base64, self.mime_type.as_deref())?;
        Ok(match self.display_uri {
            Some(uri) => payload.with_display_uri(uri),
            None => payload,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
