//! Execution events and aggregated cell results.
//!
//! An [`ExecutionEvent`] is one normalized unit of kernel output. Its content
//! type and content format are always a valid pair: the only way to build an
//! event is through constructors that take the format for the chosen kind,
//! and deserialization re-checks the pairing.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

/// Which kernel notification an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Stream,
    Error,
    DisplayData,
    ExecuteResult,
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgType::Stream => write!(f, "stream"),
            MsgType::Error => write!(f, "error"),
            MsgType::DisplayData => write!(f, "display_data"),
            MsgType::ExecuteResult => write!(f, "execute_result"),
        }
    }
}

/// How the content of an event should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Console,
    Image,
    Code,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Console => write!(f, "console"),
            ContentType::Image => write!(f, "image"),
            ContentType::Code => write!(f, "code"),
        }
    }
}

/// Encoding of an event's `content` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentFormat {
    #[serde(rename = "output")]
    Output,
    #[serde(rename = "base64-png")]
    Base64Png,
    #[serde(rename = "base64-jpeg")]
    Base64Jpeg,
    #[serde(rename = "html")]
    Html,
    #[serde(rename = "javascript")]
    Javascript,
}

impl std::fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentFormat::Output => write!(f, "output"),
            ContentFormat::Base64Png => write!(f, "base64-png"),
            ContentFormat::Base64Jpeg => write!(f, "base64-jpeg"),
            ContentFormat::Html => write!(f, "html"),
            ContentFormat::Javascript => write!(f, "javascript"),
        }
    }
}

/// Raster image encodings the kernel can hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    fn content_format(self) -> ContentFormat {
        match self {
            ImageFormat::Png => ContentFormat::Base64Png,
            ImageFormat::Jpeg => ContentFormat::Base64Jpeg,
        }
    }
}

/// Source-like payloads rendered as code rather than console text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeFormat {
    Html,
    Javascript,
}

impl CodeFormat {
    fn content_format(self) -> ContentFormat {
        match self {
            CodeFormat::Html => ContentFormat::Html,
            CodeFormat::Javascript => ContentFormat::Javascript,
        }
    }
}

/// One normalized unit of kernel output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EventRecord")]
pub struct ExecutionEvent {
    msg_type: MsgType,
    content_type: ContentType,
    content_format: ContentFormat,
    content: String,
}

impl ExecutionEvent {
    /// Plain console text (stream output, tracebacks, `text/plain` results).
    pub fn console(msg_type: MsgType, text: impl Into<String>) -> Self {
        Self {
            msg_type,
            content_type: ContentType::Console,
            content_format: ContentFormat::Output,
            content: text.into(),
        }
    }

    /// A base64-encoded image.
    pub fn image(msg_type: MsgType, format: ImageFormat, base64: impl Into<String>) -> Self {
        Self {
            msg_type,
            content_type: ContentType::Image,
            content_format: format.content_format(),
            content: base64.into(),
        }
    }

    /// HTML or JavaScript source produced by a rich display.
    pub fn code(msg_type: MsgType, format: CodeFormat, source: impl Into<String>) -> Self {
        Self {
            msg_type,
            content_type: ContentType::Code,
            content_format: format.content_format(),
            content: source.into(),
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn content_format(&self) -> ContentFormat {
        self.content_format
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_error(&self) -> bool {
        self.msg_type == MsgType::Error
    }

    /// The image view of this event, if it carries one.
    pub fn as_image(&self) -> Option<Base64Image> {
        let format = match self.content_format {
            ContentFormat::Base64Png => ImageFormat::Png,
            ContentFormat::Base64Jpeg => ImageFormat::Jpeg,
            _ => return None,
        };
        Some(Base64Image {
            format,
            content: self.content.clone(),
        })
    }
}

/// Unvalidated wire shape of an [`ExecutionEvent`].
#[derive(Deserialize)]
struct EventRecord {
    msg_type: MsgType,
    content_type: ContentType,
    content_format: ContentFormat,
    content: String,
}

/// Error for an event whose content format does not belong to its content type.
#[derive(Debug, thiserror::Error)]
#[error("content format '{content_format}' is not valid for content type '{content_type}'")]
pub struct InvalidEventFormat {
    pub content_type: ContentType,
    pub content_format: ContentFormat,
}

impl TryFrom<EventRecord> for ExecutionEvent {
    type Error = InvalidEventFormat;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        let valid = matches!(
            (record.content_type, record.content_format),
            (ContentType::Console, ContentFormat::Output)
                | (ContentType::Image, ContentFormat::Base64Png)
                | (ContentType::Image, ContentFormat::Base64Jpeg)
                | (ContentType::Code, ContentFormat::Html)
                | (ContentType::Code, ContentFormat::Javascript)
        );
        if !valid {
            return Err(InvalidEventFormat {
                content_type: record.content_type,
                content_format: record.content_format,
            });
        }
        Ok(Self {
            msg_type: record.msg_type,
            content_type: record.content_type,
            content_format: record.content_format,
            content: record.content,
        })
    }
}

/// An image in base64 form, either png or jpeg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base64Image {
    #[serde(rename = "content_format")]
    pub format: ImageFormat,
    pub content: String,
}

impl Base64Image {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// Decode the image bytes. Kernels may wrap base64 at 76 columns, so
    /// whitespace is ignored.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let compact: String = self
            .content
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        BASE64_STANDARD.decode(compact)
    }
}

/// Final result of running one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Every event produced, in arrival order.
    pub events: Vec<ExecutionEvent>,
    /// Whether any event was an error.
    pub error: bool,
    /// Concatenated content of all non-image events, suitable as LLM context.
    pub text: String,
    /// Images produced, in arrival order.
    pub images: Vec<Base64Image>,
}

impl ExecutionResult {
    pub fn from_events(events: Vec<ExecutionEvent>) -> Self {
        let mut text = String::new();
        let mut images = Vec::new();
        let mut error = false;

        for event in &events {
            match event.as_image() {
                Some(image) => images.push(image),
                None => text.push_str(event.content()),
            }
            error |= event.is_error();
        }

        Self {
            events,
            error,
            text,
            images,
        }
    }
}
