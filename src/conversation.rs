//! Conversation templates for prompting the model.
//!
//! The evaluation loop builds one prompt per run: an image placeholder plus
//! the user query, wrapped in the conversation format the model was trained
//! with. The supported formats are a closed set; each variant carries its own
//! role names, separator convention, and stop marker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder the user query carries at the image position.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

/// Start marker used by models trained with explicit image delimiters.
pub const IMAGE_START_MARKER: &str = "<im_start>";

/// End marker used by models trained with explicit image delimiters.
pub const IMAGE_END_MARKER: &str = "<im_end>";

const SYSTEM_V0: &str = "A chat between a curious human and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the human's questions.";

const SYSTEM_V1: &str = "A chat between a curious user and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the user's questions.";

/// How consecutive messages are joined in the rendered prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    /// One separator after every message.
    Single,
    /// Alternating separators; the second one terminates assistant turns.
    Two,
}

/// Supported conversation templates.
///
/// A closed set rather than a name-keyed registry: each variant knows how to
/// render a prompt and which marker ends a generated response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvTemplate {
    /// Single-separator format with `Human`/`Assistant` roles (`###` breaks).
    V0,
    /// Vicuna-style two-separator format with `USER`/`ASSISTANT` roles.
    #[default]
    V1,
}

impl ConvTemplate {
    /// Role names for the user and assistant turns.
    #[must_use]
    pub fn roles(self) -> (&'static str, &'static str) {
        match self {
            Self::V0 => ("Human", "Assistant"),
            Self::V1 => ("USER", "ASSISTANT"),
        }
    }

    /// Separator convention for this template.
    #[must_use]
    pub fn separator_style(self) -> SeparatorStyle {
        match self {
            Self::V0 => SeparatorStyle::Single,
            Self::V1 => SeparatorStyle::Two,
        }
    }

    /// Marker that signals the end of a generated response.
    ///
    /// For the single-separator style this is the message separator itself;
    /// for the two-separator style it is the second (turn-terminating)
    /// separator.
    #[must_use]
    pub fn stop_marker(self) -> &'static str {
        match self {
            Self::V0 => "###",
            Self::V1 => "</s>",
        }
    }

    /// Render the full prompt for a single user query, leaving the assistant
    /// slot open for generation.
    #[must_use]
    pub fn prompt(self, query: &str) -> String {
        let (user, assistant) = self.roles();
        match self.separator_style() {
            SeparatorStyle::Single => {
                let sep = self.stop_marker();
                format!("{SYSTEM_V0}{sep}{user}: {query}{sep}{assistant}:")
            }
            SeparatorStyle::Two => {
                format!("{SYSTEM_V1} {user}: {query} {assistant}:")
            }
        }
    }
}

impl fmt::Display for ConvTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V0 => write!(f, "v0"),
            Self::V1 => write!(f, "v1"),
        }
    }
}

impl FromStr for ConvTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v0" | "llava_v0" => Ok(Self::V0),
            "v1" | "llava_v1" | "vicuna_v1" => Ok(Self::V1),
            other => Err(format!("unknown conversation template: {other}")),
        }
    }
}

/// Prepend the image placeholder to a user query.
///
/// Models trained with explicit image delimiters expect the placeholder to be
/// wrapped in start/end markers; everything else takes the bare placeholder.
#[must_use]
pub fn image_query(query: &str, use_image_markers: bool) -> String {
    if use_image_markers {
        format!("{IMAGE_START_MARKER}{IMAGE_PLACEHOLDER}{IMAGE_END_MARKER}\n{query}")
    } else {
        format!("{IMAGE_PLACEHOLDER}\n{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_prompt_shape() {
        let prompt = ConvTemplate::V1.prompt("<image>\nDescribe this image.");
        assert!(prompt.contains("USER: <image>\nDescribe this image."));
        assert!(prompt.ends_with("ASSISTANT:"));
        assert!(!prompt.contains("###"));
    }

    #[test]
    fn test_v0_prompt_shape() {
        let prompt = ConvTemplate::V0.prompt("<image>\nDescribe this image.");
        assert!(prompt.contains("###Human: "));
        assert!(prompt.ends_with("###Assistant:"));
    }

    #[test]
    fn test_stop_markers() {
        assert_eq!(ConvTemplate::V0.stop_marker(), "###");
        assert_eq!(ConvTemplate::V1.stop_marker(), "</s>");
    }

    #[test]
    fn test_from_str_accepts_historical_names() {
        assert_eq!("v1".parse::<ConvTemplate>().unwrap(), ConvTemplate::V1);
        assert_eq!("vicuna_v1".parse::<ConvTemplate>().unwrap(), ConvTemplate::V1);
        assert_eq!("llava_v0".parse::<ConvTemplate>().unwrap(), ConvTemplate::V0);
        assert!("mistral".parse::<ConvTemplate>().is_err());
    }

    #[test]
    fn test_image_query_markers() {
        assert_eq!(image_query("hi", false), "<image>\nhi");
        assert_eq!(image_query("hi", true), "<im_start><image><im_end>\nhi");
    }
}
