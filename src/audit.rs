use chrono::Local;
use serde::{Deserialize, Serialize};

pub const IMAGE_GENERATION: &str = "Image Generation";

/// Audit record of one image generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptHistoryEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub category: String,
    pub data: PromptPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    /// Exact prompt the image model received
    pub final_prompt: String,
    pub generated_image_url: String,
    /// Candidate text the image was generated from
    pub variant_text: String,
}

impl PromptHistoryEntry {
    pub fn image_generation(
        final_prompt: impl Into<String>,
        image_url: impl Into<String>,
        variant_text: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            category: IMAGE_GENERATION.to_string(),
            data: PromptPayload {
                final_prompt: final_prompt.into(),
                generated_image_url: image_url.into(),
                variant_text: variant_text.into(),
            },
        }
    }
}

/// One row in the history view
#[derive(Debug, Clone, PartialEq)]
pub struct AuditVariant {
    /// 1-based position within its iteration
    pub number: usize,
    pub final_prompt: String,
    pub image_url: String,
    pub chosen: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditIteration {
    /// 1-based
    pub number: usize,
    pub timestamp: String,
    pub variants: Vec<AuditVariant>,
}

/// Group entries into iterations of two (the last may hold one) and mark
/// each variant chosen iff its text made it into the accepted history.
pub fn iterations(entries: &[PromptHistoryEntry], history: &[String]) -> Vec<AuditIteration> {
    entries
        .chunks(2)
        .enumerate()
        .map(|(idx, pair)| AuditIteration {
            number: idx + 1,
            timestamp: pair[0].timestamp.clone(),
            variants: pair
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.data.generated_image_url.is_empty())
                .map(|(vidx, e)| AuditVariant {
                    number: vidx + 1,
                    final_prompt: e.data.final_prompt.clone(),
                    image_url: e.data.generated_image_url.clone(),
                    chosen: history.iter().any(|h| h == &e.data.variant_text),
                })
                .collect(),
        })
        .collect()
}
