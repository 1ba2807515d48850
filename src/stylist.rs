use crate::decompose::AnalysisError;
use crate::llm::{ChatOptions, ContentPart, LlmMessage, VisionModel};
use crate::metrics;
use crate::models::{ImageError, ImagePayload, SubmitImageRequest};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{OneOrMany, formats::PreferMany, serde_as};
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MIN_WARDROBE_IMAGES: usize = 2;
pub const MAX_STYLE_IMAGES: usize = 2;

const RECOMMENDATION_MAX_TOKENS: u32 = 800;
const WARDROBE_MAX_TOKENS: u32 = 1200;
const STYLE_MAX_TOKENS: u32 = 800;

const STYLE_PROMPT: &str = "Analyze these outfit photos and describe the person's fashion style \
in detail. Include keywords, brands, and outfit suggestions that would complement their style.";

#[derive(Debug, Clone)]
pub struct StylistConfig {
    pub model: String,
    pub temperature: f32,
}

impl Default for StylistConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Error)]
pub enum StylistError {
    #[error("at least {required} images are needed, got {given}")]
    NotEnoughImages { required: usize, given: usize },
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("stylist response unusable: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationMode {
    /// Where to buy pieces like the ones in the photo.
    #[default]
    Similar,
    /// A fresh outfit in the photo's spirit, steered by `direction`.
    #[serde(alias = "custom")]
    NewOutfit,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecommendationBrief {
    #[serde(default)]
    pub mode: RecommendationMode,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub colors: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendationRequest {
    #[serde(flatten)]
    pub image: SubmitImageRequest,
    #[serde(flatten)]
    pub brief: RecommendationBrief,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardrobeBrief {
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WardrobeRequest {
    pub images: Vec<SubmitImageRequest>,
    #[serde(flatten)]
    pub brief: WardrobeBrief,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StyleRequest {
    pub images: Vec<SubmitImageRequest>,
}

pub fn payloads(images: Vec<SubmitImageRequest>) -> Result<Vec<ImagePayload>, ImageError> {
    images
        .into_iter()
        .map(SubmitImageRequest::into_payload)
        .collect()
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreRecommendation {
    #[serde(default)]
    pub store: String,
    #[serde_as(as = "OneOrMany<_, PreferMany>")]
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(
        default,
        alias = "priceRange",
        deserialize_with = "loose_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub mode: RecommendationMode,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_outfit: Option<String>,
    pub recommendations: Vec<StoreRecommendation>,
    /// `false` when the reply was not the requested JSON; `summary` then
    /// holds the reply verbatim.
    pub structured: bool,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CapsuleItem {
    #[serde(default)]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "loose_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde_as(as = "OneOrMany<_, PreferMany>")]
    #[serde(default)]
    pub stores: Vec<String>,
    #[serde(
        default,
        alias = "priceRange",
        deserialize_with = "loose_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapsuleWardrobe {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_analysis: Option<String>,
    pub items: Vec<CapsuleItem>,
    pub outfit_combinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleAnalysis {
    pub analysis: String,
    pub images_used: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationReply {
    #[serde(default, deserialize_with = "loose_text")]
    description: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    new_outfit: Option<String>,
    #[serde(default)]
    recommendations: Vec<StoreRecommendation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WardrobeReply {
    #[serde(default, deserialize_with = "loose_text")]
    style_analysis: Option<String>,
    #[serde(default)]
    capsule_wardrobe: Vec<CapsuleItem>,
    #[serde(default)]
    outfit_combinations: Vec<Value>,
}

/// Shopping and styling advice built on the same vision model as outfit
/// decomposition.
#[derive(Clone)]
pub struct Stylist {
    model: Arc<dyn VisionModel>,
    config: StylistConfig,
}

impl Stylist {
    pub fn new(model: Arc<dyn VisionModel>, config: StylistConfig) -> Self {
        Self { model, config }
    }

    /// Store suggestions for one outfit photo. A reply that is not the
    /// requested JSON is kept as free text rather than failing the call.
    pub async fn recommend(
        &self,
        image: &ImagePayload,
        brief: &RecommendationBrief,
    ) -> Result<Recommendation, StylistError> {
        let prompt = recommendation_prompt(brief);
        let text = self
            .ask(
                "recommendation",
                prompt,
                std::slice::from_ref(image),
                self.options(RECOMMENDATION_MAX_TOKENS),
            )
            .await?;
        Ok(parse_recommendation(brief.mode, &text))
    }

    pub async fn capsule_wardrobe(
        &self,
        images: &[ImagePayload],
        brief: &WardrobeBrief,
    ) -> Result<CapsuleWardrobe, StylistError> {
        if images.len() < MIN_WARDROBE_IMAGES {
            return Err(StylistError::NotEnoughImages {
                required: MIN_WARDROBE_IMAGES,
                given: images.len(),
            });
        }
        let prompt = wardrobe_prompt(images.len(), brief);
        let text = self
            .ask("wardrobe", prompt, images, self.options(WARDROBE_MAX_TOKENS))
            .await?;
        parse_wardrobe(&text)
    }

    /// Free-text style read of the first couple of photos.
    pub async fn analyze_style(&self, images: &[ImagePayload]) -> Result<StyleAnalysis, StylistError> {
        if images.is_empty() {
            return Err(StylistError::NotEnoughImages {
                required: 1,
                given: 0,
            });
        }
        let used = &images[..images.len().min(MAX_STYLE_IMAGES)];
        let options = ChatOptions {
            json_object: false,
            ..self.options(STYLE_MAX_TOKENS)
        };
        let text = self
            .ask("style", STYLE_PROMPT.to_string(), used, options)
            .await?;
        let analysis = text.trim();
        if analysis.is_empty() {
            return Err(StylistError::InvalidResponse("empty analysis".into()));
        }
        Ok(StyleAnalysis {
            analysis: analysis.to_string(),
            images_used: used.len(),
        })
    }

    fn options(&self, max_tokens: u32) -> ChatOptions {
        ChatOptions {
            model: Some(self.config.model.clone()),
            max_tokens: Some(max_tokens),
            temperature: Some(self.config.temperature),
            json_object: true,
        }
    }

    async fn ask(
        &self,
        feature: &'static str,
        prompt: String,
        images: &[ImagePayload],
        options: ChatOptions,
    ) -> Result<String, StylistError> {
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(ContentPart::text(prompt));
        parts.extend(images.iter().map(|image| ContentPart::image(image.data_url())));
        let messages = [LlmMessage::user(parts)];

        let started = Instant::now();
        let result = self.model.complete(&messages, &options).await;
        metrics::stylist_call(feature, images.len(), result.is_ok(), started.elapsed());
        match result {
            Ok(text) => {
                debug!(target = "outfit.stylist", feature, chars = text.len(), "stylist_reply");
                Ok(text)
            }
            Err(err) => {
                warn!(target = "outfit.stylist", feature, error = %err, "stylist_request_failed");
                Err(AnalysisError::from(err).into())
            }
        }
    }
}

fn preference(value: &Option<String>, default: &'static str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

pub fn recommendation_prompt(brief: &RecommendationBrief) -> String {
    let budget = preference(&brief.budget, "100");
    match brief.mode {
        RecommendationMode::Similar => {
            let colors = preference(&brief.colors, "same as in image");
            format!(
                "Analyze this outfit image and provide:\n\
                 1. A brief description of what's in the image\n\
                 2. List 5 specific store recommendations where someone could buy similar items \
                 (include both online and physical stores)\n\
                 3. For each store, suggest 1-2 specific items that would match the style in the image\n\
                 4. Estimated price range for each item\n\
                 Budget: ${budget}, Preferred colors: {colors}\n\
                 Format as JSON with keys: description, recommendations (array with store, items, priceRange)"
            )
        }
        RecommendationMode::NewOutfit => {
            let direction = preference(&brief.direction, "updated trends");
            let colors = preference(&brief.colors, "versatile mix");
            format!(
                "Based on this outfit image, create a fresh styling recommendation with these requirements:\n\
                 1. Create a new outfit inspired by this style but with {direction}\n\
                 2. List 5 specific stores where someone could buy each piece\n\
                 3. For each store, suggest 1-2 specific items that would work for the outfit\n\
                 4. Estimated price range for each item\n\
                 Budget: ${budget}, Preferred colors: {colors}\n\
                 Format as JSON with keys: description, newOutfit, recommendations (array with store, items, priceRange)"
            )
        }
    }
}

pub fn wardrobe_prompt(image_count: usize, brief: &WardrobeBrief) -> String {
    let style = preference(&brief.style, "versatile");
    let budget = preference(&brief.budget, "500");
    let season = preference(&brief.season, "all seasons");
    format!(
        "Based on {image_count} images, create a capsule wardrobe with 15 items. \
         Include tops, bottoms, shoes, accessories. Add 2 store options and price range per item. \
         Preferences: {style}, ${budget}, {season}. \
         Format JSON: styleAnalysis, capsuleWardrobe (array with name, category, stores, priceRange), \
         outfitCombinations (array of strings)."
    )
}

pub fn parse_recommendation(mode: RecommendationMode, text: &str) -> Recommendation {
    let trimmed = text.trim();
    match serde_json::from_str::<RecommendationReply>(json_body(trimmed)) {
        Ok(reply) => Recommendation {
            mode,
            summary: reply
                .description
                .clone()
                .or_else(|| reply.new_outfit.clone())
                .unwrap_or_default(),
            new_outfit: reply.new_outfit,
            recommendations: reply.recommendations,
            structured: true,
        },
        Err(err) => {
            info!(target = "outfit.stylist", error = %err, "recommendation_not_json");
            Recommendation {
                mode,
                summary: trimmed.to_string(),
                new_outfit: None,
                recommendations: Vec::new(),
                structured: false,
            }
        }
    }
}

pub fn parse_wardrobe(text: &str) -> Result<CapsuleWardrobe, StylistError> {
    let reply: WardrobeReply = serde_json::from_str(json_body(text.trim()))
        .map_err(|err| StylistError::InvalidResponse(err.to_string()))?;
    Ok(CapsuleWardrobe {
        style_analysis: reply.style_analysis,
        items: reply.capsule_wardrobe,
        outfit_combinations: reply
            .outfit_combinations
            .into_iter()
            .filter_map(|combo| match combo {
                Value::Null => None,
                Value::String(text) => Some(text),
                other => Some(other.to_string()),
            })
            .collect(),
    })
}

/// Strips a Markdown code fence if the model wrapped its JSON in one.
fn json_body(text: &str) -> &str {
    text.strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(text)
}

/// Accepts a string, a number or null; models are loose about price fields.
fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text).filter(|t| !t.trim().is_empty()),
        Some(other) => Some(other.to_string()),
    })
}
