//! Model Classifier
//!
//! Maps arbitrary model identifiers -- free-form strings produced by
//! heterogeneous runtimes (Ollama, LM Studio, bare GGUF paths) -- to a
//! normalized capability record: tier, context window, and model type.
//! `classify` is total and deterministic; it is the single source of truth
//! for tiers and no other module reinterprets model names.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Capability bucket for a model. Ordering follows capacity: small < xl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
    Xl,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xl => "xl",
        }
    }

    /// Default context window for the tier.
    pub fn default_context(&self) -> u32 {
        match self {
            Self::Small => 4096,
            Self::Medium => 8192,
            Self::Large => 32768,
            Self::Xl => 32768,
        }
    }

    /// Numeric rank for sorting (xl highest).
    pub fn rank(&self) -> u8 {
        match self {
            Self::Small => 0,
            Self::Medium => 1,
            Self::Large => 2,
            Self::Xl => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "xl" => Ok(Self::Xl),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Image,
    Whisper,
    Multimodal,
}

/// Normalized capability record derived purely from a model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapability {
    pub tier: Tier,
    pub context: u32,
    pub model_type: ModelType,
}

impl ModelCapability {
    fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            context: tier.default_context(),
            model_type: ModelType::Llm,
        }
    }
}

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

/// Parsed form of a requested model identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelector {
    /// Bare tier name: any model of that tier qualifies.
    Tier(Tier),
    /// `<tier>|<substring>`: tier plus a lower-cased name fragment.
    Combined { tier: Tier, substring: String },
    /// `<model>@<handle>`: a specific model on a specific provider.
    Addressed { model: String, handle: String },
    /// Anything else: a concrete model name, matched after normalization.
    Exact(String),
}

/// A combined selector whose tier half is not a valid tier name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed combined selector: {0:?} is not a tier")]
pub struct MalformedSelector(pub String);

impl ModelSelector {
    /// Parse a requested identifier. Only a malformed combined selector
    /// fails; every other string is a valid selector of some kind.
    pub fn parse(identifier: &str) -> Result<Self, MalformedSelector> {
        let identifier = identifier.trim();

        if let Ok(tier) = identifier.parse::<Tier>() {
            return Ok(Self::Tier(tier));
        }

        if let Some((tier_part, substring)) = identifier.split_once('|') {
            let tier = tier_part
                .trim()
                .parse::<Tier>()
                .map_err(|()| MalformedSelector(tier_part.trim().to_string()))?;
            return Ok(Self::Combined {
                tier,
                substring: substring.trim().to_lowercase(),
            });
        }

        if let Some((model, handle)) = identifier.rsplit_once('@') {
            if !model.is_empty() && !handle.is_empty() {
                return Ok(Self::Addressed {
                    model: model.to_string(),
                    handle: handle.to_string(),
                });
            }
        }

        Ok(Self::Exact(identifier.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify an identifier into a capability record. Total: unparseable or
/// unknown names fall back to the medium tier defaults.
pub fn classify(identifier: &str) -> ModelCapability {
    match ModelSelector::parse(identifier) {
        Ok(ModelSelector::Tier(tier)) => ModelCapability::for_tier(tier),
        Ok(ModelSelector::Combined { tier, .. }) => ModelCapability::for_tier(tier),
        Ok(ModelSelector::Addressed { model, .. }) => classify_name(&model),
        Ok(ModelSelector::Exact(name)) => classify_name(&name),
        Err(_) => ModelCapability::for_tier(Tier::Medium),
    }
}

/// Strip path prefixes (`/` segments) and version tags (`:` suffix) and
/// lower-case, producing the form used for model-name comparison.
pub fn normalize(identifier: &str) -> String {
    let base = identifier.rsplit('/').next().unwrap_or(identifier);
    let base = base.split(':').next().unwrap_or(base);
    base.trim().to_lowercase()
}

fn classify_name(name: &str) -> ModelCapability {
    let lower = name.to_lowercase();
    let model_type = detect_type(&lower);

    // Size-word shortcut before family and size-number rules.
    if lower.contains("mini") || lower.contains("tiny") || lower.contains("small") {
        return ModelCapability {
            model_type,
            ..ModelCapability::for_tier(Tier::Small)
        };
    }

    // Family and size rules run on the path-stripped but tag-preserving
    // form: Ollama-style tags often carry the parameter count ("llama2:70b").
    let base = lower.rsplit('/').next().unwrap_or(&lower).to_string();
    if let Some(cap) = family_lookup(&base) {
        return ModelCapability { model_type, ..cap };
    }

    if let Some(tier) = size_pattern_lookup(&base) {
        return ModelCapability {
            model_type,
            ..ModelCapability::for_tier(tier)
        };
    }

    ModelCapability {
        model_type,
        ..ModelCapability::for_tier(Tier::Medium)
    }
}

/// Family table keyed by the leading token before `-`, `:` or `/`.
/// Some families are version-dependent and inspect the rest of the name.
fn family_lookup(base: &str) -> Option<ModelCapability> {
    let token = base.split(['-', ':', '/', ' ']).next().unwrap_or(base);

    let cap = match token {
        "phi" | "phi2" | "phi3" | "phi4" => {
            if base.contains("phi-4") || base.contains("phi4") {
                // Phi-4 ships a 16k context.
                ModelCapability {
                    tier: Tier::Large,
                    context: 16384,
                    model_type: ModelType::Llm,
                }
            } else if base.contains("phi-3") || base.contains("phi3") {
                ModelCapability::for_tier(Tier::Medium)
            } else {
                ModelCapability::for_tier(Tier::Small)
            }
        }
        "mistral" | "codestral" => ModelCapability::for_tier(Tier::Medium),
        "mixtral" => ModelCapability::for_tier(Tier::Large),
        "llama2" => {
            if base.contains("70b") {
                ModelCapability::for_tier(Tier::Xl)
            } else if base.contains("13b") {
                ModelCapability::for_tier(Tier::Large)
            } else {
                ModelCapability::for_tier(Tier::Medium)
            }
        }
        "llama3" | "llama31" | "llama32" => {
            if base.contains("70b") || base.contains("405b") {
                ModelCapability::for_tier(Tier::Xl)
            } else {
                ModelCapability::for_tier(Tier::Medium)
            }
        }
        "gemma" | "gemma2" => {
            if base.contains("2b") {
                ModelCapability::for_tier(Tier::Small)
            } else {
                ModelCapability::for_tier(Tier::Medium)
            }
        }
        "qwen" | "qwen2" | "qwen25" => {
            if base.contains("72b") {
                ModelCapability::for_tier(Tier::Xl)
            } else if base.contains("32b") || base.contains("14b") {
                ModelCapability::for_tier(Tier::Large)
            } else {
                ModelCapability::for_tier(Tier::Medium)
            }
        }
        _ => return None,
    };
    Some(cap)
}

/// Parameter-count patterns, checked largest tier first so that e.g. "13b"
/// resolves to large before the small single-digit pattern can touch it.
static SIZE_PATTERNS: LazyLock<Vec<(Regex, Tier)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"\b(6[5-9]|7[02]|180|405)b\b").expect("xl size pattern"),
            Tier::Xl,
        ),
        (
            Regex::new(r"\b(1[3-9]|2\d|3\d)b\b|mixtral|8x7b").expect("large size pattern"),
            Tier::Large,
        ),
        (
            Regex::new(r"\b[7-9]b\b|mistral").expect("medium size pattern"),
            Tier::Medium,
        ),
        (
            Regex::new(r"\b[1-6](\.\d)?b\b").expect("small size pattern"),
            Tier::Small,
        ),
    ]
});

fn size_pattern_lookup(normalized: &str) -> Option<Tier> {
    SIZE_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(normalized))
        .map(|(_, tier)| *tier)
}

fn detect_type(lower: &str) -> ModelType {
    if lower.contains("whisper") {
        ModelType::Whisper
    } else if lower.contains("llava") || lower.contains("pixtral") || lower.contains("vision") {
        ModelType::Multimodal
    } else if lower.contains("stable-diffusion") || lower.contains("sdxl") || lower.contains("flux")
    {
        ModelType::Image
    } else {
        ModelType::Llm
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
