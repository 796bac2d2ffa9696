//! Token counting used to infer usage that was not ingested.
//!
//! Two tokenizer families are supported, selected by a model definition's `tokenizer_id`:
//!
//! - `openai`: tiktoken BPE encodings. The encoding is picked from `tokenizerModel` in the
//!   tokenizer config, then from the generation's model name, falling back to `cl100k_base`.
//! - `huggingface`: a `tokenizer.json` file loaded from `path` in the tokenizer config.
//!
//! Chat-formatted payloads (arrays of `{role, content, name?}` objects) are counted with
//! per-message framing: `tokensPerMessage` for every message, `tokensPerName` for every `name`
//! field, plus a fixed reply-priming overhead for OpenAI encodings.
//!
//! Loaded encoders are cached for the lifetime of the process: OpenAI encoders per encoding (so
//! every model name sharing an encoding shares one encoder), Hugging Face tokenizers per path.

use crate::db::models::model_definitions::TokenizerConfig;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::Tokenizer as Encoding;
use tokenizers::Tokenizer;

const DEFAULT_OPENAI_ENCODING: Encoding = Encoding::Cl100kBase;
const OPENAI_TOKENS_PER_MESSAGE: i64 = 3;
const OPENAI_TOKENS_PER_NAME: i64 = 1;
// every reply is primed with <|start|>assistant<|message|>
const OPENAI_REPLY_PRIMING: i64 = 3;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("unsupported tokenizer '{0}'")]
    Unsupported(String),

    #[error("invalid tokenizer configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load tokenizer {name}: {message}")]
    Load { name: String, message: String },

    #[error("failed to encode text: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    OpenAi,
    HuggingFace,
}

impl FromStr for TokenizerKind {
    type Err = TokenizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(TokenizerKind::OpenAi),
            "huggingface" => Ok(TokenizerKind::HuggingFace),
            other => Err(TokenizerError::Unsupported(other.to_string())),
        }
    }
}

/// How chat messages are framed when counting.
#[derive(Debug, Clone, Copy)]
struct ChatFraming {
    per_message: i64,
    per_name: i64,
    reply_priming: i64,
}

impl ChatFraming {
    fn for_kind(kind: TokenizerKind, config: Option<&TokenizerConfig>) -> Self {
        let (per_message, per_name, reply_priming) = match kind {
            TokenizerKind::OpenAi => (OPENAI_TOKENS_PER_MESSAGE, OPENAI_TOKENS_PER_NAME, OPENAI_REPLY_PRIMING),
            TokenizerKind::HuggingFace => (0, 0, 0),
        };
        Self {
            per_message: config.and_then(|c| c.tokens_per_message).unwrap_or(per_message),
            per_name: config.and_then(|c| c.tokens_per_name).unwrap_or(per_name),
            reply_priming,
        }
    }
}

/// Check that a tokenizer id and its configuration can be used, without loading anything.
pub fn validate(tokenizer_id: &str, config: Option<&TokenizerConfig>) -> Result<()> {
    let kind = TokenizerKind::from_str(tokenizer_id)?;
    if let Some(config) = config {
        if config.tokens_per_message.is_some_and(|n| n < 0) || config.tokens_per_name.is_some_and(|n| n < 0) {
            return Err(TokenizerError::InvalidConfig(
                "tokensPerMessage and tokensPerName must not be negative".to_string(),
            ));
        }
    }
    if kind == TokenizerKind::HuggingFace && config.and_then(|c| c.path.as_deref()).is_none() {
        return Err(TokenizerError::InvalidConfig(
            "huggingface tokenizers require a tokenizer.json path".to_string(),
        ));
    }
    Ok(())
}

/// Count the tokens of a recorded input or output payload.
///
/// `model` is the generation's model name, used to pick an OpenAI encoding when the tokenizer
/// config does not name one.
pub fn count_tokens(tokenizer_id: &str, config: Option<&TokenizerConfig>, model: &str, value: &Value) -> Result<i64> {
    let kind = TokenizerKind::from_str(tokenizer_id)?;
    let framing = ChatFraming::for_kind(kind, config);

    match kind {
        TokenizerKind::OpenAi => {
            let hint = config.and_then(|c| c.tokenizer_model.as_deref()).unwrap_or(model);
            let bpe = openai_encoder(hint)?;
            count_value(value, framing, &|text| Ok(bpe.encode_with_special_tokens(text).len()))
        }
        TokenizerKind::HuggingFace => {
            let path = config
                .and_then(|c| c.path.as_deref())
                .ok_or_else(|| TokenizerError::InvalidConfig("missing tokenizer path".to_string()))?;
            let tokenizer = huggingface_tokenizer(path)?;
            count_value(value, framing, &|text| {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| TokenizerError::Encode(e.to_string()))?;
                Ok(encoding.get_ids().len())
            })
        }
    }
}

fn count_value(value: &Value, framing: ChatFraming, encode: &dyn Fn(&str) -> Result<usize>) -> Result<i64> {
    match value {
        Value::Null => Ok(0),
        Value::String(text) => Ok(encode(text)? as i64),
        Value::Array(items) if !items.is_empty() && items.iter().all(is_chat_message) => {
            let mut total = 0i64;
            for message in items {
                total += framing.per_message;
                if let Some(fields) = message.as_object() {
                    for (key, field) in fields {
                        total += encode(&as_text(field))? as i64;
                        if key == "name" {
                            total += framing.per_name;
                        }
                    }
                }
            }
            Ok(total + framing.reply_priming)
        }
        other => Ok(encode(&as_text(other))? as i64),
    }
}

fn is_chat_message(value: &Value) -> bool {
    value.as_object().is_some_and(|fields| fields.contains_key("role"))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The tiktoken encoding for a model name, `cl100k_base` for names tiktoken doesn't know.
fn encoding_for_model(model_hint: &str) -> Encoding {
    tiktoken_rs::tokenizer::get_tokenizer(model_hint).unwrap_or_else(|| {
        tracing::debug!(model = %model_hint, "No tiktoken encoding for model, using {:?}", DEFAULT_OPENAI_ENCODING);
        DEFAULT_OPENAI_ENCODING
    })
}

fn openai_encoder(model_hint: &str) -> Result<Arc<CoreBPE>> {
    static CACHE: OnceLock<Mutex<HashMap<Encoding, Arc<CoreBPE>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    let encoding = encoding_for_model(model_hint);
    if let Some(bpe) = cache.lock().get(&encoding) {
        return Ok(bpe.clone());
    }

    let bpe = tiktoken_rs::get_bpe_from_tokenizer(encoding).map_err(|e| TokenizerError::Load {
        name: format!("{encoding:?}"),
        message: e.to_string(),
    })?;
    // first loader wins if two threads raced
    Ok(cache.lock().entry(encoding).or_insert_with(|| Arc::new(bpe)).clone())
}

fn huggingface_tokenizer(path: &str) -> Result<Arc<Tokenizer>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Tokenizer>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    if let Some(tokenizer) = cache.lock().get(path) {
        return Ok(tokenizer.clone());
    }

    let tokenizer = Tokenizer::from_file(path).map_err(|e| TokenizerError::Load {
        name: path.to_string(),
        message: e.to_string(),
    })?;
    let tokenizer = Arc::new(tokenizer);
    cache.lock().insert(path.to_string(), tokenizer.clone());
    Ok(tokenizer)
}
