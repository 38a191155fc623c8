//! Tokenizer loading and saving.

use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::error::{Result, TuneError};
use crate::prompt::TextEncoder;

/// Files copied next to `tokenizer.json` when saving.
const TOKENIZER_SIDE_FILES: &[&str] = &["tokenizer_config.json", "special_tokens_map.json"];

/// EOS spellings tried when `tokenizer_config.json` does not name one.
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<|im_end|>", "<eos>"];

/// Tokenizer plus the special tokens training needs.
#[derive(Debug, Clone)]
pub struct TokenizerBundle {
    /// Underlying tokenizer.
    pub tokenizer: Tokenizer,
    /// End-of-sequence token text.
    pub eos_token: String,
    /// End-of-sequence token id.
    pub eos_token_id: u32,
    /// Padding id; the EOS id when the tokenizer defines no pad token.
    pub pad_token_id: u32,
    source_dir: Option<PathBuf>,
}

impl TokenizerBundle {
    /// Wrap a tokenizer, using `eos_token` for both EOS and padding.
    ///
    /// # Errors
    ///
    /// Returns an error if `eos_token` is not in the vocabulary.
    pub fn new(tokenizer: Tokenizer, eos_token: &str) -> Result<Self> {
        let eos_token_id = tokenizer.token_to_id(eos_token).ok_or_else(|| {
            TuneError::Model(format!("EOS token {eos_token:?} not in vocabulary"))
        })?;
        Ok(Self {
            tokenizer,
            eos_token: eos_token.to_string(),
            eos_token_id,
            pad_token_id: eos_token_id,
            source_dir: None,
        })
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl TextEncoder for TokenizerBundle {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.tokenizer.encode(text, true)?.get_ids().to_vec())
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }
}

/// Read a special token from `tokenizer_config.json`, which stores either a
/// plain string or an object with a `content` field.
fn special_token(config: &serde_json::Value, key: &str) -> Option<String> {
    match config.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("content")
            .and_then(serde_json::Value::as_str)
            .map(String::from),
        _ => None,
    }
}

/// Load `tokenizer.json` from a model directory.
///
/// EOS comes from `tokenizer_config.json` when present, otherwise from a list
/// of common spellings. The pad token defaults to EOS.
///
/// # Errors
///
/// Returns an error if the tokenizer is missing or has no recognizable EOS.
pub fn load_tokenizer<P: AsRef<Path>>(model_path: P) -> Result<TokenizerBundle> {
    let dir = model_path.as_ref();
    let tokenizer_file = dir.join("tokenizer.json");
    if !tokenizer_file.exists() {
        return Err(TuneError::Model(format!(
            "tokenizer.json not found in {}",
            dir.display()
        )));
    }
    let tokenizer = Tokenizer::from_file(&tokenizer_file)?;

    let config: serde_json::Value = match std::fs::read_to_string(dir.join("tokenizer_config.json")) {
        Ok(content) => serde_json::from_str(&content)?,
        Err(_) => serde_json::Value::Null,
    };

    let eos_token = special_token(&config, "eos_token")
        .filter(|t| tokenizer.token_to_id(t).is_some())
        .or_else(|| {
            EOS_CANDIDATES
                .iter()
                .find(|t| tokenizer.token_to_id(t).is_some())
                .map(|t| (*t).to_string())
        })
        .ok_or_else(|| TuneError::Model("tokenizer has no EOS token".into()))?;

    let mut bundle = TokenizerBundle::new(tokenizer, &eos_token)?;
    match special_token(&config, "pad_token").and_then(|t| bundle.tokenizer.token_to_id(&t)) {
        Some(pad) => bundle.pad_token_id = pad,
        None => tracing::info!("No pad token; using EOS ({eos_token}) for padding"),
    }
    bundle.source_dir = Some(dir.to_path_buf());

    tracing::info!(
        "Loaded tokenizer with vocab size {} (eos={}, pad_id={})",
        bundle.vocab_size(),
        bundle.eos_token,
        bundle.pad_token_id
    );
    Ok(bundle)
}

/// Save the tokenizer into `dir`.
///
/// Side files from the source directory are copied as-is; when there are
/// none a minimal `tokenizer_config.json` recording EOS and pad is written.
///
/// # Errors
///
/// Returns an error if a file cannot be written.
pub fn save_tokenizer<P: AsRef<Path>>(bundle: &TokenizerBundle, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    bundle.tokenizer.save(dir.join("tokenizer.json"), false)?;

    let mut copied = false;
    if let Some(source) = &bundle.source_dir {
        for name in TOKENIZER_SIDE_FILES {
            let src = source.join(name);
            if src.exists() && source != dir {
                std::fs::copy(&src, dir.join(name))?;
                copied = true;
            }
        }
    }
    if !copied && !dir.join("tokenizer_config.json").exists() {
        let pad_token = bundle
            .tokenizer
            .id_to_token(bundle.pad_token_id)
            .unwrap_or_else(|| bundle.eos_token.clone());
        let config = serde_json::json!({
            "eos_token": bundle.eos_token,
            "pad_token": pad_token,
        });
        std::fs::write(
            dir.join("tokenizer_config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
    }

    tracing::debug!("Saved tokenizer to {}", dir.display());
    Ok(())
}
