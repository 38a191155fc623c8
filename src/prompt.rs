//! Prompt rendering and tokenization with prompt masking.
//!
//! Every record becomes `prompt + output + eos`. Label positions covered by
//! the prompt are set to [`IGNORE_INDEX`] so only the response contributes to
//! the loss.

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::PromptSettings;
use crate::dataset::Record;
use crate::error::Result;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Text-to-token-id encoding.
///
/// Implemented by [`crate::model::TokenizerBundle`]; tests use small
/// hand-written encoders.
pub trait TextEncoder {
    /// Encode text into token ids, adding the tokenizer's special tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying tokenizer fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// End-of-sequence token text appended after every response.
    fn eos_token(&self) -> &str;
}

/// Chat template with `<|system|>`, `<|user|>` and `<|assistant|>` turns.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system_prompt: String,
}

impl PromptTemplate {
    /// Create a template with the given system message.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    /// Render the prompt for one instruction, ending at the assistant turn.
    #[must_use]
    pub fn render(&self, instruction: &str) -> String {
        format!(
            "<|system|>\n{}\n\n<|user|>\n{instruction}\n\n<|assistant|>\n",
            self.system_prompt
        )
    }
}

impl From<&PromptSettings> for PromptTemplate {
    fn from(settings: &PromptSettings) -> Self {
        Self::new(settings.system_prompt.clone())
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::from(&PromptSettings::default())
    }
}

/// One tokenized training example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    /// Token ids of `prompt + output + eos`, truncated.
    pub input_ids: Vec<u32>,
    /// All ones until collation pads the sequence.
    pub attention_mask: Vec<u32>,
    /// Loss targets, [`IGNORE_INDEX`] over the prompt.
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    /// Sequence length, used for length-grouped batching.
    #[must_use]
    pub fn length(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of positions that contribute to the loss.
    #[must_use]
    pub fn num_target_tokens(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }
}

/// Tokenize one record.
///
/// Returns `Ok(None)` when truncation to `max_length` leaves no response token.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn tokenize_example<E: TextEncoder + ?Sized>(
    encoder: &E,
    template: &PromptTemplate,
    record: &Record,
    max_length: usize,
) -> Result<Option<TokenizedExample>> {
    let prompt = template.render(&record.instruction);
    let full_text = format!("{prompt}{}{}", record.output, encoder.eos_token());

    let mut input_ids = encoder.encode(&full_text)?;
    input_ids.truncate(max_length);

    let prompt_len = encoder.encode(&prompt)?.len();
    if prompt_len >= input_ids.len() {
        return Ok(None);
    }

    let labels = input_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| {
            if i < prompt_len {
                IGNORE_INDEX
            } else {
                i64::from(id)
            }
        })
        .collect();

    Ok(Some(TokenizedExample {
        attention_mask: vec![1; input_ids.len()],
        input_ids,
        labels,
    }))
}

/// Tokenize a split, dropping records whose prompt fills `max_length`.
///
/// # Errors
///
/// Returns an error if encoding fails or the progress bar cannot be styled.
pub fn tokenize_records<E: TextEncoder + ?Sized>(
    encoder: &E,
    template: &PromptTemplate,
    records: &[Record],
    max_length: usize,
    desc: &str,
) -> Result<Vec<TokenizedExample>> {
    let pb = ProgressBar::new(records.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("#>-"),
    );
    pb.set_message(desc.to_string());

    let mut examples = Vec::with_capacity(records.len());
    for record in records {
        if let Some(example) = tokenize_example(encoder, template, record, max_length)? {
            examples.push(example);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let dropped = records.len() - examples.len();
    if dropped > 0 {
        tracing::warn!(
            "{desc}: dropped {dropped} of {} examples whose prompt exceeds max_length={max_length}",
            records.len()
        );
    }
    tracing::info!("{desc}: {} tokenized examples", examples.len());

    Ok(examples)
}
