use crate::activation_cache::{TensorDecodeError, decode_activations};
use crate::backend::{Backend, BackendError};
use crate::protocol::InferenceResponse;
use ndarray::ArrayD;
use std::collections::HashMap;

/// Identifies one issued inference request. Tickets are strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InferenceTicket(u64);

impl InferenceTicket {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Hands out request tickets and decides which response may be applied.
///
/// Only the response to the most recently issued request is accepted, so a
/// slow answer to an older request can never overwrite a newer one.
#[derive(Debug, Clone, Default)]
pub struct InferenceTracker {
    next_ticket: u64,
    latest: Option<InferenceTicket>,
    inferencing: bool,
}

impl InferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> InferenceTicket {
        let ticket = InferenceTicket(self.next_ticket);
        self.next_ticket += 1;
        self.latest = Some(ticket);
        self.inferencing = true;
        ticket
    }

    pub fn is_current(&self, ticket: InferenceTicket) -> bool {
        self.latest == Some(ticket)
    }

    /// Mark `ticket` as answered. Returns whether its response should be used.
    pub fn finish(&mut self, ticket: InferenceTicket) -> bool {
        if self.is_current(ticket) {
            self.inferencing = false;
            true
        } else {
            log::info!(
                "Dropping response to inference request {}, request {:?} is newer",
                ticket.id(),
                self.latest.map(|latest| latest.id())
            );
            false
        }
    }

    /// Forget every outstanding request; their answers will be dropped.
    pub fn invalidate(&mut self) {
        if let Some(latest) = self.latest.take() {
            log::debug!("Invalidated inference requests up to {}", latest.id());
        }
        self.inferencing = false;
    }

    /// Busy flag for disabling re-entrant triggers in the UI.
    pub fn inferencing(&self) -> bool {
        self.inferencing
    }
}

/// Decoded result of one inference run, minus the activations.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub prompt: Vec<String>,
    pub prompt_sub_words: Vec<Vec<String>>,
    pub logits: ArrayD<f32>,
    pub tokens: Vec<Vec<u32>>,
    pub sub_words: Vec<Vec<String>>,
    pub token_loss: ArrayD<f32>,
    pub final_loss: f32,
}

impl InferenceOutput {
    /// Split a response into the output and its decoded activations.
    pub fn decode(
        response: InferenceResponse,
    ) -> Result<(Self, HashMap<String, ArrayD<f32>>), TensorDecodeError> {
        let activations = decode_activations(&response.activation_data)?;
        let output = Self {
            logits: response.logits.to_array()?,
            token_loss: response.token_loss.to_array()?,
            prompt: response.inference_prompt,
            prompt_sub_words: response.inference_sub_words,
            tokens: response.tokens,
            sub_words: response.sub_words,
            final_loss: response.final_loss,
        };
        Ok((output, activations))
    }

    /// Highest scoring token id at every position of the first batch entry.
    pub fn top_tokens(&self) -> Vec<u32> {
        if self.logits.ndim() != 3 {
            return vec![];
        }
        self.logits
            .index_axis(ndarray::Axis(0), 0)
            .outer_iter()
            .map(|position| {
                position
                    .iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (i, x)| {
                        if *x > best.1 { (i, *x) } else { best }
                    })
                    .0 as u32
            })
            .collect()
    }
}

/// Prompt text and its tokenization as last reported by the backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PromptState {
    pub input_text: Vec<String>,
    pub input_tokens: Vec<Vec<u32>>,
    pub input_sub_words: Vec<Vec<String>>,
}

impl PromptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `text` and re-tokenize it. Both tokenize calls are independent:
    /// whichever succeeds is applied, a failing one keeps the previous value.
    pub fn update_input_text<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        text: &str,
    ) -> Result<(), BackendError> {
        self.input_text = vec![text.to_string()];
        let tokens = backend.to_tokens(&self.input_text);
        let sub_words = backend.to_string_tokens(&self.input_text);
        let mut first_error = None;
        match tokens {
            Ok(response) => self.input_tokens = response.tokens,
            Err(error) => {
                log::warn!("Tokenizing prompt failed: {error}");
                first_error = Some(error);
            }
        }
        match sub_words {
            Ok(response) => self.input_sub_words = response.string_tokens,
            Err(error) => {
                log::warn!("Splitting prompt into sub words failed: {error}");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
