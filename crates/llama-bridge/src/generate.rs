//! Token generation loop.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{BatchResult, Context, DecodeFailure};
use crate::error::{BridgeError, Result};
use crate::sampler::Sampler;
use crate::tokenizer::Tokenizer;

/// Parameters for a generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Pre-tokenized prompt.
    pub prompt: Vec<i32>,
    /// Maximum tokens to generate; the sampler's `max_tokens` when `None`.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Stop-word strings.
    #[serde(default)]
    pub stop_words: Vec<String>,
}

/// Events emitted during generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateEvent {
    /// A new text piece was decoded.
    Token(String),
    /// Generation finished.
    Done {
        finish_reason: FinishReason,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// The engine failed mid-generation.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop (EOS / EOT token).
    Stop,
    /// Reached `max_tokens`.
    Length,
    /// Matched a stop word.
    StopWord(String),
    /// The context window has no room for another token.
    ContextFull,
    /// The event sink asked to stop.
    Cancelled,
    /// Decode failed for a reason other than a full context.
    Error,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
            Self::ContextFull => write!(f, "context_full"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Summary of a finished generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Run a synchronous generation loop on the calling thread.
///
/// Text pieces are delivered to `on_event` as they are produced; returning
/// `false` from it stops generation. Programmer errors (released entities,
/// an empty prompt, a sampler bound to another context) are returned as
/// `Err`; decode failures end generation with a [`FinishReason`].
pub fn generate<F>(
    ctx: &mut Context,
    sampler: &mut Sampler,
    tokenizer: &Tokenizer,
    request: &GenerateRequest,
    mut on_event: F,
) -> Result<Completion>
where
    F: FnMut(GenerateEvent) -> bool,
{
    if request.prompt.is_empty() {
        return Err(BridgeError::invalid("prompt must contain at least one token"));
    }
    let max_tokens = request.max_tokens.unwrap_or(sampler.params().max_tokens);
    let prompt_tokens = request.prompt.len() as u32;
    let mut completion = Completion {
        text: String::new(),
        finish_reason: FinishReason::Length,
        prompt_tokens,
        completion_tokens: 0,
    };

    //  Prompt processing
    let mut batch = ctx.create_batch(request.prompt.len())?;
    batch.add_tokens(&request.prompt)?;
    sampler.reset()?;

    let mut step = ctx.process(&batch)?;

    //  Token generation loop
    let finish_reason = loop {
        if let BatchResult::Failed(failure) = step {
            break decode_failed(failure, &mut on_event);
        }

        // Max-tokens guard
        if completion.completion_tokens >= max_tokens {
            break FinishReason::Length;
        }

        let token = sampler.sample_context(ctx)?;
        sampler.accept(token)?;
        completion.completion_tokens += 1;

        // EOS / EOT
        if tokenizer.is_end_of_generation(token)? {
            break FinishReason::Stop;
        }

        let piece = tokenizer.token_text(token)?;
        completion.text.push_str(&piece);

        // Stop-word check
        if let Some(sw) = request
            .stop_words
            .iter()
            .find(|sw| !sw.is_empty() && completion.text.ends_with(sw.as_str()))
        {
            break FinishReason::StopWord(sw.clone());
        }

        if !on_event(GenerateEvent::Token(piece)) {
            debug!("Generation cancelled by event sink");
            completion.finish_reason = FinishReason::Cancelled;
            return Ok(completion);
        }

        // Next decode step; positions continue from the prompt.
        batch.clear()?;
        batch.add_token(token)?;
        step = ctx.process(&batch)?;
    };

    completion.finish_reason = finish_reason;
    on_event(GenerateEvent::Done {
        finish_reason: completion.finish_reason.clone(),
        prompt_tokens,
        completion_tokens: completion.completion_tokens,
    });
    debug!(
        finish_reason = %completion.finish_reason,
        completion_tokens = completion.completion_tokens,
        "Generation finished"
    );
    Ok(completion)
}

fn decode_failed<F>(failure: DecodeFailure, on_event: &mut F) -> FinishReason
where
    F: FnMut(GenerateEvent) -> bool,
{
    match failure {
        DecodeFailure::NoKvSlot => FinishReason::ContextFull,
        other => {
            on_event(GenerateEvent::Error(format!("decode: {other}")));
            FinishReason::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParams;
    use crate::sampler::SamplerParams;
    use crate::testing::{Fixture, byte_token};

    struct Run {
        completion: Completion,
        events: Vec<GenerateEvent>,
    }

    fn run(fx: &Fixture, n_ctx: u32, prompt: &str, request: GenerateRequest) -> Run {
        let model = fx.load_model(ModelParams::default());
        let tokenizer = model.tokenizer().unwrap();
        let mut ctx = fx.context(&model, n_ctx);
        let mut sampler = ctx.create_sampler(&SamplerParams::greedy()).unwrap();
        let request = GenerateRequest {
            prompt: tokenizer.tokenize(prompt).unwrap(),
            ..request
        };

        let mut events = Vec::new();
        let completion = generate(&mut ctx, &mut sampler, &tokenizer, &request, |e| {
            events.push(e);
            true
        })
        .unwrap();
        Run { completion, events }
    }

    #[test]
    fn test_stops_at_end_of_generation_token() {
        let fx = Fixture::new();
        let run = run(&fx, 64, ",", GenerateRequest::default());
        assert_eq!(run.completion.text, "-.");
        assert_eq!(run.completion.finish_reason, FinishReason::Stop);
        assert_eq!(run.completion.completion_tokens, 3);
        assert_eq!(
            run.events.last(),
            Some(&GenerateEvent::Done {
                finish_reason: FinishReason::Stop,
                prompt_tokens: 1,
                completion_tokens: 3,
            })
        );
    }

    #[test]
    fn test_max_tokens_limits_output() {
        let fx = Fixture::new();
        let request = GenerateRequest {
            max_tokens: Some(2),
            ..Default::default()
        };
        let run = run(&fx, 64, "a", request);
        assert_eq!(run.completion.text, "bc");
        assert_eq!(run.completion.finish_reason, FinishReason::Length);
        let tokens: Vec<_> = run
            .events
            .iter()
            .filter(|e| matches!(e, GenerateEvent::Token(_)))
            .collect();
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_stop_word_ends_generation() {
        let fx = Fixture::new();
        let request = GenerateRequest {
            stop_words: vec!["cd".into()],
            ..Default::default()
        };
        let run = run(&fx, 64, "a", request);
        assert_eq!(run.completion.finish_reason, FinishReason::StopWord("cd".into()));
        assert_eq!(run.completion.text, "bcd");
        assert_eq!(
            &run.events[..2],
            &[GenerateEvent::Token("b".into()), GenerateEvent::Token("c".into())]
        );
    }

    #[test]
    fn test_full_context_is_a_finish_reason() {
        let fx = Fixture::new();
        let run = run(&fx, 4, "ab", GenerateRequest::default());
        assert_eq!(run.completion.finish_reason, FinishReason::ContextFull);
        assert_eq!(run.completion.text, "cde");
    }

    #[test]
    fn test_sink_can_cancel() {
        let fx = Fixture::new();
        let model = fx.load_model(ModelParams::default());
        let tokenizer = model.tokenizer().unwrap();
        let mut ctx = fx.context(&model, 64);
        let mut sampler = ctx.create_sampler(&SamplerParams::greedy()).unwrap();
        let request = GenerateRequest {
            prompt: vec![byte_token(b'a')],
            ..Default::default()
        };

        let mut seen = 0;
        let completion = generate(&mut ctx, &mut sampler, &tokenizer, &request, |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(completion.finish_reason, FinishReason::Cancelled);
        assert_eq!(completion.completion_tokens, 1);
    }

    #[test]
    fn test_engine_error_is_reported_as_event() {
        let fx = Fixture::new();
        let model = fx.load_model(ModelParams::default());
        let tokenizer = model.tokenizer().unwrap();
        let mut ctx = fx.context(&model, 64);
        let mut sampler = ctx.create_sampler(&SamplerParams::greedy()).unwrap();
        let request = GenerateRequest {
            prompt: vec![byte_token(b'a')],
            ..Default::default()
        };

        fx.engine.fail_next_decode(-3);
        let mut events = Vec::new();
        let completion = generate(&mut ctx, &mut sampler, &tokenizer, &request, |e| {
            events.push(e);
            true
        })
        .unwrap();
        assert_eq!(completion.finish_reason, FinishReason::Error);
        assert!(matches!(&events[0], GenerateEvent::Error(msg) if msg.contains("-3")));
    }

    #[test]
    fn test_empty_prompt_is_invalid() {
        let fx = Fixture::new();
        let model = fx.load_model(ModelParams::default());
        let tokenizer = model.tokenizer().unwrap();
        let mut ctx = fx.context(&model, 64);
        let mut sampler = ctx.create_sampler(&SamplerParams::greedy()).unwrap();
        let err = generate(
            &mut ctx,
            &mut sampler,
            &tokenizer,
            &GenerateRequest::default(),
            |_| true,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }
}
