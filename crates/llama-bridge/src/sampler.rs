//! Next-token selection over a context's logits.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{Context, ContextId};
use crate::error::{BridgeError, Entity, Result};
use crate::pipeline;

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    /// 0 = greedy.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus threshold in (0, 1]; 1 disables the filter.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// 0 disables the filter.
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    /// 1.0 disables the penalty.
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// How many recently accepted tokens the penalty looks at.
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Fixed seed; `None` draws from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_p() -> f32 {
    0.95
}
fn default_top_k() -> i32 {
    40
}
fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_repeat_last_n() -> usize {
    64
}
fn default_max_tokens() -> u32 {
    128
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            repeat_last_n: default_repeat_last_n(),
            max_tokens: default_max_tokens(),
            seed: None,
        }
    }
}

impl SamplerParams {
    /// Deterministic argmax sampling.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(BridgeError::invalid(format!(
                "temperature must be finite and >= 0 (got {})",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(BridgeError::invalid(format!(
                "top_p must be in (0, 1] (got {})",
                self.top_p
            )));
        }
        if self.top_k < 0 {
            return Err(BridgeError::invalid(format!(
                "top_k must be >= 0 (got {})",
                self.top_k
            )));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(BridgeError::invalid(format!(
                "repetition_penalty must be positive (got {})",
                self.repetition_penalty
            )));
        }
        if self.max_tokens == 0 {
            return Err(BridgeError::invalid("max_tokens must be positive"));
        }
        Ok(())
    }
}

struct SamplerState {
    history: VecDeque<i32>,
    /// Persistent source for unseeded samplers.
    rng: StdRng,
}

/// Picks the next token from a logits vector.
///
/// Holds no native handle: only its parameters, the accepted-token history
/// for the repetition penalty, and a random source. Bound to the Context it
/// was created from.
pub struct Sampler {
    context: ContextId,
    params: SamplerParams,
    state: Option<SamplerState>,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("context", &self.context)
            .field("params", &self.params)
            .field("released", &self.state.is_none())
            .finish()
    }
}

impl Sampler {
    pub(crate) fn new(context: ContextId, params: SamplerParams) -> Result<Self> {
        params.validate()?;
        debug!(
            %context,
            temperature = params.temperature,
            top_p = params.top_p,
            top_k = params.top_k,
            seed = ?params.seed,
            "Sampler created"
        );
        Ok(Self {
            context,
            state: Some(SamplerState {
                history: VecDeque::with_capacity(params.repeat_last_n),
                rng: StdRng::from_entropy(),
            }),
            params,
        })
    }

    fn state(&mut self) -> Result<&mut SamplerState> {
        self.state
            .as_mut()
            .ok_or(BridgeError::released(Entity::Sampler))
    }

    pub fn params(&self) -> &SamplerParams {
        &self.params
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    //  Sampling

    /// Run the sampling pipeline over `logits` and return a token id in
    /// `[0, logits.len())`.
    ///
    /// With a fixed seed the same logits (and history) always give the same
    /// token.
    pub fn sample(&mut self, logits: &[f32]) -> Result<i32> {
        let params = self.params.clone();
        let state = self.state()?;
        if logits.is_empty() {
            return Err(BridgeError::invalid("cannot sample from empty logits"));
        }
        let history = state.history.make_contiguous();

        let mut work = logits.to_vec();
        pipeline::apply_repetition_penalty(&mut work, history, params.repetition_penalty);

        let id = if params.temperature == 0.0 {
            pipeline::argmax(&work)
        } else {
            let top_k = usize::try_from(params.top_k).unwrap_or(0);
            match pipeline::distribution(&work, params.temperature, params.top_p, top_k) {
                Some(probs) => {
                    let r: f32 = match params.seed {
                        Some(seed) => StdRng::seed_from_u64(seed).r#gen(),
                        None => state.rng.r#gen(),
                    };
                    pipeline::draw(&probs, r)
                }
                None => 0,
            }
        };

        i32::try_from(id).map_err(|_| BridgeError::invalid("vocabulary exceeds i32 token range"))
    }

    /// Sample from the bound context's current logits.
    pub fn sample_context(&mut self, ctx: &Context) -> Result<i32> {
        self.state()?;
        if ctx.id() != self.context {
            return Err(BridgeError::invalid(format!(
                "sampler is bound to {}, not {}",
                self.context,
                ctx.id()
            )));
        }
        self.sample(ctx.logits()?)
    }

    /// Record a generated token for the repetition penalty.
    pub fn accept(&mut self, token: i32) -> Result<()> {
        let window = self.params.repeat_last_n;
        let state = self.state()?;
        if window == 0 {
            return Ok(());
        }
        if state.history.len() == window {
            state.history.pop_front();
        }
        state.history.push_back(token);
        Ok(())
    }

    /// Forget accepted tokens.
    pub fn reset(&mut self) -> Result<()> {
        self.state()?.history.clear();
        Ok(())
    }

    pub fn history(&self) -> Result<Vec<i32>> {
        self.state
            .as_ref()
            .map(|s| s.history.iter().copied().collect())
            .ok_or(BridgeError::released(Entity::Sampler))
    }

    /// Release the sampler (idempotent). Independent of its Context.
    pub fn release(&mut self) {
        if self.state.take().is_some() {
            debug!(context = %self.context, "Sampler released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParams;
    use crate::testing::{Fixture, byte_token};

    fn sampler(params: SamplerParams) -> (Fixture, Sampler) {
        let fx = Fixture::new();
        let sampler = {
            let model = fx.load_model(ModelParams::default());
            let ctx = fx.context(&model, 32);
            ctx.create_sampler(&params).unwrap()
        };
        (fx, sampler)
    }

    #[test]
    fn test_greedy_returns_argmax_regardless_of_seed() {
        for seed in [None, Some(1), Some(42)] {
            let (_fx, mut s) = sampler(SamplerParams {
                temperature: 0.0,
                seed,
                ..Default::default()
            });
            assert_eq!(s.sample(&[0.1, 5.0, 2.0]).unwrap(), 1);
        }
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let (_fx, mut s) = sampler(SamplerParams {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            seed: Some(7),
            ..Default::default()
        });
        let logits = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let first = s.sample(&logits).unwrap();
        for _ in 0..20 {
            assert_eq!(s.sample(&logits).unwrap(), first);
        }
    }

    #[test]
    fn test_unseeded_sampler_stays_in_range() {
        let (_fx, mut s) = sampler(SamplerParams::default());
        let logits = [0.5, 2.0, -1.0, 3.0, 0.0];
        for _ in 0..200 {
            let id = s.sample(&logits).unwrap();
            assert!((0..5).contains(&id));
        }
    }

    #[test]
    fn test_top_k_one_behaves_like_greedy() {
        let (_fx, mut s) = sampler(SamplerParams {
            temperature: 1.5,
            top_k: 1,
            ..Default::default()
        });
        for _ in 0..50 {
            assert_eq!(s.sample(&[0.0, 1.0, 4.0, 2.0]).unwrap(), 2);
        }
    }

    #[test]
    fn test_non_finite_logits_still_yield_a_token() {
        let (_fx, mut s) = sampler(SamplerParams::default());
        assert_eq!(s.sample(&[f32::NAN, f32::NAN]).unwrap(), 0);
        assert_eq!(s.sample(&[f32::NEG_INFINITY, 0.0, f32::NAN]).unwrap(), 1);
    }

    #[test]
    fn test_tiny_temperature_draws_only_the_argmax() {
        for temperature in [1e-20, 1e-38, 1e-40] {
            let (_fx, mut s) = sampler(SamplerParams {
                temperature,
                top_p: 1.0,
                top_k: 0,
                repetition_penalty: 1.0,
                seed: None,
                ..Default::default()
            });
            for _ in 0..200 {
                assert_eq!(s.sample(&[0.1, 5.0, 2.0]).unwrap(), 1, "temperature {temperature}");
            }
        }
    }

    #[test]
    fn test_positive_infinity_logit_always_wins() {
        let (_fx, mut s) = sampler(SamplerParams {
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            ..Default::default()
        });
        for _ in 0..200 {
            assert_eq!(s.sample(&[f32::INFINITY, 5.0]).unwrap(), 0);
        }
    }

    #[test]
    fn test_empty_logits_are_invalid() {
        let (_fx, mut s) = sampler(SamplerParams::default());
        assert!(matches!(s.sample(&[]), Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_repetition_penalty_changes_greedy_choice() {
        let (_fx, mut s) = sampler(SamplerParams {
            temperature: 0.0,
            repetition_penalty: 2.0,
            ..Default::default()
        });
        let logits = [3.0, 2.0, 0.0];
        assert_eq!(s.sample(&logits).unwrap(), 0);
        s.accept(0).unwrap();
        assert_eq!(s.sample(&logits).unwrap(), 1);
        s.reset().unwrap();
        assert_eq!(s.sample(&logits).unwrap(), 0);
    }

    #[test]
    fn test_history_window_is_bounded() {
        let (_fx, mut s) = sampler(SamplerParams {
            repeat_last_n: 2,
            ..Default::default()
        });
        for t in [1, 2, 3] {
            s.accept(t).unwrap();
        }
        assert_eq!(s.history().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_invalid_params_rejected_at_creation() {
        let fx = Fixture::new();
        let model = fx.load_model(ModelParams::default());
        let ctx = fx.context(&model, 32);
        let bad = [
            SamplerParams { temperature: -0.1, ..Default::default() },
            SamplerParams { temperature: f32::NAN, ..Default::default() },
            SamplerParams { top_p: 0.0, ..Default::default() },
            SamplerParams { top_p: 1.2, ..Default::default() },
            SamplerParams { top_k: -1, ..Default::default() },
            SamplerParams { repetition_penalty: 0.0, ..Default::default() },
            SamplerParams { max_tokens: 0, ..Default::default() },
        ];
        for params in bad {
            assert!(matches!(
                ctx.create_sampler(&params),
                Err(BridgeError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_sample_context_reads_bound_context_only() {
        let fx = Fixture::new();
        let model = fx.load_model(ModelParams::default());
        let mut ctx = fx.context(&model, 32);
        let other = fx.context(&model, 32);
        let mut s = ctx.create_sampler(&SamplerParams::greedy()).unwrap();

        assert!(matches!(s.sample_context(&ctx), Err(BridgeError::NoLogitsAvailable)));

        let mut batch = ctx.create_batch(1).unwrap();
        batch.add_token(byte_token(b'x')).unwrap();
        ctx.process(&batch).unwrap();
        assert_eq!(s.sample_context(&ctx).unwrap(), byte_token(b'y'));

        assert!(matches!(s.sample_context(&other), Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_released_sampler_fails_and_release_is_idempotent() {
        let (_fx, mut s) = sampler(SamplerParams::default());
        s.release();
        s.release();
        assert!(matches!(
            s.sample(&[1.0]),
            Err(BridgeError::UseAfterRelease { entity: Entity::Sampler })
        ));
        assert!(s.accept(1).is_err());
        assert!(s.reset().is_err());
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let params: SamplerParams = serde_json::from_str(r#"{"temperature": 0.2}"#).unwrap();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.repeat_last_n, 64);
        assert_eq!(params.seed, None);
    }
}
