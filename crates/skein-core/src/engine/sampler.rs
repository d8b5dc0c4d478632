//! Per-job sampling pipeline: temperature, top-p, seeded RNG and the
//! optional grammar constraint.
//!
//! The chain is built once at submission (grammar and schema errors surface
//! before any slot or KV state is touched) and owned by the job until it
//! terminates.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::backend::Token;
use crate::engine::errors::EngineError;
use crate::engine::grammar::{Grammar, GrammarMatcher};
use crate::engine::schema::json_schema_to_grammar;
use crate::engine::tokenizer::Tokenizer;

/// Inputs to [`build_sampler`].
pub(crate) struct SamplerSpec<'a> {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
    pub grammar: Option<&'a str>,
    pub json_schema: Option<&'a str>,
}

/// Assemble a per-job sampler. At most one of grammar / JSON schema may be
/// set (enforced by parameter validation); a schema is converted to a grammar
/// deterministically before the chain is built.
pub(crate) fn build_sampler(spec: SamplerSpec<'_>) -> Result<SamplerChain, EngineError> {
    let grammar_text = match (spec.grammar, spec.json_schema) {
        (Some(g), _) => Some(g.to_owned()),
        (None, Some(schema)) => Some(json_schema_to_grammar(schema)?),
        (None, None) => None,
    };
    let matcher = grammar_text
        .map(|text| {
            Grammar::parse(&text)
                .map(|g| GrammarMatcher::new(Arc::new(g)))
                .map_err(|e| EngineError::InvalidGrammar {
                    message: e.to_string(),
                })
        })
        .transpose()?;

    Ok(SamplerChain {
        temperature: spec.temperature,
        top_p: spec.top_p,
        rng: StdRng::seed_from_u64(spec.seed),
        grammar: matcher,
    })
}

#[derive(Debug)]
pub(crate) struct SamplerChain {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
    grammar: Option<GrammarMatcher>,
}

impl SamplerChain {
    /// Sample the next token from `logits`.
    ///
    /// With a grammar attached, the unconstrained pick is validated first and
    /// a constrained resample runs only when it is rejected (so the grammar
    /// walk over the vocabulary is paid on the slow path only). When the
    /// grammar admits nothing, the end-of-generation token is returned and the
    /// job terminates normally.
    pub fn sample(&mut self, logits: &[f32], tokenizer: &dyn Tokenizer) -> Token {
        let picked = self.pick(logits, None);
        let Some(grammar) = self.grammar.as_ref() else {
            return picked;
        };
        if Self::admissible(grammar, picked, tokenizer) {
            return picked;
        }

        let allowed: Vec<Token> = (0..logits.len() as Token)
            .filter(|&t| Self::admissible(grammar, t, tokenizer))
            .collect();
        if allowed.is_empty() {
            return tokenizer.eog_token();
        }
        self.pick(logits, Some(&allowed))
    }

    /// Advance sampler state with an accepted token.
    ///
    /// Prompt tokens are fed through here as well; pieces the grammar cannot
    /// consume leave its state untouched, so only generated text advances the
    /// constraint.
    pub fn accept(&mut self, token: Token, tokenizer: &dyn Tokenizer) {
        if let Some(grammar) = self.grammar.as_mut() {
            if !tokenizer.is_eog(token) {
                let piece = tokenizer.decode_one(token);
                if !piece.is_empty() {
                    let _ = grammar.accept_text(&piece);
                }
            }
        }
    }

    fn admissible(grammar: &GrammarMatcher, token: Token, tokenizer: &dyn Tokenizer) -> bool {
        if tokenizer.is_eog(token) {
            return grammar.can_finish();
        }
        let piece = tokenizer.decode_one(token);
        // Tokens with no text (control tokens) cannot advance the constraint.
        !piece.is_empty() && grammar.allows_text(&piece)
    }

    /// Temperature / top-p selection over `logits`, optionally restricted to
    /// `allowed` token ids.
    fn pick(&mut self, logits: &[f32], allowed: Option<&[Token]>) -> Token {
        let candidates: Vec<(Token, f32)> = match allowed {
            Some(ids) => ids.iter().map(|&t| (t, logits[t as usize])).collect(),
            None => logits
                .iter()
                .enumerate()
                .map(|(i, &l)| (i as Token, l))
                .collect(),
        };
        debug_assert!(!candidates.is_empty());

        if self.temperature <= 0.0 {
            return candidates
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|&(t, _)| t)
                .unwrap_or_default();
        }

        // Softmax at the configured temperature.
        let mut scored: Vec<(Token, f32)> = candidates
            .into_iter()
            .map(|(t, l)| (t, l / self.temperature))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let max = scored[0].1;
        let mut total = 0.0f32;
        for (_, s) in scored.iter_mut() {
            *s = (*s - max).exp();
            total += *s;
        }

        // Nucleus truncation, keeping at least one candidate.
        let mut kept = scored.len();
        if self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            for (i, (_, p)) in scored.iter().enumerate() {
                cumulative += p / total;
                if cumulative >= self.top_p {
                    kept = i + 1;
                    break;
                }
            }
        }
        scored.truncate(kept);

        let total: f32 = scored.iter().map(|&(_, p)| p).sum();
        let mut roll = self.rng.gen::<f32>() * total;
        for &(t, p) in &scored {
            roll -= p;
            if roll <= 0.0 {
                return t;
            }
        }
        scored.last().map(|&(t, _)| t).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockTokenizer;

    fn spec(temperature: f32, top_p: f32, seed: u64) -> SamplerSpec<'static> {
        SamplerSpec {
            temperature,
            top_p,
            seed,
            grammar: None,
            json_schema: None,
        }
    }

    fn logits_favoring(token: Token, vocab: usize) -> Vec<f32> {
        let mut l = vec![0.0f32; vocab];
        l[token as usize] = 12.0;
        l
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let tok = MockTokenizer::new();
        let mut chain = build_sampler(spec(0.0, 1.0, 7)).unwrap();
        let logits = logits_favoring(b'q' as Token, 258);
        assert_eq!(chain.sample(&logits, &tok), b'q' as Token);
    }

    #[test]
    fn same_seed_same_draws() {
        let tok = MockTokenizer::new();
        let logits: Vec<f32> = (0..258).map(|i| ((i * 37) % 100) as f32 / 10.0).collect();
        let mut a = build_sampler(spec(0.9, 0.95, 42)).unwrap();
        let mut b = build_sampler(spec(0.9, 0.95, 42)).unwrap();
        for _ in 0..16 {
            assert_eq!(a.sample(&logits, &tok), b.sample(&logits, &tok));
        }
    }

    #[test]
    fn top_p_filters_the_tail() {
        let tok = MockTokenizer::new();
        // One dominant candidate: nucleus of 0.5 keeps only it.
        let logits = logits_favoring(b'a' as Token, 258);
        let mut chain = build_sampler(spec(0.8, 0.5, 3)).unwrap();
        for _ in 0..8 {
            assert_eq!(chain.sample(&logits, &tok), b'a' as Token);
        }
    }

    #[test]
    fn grammar_masks_disallowed_tokens() {
        let tok = MockTokenizer::new();
        let mut chain = build_sampler(SamplerSpec {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
            grammar: Some("root ::= [0-9] [0-9]"),
            json_schema: None,
        })
        .unwrap();
        // The unconstrained argmax is a letter; the grammar forces a digit.
        let logits = logits_favoring(b'z' as Token, 258);
        let first = chain.sample(&logits, &tok);
        assert!((b'0'..=b'9').contains(&(first as u8)));
        chain.accept(first, &tok);
        let second = chain.sample(&logits, &tok);
        assert!((b'0'..=b'9').contains(&(second as u8)));
        chain.accept(second, &tok);
        // Grammar exhausted: only end-of-generation remains admissible.
        let third = chain.sample(&logits, &tok);
        assert_eq!(third, tok.eog_token());
    }

    #[test]
    fn schema_is_converted_before_the_chain_is_built() {
        let err = build_sampler(SamplerSpec {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
            grammar: None,
            json_schema: Some("{broken"),
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGrammar { .. }));
    }

    #[test]
    fn malformed_grammar_fails_construction() {
        let err = build_sampler(SamplerSpec {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
            grammar: Some("root ::= nowhere"),
            json_schema: None,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGrammar { .. }));
    }

    #[test]
    fn prompt_pieces_never_corrupt_grammar_state() {
        let tok = MockTokenizer::new();
        let mut chain = build_sampler(SamplerSpec {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
            grammar: Some("root ::= [0-9] [0-9] [0-9] [0-9]"),
            json_schema: None,
        })
        .unwrap();
        // Feed prompt text that the grammar cannot consume.
        for t in tok.tokenize("Output a number:", false).unwrap() {
            chain.accept(t, &tok);
        }
        let logits = logits_favoring(b'k' as Token, 258);
        let first = chain.sample(&logits, &tok);
        assert!((b'0'..=b'9').contains(&(first as u8)), "state still at root");
    }
}
