//! Per-sequence session persistence and prompt/session prefix matching.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::engine::backend::{ModelBackend, SlotId, Token};

/// A persisted `(tokens, KV)` pair on disk, keyed by path and logical session
/// id. The file contents are opaque to the scheduler; corruption detection
/// lives here.
pub(crate) struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Restore the session into `slot`, returning its token history.
    ///
    /// A missing or empty file is a new session. A file that exists but fails
    /// to load is deleted and treated as empty; a corrupt session is never
    /// surfaced as a job error.
    pub fn load(
        &self,
        backend: &mut dyn ModelBackend,
        slot: SlotId,
        max_tokens: usize,
    ) -> Vec<Token> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => {
                debug!(path = %self.path.display(), "session file does not exist, will create");
                return Vec::new();
            }
        };
        if metadata.len() == 0 {
            debug!(path = %self.path.display(), "session file is empty, new session");
            return Vec::new();
        }

        match backend.load_sequence(&self.path, slot, max_tokens) {
            Ok(tokens) => {
                debug!(
                    path = %self.path.display(),
                    tokens = tokens.len(),
                    "restored session"
                );
                tokens
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to load session file, deleting corrupt file"
                );
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "could not delete corrupt session file");
                }
                Vec::new()
            }
        }
    }

    /// Persist the slot's state and token history, overwriting any previous
    /// contents. Failures are logged, not surfaced: the job has already
    /// produced its output.
    pub fn save(&self, backend: &mut dyn ModelBackend, slot: SlotId, tokens: &[Token]) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        if let Err(e) = backend.save_sequence(&self.path, slot, tokens) {
            warn!(path = %self.path.display(), error = %e, "failed to save session file");
        }
    }
}

/// Longest reusable prefix of `prompt` given the `session` token history and
/// the pinned window head `n_keep`.
///
/// Beyond the plain common prefix this recognises a session whose middle was
/// dropped by context shifting: when the first `n_keep` tokens match, the
/// suffix is compared at the shifted offset `n_keep + gap`, where `gap` is
/// how many tokens the old session is short of the prompt. If the whole old
/// session is reusable and strictly longer than the prompt, the result is
/// decremented so the final overlap token is re-evaluated (its logits are
/// stale).
pub(crate) fn match_prefix(prompt: &[Token], session: &[Token], n_keep: usize) -> usize {
    if session.is_empty() {
        return 0;
    }

    let simple = || {
        prompt
            .iter()
            .zip(session.iter())
            .take_while(|(a, b)| a == b)
            .count()
    };

    let mut matched = if session.len() < n_keep {
        simple()
    } else if prompt.len() >= n_keep && prompt[..n_keep] == session[..n_keep] {
        let gap = prompt.len().saturating_sub(session.len());
        let shifted = &session[n_keep..];
        let reusable = shifted
            .iter()
            .enumerate()
            .all(|(i, t)| prompt.get(n_keep + gap + i) == Some(t));
        if reusable {
            session.len()
        } else {
            simple()
        }
    } else {
        simple()
    };

    if session.len() > prompt.len() && matched > 0 {
        // Always force re-evaluation of the last matched token.
        matched -= 1;
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_matches_nothing() {
        assert_eq!(match_prefix(&[1, 2, 3], &[], 2), 0);
    }

    #[test]
    fn identical_equal_length_matches_fully() {
        let toks = vec![1, 2, 3, 4];
        assert_eq!(match_prefix(&toks, &toks, 2), 4);
    }

    #[test]
    fn longer_session_decrements_by_one() {
        // Session extends past the prompt: the last overlap token must be
        // re-evaluated.
        assert_eq!(match_prefix(&[1, 2, 3], &[1, 2, 3, 4, 5], 2), 2);
    }

    #[test]
    fn plain_common_prefix_when_head_diverges() {
        assert_eq!(match_prefix(&[1, 2, 9, 9], &[1, 2, 3, 4], 2), 2);
        assert_eq!(match_prefix(&[9, 9, 9], &[1, 2, 3], 2), 0);
    }

    #[test]
    fn short_prompt_falls_back_to_common_prefix() {
        // Prompt shorter than n_keep: simple matching only. Session longer
        // than prompt triggers the re-evaluation decrement.
        assert_eq!(match_prefix(&[1], &[1, 2, 3, 4], 4), 0);
    }

    #[test]
    fn shifted_suffix_reuses_whole_session() {
        // Old session dropped tokens 3,4 from the middle during windowing:
        // prompt  = 1 2 | 3 4 | 5 6 7
        // session = 1 2 | 5 6 7
        let prompt = vec![1, 2, 3, 4, 5, 6, 7];
        let session = vec![1, 2, 5, 6, 7];
        assert_eq!(match_prefix(&prompt, &session, 2), 5);
    }

    #[test]
    fn shifted_suffix_mismatch_falls_back() {
        let prompt = vec![1, 2, 3, 4, 5, 6, 7];
        let session = vec![1, 2, 5, 9, 7];
        assert_eq!(match_prefix(&prompt, &session, 2), 2);
    }

    #[test]
    fn growing_prompt_reuses_session_prefix() {
        // The multi-turn case: the new prompt extends the previous history.
        let session = vec![1, 2, 3, 4];
        let prompt = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(match_prefix(&prompt, &session, 2), 4);
    }
}
