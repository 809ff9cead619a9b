//! Session outcome scoring

use std::time::Duration;

use serde::Serialize;

use crate::transcript::{SpeakerRole, Transcript};

/// User turns that earn full participation credit
const FULL_PARTICIPATION_TURNS: usize = 8;
/// Average words per user turn that earn full elaboration credit
const FULL_ELABORATION_WORDS: usize = 12;
const PARTICIPATION_POINTS: f64 = 50.0;
const ELABORATION_POINTS: f64 = 50.0;
const FALLBACK_PENALTY: u32 = 5;
const MAX_FALLBACK_PENALTY: u32 = 20;

/// Summary of a finished call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub user_turns: usize,
    pub assistant_turns: usize,
    pub user_words: usize,
    pub fallback_replies: u32,
    pub duration_secs: u64,
    /// 0..=100
    pub score: u8,
}

impl SessionOutcome {
    /// Score a transcript
    ///
    /// Participation (number of user turns) and elaboration (average words
    /// per user turn) each contribute up to half; every fallback reply costs
    /// a few points.
    #[must_use]
    pub fn compute(transcript: &Transcript, fallback_replies: u32, duration: Duration) -> Self {
        let user: Vec<_> = transcript
            .utterances()
            .iter()
            .filter(|u| u.role == SpeakerRole::User)
            .collect();
        let assistant_turns = transcript
            .utterances()
            .iter()
            .filter(|u| u.role == SpeakerRole::Assistant)
            .count();

        let user_turns = user.len();
        let user_words: usize = user.iter().map(|u| u.word_count()).sum();

        #[allow(clippy::cast_precision_loss)]
        let participation =
            user_turns.min(FULL_PARTICIPATION_TURNS) as f64 / FULL_PARTICIPATION_TURNS as f64;
        #[allow(clippy::cast_precision_loss)]
        let elaboration = if user_turns == 0 {
            0.0
        } else {
            let average = user_words as f64 / user_turns as f64;
            average.min(FULL_ELABORATION_WORDS as f64) / FULL_ELABORATION_WORDS as f64
        };

        let raw = participation.mul_add(PARTICIPATION_POINTS, elaboration * ELABORATION_POINTS);
        let penalty = (fallback_replies * FALLBACK_PENALTY).min(MAX_FALLBACK_PENALTY);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let score = (raw.round() as i64 - i64::from(penalty)).clamp(0, 100) as u8;

        Self {
            user_turns,
            assistant_turns,
            user_words,
            fallback_replies,
            duration_secs: duration.as_secs(),
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_call_scores_zero() {
        let outcome = SessionOutcome::compute(&Transcript::new(), 0, Duration::from_secs(10));
        assert_eq!(outcome.score, 0);
        assert_eq!(outcome.user_turns, 0);
    }

    #[test]
    fn engaged_call_scores_full() {
        let mut transcript = Transcript::new();
        let answer = "Creo que deberíamos informar al cliente del error antes de facturar nada";
        for _ in 0..8 {
            transcript.append_final(SpeakerRole::Assistant, "¿Qué harías?");
            transcript.append_final(SpeakerRole::User, answer);
        }
        let outcome = SessionOutcome::compute(&transcript, 0, Duration::from_secs(240));
        assert_eq!(outcome.score, 100);
        assert_eq!(outcome.assistant_turns, 8);
        assert_eq!(outcome.duration_secs, 240);
    }

    #[test]
    fn fallbacks_cost_points_but_never_below_zero() {
        let mut transcript = Transcript::new();
        transcript.append_final(SpeakerRole::User, "No sé");
        let clean = SessionOutcome::compute(&transcript, 0, Duration::ZERO);
        let degraded = SessionOutcome::compute(&transcript, 2, Duration::ZERO);
        assert_eq!(clean.score - degraded.score, 10);
        assert_eq!(SessionOutcome::compute(&transcript, 50, Duration::ZERO).score, 0);
    }
}
