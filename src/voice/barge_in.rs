//! Barge-in decision policy

use super::stt::TranscriptEvent;

/// Decides when user speech interrupts the assistant
///
/// The decision is a pure function of the transcript events observed since the
/// assistant started responding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BargeInPolicy {
    /// Whether interruptions are honored at all
    pub enabled: bool,
    /// Consecutive non-trivial interim transcripts that trigger barge-in
    pub min_interim_events: usize,
    /// Minimum non-whitespace characters for an interim to be non-trivial
    pub min_interim_chars: usize,
    /// Whether a Final transcript always triggers barge-in
    pub on_final: bool,
}

impl Default for BargeInPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interim_events: 2,
            min_interim_chars: 2,
            on_final: true,
        }
    }
}

impl BargeInPolicy {
    /// Whether the observed events warrant interrupting playback
    #[must_use]
    pub fn should_barge_in(&self, events: &[TranscriptEvent]) -> bool {
        if !self.enabled {
            return false;
        }

        let mut run = 0;
        for event in events {
            match event {
                TranscriptEvent::Final { .. } if self.on_final => return true,
                TranscriptEvent::Interim { text } if self.is_substantial(text) => {
                    run += 1;
                    if run >= self.min_interim_events {
                        return true;
                    }
                }
                _ => run = 0,
            }
        }
        false
    }

    fn is_substantial(&self, text: &str) -> bool {
        text.chars().filter(|c| !c.is_whitespace()).count() >= self.min_interim_chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interim(text: &str) -> TranscriptEvent {
        TranscriptEvent::Interim {
            text: text.to_string(),
        }
    }

    #[test]
    fn two_substantial_interims_trigger() {
        let policy = BargeInPolicy::default();
        assert!(!policy.should_barge_in(&[interim("wait")]));
        assert!(policy.should_barge_in(&[interim("wait"), interim("stop")]));
    }

    #[test]
    fn trivial_interim_breaks_the_run() {
        let policy = BargeInPolicy::default();
        assert!(!policy.should_barge_in(&[interim("wait"), interim(" a "), interim("stop")]));
    }

    #[test]
    fn final_triggers_immediately() {
        let policy = BargeInPolicy::default();
        let events = [TranscriptEvent::Final {
            text: "no".to_string(),
            utterance_id: 4,
        }];
        assert!(policy.should_barge_in(&events));

        let policy = BargeInPolicy {
            on_final: false,
            ..BargeInPolicy::default()
        };
        assert!(!policy.should_barge_in(&events));
    }

    #[test]
    fn disabled_policy_never_triggers() {
        let policy = BargeInPolicy {
            enabled: false,
            ..BargeInPolicy::default()
        };
        assert!(!policy.should_barge_in(&[interim("wait"), interim("stop"), interim("now")]));
    }

    #[test]
    fn deterministic_for_same_sequence() {
        let policy = BargeInPolicy {
            min_interim_events: 3,
            ..BargeInPolicy::default()
        };
        let events = [interim("hey"), interim("hey there"), interim("hey there you")];
        assert_eq!(policy.should_barge_in(&events), policy.should_barge_in(&events));
        assert!(policy.should_barge_in(&events));
    }
}
