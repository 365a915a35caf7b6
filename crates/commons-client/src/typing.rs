//! Typing state machines. Both take the current `Instant` from the caller so
//! they can be driven by a real clock or a test.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use commons_types::events::ChannelEvent;

/// Inactivity after which the sender reports it stopped typing.
pub const STOP_AFTER: Duration = Duration::from_secs(2);

/// How long a receiver shows an indicator without a renewal.
pub const INDICATOR_TTL: Duration = Duration::from_secs(3);

/// While typing continues, the start signal is repeated this often so
/// receivers never hit `INDICATOR_TTL`.
pub const RENEW_EVERY: Duration = Duration::from_secs(1);

/// Sender side. Each method returns the signal to send, if any.
#[derive(Debug)]
pub struct TypingDebouncer {
    window: Duration,
    renew_every: Duration,
    last_keystroke: Option<Instant>,
    last_signal: Option<Instant>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(STOP_AFTER)
    }
}

impl TypingDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            renew_every: RENEW_EVERY,
            last_keystroke: None,
            last_signal: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.last_keystroke.is_some()
    }

    /// A keystroke. Returns `Some(true)` on the transition into typing and
    /// again whenever the last signal is older than the renewal interval.
    pub fn keystroke(&mut self, now: Instant) -> Option<bool> {
        self.last_keystroke = Some(now);
        let due = match self.last_signal {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) >= self.renew_every,
        };
        if !due {
            return None;
        }
        self.last_signal = Some(now);
        Some(true)
    }

    /// Call periodically. Returns `Some(false)` once the window has lapsed.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        match self.last_keystroke {
            Some(last) if now.saturating_duration_since(last) >= self.window => {
                self.last_keystroke = None;
                self.last_signal = None;
                Some(false)
            }
            _ => None,
        }
    }

    /// The draft was sent or discarded.
    pub fn stop(&mut self) -> Option<bool> {
        self.last_signal = None;
        self.last_keystroke.take().map(|_| false)
    }
}

/// Receiver side: who is typing in one conversation. Entries expire on their
/// own, so a lost stop signal heals after the TTL.
#[derive(Debug)]
pub struct TypingIndicators {
    own_id: Uuid,
    ttl: Duration,
    typing: HashMap<Uuid, (String, Instant)>,
}

impl TypingIndicators {
    pub fn new(own_id: Uuid) -> Self {
        Self::with_ttl(own_id, INDICATOR_TTL)
    }

    pub fn with_ttl(own_id: Uuid, ttl: Duration) -> Self {
        Self {
            own_id,
            ttl,
            typing: HashMap::new(),
        }
    }

    /// Feed a `typing` event. Anything else is ignored.
    pub fn apply(&mut self, event: &ChannelEvent, now: Instant) {
        let ChannelEvent::Typing { user_id, user_name, is_typing } = event else {
            return;
        };
        if *user_id == self.own_id {
            return;
        }
        if *is_typing {
            self.typing.insert(*user_id, (user_name.clone(), now));
        } else {
            self.typing.remove(user_id);
        }
    }

    /// Names currently typing, sorted. Expired entries are dropped.
    pub fn active(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        self.typing
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < ttl);
        let mut names: Vec<String> = self.typing.values().map(|(name, _)| name.clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(user_id: Uuid, name: &str, is_typing: bool) -> ChannelEvent {
        ChannelEvent::Typing {
            user_id,
            user_name: name.into(),
            is_typing,
        }
    }

    #[test]
    fn debouncer_signals_start_once_and_stop_after_quiet() {
        let t0 = Instant::now();
        let mut debouncer = TypingDebouncer::default();

        assert_eq!(debouncer.keystroke(t0), Some(true));
        assert_eq!(debouncer.keystroke(t0 + Duration::from_millis(500)), None);
        assert_eq!(debouncer.poll(t0 + Duration::from_millis(2000)), None);
        assert_eq!(debouncer.poll(t0 + Duration::from_millis(2500)), Some(false));
        assert_eq!(debouncer.poll(t0 + Duration::from_millis(9000)), None);
        assert!(!debouncer.is_typing());

        assert_eq!(debouncer.keystroke(t0 + Duration::from_secs(10)), Some(true));
        assert_eq!(debouncer.stop(), Some(false));
        assert_eq!(debouncer.stop(), None);
    }

    #[test]
    fn indicators_expire_without_a_stop_signal() {
        let t0 = Instant::now();
        let (me, amara, bola) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut indicators = TypingIndicators::new(me);

        indicators.apply(&typing(amara, "Amara", true), t0);
        indicators.apply(&typing(bola, "Bola", true), t0 + Duration::from_secs(2));
        indicators.apply(&typing(me, "Me", true), t0);
        assert_eq!(indicators.active(t0 + Duration::from_secs(2)), ["Amara", "Bola"]);

        // Amara's stop was lost; Bola keeps renewing
        indicators.apply(&typing(bola, "Bola", true), t0 + Duration::from_secs(4));
        assert_eq!(indicators.active(t0 + Duration::from_secs(4)), ["Bola"]);

        indicators.apply(&typing(bola, "Bola", false), t0 + Duration::from_secs(5));
        assert!(indicators.active(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn continuous_typing_stays_visible_to_receivers() {
        let t0 = Instant::now();
        let (sender_id, receiver_id) = (Uuid::new_v4(), Uuid::new_v4());
        let mut debouncer = TypingDebouncer::default();
        let mut indicators = TypingIndicators::new(receiver_id);

        let mut signals = 0;
        for step in 0..=10 {
            let now = t0 + Duration::from_millis(500 * step);
            if let Some(is_typing) = debouncer.keystroke(now) {
                signals += 1;
                indicators.apply(&typing(sender_id, "Chidi", is_typing), now);
            }
            assert_eq!(indicators.active(now), ["Chidi"], "gap at {}ms", 500 * step);
        }
        // Renewed, but not on every keystroke
        assert!((2..=6).contains(&signals));

        let quiet = t0 + Duration::from_millis(5000) + STOP_AFTER;
        let stop = debouncer.poll(quiet).unwrap();
        indicators.apply(&typing(sender_id, "Chidi", stop), quiet);
        assert!(indicators.active(quiet).is_empty());
    }
}
