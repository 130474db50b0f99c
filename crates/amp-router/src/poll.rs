//! Poll cycle and duplicate suppression
//!
//! A session walks a fixed list of 17 queries (gain in1-4, gain out1-4,
//! mute in1-4, mute out1-4, master mute), one per tick, wrapping forever.
//! Responses are folded into per-channel caches and only changes are
//! surfaced as [`Sample`]s.

use std::collections::HashMap;
use std::time::SystemTime;

use amp_protocol::{ChannelKind, Command, Level, MuteTarget, Response, CHANNEL_COUNT};
use serde::Serialize;

use crate::events::Sample;

/// The standard query order for one amplifier
pub fn default_queries() -> Vec<Command> {
    let gains = ChannelKind::ALL.into_iter().flat_map(|kind| {
        (1..=CHANNEL_COUNT).map(move |channel| Command::ReadGain { kind, channel })
    });
    let mutes = ChannelKind::ALL.into_iter().flat_map(|kind| {
        (1..=CHANNEL_COUNT).map(move |channel| Command::ReadMute {
            target: MuteTarget::channel(kind, channel),
        })
    });
    gains
        .chain(mutes)
        .chain(std::iter::once(Command::ReadMute {
            target: MuteTarget::Master,
        }))
        .collect()
}

/// Poll counters, kept across reconnects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    /// Completed passes over the query list
    pub cycles: u64,
    /// Responses that produced a sample
    pub emitted: u64,
    /// Responses identical to the cached value
    pub suppressed: u64,
}

/// Rotating query list plus the last value seen per channel
#[derive(Debug, Clone)]
pub struct PollCycle {
    queries: Vec<Command>,
    position: usize,
    gains: HashMap<(ChannelKind, u8), Level>,
    mutes: HashMap<MuteTarget, bool>,
    stats: PollStats,
}

impl PollCycle {
    pub fn new() -> Self {
        Self::with_queries(default_queries())
    }

    /// Poll a custom query list. An empty list never yields a query.
    pub fn with_queries(queries: Vec<Command>) -> Self {
        Self {
            queries,
            position: 0,
            gains: HashMap::new(),
            mutes: HashMap::new(),
            stats: PollStats::default(),
        }
    }

    /// Next query in the cycle
    pub fn next_query(&mut self) -> Option<Command> {
        let query = *self.queries.get(self.position)?;
        self.position += 1;
        if self.position == self.queries.len() {
            self.position = 0;
            self.stats.cycles += 1;
        }
        Some(query)
    }

    /// Index of the query that will be sent next
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Fold a response into the caches; returns a sample if the value changed
    pub fn observe(&mut self, response: &Response) -> Option<Sample> {
        let at = SystemTime::now();
        let sample = match *response {
            Response::Gain {
                kind,
                channel,
                level,
            } => (self.gains.insert((kind, channel), level) != Some(level)).then_some(
                Sample::Gain {
                    kind,
                    channel,
                    level,
                    at,
                },
            ),
            Response::Mute { target, muted } => (self.mutes.insert(target, muted) != Some(muted))
                .then_some(Sample::Mute { target, muted, at }),
        };

        match sample {
            Some(_) => self.stats.emitted += 1,
            None => self.stats.suppressed += 1,
        }
        sample
    }

    /// Forget every cached value so the next reading of each channel is reported
    pub fn forget(&mut self) {
        self.gains.clear();
        self.mutes.clear();
    }

    /// Forget every cached value and restart from the first query
    ///
    /// Called when the connection drops so the first reading after a
    /// reconnect is always reported.
    pub fn reset(&mut self) {
        self.forget();
        self.position = 0;
    }
}

impl Default for PollCycle {
    fn default() -> Self {
        Self::new()
    }
}
