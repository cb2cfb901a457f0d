//! Folding raw interaction events into semantic events.
//!
//! One accumulator exists per (stream, target). Each raw event either feeds
//! an accumulator and pushes its idle deadline out, or completes it
//! immediately (a click, a focus change). Like the mutation aggregator this
//! takes `now` from the caller, so a fixed trace flushes identically every run.

use tether_common::protocol::{InputEvent, InputKind, SemanticEvent};

use crate::config::EventsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Text,
    Scroll,
    Pointer,
    Visibility,
}

#[derive(Debug)]
enum Fold {
    Text {
        value: String,
        keydowns: usize,
        inputs: usize,
        started_at: u64,
        ended_at: u64,
    },
    Scroll {
        x: f64,
        y: f64,
        ticks: usize,
        started_at: u64,
        ended_at: u64,
    },
    Pointer {
        pressed: bool,
        moves: usize,
        started_at: u64,
        ended_at: u64,
    },
    Visibility {
        initial: bool,
        current: bool,
        at: u64,
    },
}

#[derive(Debug)]
struct Accumulator {
    seq: u64,
    stream: Stream,
    target: String,
    deadline: u64,
    fold: Fold,
}

impl Accumulator {
    /// The semantic event this accumulator stands for, if any.
    fn finish(self) -> Option<SemanticEvent> {
        let target = self.target;
        match self.fold {
            Fold::Text {
                value,
                keydowns,
                inputs,
                started_at,
                ended_at,
            } => Some(SemanticEvent::TextEntered {
                target,
                value,
                keystrokes: if keydowns > 0 { keydowns } else { inputs },
                started_at,
                ended_at,
            }),
            Fold::Scroll {
                x,
                y,
                ticks,
                started_at,
                ended_at,
            } => Some(SemanticEvent::Scrolled {
                target,
                x,
                y,
                ticks,
                started_at,
                ended_at,
            }),
            // A press that never became a click (drag, cancelled press) folds away.
            Fold::Pointer { pressed: true, .. } => None,
            Fold::Pointer {
                pressed: false,
                moves,
                started_at,
                ended_at,
            } => Some(SemanticEvent::Hovered {
                target,
                moves,
                started_at,
                ended_at,
            }),
            Fold::Visibility {
                initial,
                current,
                at,
            } => (initial != current).then_some(SemanticEvent::VisibilityChanged {
                target,
                visible: current,
                at,
            }),
        }
    }
}

#[derive(Debug)]
pub struct EventAggregator {
    config: EventsConfig,
    accumulators: Vec<Accumulator>,
    next_seq: u64,
}

impl EventAggregator {
    pub fn new(config: EventsConfig) -> Self {
        Self {
            config,
            accumulators: Vec::new(),
            next_seq: 0,
        }
    }

    /// Feed one raw event that arrived at `now`.
    ///
    /// Returns events completed by this one (a click, or text flushed by a
    /// focus change). Call [`flush_due`](Self::flush_due) with the same `now`
    /// first so timer-driven flushes keep their place in the order.
    pub fn push(&mut self, event: InputEvent, now: u64) -> Vec<SemanticEvent> {
        let mut out = Vec::new();
        let ts = event.timestamp;

        match event.kind {
            InputKind::Keydown | InputKind::Input => {
                out.extend(self.flush_text_except(&event.target));
                let deadline = now + self.config.text_idle_ms;
                let submit = event.kind == InputKind::Keydown && event.key.as_deref() == Some("Enter");
                let acc = self.upsert(Stream::Text, &event.target, deadline, || Fold::Text {
                    value: String::new(),
                    keydowns: 0,
                    inputs: 0,
                    started_at: ts,
                    ended_at: ts,
                });
                if let Fold::Text {
                    value,
                    keydowns,
                    inputs,
                    ended_at,
                    ..
                } = &mut acc.fold
                {
                    *ended_at = ts;
                    if event.kind == InputKind::Input {
                        *inputs += 1;
                        if let Some(v) = &event.value {
                            *value = v.clone();
                        }
                    } else if let Some(key) = event.key.as_deref() {
                        *keydowns += 1;
                        apply_key(value, key);
                    }
                }
                if submit {
                    out.extend(self.take(Stream::Text, &event.target));
                }
            }
            InputKind::Focus => {
                out.extend(self.flush_text_except(&event.target));
            }
            InputKind::Blur => {
                out.extend(self.take(Stream::Text, &event.target));
            }
            InputKind::Scroll => {
                let deadline = now + self.config.scroll_idle_ms;
                let acc = self.upsert(Stream::Scroll, &event.target, deadline, || Fold::Scroll {
                    x: 0.0,
                    y: 0.0,
                    ticks: 0,
                    started_at: ts,
                    ended_at: ts,
                });
                if let Fold::Scroll {
                    x,
                    y,
                    ticks,
                    ended_at,
                    ..
                } = &mut acc.fold
                {
                    *x = event.x.unwrap_or(*x);
                    *y = event.y.unwrap_or(*y);
                    *ticks += 1;
                    *ended_at = ts;
                }
            }
            InputKind::PointerEnter
            | InputKind::PointerMove
            | InputKind::PointerDown
            | InputKind::PointerUp => {
                let deadline = now + self.config.pointer_idle_ms;
                let acc = self.upsert(Stream::Pointer, &event.target, deadline, || {
                    Fold::Pointer {
                        pressed: false,
                        moves: 0,
                        started_at: ts,
                        ended_at: ts,
                    }
                });
                if let Fold::Pointer {
                    pressed,
                    moves,
                    ended_at,
                    ..
                } = &mut acc.fold
                {
                    match event.kind {
                        InputKind::PointerDown => *pressed = true,
                        InputKind::PointerMove => *moves += 1,
                        _ => {}
                    }
                    *ended_at = ts;
                }
            }
            InputKind::Click => {
                self.take(Stream::Pointer, &event.target);
                out.push(SemanticEvent::Clicked {
                    target: event.target,
                    x: event.x,
                    y: event.y,
                    at: ts,
                });
            }
            InputKind::Visibility => {
                let visible = event.visible.unwrap_or(true);
                let deadline = now + self.config.visibility_idle_ms;
                let acc = self.upsert(Stream::Visibility, &event.target, deadline, || {
                    Fold::Visibility {
                        initial: !visible,
                        current: visible,
                        at: ts,
                    }
                });
                if let Fold::Visibility { current, at, .. } = &mut acc.fold {
                    *current = visible;
                    *at = ts;
                }
            }
        }

        out
    }

    /// Earliest pending idle deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.accumulators.iter().map(|a| a.deadline).min()
    }

    /// Flush every accumulator whose idle window has elapsed, ordered by
    /// deadline and then by when the accumulator was opened.
    pub fn flush_due(&mut self, now: u64) -> Vec<SemanticEvent> {
        self.drain(|a| a.deadline <= now)
    }

    /// Flush everything, e.g. when the session ends.
    pub fn flush_all(&mut self) -> Vec<SemanticEvent> {
        self.drain(|_| true)
    }

    pub fn pending(&self) -> usize {
        self.accumulators.len()
    }

    fn drain<F>(&mut self, due: F) -> Vec<SemanticEvent>
    where
        F: Fn(&Accumulator) -> bool,
    {
        let (mut ready, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.accumulators).into_iter().partition(|a| due(a));
        self.accumulators = keep;
        ready.sort_by_key(|a| (a.deadline, a.seq));
        ready.into_iter().filter_map(Accumulator::finish).collect()
    }

    fn flush_text_except(&mut self, target: &str) -> Vec<SemanticEvent> {
        self.drain(|a| a.stream == Stream::Text && a.target != target)
    }

    fn take(&mut self, stream: Stream, target: &str) -> Option<SemanticEvent> {
        let pos = self
            .accumulators
            .iter()
            .position(|a| a.stream == stream && a.target == target)?;
        self.accumulators.remove(pos).finish()
    }

    fn upsert<F>(&mut self, stream: Stream, target: &str, deadline: u64, init: F) -> &mut Accumulator
    where
        F: FnOnce() -> Fold,
    {
        let pos = match self
            .accumulators
            .iter()
            .position(|a| a.stream == stream && a.target == target)
        {
            Some(pos) => pos,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.accumulators.push(Accumulator {
                    seq,
                    stream,
                    target: target.to_string(),
                    deadline,
                    fold: init(),
                });
                self.accumulators.len() - 1
            }
        };
        let acc = &mut self.accumulators[pos];
        acc.deadline = deadline;
        acc
    }
}

fn apply_key(value: &mut String, key: &str) {
    match key {
        "Backspace" => {
            value.pop();
        }
        "Enter" | "Tab" | "Escape" => {}
        k if k.chars().count() == 1 => value.push_str(k),
        _ => {}
    }
}
