//! Per-channel timelines of discretized pulses.
//!
//! ## Overview
//! Every pulse added to the compiler is converted to time steps and recorded as a [`PulseBook`]:
//! a half-open interval `[start_pos, end_pos)` plus a channel-specific payload. A timeline keeps
//! its books in a `BTreeSet` ordered by `start_pos`, which makes the overlap check on insertion a
//! lookup of the two neighbours of the new book.
//!
//! [`BaseTimeline`] provides the shared behavior through field accessors, implemented by
//! - [`TtlTimeline`], one per TTL channel, whose books carry no payload;
//! - [`DdsTimeline`], one per DDS channel, whose books carry the words programmed at the start and
//!   at the end of the pulse.
//!
//! Exactly adjacent books (`prev.end_pos == next.start_pos`) do not overlap.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::dds::DdsWord;
use crate::error::{Error, Result};

/// A pulse discretized to time steps. `start_pos` is inclusive and `end_pos` exclusive.
///
/// Books are ordered, and compared, by `start_pos` only.
#[derive(Clone, Debug)]
pub struct PulseBook<P> {
    pub start_pos: i64,
    pub end_pos: i64,
    /// Human-readable origin of the book, used in conflict reports.
    pub origin: String,
    pub payload: P,
}

impl<P> PulseBook<P> {
    pub fn new(start_pos: i64, end_pos: i64, origin: String, payload: P) -> Self {
        Self {
            start_pos,
            end_pos,
            origin,
            payload,
        }
    }
}

impl<P> Ord for PulseBook<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_pos.cmp(&other.start_pos)
    }
}
impl<P> PartialOrd for PulseBook<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<P> PartialEq for PulseBook<P> {
    fn eq(&self, other: &Self) -> bool {
        self.start_pos == other.start_pos
    }
}
impl<P> Eq for PulseBook<P> {}

impl<P> fmt::Display for PulseBook<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}, {}) ({})",
            self.start_pos, self.end_pos, self.origin
        )
    }
}

/// Words a DDS channel is programmed with at the start and at the end of a pulse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DdsSwitch {
    pub on: DdsWord,
    pub off: DdsWord,
}

pub trait BaseTimeline {
    type Payload;

    // Field methods
    fn name(&self) -> &str;
    fn books(&self) -> &BTreeSet<PulseBook<Self::Payload>>;
    // Mutable field references
    fn books_(&mut self) -> &mut BTreeSet<PulseBook<Self::Payload>>;

    fn is_edited(&self) -> bool {
        !self.books().is_empty()
    }

    /// End step of the last book, 0 for an empty timeline.
    fn last_end(&self) -> i64 {
        // Books never overlap, so the last start also has the last end.
        self.books().last().map_or(0, |book| book.end_pos)
    }

    /// Each book contributes a rising and a falling edge.
    fn switch_count(&self) -> usize {
        2 * self.books().len()
    }

    /// Inserts `book`, rejecting it if it overlaps a book already on the timeline.
    fn add_book(&mut self, book: PulseBook<Self::Payload>) -> Result<()> {
        let conflict = |existing: &PulseBook<Self::Payload>| Error::PulseConflict {
            channel: self.name().to_string(),
            existing: existing.to_string(),
            new: book.to_string(),
        };
        // `range(&book..)` includes a book with an equal start.
        if let Some(next) = self.books().range(&book..).next() {
            if next.start_pos < book.end_pos {
                return Err(conflict(next));
            }
        }
        if let Some(prev) = self.books().range(..&book).next_back() {
            if prev.end_pos > book.start_pos {
                return Err(conflict(prev));
            }
        }
        self.books_().insert(book);
        Ok(())
    }

    fn clear(&mut self) {
        self.books_().clear();
    }
}

pub struct TtlTimeline {
    name: String,
    channel_number: usize,
    books: BTreeSet<PulseBook<()>>,
}

impl TtlTimeline {
    pub fn new(name: &str, channel_number: usize) -> Self {
        Self {
            name: name.to_string(),
            channel_number,
            books: BTreeSet::new(),
        }
    }

    pub fn channel_number(&self) -> usize {
        self.channel_number
    }

    pub fn add_pulse(&mut self, start_pos: i64, end_pos: i64, origin: String) -> Result<()> {
        self.add_book(PulseBook::new(start_pos, end_pos, origin, ()))
    }
}

impl BaseTimeline for TtlTimeline {
    type Payload = ();

    fn name(&self) -> &str {
        &self.name
    }
    fn books(&self) -> &BTreeSet<PulseBook<()>> {
        &self.books
    }
    fn books_(&mut self) -> &mut BTreeSet<PulseBook<()>> {
        &mut self.books
    }
}

pub struct DdsTimeline {
    name: String,
    books: BTreeSet<PulseBook<DdsSwitch>>,
}

impl DdsTimeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            books: BTreeSet::new(),
        }
    }

    pub fn add_pulse(
        &mut self,
        start_pos: i64,
        end_pos: i64,
        origin: String,
        switch: DdsSwitch,
    ) -> Result<()> {
        self.add_book(PulseBook::new(start_pos, end_pos, origin, switch))
    }
}

impl BaseTimeline for DdsTimeline {
    type Payload = DdsSwitch;

    fn name(&self) -> &str {
        &self.name
    }
    fn books(&self) -> &BTreeSet<PulseBook<DdsSwitch>> {
        &self.books
    }
    fn books_(&mut self) -> &mut BTreeSet<PulseBook<DdsSwitch>> {
        &mut self.books
    }
}
