//! DFA rank/unrank: a bijection between integers and the words of a regular
//! language with a fixed length.
//!
//! The regex is compiled to an anchored, minimized, byte-oriented dense DFA
//! (match-kind `All`, so acceptance is plain language membership), then
//! flattened into a transition table over the live states. Transitions are
//! kept as contiguous byte runs `(lo, hi, next)`; every byte of a run has
//! the same continuation count, so ranking charges a whole run with one
//! multiply instead of a walk over its bytes. For every state `q` and
//! remaining length `k`, `counts[k][q]` is the number of accepted words of
//! length exactly `k` from `q`.
use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use regex_automata::dfa::{dense, Automaton, StartKind};
use regex_automata::nfa::thompson;
use regex_automata::util::syntax;
use regex_automata::{Anchored, MatchKind};

use crate::errors::{Error, Result};

/// A maximal run of consecutive input bytes sharing one target state.
#[derive(Debug, Clone, Copy)]
struct Run {
    lo: u8,
    hi: u8,
    next: u32,
}

pub struct Dfa {
    max_len: usize,
    start: u32,
    accepting: Vec<bool>,
    /// Per state: runs into live states, sorted by byte.
    transitions: Vec<Vec<Run>>,
    /// `counts[k][q]` = number of accepted words of length exactly `k` from `q`.
    counts: Vec<Vec<BigUint>>,
    words_in_slice: BigUint,
    /// Number of accepted words shorter than `max_len`; the raw enumeration
    /// places them before the slice.
    offset: BigUint,
    capacity: usize,
}

impl Dfa {
    /// Compile `pattern` and build the ranking tables for words of length
    /// exactly `max_len`.
    pub fn from_regex(pattern: &str, max_len: usize) -> Result<Self> {
        let dfa = dense::Builder::new()
            .configure(
                dense::Config::new()
                    .start_kind(StartKind::Anchored)
                    .match_kind(MatchKind::All)
                    .minimize(true),
            )
            .syntax(syntax::Config::new().unicode(false).utf8(false))
            .thompson(thompson::Config::new().utf8(false))
            .build(pattern)
            .map_err(|e| Error::BuildFailed(e.to_string()))?;
        let start_id = dfa
            .universal_start_state(Anchored::Yes)
            .ok_or_else(|| Error::BuildFailed("pattern has no universal start state".into()))?;

        // Breadth-first flattening of the reachable live states.
        let mut index: HashMap<_, u32> = HashMap::new();
        let mut order = vec![start_id];
        index.insert(start_id, 0);
        let mut accepting = Vec::new();
        let mut transitions: Vec<Vec<Run>> = Vec::new();
        let mut at = 0;
        while at < order.len() {
            let sid = order[at];
            accepting.push(dfa.is_match_state(dfa.next_eoi_state(sid)));
            let mut row: Vec<Run> = Vec::new();
            for byte in 0..=255u8 {
                let next = dfa.next_state(sid, byte);
                if dfa.is_dead_state(next) || dfa.is_quit_state(next) {
                    continue;
                }
                let idx = *index.entry(next).or_insert_with(|| {
                    order.push(next);
                    (order.len() - 1) as u32
                });
                match row.last_mut() {
                    Some(run) if run.next == idx && run.hi + 1 == byte => run.hi = byte,
                    _ => row.push(Run {
                        lo: byte,
                        hi: byte,
                        next: idx,
                    }),
                }
            }
            transitions.push(row);
            at += 1;
        }

        let states = order.len();
        let mut counts: Vec<Vec<BigUint>> = Vec::with_capacity(max_len + 1);
        counts.push(
            accepting
                .iter()
                .map(|&a| if a { BigUint::one() } else { BigUint::zero() })
                .collect(),
        );
        for k in 1..=max_len {
            let prev = &counts[k - 1];
            let layer: Vec<BigUint> = (0..states)
                .map(|q| {
                    let mut total = BigUint::zero();
                    for run in &transitions[q] {
                        total += &prev[run.next as usize] * run.width();
                    }
                    total
                })
                .collect();
            counts.push(layer);
        }

        let words_in_slice = counts[max_len][0].clone();
        if words_in_slice < BigUint::from(2u8) {
            return Err(Error::LanguageIsEmpty);
        }
        let mut words_in_language = BigUint::zero();
        for layer in &counts {
            words_in_language += &layer[0];
        }
        let offset = &words_in_language - &words_in_slice;
        let capacity = (words_in_slice.bits() - 1) as usize;

        Ok(Self {
            max_len,
            start: 0,
            accepting,
            transitions,
            counts,
            words_in_slice,
            offset,
            capacity,
        })
    }

    /// Size in bits of the integers this DFA can (un)rank.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn words_in_slice(&self) -> &BigUint {
        &self.words_in_slice
    }

    /// Lexicographic rank of `word` within the fixed-length slice.
    pub fn rank(&self, word: &[u8]) -> Result<BigUint> {
        let raw = self.rank_raw(word)?;
        Ok(raw - &self.offset)
    }

    /// The inverse of `rank`.
    pub fn unrank(&self, c: &BigUint) -> Result<Vec<u8>> {
        if c >= &self.words_in_slice {
            return Err(Error::OutOfRange);
        }
        let raw = c + &self.offset;
        self.unrank_raw(&raw)
    }

    /// Rank within the enumeration of all words of length <= `max_len`,
    /// where every shorter word precedes the slice.
    fn rank_raw(&self, word: &[u8]) -> Result<BigUint> {
        if word.len() != self.max_len {
            return Err(Error::NotInLanguage);
        }
        let mut c = BigUint::zero();
        let mut q = self.start;
        for (i, &sym) in word.iter().enumerate() {
            let rem = self.max_len - i - 1;
            let mut next = None;
            for run in &self.transitions[q as usize] {
                let branch = &self.counts[rem][run.next as usize];
                if sym > run.hi {
                    c += branch * run.width();
                } else {
                    if sym >= run.lo {
                        c += branch * u32::from(sym - run.lo);
                        next = Some(run.next);
                    }
                    break;
                }
            }
            q = next.ok_or(Error::NotInLanguage)?;
        }
        if !self.accepting[q as usize] {
            return Err(Error::NotInLanguage);
        }
        Ok(c + &self.offset)
    }

    fn unrank_raw(&self, raw: &BigUint) -> Result<Vec<u8>> {
        let mut c = raw - &self.offset;
        let mut q = self.start;
        let mut word = Vec::with_capacity(self.max_len);
        for i in 0..self.max_len {
            let rem = self.max_len - i - 1;
            let mut chosen = None;
            for run in &self.transitions[q as usize] {
                let branch = &self.counts[rem][run.next as usize];
                let span = branch * run.width();
                if c < span {
                    // Every byte of the run continues in `branch` ways.
                    let step: BigUint = &c / branch;
                    let step = step.to_u32().expect("run width fits in u32");
                    c -= branch * step;
                    chosen = Some((run.lo + step as u8, run.next));
                    break;
                }
                c -= span;
            }
            let (byte, target) = chosen.ok_or(Error::OutOfRange)?;
            word.push(byte);
            q = target;
        }
        debug_assert!(self.accepting[q as usize]);
        Ok(word)
    }
}

impl Run {
    fn width(&self) -> u32 {
        u32::from(self.hi - self.lo) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn big(n: u64) -> BigUint {
        BigUint::from(n)
    }

    #[test]
    fn rank_unrank_round_trip_small_language() {
        let dfa = Dfa::from_regex("[ab]*", 3).unwrap();
        assert_eq!(dfa.words_in_slice(), &big(8));
        assert_eq!(dfa.capacity(), 3);
        for c in 0..8u64 {
            let word = dfa.unrank(&big(c)).unwrap();
            assert_eq!(word.len(), 3);
            assert_eq!(dfa.rank(&word).unwrap(), big(c));
        }
    }

    #[test]
    fn unrank_is_lexicographic() {
        let dfa = Dfa::from_regex("[ab]*", 3).unwrap();
        assert_eq!(dfa.unrank(&big(0)).unwrap(), b"aaa");
        assert_eq!(dfa.unrank(&big(1)).unwrap(), b"aab");
        assert_eq!(dfa.unrank(&big(7)).unwrap(), b"bbb");
    }

    #[test]
    fn shorter_words_shift_the_slice() {
        // "b" is in the language but shorter than the slice; only words
        // starting with 'a' have length 3.
        let dfa = Dfa::from_regex("a[ab][ab]|b", 3).unwrap();
        assert_eq!(dfa.words_in_slice(), &big(4));
        assert_eq!(dfa.unrank(&big(0)).unwrap(), b"aaa");
        assert_eq!(dfa.rank(b"abb").unwrap(), big(3));
    }

    #[test]
    fn sparse_classes_rank_across_runs() {
        // Two disjoint byte runs ('0'-'9' and 'a'-'f') per position.
        let dfa = Dfa::from_regex("[0-9a-f]*", 2).unwrap();
        assert_eq!(dfa.words_in_slice(), &big(256));
        assert_eq!(dfa.unrank(&big(0)).unwrap(), b"00");
        assert_eq!(dfa.unrank(&big(10 * 16)).unwrap(), b"a0");
        assert_eq!(dfa.rank(b"ff").unwrap(), big(255));
        for c in [0u64, 15, 16, 159, 160, 255] {
            assert_eq!(dfa.rank(&dfa.unrank(&big(c)).unwrap()).unwrap(), big(c));
        }
    }

    #[test]
    fn rank_rejects_foreign_and_missized_words() {
        let dfa = Dfa::from_regex("[ab]*", 3).unwrap();
        assert!(matches!(dfa.rank(b"abc"), Err(Error::NotInLanguage)));
        assert!(matches!(dfa.rank(b"ab"), Err(Error::NotInLanguage)));
    }

    #[test]
    fn unrank_rejects_out_of_range() {
        let dfa = Dfa::from_regex("[ab]*", 3).unwrap();
        assert!(matches!(dfa.unrank(&big(8)), Err(Error::OutOfRange)));
    }

    #[test]
    fn empty_slice_is_rejected() {
        // The only word is "ab"; nothing has length 3.
        assert!(matches!(
            Dfa::from_regex("ab", 3),
            Err(Error::LanguageIsEmpty)
        ));
    }

    #[test]
    fn singleton_slice_is_rejected() {
        assert!(matches!(
            Dfa::from_regex("abc", 3),
            Err(Error::LanguageIsEmpty)
        ));
    }

    #[test]
    fn capacity_sized_integers_survive_the_round_trip() {
        // 26 * 10^4 words, so capacity is 17 bits; every 17-bit integer must
        // be encodable and come back unchanged.
        let dfa = Dfa::from_regex("[a-z][0-9]*", 5).unwrap();
        assert_eq!(dfa.capacity(), 17);
        let limit = BigUint::one() << dfa.capacity();
        for c in [0u64, 1, 1000, (1 << 17) - 1] {
            let word = dfa.unrank(&big(c)).unwrap();
            let rank = dfa.rank(&word).unwrap();
            assert_eq!(rank, big(c));
            assert!(rank < limit);
        }
    }
}
