//! The JTAG TAP state machine, with precomputed minimal TMS paths between
//! every pair of states.
//!
//! This module knows a lot about the JTAG state machine, but in a completely
//! cable-independent way. The path table is built once, on first use, by a
//! breadth-first expansion of the static transition table; the universal
//! reset sequence (usable from the virtual [`TapState::Unknown`] state) is
//! validated against every real state before it is handed out.

use std::fmt;
use std::sync::OnceLock;

use crate::JtagError;

/// One of the 16 TAP controller states, plus the virtual `Unknown` state
/// used before the controller has ever been reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    Reset = 0,
    Idle = 1,
    SelectDr = 2,
    CaptureDr = 3,
    ShiftDr = 4,
    Exit1Dr = 5,
    PauseDr = 6,
    Exit2Dr = 7,
    UpdateDr = 8,
    SelectIr = 9,
    CaptureIr = 10,
    ShiftIr = 11,
    Exit1Ir = 12,
    PauseIr = 13,
    Exit2Ir = 14,
    UpdateIr = 15,
    Unknown = 16,
}

impl TapState {
    pub(crate) const COUNT: usize = 17;

    /// The 16 real controller states, in discriminant order.
    pub const REAL: [TapState; 16] = [
        TapState::Reset,
        TapState::Idle,
        TapState::SelectDr,
        TapState::CaptureDr,
        TapState::ShiftDr,
        TapState::Exit1Dr,
        TapState::PauseDr,
        TapState::Exit2Dr,
        TapState::UpdateDr,
        TapState::SelectIr,
        TapState::CaptureIr,
        TapState::ShiftIr,
        TapState::Exit1Ir,
        TapState::PauseIr,
        TapState::Exit2Ir,
        TapState::UpdateIr,
    ];

    /// The state reached after one clock with the given TMS level.
    /// `Unknown` stays `Unknown`: without a reset there is nothing to know.
    pub const fn step(self, tms: bool) -> TapState {
        match (self, tms) {
            (TapState::Reset, false) => TapState::Idle,
            (TapState::Reset, true) => TapState::Reset,
            (TapState::Idle, false) => TapState::Idle,
            (TapState::Idle, true) => TapState::SelectDr,
            (TapState::SelectDr, false) => TapState::CaptureDr,
            (TapState::SelectDr, true) => TapState::SelectIr,
            (TapState::CaptureDr, false) => TapState::ShiftDr,
            (TapState::CaptureDr, true) => TapState::Exit1Dr,
            (TapState::ShiftDr, false) => TapState::ShiftDr,
            (TapState::ShiftDr, true) => TapState::Exit1Dr,
            (TapState::Exit1Dr, false) => TapState::PauseDr,
            (TapState::Exit1Dr, true) => TapState::UpdateDr,
            (TapState::PauseDr, false) => TapState::PauseDr,
            (TapState::PauseDr, true) => TapState::Exit2Dr,
            (TapState::Exit2Dr, false) => TapState::ShiftDr,
            (TapState::Exit2Dr, true) => TapState::UpdateDr,
            (TapState::UpdateDr, false) => TapState::Idle,
            (TapState::UpdateDr, true) => TapState::SelectDr,
            (TapState::SelectIr, false) => TapState::CaptureIr,
            (TapState::SelectIr, true) => TapState::Reset,
            (TapState::CaptureIr, false) => TapState::ShiftIr,
            (TapState::CaptureIr, true) => TapState::Exit1Ir,
            (TapState::ShiftIr, false) => TapState::ShiftIr,
            (TapState::ShiftIr, true) => TapState::Exit1Ir,
            (TapState::Exit1Ir, false) => TapState::PauseIr,
            (TapState::Exit1Ir, true) => TapState::UpdateIr,
            (TapState::PauseIr, false) => TapState::PauseIr,
            (TapState::PauseIr, true) => TapState::Exit2Ir,
            (TapState::Exit2Ir, false) => TapState::ShiftIr,
            (TapState::Exit2Ir, true) => TapState::UpdateIr,
            (TapState::UpdateIr, false) => TapState::Idle,
            (TapState::UpdateIr, true) => TapState::SelectDr,
            (TapState::Unknown, _) => TapState::Unknown,
        }
    }

    /// Whether data is moving through a shift register in this state.
    pub const fn is_shifting(self) -> bool {
        matches!(self, TapState::ShiftDr | TapState::ShiftIr)
    }

    /// The TMS level that keeps the controller parked in this state.
    ///
    /// Every stable state self-loops on exactly one TMS level; the
    /// pass-through states (`SelectDr`, `Exit1Ir`, ...) have none and
    /// produce [`JtagError::NotCycleState`].
    pub fn cycle_bit(self) -> Result<bool, JtagError> {
        if self != TapState::Unknown {
            for tms in [false, true] {
                if self.step(tms) == self {
                    return Ok(tms);
                }
            }
        }
        Err(JtagError::NotCycleState(self))
    }

    /// Run the transition table over a TMS sequence.
    pub fn walk<I: IntoIterator<Item = bool>>(self, tms: I) -> TapState {
        tms.into_iter().fold(self, TapState::step)
    }

    /// The shortest TMS sequence from `self` to `to`.
    ///
    /// Paths from a state to itself are the shortest way to *leave and come
    /// back* (at least one clock), not the empty sequence. Paths from
    /// `Unknown` start with the universal reset sequence and are therefore
    /// correct whatever state the hardware is really in. `None` only when
    /// `to` is `Unknown`, which nothing can reach.
    pub fn path_to(self, to: TapState) -> Option<TmsPath> {
        table().paths[self as usize][to as usize]
            .as_ref()
            .map(|bits| TmsPath {
                start: self,
                end: to,
                bits: bits.clone(),
            })
    }

    /// Path to `to` that works from any actual state: reset, then walk.
    pub fn path_from_unknown(to: TapState) -> Option<TmsPath> {
        TapState::Unknown.path_to(to)
    }
}

impl fmt::Display for TapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TapState::Reset => "reset",
            TapState::Idle => "idle",
            TapState::SelectDr => "select_dr",
            TapState::CaptureDr => "capture_dr",
            TapState::ShiftDr => "shift_dr",
            TapState::Exit1Dr => "exit1_dr",
            TapState::PauseDr => "pause_dr",
            TapState::Exit2Dr => "exit2_dr",
            TapState::UpdateDr => "update_dr",
            TapState::SelectIr => "select_ir",
            TapState::CaptureIr => "capture_ir",
            TapState::ShiftIr => "shift_ir",
            TapState::Exit1Ir => "exit1_ir",
            TapState::PauseIr => "pause_ir",
            TapState::Exit2Ir => "exit2_ir",
            TapState::UpdateIr => "update_ir",
            TapState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A TMS sequence taking the controller from one known state to another.
///
/// Minimal-length by construction; [`TmsPath::pad`] can stretch it to meet
/// a cable's length or alignment requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmsPath {
    start: TapState,
    end: TapState,
    bits: Vec<bool>,
}

impl TmsPath {
    pub fn start(&self) -> TapState {
        self.start
    }

    pub fn end(&self) -> TapState {
        self.end
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Stretch the path by dwelling on an intermediate stable state.
    ///
    /// The result satisfies `len % stride == offset` and `len >= min_len`,
    /// and still ends on the same state. If `min_pause` is nonzero the path
    /// is forced through `pause_state` (default `idle`) for at least that
    /// many cycles, even when the length constraints are already met.
    ///
    /// # Panics
    ///
    /// If `offset >= stride`.
    pub fn pad(
        self,
        min_len: usize,
        stride: usize,
        offset: usize,
        min_pause: usize,
        pause_state: Option<TapState>,
    ) -> Result<TmsPath, JtagError> {
        assert!(offset < stride, "pad offset {offset} must be below stride {stride}");
        if self.bits.len() % stride == offset && self.bits.len() >= min_len && min_pause == 0 {
            return Ok(self);
        }
        let pause = pause_state.unwrap_or(TapState::Idle);
        let seq1 = self.start.path_to(pause).ok_or(JtagError::NoPath {
            from: self.start,
            to: pause,
        })?;
        let seq2 = pause.path_to(self.end).ok_or(JtagError::NoPath {
            from: pause,
            to: self.end,
        })?;
        let cycle = pause.cycle_bit()?;
        let startlen = seq1.len() + seq2.len();
        let mut padlen = min_pause
            .saturating_sub(1)
            .max(min_len.saturating_sub(startlen));
        padlen = (offset as i64 - startlen as i64 - padlen as i64).rem_euclid(stride as i64)
            as usize
            + padlen;
        let mut bits = seq1.bits;
        bits.extend(std::iter::repeat(cycle).take(padlen));
        bits.extend_from_slice(&seq2.bits);
        Ok(TmsPath {
            start: self.start,
            end: self.end,
            bits,
        })
    }
}

struct PathTable {
    paths: Vec<Vec<Option<Vec<bool>>>>,
}

fn table() -> &'static PathTable {
    static TABLE: OnceLock<PathTable> = OnceLock::new();
    TABLE.get_or_init(PathTable::build)
}

impl PathTable {
    /// All-pairs shortest paths by breadth-first levels: seed with the
    /// length-1 transitions (TMS 0 before TMS 1, states in discriminant
    /// order), then keep extending the frontier by one clock, never
    /// replacing a path that was found earlier. Small fixed state count;
    /// determinism matters here, speed does not.
    fn build() -> Self {
        let n = TapState::COUNT;
        let mut paths: Vec<Vec<Option<Vec<bool>>>> = vec![vec![None; n]; n];

        let mut level: Vec<(TapState, TapState, Vec<bool>)> = Vec::new();
        for s in TapState::REAL {
            for tms in [false, true] {
                let e = s.step(tms);
                let slot = &mut paths[s as usize][e as usize];
                if slot.is_none() {
                    *slot = Some(vec![tms]);
                    level.push((s, e, vec![tms]));
                }
            }
        }
        while !level.is_empty() {
            let mut next: Vec<(TapState, TapState, Vec<bool>)> = Vec::new();
            for (start, mid, first) in &level {
                for tms in [false, true] {
                    let end = mid.step(tms);
                    let slot = &mut paths[*start as usize][end as usize];
                    if slot.is_none() {
                        let mut bits = first.clone();
                        bits.push(tms);
                        *slot = Some(bits.clone());
                        next.push((*start, end, bits));
                    }
                }
            }
            level = next;
        }
        for s in TapState::REAL {
            for e in TapState::REAL {
                assert!(
                    paths[s as usize][e as usize].is_some(),
                    "no path from {s} to {e}"
                );
            }
        }

        // The universal reset sequence: the longest of the per-state
        // shortest paths to reset, which must then reset every state.
        let mut reset_path: Vec<bool> = Vec::new();
        for s in TapState::REAL {
            if let Some(p) = &paths[s as usize][TapState::Reset as usize] {
                if *p > reset_path {
                    reset_path = p.clone();
                }
            }
        }
        for s in TapState::REAL {
            let landed = s.walk(reset_path.iter().copied());
            assert!(
                landed == TapState::Reset,
                "reset sequence left {s} in {landed}"
            );
        }

        paths[TapState::Unknown as usize][TapState::Reset as usize] = Some(reset_path.clone());
        for s in TapState::REAL {
            if s == TapState::Reset {
                continue;
            }
            if let Some(tail) = paths[TapState::Reset as usize][s as usize].clone() {
                let mut bits = reset_path.clone();
                bits.extend_from_slice(&tail);
                paths[TapState::Unknown as usize][s as usize] = Some(bits);
            }
        }

        PathTable { paths }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_spot_checks() {
        assert_eq!(TapState::Reset.step(true), TapState::Reset);
        assert_eq!(TapState::Reset.step(false), TapState::Idle);
        assert_eq!(TapState::SelectIr.step(true), TapState::Reset);
        assert_eq!(TapState::Exit2Dr.step(false), TapState::ShiftDr);
        assert_eq!(TapState::Unknown.step(false), TapState::Unknown);
    }

    #[test]
    fn every_pair_has_a_path_that_lands() {
        for s1 in TapState::REAL {
            for s2 in TapState::REAL {
                let path = s1.path_to(s2).unwrap();
                assert_eq!(path.start(), s1);
                assert_eq!(path.end(), s2);
                assert!(!path.is_empty());
                assert_eq!(s1.walk(path.bits().iter().copied()), s2);
            }
        }
    }

    #[test]
    fn paths_are_minimal() {
        // Brute-force every shorter non-empty TMS sequence and check that
        // none of them reaches the target.
        for s1 in TapState::REAL {
            for s2 in TapState::REAL {
                let found = s1.path_to(s2).unwrap().len();
                for len in 1..found {
                    for seq in 0u32..(1 << len) {
                        let bits = (0..len).map(|i| seq >> i & 1 == 1);
                        assert!(
                            s1.walk(bits) != s2,
                            "found a {len}-clock path from {s1} to {s2}, table has {found}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_paths_land_from_every_state() {
        for target in TapState::REAL {
            let path = TapState::path_from_unknown(target).unwrap();
            for start in TapState::REAL {
                assert_eq!(start.walk(path.bits().iter().copied()), target);
            }
        }
        assert!(TapState::Unknown.path_to(TapState::Unknown).is_none());
    }

    #[test]
    fn reset_sequence_is_five_ones() {
        let path = TapState::path_from_unknown(TapState::Reset).unwrap();
        assert_eq!(path.bits(), &[true; 5]);
    }

    #[test]
    fn cycle_bits() {
        assert_eq!(TapState::Reset.cycle_bit().unwrap(), true);
        assert_eq!(TapState::Idle.cycle_bit().unwrap(), false);
        assert_eq!(TapState::ShiftDr.cycle_bit().unwrap(), false);
        assert_eq!(TapState::PauseIr.cycle_bit().unwrap(), false);
        for bad in [
            TapState::SelectDr,
            TapState::CaptureIr,
            TapState::Exit1Dr,
            TapState::UpdateIr,
            TapState::Unknown,
        ] {
            assert!(bad.cycle_bit().is_err());
        }
    }

    #[test]
    fn pad_meets_length_and_alignment() {
        for (min_len, stride, offset, min_pause) in
            [(1, 1, 0, 0), (10, 1, 0, 0), (1, 16, 0, 0), (1, 8, 3, 0), (1, 1, 0, 4)]
        {
            let path = TapState::Unknown.path_to(TapState::ShiftDr).unwrap();
            let padded = path
                .pad(min_len, stride, offset, min_pause, None)
                .unwrap();
            assert!(padded.len() >= min_len);
            assert_eq!(padded.len() % stride, offset);
            for start in TapState::REAL {
                assert_eq!(start.walk(padded.bits().iter().copied()), TapState::ShiftDr);
            }
        }
    }

    #[test]
    fn pad_dwells_on_the_pause_state() {
        let path = TapState::Reset.path_to(TapState::ShiftIr).unwrap();
        let padded = path.pad(1, 1, 0, 6, None).unwrap();
        // Count the longest stay in idle while replaying the path.
        let mut state = TapState::Reset;
        let mut dwell = 0;
        let mut longest = 0;
        for &bit in padded.bits() {
            state = state.step(bit);
            if state == TapState::Idle {
                dwell += 1;
                longest = longest.max(dwell);
            } else {
                dwell = 0;
            }
        }
        assert!(longest >= 6);
        assert_eq!(state, TapState::ShiftIr);
    }

    #[test]
    fn pad_already_satisfied_is_identity() {
        let path = TapState::Idle.path_to(TapState::ShiftDr).unwrap();
        let bits = path.bits().to_vec();
        let padded = path.pad(1, 1, 0, 0, None).unwrap();
        assert_eq!(padded.bits(), &bits[..]);
    }
}
