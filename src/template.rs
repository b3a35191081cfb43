//! Reusable JTAG I/O templates.
//!
//! A [`JtagTemplate`] accumulates a walk through the TAP state machine
//! together with the TDI bits to drive and the TDO windows to capture.
//! Templates compose (`concat`/`repeat`, or `+`/`*`, or
//! `begin_loop`/`end_loop`) and compile lazily: the first invocation turns
//! the accumulated lists into wire strings, runs the transport's
//! customization pass, and caches the result; later invocations only
//! splice in fresh TDI words.

use std::ops::{Add, Mul};
use std::sync::{Arc, Mutex};

use crate::chain::BypassInfo;
use crate::states::TapState;
use crate::transport::Transport;
use crate::xstring::{BitString, TdiCombiner, TdoExtractor, TemplateStrings, XBit};
use crate::JtagError;

/// TDI bits for one run of shift clocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tdi {
    /// A concrete word; `-1` is shorthand for all ones at any width.
    Word(i128),
    /// Literal drive levels, written most-recent-bit first (the first bit
    /// clocked out is the last element).
    Pattern(Vec<XBit>),
    /// A placeholder filled from the numbered data stream at run time.
    Var(usize),
}

impl Tdi {
    /// The default placeholder: stream 0.
    pub fn var() -> Tdi {
        Tdi::Var(0)
    }

    pub fn ones() -> Tdi {
        Tdi::Word(-1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TdiEntry {
    pub(crate) bits: usize,
    pub(crate) value: Tdi,
}

/// A capture window: `offset` is measured start-to-start from the previous
/// window (easy to fix up when templates are spliced together).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TdoEntry {
    pub(crate) offset: usize,
    pub(crate) bits: usize,
}

struct Compiled<T: Transport> {
    handle: T::Compiled,
    combiner: TdiCombiner,
    extractor: Option<TdoExtractor>,
}

/// A device-independent JTAG transaction under construction.
pub struct JtagTemplate<T: Transport> {
    transport: Arc<Mutex<T>>,
    name: String,
    tms: Vec<bool>,
    tdi: Vec<TdiEntry>,
    tdo: Vec<TdoEntry>,
    /// Start of the most recent capture window, for offset bookkeeping.
    prevread: usize,
    /// Every TAP state visited, starting state first.
    states: Vec<TapState>,
    bypass: Option<BypassInfo>,
    loopstack: Option<Box<JtagTemplate<T>>>,
    compiled: Option<Compiled<T>>,
}

impl<T: Transport> JtagTemplate<T> {
    /// A template that starts from an unknown TAP state; its first state
    /// move will go through the universal reset sequence.
    pub fn new(transport: Arc<Mutex<T>>) -> JtagTemplate<T> {
        JtagTemplate::with_start(transport, TapState::Unknown)
    }

    /// A template that assumes the TAP is already parked in `start`.
    pub fn with_start(transport: Arc<Mutex<T>>, start: TapState) -> JtagTemplate<T> {
        JtagTemplate {
            transport,
            name: String::new(),
            tms: Vec::new(),
            tdi: Vec::new(),
            tdo: Vec::new(),
            prevread: 0,
            states: vec![start],
            bypass: None,
            loopstack: None,
            compiled: None,
        }
    }

    /// A template addressing one part of a discovered chain: instruction
    /// and data shifts get the part's bypass filler added transparently.
    pub fn with_bypass(transport: Arc<Mutex<T>>, bypass: BypassInfo) -> JtagTemplate<T> {
        let mut t = JtagTemplate::new(transport);
        t.bypass = Some(bypass);
        t
    }

    /// Attach a debugging name, reported when the template is compiled.
    pub fn named(mut self, name: &str) -> JtagTemplate<T> {
        self.name = name.to_string();
        self
    }

    /// Clocks accumulated so far.
    pub fn len(&self) -> usize {
        self.tms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tms.is_empty()
    }

    /// The TAP state the template ends in.
    pub fn tail(&self) -> TapState {
        self.states.last().copied().unwrap_or(TapState::Unknown)
    }

    /// Append the minimal TMS path to `state`, driving don't-care TDI.
    ///
    /// Note this always appends at least one clock, even when the template
    /// is already in `state` (one lap around the state's shortest cycle);
    /// the `read_*`/`write_*` helpers guard against that themselves.
    pub fn move_to(&mut self, state: TapState) -> Result<&mut Self, JtagError> {
        self.compiled = None;
        let tail = self.tail();
        let path = tail
            .path_to(state)
            .ok_or(JtagError::NoPath { from: tail, to: state })?;
        self.tms.extend_from_slice(path.bits());
        self.tdi.push(TdiEntry {
            bits: path.len(),
            value: Tdi::Pattern(vec![XBit::DontCare; path.len()]),
        });
        self.states.push(state);
        Ok(self)
    }

    /// Dwell `count` clocks in the current (stable) state, driving zeros.
    ///
    /// With `advance`, the final clock flips TMS and leaves the state.
    /// Capture is not available here; use [`JtagTemplate::shift`] in a
    /// shift state for that.
    pub fn dwell(&mut self, count: usize, advance: bool) -> Result<&mut Self, JtagError> {
        self.compiled = None;
        let tail = self.tail();
        let cycle = tail.cycle_bit()?;
        assert!(
            count > 0 || !advance,
            "cannot advance out of {tail} with zero clocks"
        );
        self.tms.extend(std::iter::repeat(cycle).take(count));
        if advance {
            if let Some(last) = self.tms.last_mut() {
                *last = !cycle;
            }
            self.states.push(tail.step(!cycle));
        }
        self.tdi.push(TdiEntry {
            bits: count,
            value: Tdi::Word(0),
        });
        Ok(self)
    }

    /// Hold a shift state for `count` clocks, driving `tdi`.
    ///
    /// With `advance`, TMS flips on the final clock (the bit still
    /// shifts) and the TAP moves to the exit state. With `read`, a TDO
    /// capture window is registered over exactly these clocks.
    pub fn shift(
        &mut self,
        count: usize,
        tdi: Tdi,
        advance: bool,
        read: bool,
    ) -> Result<&mut Self, JtagError> {
        self.compiled = None;
        let tail = self.tail();
        if !tail.is_shifting() {
            return Err(JtagError::NotShiftState(tail));
        }
        if let Tdi::Pattern(bits) = &tdi {
            if bits.len() != count {
                return Err(JtagError::TdiWidthMismatch {
                    bits: count,
                    got: bits.len(),
                });
            }
        }
        assert!(
            count > 0 || !advance,
            "cannot advance out of {tail} with zero clocks"
        );
        let start = self.tms.len();
        let cycle = tail.cycle_bit()?;
        self.tms.extend(std::iter::repeat(cycle).take(count));
        if advance {
            if let Some(last) = self.tms.last_mut() {
                *last = !cycle;
            }
            self.states.push(tail.step(!cycle));
        }
        self.tdi.push(TdiEntry { bits: count, value: tdi });
        if read {
            self.tdo.push(TdoEntry {
                offset: start - self.prevread,
                bits: count,
            });
            self.prevread = start;
        }
        Ok(self)
    }

    /// Shared body of the `read_*`/`write_*` helpers: route to the shift
    /// state, wrap the payload in this part's bypass filler, and (when
    /// advancing) park on `select_dr` ready for the next operation.
    fn readwrite(
        &mut self,
        shift_state: TapState,
        bits: usize,
        tdi: Tdi,
        advance: bool,
        read: bool,
    ) -> Result<&mut Self, JtagError> {
        let (prefix, suffix, filler) = match (&self.bypass, shift_state) {
            (Some(b), TapState::ShiftIr) => (b.next_ir, b.prev_ir, XBit::One),
            (Some(b), TapState::ShiftDr) => (b.next_dr, b.prev_dr, XBit::Zero),
            _ => (0, 0, XBit::Zero),
        };
        if self.tail() != shift_state {
            self.move_to(shift_state)?;
            if prefix > 0 {
                self.shift(prefix, Tdi::Pattern(vec![filler; prefix]), false, false)?;
            }
        }
        self.shift(bits, tdi, advance && suffix == 0, read)?;
        if advance {
            if suffix > 0 {
                self.shift(suffix, Tdi::Pattern(vec![filler; suffix]), true, false)?;
            }
            self.move_to(TapState::SelectDr)?;
        }
        Ok(self)
    }

    /// Write `bits` of `tdi` into the instruction register.
    pub fn write_ir(&mut self, bits: usize, tdi: Tdi, advance: bool) -> Result<&mut Self, JtagError> {
        self.readwrite(TapState::ShiftIr, bits, tdi, advance, false)
    }

    /// Write `bits` of `tdi` into the data register.
    pub fn write_dr(&mut self, bits: usize, tdi: Tdi, advance: bool) -> Result<&mut Self, JtagError> {
        self.readwrite(TapState::ShiftDr, bits, tdi, advance, false)
    }

    /// Capture `bits` from the instruction register while shifting `tdi` in.
    pub fn read_ir(&mut self, bits: usize, tdi: Tdi, advance: bool) -> Result<&mut Self, JtagError> {
        self.readwrite(TapState::ShiftIr, bits, tdi, advance, true)
    }

    /// Capture `bits` from the data register while shifting `tdi` in.
    pub fn read_dr(&mut self, bits: usize, tdi: Tdi, advance: bool) -> Result<&mut Self, JtagError> {
        self.readwrite(TapState::ShiftDr, bits, tdi, advance, true)
    }

    /// Deep copy of the builder state; the compiled cache is not shared.
    pub fn copy(&self) -> JtagTemplate<T> {
        JtagTemplate {
            transport: self.transport.clone(),
            name: self.name.clone(),
            tms: self.tms.clone(),
            tdi: self.tdi.clone(),
            tdo: self.tdo.clone(),
            prevread: self.prevread,
            states: self.states.clone(),
            bypass: self.bypass,
            loopstack: self.loopstack.as_ref().map(|b| Box::new(b.copy())),
            compiled: None,
        }
    }

    /// Splice `other` onto the end of `self`, returning a new template.
    ///
    /// The seam is validated first: `other` must begin where `self` ends,
    /// in the sense that the TMS values from `self`'s tail into `other`'s
    /// path match `other`'s own opening TMS values. A failed join leaves
    /// both operands untouched. Adjacent literal TDI runs are merged
    /// across the seam; this is only a compaction.
    pub fn concat(&self, other: &JtagTemplate<T>) -> Result<JtagTemplate<T>, JtagError> {
        let mut new = self.copy();
        if other.tms.is_empty() {
            return Ok(new);
        }
        if !Arc::ptr_eq(&self.transport, &other.transport) {
            return Err(JtagError::TransportMismatch);
        }
        if self.bypass != other.bypass {
            return Err(JtagError::BypassMismatch);
        }
        let tail = new.tail();
        let head = other.states[0];
        if other.states.len() >= 2 {
            let via = other.states[1];
            if !join_compatible(tail, head, via) {
                return Err(JtagError::JoinMismatch { tail, head, via });
            }
        } else if tail != head {
            return Err(JtagError::JoinMismatch { tail, head, via: head });
        }

        let merged = match (new.tdi.last(), other.tdi.first()) {
            (
                Some(TdiEntry { bits: last_bits, value: Tdi::Pattern(last) }),
                Some(TdiEntry { bits: first_bits, value: Tdi::Pattern(first) }),
            ) => {
                // `other`'s bits come later in time, so they go in front.
                let mut bits = Vec::with_capacity(first.len() + last.len());
                bits.extend_from_slice(first);
                bits.extend_from_slice(last);
                Some(TdiEntry {
                    bits: last_bits + first_bits,
                    value: Tdi::Pattern(bits),
                })
            }
            _ => None,
        };
        let rest: &[TdiEntry] = if let Some(merged) = merged {
            let last = new.tdi.len() - 1;
            new.tdi[last] = merged;
            &other.tdi[1..]
        } else {
            &other.tdi
        };
        new.tdi.extend(rest.iter().cloned());

        if !other.tdo.is_empty() {
            let mut first = other.tdo[0];
            first.offset += new.tms.len() - new.prevread;
            new.tdo.push(first);
            new.tdo.extend(other.tdo[1..].iter().copied());
            new.prevread = new.tms.len() + other.prevread;
        }
        new.tms.extend_from_slice(&other.tms);
        new.states.extend(other.states[1..].iter().copied());
        Ok(new)
    }

    /// Repeat the template `n` times.
    ///
    /// Only valid when the template is a self-contained loop (its tail
    /// rejoins its own opening transition). `n == 0` yields an empty
    /// template, `n == 1` a plain copy.
    pub fn repeat(&self, n: usize) -> Result<JtagTemplate<T>, JtagError> {
        if n == 0 {
            return Ok(JtagTemplate::new(self.transport.clone()));
        }
        let mut new = self.copy();
        if n == 1 || new.tms.is_empty() {
            return Ok(new);
        }
        if new.states.len() >= 2 {
            let tail = new.tail();
            let head = new.states[0];
            let via = new.states[1];
            if !join_compatible(tail, head, via) {
                return Err(JtagError::JoinMismatch { tail, head, via });
            }
        }

        let first_last_literal = matches!(
            (new.tdi.first(), new.tdi.last()),
            (
                Some(TdiEntry { value: Tdi::Pattern(_), .. }),
                Some(TdiEntry { value: Tdi::Pattern(_), .. })
            )
        );
        if first_last_literal {
            if let Some(tdilast) = new.tdi.pop() {
                if new.tdi.is_empty() {
                    // A single literal run: repeat it in place.
                    if let Tdi::Pattern(bits) = &tdilast.value {
                        let mut repeated = Vec::with_capacity(bits.len() * n);
                        for _ in 0..n {
                            repeated.extend_from_slice(bits);
                        }
                        new.tdi.push(TdiEntry {
                            bits: tdilast.bits * n,
                            value: Tdi::Pattern(repeated),
                        });
                    }
                } else {
                    let mut tdi2 = new.tdi.clone();
                    if let (
                        TdiEntry { bits: first_bits, value: Tdi::Pattern(first) },
                        Tdi::Pattern(last),
                    ) = (&tdi2[0], &tdilast.value)
                    {
                        let mut bits = Vec::with_capacity(first.len() + last.len());
                        bits.extend_from_slice(first);
                        bits.extend_from_slice(last);
                        tdi2[0] = TdiEntry {
                            bits: first_bits + tdilast.bits,
                            value: Tdi::Pattern(bits),
                        };
                    }
                    for _ in 1..n {
                        new.tdi.extend(tdi2.iter().cloned());
                    }
                    new.tdi.push(tdilast);
                }
            }
        } else {
            let once = new.tdi.clone();
            for _ in 1..n {
                new.tdi.extend(once.iter().cloned());
            }
        }

        if !new.tdo.is_empty() {
            let mut tdo2 = new.tdo.clone();
            tdo2[0].offset += new.tms.len() - new.prevread;
            for _ in 1..n {
                new.tdo.extend(tdo2.iter().copied());
            }
            new.prevread += (n - 1) * new.tms.len();
        }

        let once = new.tms.clone();
        for _ in 1..n {
            new.tms.extend_from_slice(&once);
        }

        if let Some(endstate) = new.states.pop() {
            let body = new.states.clone();
            for _ in 1..n {
                new.states.extend(body.iter().copied());
            }
            new.states.push(endstate);
        }
        new.compiled = None;
        Ok(new)
    }

    /// Mark the start of a repeated section; close it with
    /// [`JtagTemplate::end_loop`]. Loops nest.
    pub fn begin_loop(&mut self) -> &mut Self {
        self.compiled = None;
        let mut fresh = JtagTemplate::with_start(self.transport.clone(), self.tail());
        fresh.bypass = self.bypass;
        fresh.name = self.name.clone();
        std::mem::swap(self, &mut fresh);
        self.loopstack = Some(Box::new(fresh));
        self
    }

    /// Close the innermost open loop, repeating its body `count` times.
    /// `count` of zero drops the body entirely.
    pub fn end_loop(&mut self, count: usize) -> Result<&mut Self, JtagError> {
        let prev = self.loopstack.take().ok_or(JtagError::UnbalancedLoop)?;
        let body = std::mem::replace(self, *prev);
        *self = self.concat(&body.repeat(count)?)?;
        Ok(self)
    }

    /// Run the template: compile on first use, splice in the TDI streams,
    /// transfer, and extract the captured windows.
    ///
    /// `streams[i]` supplies one integer per occurrence of stream `i`, in
    /// template order. Captured windows come back in time order, each
    /// least-significant-bit-first (bit 0 was captured first). Templates
    /// with no captures return an empty list.
    pub fn run(&mut self, streams: &[&[u128]]) -> Result<Vec<BitString>, JtagError> {
        match self.compiled.take() {
            Some(compiled) => {
                let result = self.apply(&compiled, streams);
                self.compiled = Some(compiled);
                result
            }
            None => {
                let compiled = self.compile()?;
                let result = self.apply(&compiled, streams);
                self.compiled = Some(compiled);
                result
            }
        }
    }

    fn compile(&self) -> Result<Compiled<T>, JtagError> {
        let strings = TemplateStrings::new(&self.tms, &self.tdi, &self.tdo)?;
        log::debug!(
            "compiling template {:?}: {} clocks, {} capture windows",
            self.name,
            strings.bit_len(),
            self.tdo.len()
        );
        let mut transport = self.transport.lock().unwrap();
        let strings = strings.customize(&mut *transport);
        let handle = transport.make_template(&strings)?;
        Ok(Compiled {
            handle,
            combiner: strings.tdi_combiner(),
            extractor: strings.tdo_extractor(),
        })
    }

    fn apply(&self, compiled: &Compiled<T>, streams: &[&[u128]]) -> Result<Vec<BitString>, JtagError> {
        let tdi = compiled.combiner.combine(streams)?;
        let raw = {
            let mut transport = self.transport.lock().unwrap();
            transport.apply_template(&compiled.handle, &tdi)?
        };
        Ok(match &compiled.extractor {
            Some(extractor) => extractor.extract(&raw),
            None => Vec::new(),
        })
    }
}

/// Two templates glue together when the TMS values from `tail` into
/// `other`'s second state are the same values `other` itself recorded; the
/// end states may differ as long as the clocked levels agree.
fn join_compatible(tail: TapState, head: TapState, via: TapState) -> bool {
    match (tail.path_to(via), head.path_to(via)) {
        (Some(a), Some(b)) => a.bits() == b.bits(),
        _ => false,
    }
}

impl<T: Transport> Add<&JtagTemplate<T>> for &JtagTemplate<T> {
    type Output = JtagTemplate<T>;

    /// Operator sugar for [`JtagTemplate::concat`]; a mismatched seam is a
    /// programming error and panics.
    fn add(self, other: &JtagTemplate<T>) -> JtagTemplate<T> {
        match self.concat(other) {
            Ok(t) => t,
            Err(e) => panic!("template join failed: {e}"),
        }
    }
}

impl<T: Transport> Mul<usize> for &JtagTemplate<T> {
    type Output = JtagTemplate<T>;

    /// Operator sugar for [`JtagTemplate::repeat`]; an open-ended template
    /// is a programming error and panics.
    fn mul(self, n: usize) -> JtagTemplate<T> {
        match self.repeat(n) {
            Ok(t) => t,
            Err(e) => panic!("template repeat failed: {e}"),
        }
    }
}
