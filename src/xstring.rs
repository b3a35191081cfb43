//! Compilation of device-independent templates into flat ternary strings,
//! and the combiner/extractor machinery that splices live TDI words into
//! the constant skeleton and pulls captured TDO words back out.
//!
//! All three strings are kept in *wire order*: index 0 is the **last** bit
//! clocked out, so reading right-to-left gives time order. The reversal
//! keeps template concatenation cheap, and every offset computation below
//! depends on it.

use std::fmt;
use std::ops::Range;

use bitvec::prelude::*;

use crate::template::{Tdi, TdiEntry, TdoEntry};
use crate::transport::Transport;
use crate::JtagError;

/// Raw concrete bits, as exchanged with a cable driver.
pub type BitString = BitVec<u8, Lsb0>;

/// One position of a ternary string.
///
/// `Var` marks late-bound data (a TDI placeholder, or a TDO capture);
/// `DontCare` marks clocks whose value is irrelevant (TDI) or discarded
/// (TDO). TMS strings only ever use `Zero`/`One`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XBit {
    Zero,
    One,
    Var,
    DontCare,
}

impl XBit {
    pub const fn from_bool(bit: bool) -> XBit {
        if bit { XBit::One } else { XBit::Zero }
    }

    pub const fn as_char(self) -> char {
        match self {
            XBit::Zero => '0',
            XBit::One => '1',
            XBit::Var => 'x',
            XBit::DontCare => '*',
        }
    }
}

/// A wire-ordered ternary string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XString {
    bits: Vec<XBit>,
}

impl XString {
    pub fn new() -> XString {
        XString::default()
    }

    pub fn with_capacity(n: usize) -> XString {
        XString {
            bits: Vec::with_capacity(n),
        }
    }

    pub fn repeat(bit: XBit, n: usize) -> XString {
        XString {
            bits: vec![bit; n],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn push(&mut self, bit: XBit) {
        self.bits.push(bit);
    }

    pub fn bits(&self) -> &[XBit] {
        &self.bits
    }

    pub(crate) fn count(&self, bit: XBit) -> usize {
        self.bits.iter().filter(|&&b| b == bit).count()
    }
}

impl Extend<XBit> for XString {
    fn extend<I: IntoIterator<Item = XBit>>(&mut self, iter: I) {
        self.bits.extend(iter);
    }
}

impl FromIterator<XBit> for XString {
    fn from_iter<I: IntoIterator<Item = XBit>>(iter: I) -> XString {
        XString {
            bits: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for XString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in &self.bits {
            write!(f, "{}", bit.as_char())?;
        }
        Ok(())
    }
}

/// The three equal-length wire-order strings compiled from one template,
/// ready for a driver's [`Transport::customize_template`] pass and then for
/// combiner/extractor construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateStrings {
    tms: BitString,
    tdi: XString,
    tdo: XString,
    /// Placeholder words in time order: (width, stream index).
    tdi_words: Vec<(usize, usize)>,
    /// Capture window widths in time order.
    tdo_words: Vec<usize>,
}

impl TemplateStrings {
    /// Flatten a template's TMS/TDI/TDO lists into wire-order strings.
    ///
    /// The TMS bits are reversed wholesale; TDI entries are reversed as
    /// words with each word kept most-significant-bit first, so the first
    /// bit transmitted is the low bit of the first word. TDO capture
    /// windows are expanded from start-to-start offsets into `Var` runs.
    pub(crate) fn new(
        tms: &[bool],
        tdi: &[TdiEntry],
        tdo: &[TdoEntry],
    ) -> Result<TemplateStrings, JtagError> {
        let bit_len = tms.len();
        let mut tms_string = BitString::with_capacity(bit_len);
        for &bit in tms.iter().rev() {
            tms_string.push(bit);
        }

        let mut tdi_words = Vec::new();
        let mut chunks: Vec<Vec<XBit>> = Vec::with_capacity(tdi.len());
        for entry in tdi {
            let chunk = match &entry.value {
                Tdi::Var(stream) => {
                    tdi_words.push((entry.bits, *stream));
                    vec![XBit::Var; entry.bits]
                }
                Tdi::Pattern(bits) => {
                    assert_eq!(
                        bits.len(),
                        entry.bits,
                        "TDI pattern width disagrees with its clock count"
                    );
                    bits.clone()
                }
                Tdi::Word(value) => word_bits(*value, entry.bits)?,
            };
            chunks.push(chunk);
        }
        let mut tdi_string = XString::with_capacity(bit_len);
        for chunk in chunks.iter().rev() {
            tdi_string.extend(chunk.iter().copied());
        }
        assert_eq!(
            tdi_string.len(),
            bit_len,
            "TDI bit count disagrees with the clock count"
        );

        let tdo_words: Vec<usize> = tdo.iter().map(|e| e.bits).collect();
        let tdo_string = if tdo.is_empty() {
            XString::repeat(XBit::DontCare, bit_len)
        } else {
            let mut chunks: Vec<Vec<XBit>> = Vec::new();
            let mut prevlen = 0;
            let mut total = 0;
            for entry in tdo {
                assert!(
                    entry.offset >= prevlen,
                    "overlapping TDO capture windows"
                );
                let gap = entry.offset - prevlen;
                chunks.push(vec![XBit::DontCare; gap]);
                chunks.push(vec![XBit::Var; entry.bits]);
                prevlen = entry.bits;
                total += gap + entry.bits;
            }
            assert!(total <= bit_len, "TDO capture windows overrun the template");
            chunks.push(vec![XBit::DontCare; bit_len - total]);
            let mut s = XString::with_capacity(bit_len);
            for chunk in chunks.iter().rev() {
                s.extend(chunk.iter().copied());
            }
            s
        };
        assert_eq!(tdo_string.len(), bit_len);

        Ok(TemplateStrings {
            tms: tms_string,
            tdi: tdi_string,
            tdo: tdo_string,
            tdi_words,
            tdo_words,
        })
    }

    /// Transaction length in clocks.
    pub fn bit_len(&self) -> usize {
        self.tms.len()
    }

    pub fn tms(&self) -> &BitString {
        &self.tms
    }

    pub fn tdi(&self) -> &XString {
        &self.tdi
    }

    pub fn tdo(&self) -> &XString {
        &self.tdo
    }

    /// Run the driver's customization pass over the TDI/TDO strings.
    ///
    /// A driver may interleave protocol framing (command bytes on TDI,
    /// spacer positions on TDO) but must hand back equal-length strings
    /// with every placeholder and capture position intact; the TMS string
    /// is the clock count and stays untouched.
    pub(crate) fn customize<T: Transport + ?Sized>(self, transport: &mut T) -> TemplateStrings {
        let var_tdi = self.tdi.count(XBit::Var);
        let var_tdo = self.tdo.count(XBit::Var);
        let TemplateStrings {
            tms,
            tdi,
            tdo,
            tdi_words,
            tdo_words,
        } = self;
        let (tdi, tdo) = transport.customize_template(tdi, tdo);
        assert_eq!(
            tdi.len(),
            tdo.len(),
            "customize_template returned TDI/TDO strings of different lengths"
        );
        assert_eq!(
            tdi.count(XBit::Var),
            var_tdi,
            "customize_template dropped TDI placeholder bits"
        );
        assert_eq!(
            tdo.count(XBit::Var),
            var_tdo,
            "customize_template dropped TDO capture bits"
        );
        assert!(
            tdo.bits()
                .iter()
                .all(|b| matches!(b, XBit::Var | XBit::DontCare)),
            "customized TDO string contains drive levels"
        );
        TemplateStrings {
            tms,
            tdi,
            tdo,
            tdi_words,
            tdo_words,
        }
    }

    pub(crate) fn tdi_combiner(&self) -> TdiCombiner {
        TdiCombiner::build(&self.tdi, &self.tdi_words)
    }

    pub(crate) fn tdo_extractor(&self) -> Option<TdoExtractor> {
        if self.tdo_words.is_empty() {
            None
        } else {
            Some(TdoExtractor::build(&self.tdo, &self.tdo_words))
        }
    }
}

/// Render a concrete TDI word most-significant-bit first. `-1` means all
/// ones whatever the width; other values must fit the declared width.
fn word_bits(value: i128, bits: usize) -> Result<Vec<XBit>, JtagError> {
    if value < 0 {
        if value != -1 {
            return Err(JtagError::TdiOverflow {
                bits,
                value: value.unsigned_abs(),
            });
        }
        return Ok(vec![XBit::One; bits]);
    }
    let value = value as u128;
    if bits < 128 && value >> bits != 0 {
        return Err(JtagError::TdiOverflow { bits, value });
    }
    Ok((0..bits)
        .rev()
        .map(|k| XBit::from_bool(k < 128 && value >> k & 1 == 1))
        .collect())
}

enum TdiRun {
    Const(BitString),
    Var(usize),
}

/// Splices caller-supplied integer streams into the constant TDI skeleton.
///
/// Built once per compiled template. The variable words are serialized into
/// one long bit string (reverse time order, each word MSB first, exactly as
/// the placeholder runs appear in the wire-order string) and dealt out to
/// the `Var` runs by cursor, since a driver's framing pass may have split
/// a word's run in two and runs need not line up with words.
pub(crate) struct TdiCombiner {
    runs: Vec<TdiRun>,
    /// (width, stream, occurrence) in reverse time order.
    words: Vec<(usize, usize, usize)>,
    /// Expected word count per stream.
    counts: Vec<usize>,
    var_bits: usize,
    total_bits: usize,
}

impl TdiCombiner {
    fn build(tdi: &XString, tdi_words: &[(usize, usize)]) -> TdiCombiner {
        let mut runs: Vec<TdiRun> = Vec::new();
        for &bit in tdi.bits() {
            if bit == XBit::Var {
                if let Some(TdiRun::Var(n)) = runs.last_mut() {
                    *n += 1;
                    continue;
                }
                runs.push(TdiRun::Var(1));
            } else {
                // Don't-cares drive zero on the wire.
                let level = bit == XBit::One;
                if let Some(TdiRun::Const(run)) = runs.last_mut() {
                    run.push(level);
                    continue;
                }
                let mut run = BitString::new();
                run.push(level);
                runs.push(TdiRun::Const(run));
            }
        }

        let mut counts: Vec<usize> = Vec::new();
        let mut words: Vec<(usize, usize, usize)> = Vec::with_capacity(tdi_words.len());
        for &(bits, stream) in tdi_words {
            if counts.len() <= stream {
                counts.resize(stream + 1, 0);
            }
            words.push((bits, stream, counts[stream]));
            counts[stream] += 1;
        }
        words.reverse();
        let var_bits = words.iter().map(|w| w.0).sum();

        TdiCombiner {
            runs,
            words,
            counts,
            var_bits,
            total_bits: tdi.len(),
        }
    }

    /// Produce the concrete wire-order TDI string for one invocation.
    pub(crate) fn combine(&self, streams: &[&[u128]]) -> Result<BitString, JtagError> {
        let got: Vec<usize> = streams.iter().map(|s| s.len()).collect();
        if got != self.counts && (!self.counts.is_empty() || got.iter().sum::<usize>() > 0) {
            return Err(JtagError::TdiStreamMismatch {
                expected: self.counts.clone(),
                got,
            });
        }

        let mut vars = BitString::with_capacity(self.var_bits);
        for &(bits, stream, occurrence) in &self.words {
            let value = streams[stream][occurrence];
            if bits < 128 && value >> bits != 0 {
                return Err(JtagError::TdiOverflow { bits, value });
            }
            for k in (0..bits).rev() {
                vars.push(k < 128 && value >> k & 1 == 1);
            }
        }

        let mut out = BitString::with_capacity(self.total_bits);
        let mut cursor = 0;
        for run in &self.runs {
            match run {
                TdiRun::Const(bits) => out.extend_from_bitslice(bits),
                TdiRun::Var(len) => {
                    out.extend_from_bitslice(&vars[cursor..cursor + *len]);
                    cursor += len;
                }
            }
        }
        assert_eq!(cursor, self.var_bits);
        assert_eq!(out.len(), self.total_bits);
        Ok(out)
    }
}

/// Pulls captured words back out of a raw TDO string.
///
/// Two-level slicing: a `keep` pass drops the dead stretches *inside*
/// capture windows (a framing pass can split a window), while dead
/// stretches *between* windows are kept and skipped by the `extract`
/// ranges, keeping the slice count low. Extract ranges index the
/// concatenated kept bits and are stored in time order.
pub(crate) struct TdoExtractor {
    keep: Vec<Range<usize>>,
    extract: Vec<Range<usize>>,
    source_len: usize,
}

impl TdoExtractor {
    fn build(tdo: &XString, tdo_words: &[usize]) -> TdoExtractor {
        // Alternating constant/variable run lengths, constant first.
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut const_len = 0;
        let mut var_len = 0;
        for &bit in tdo.bits() {
            if bit == XBit::Var {
                var_len += 1;
            } else if var_len == 0 {
                const_len += 1;
            } else {
                pairs.push((const_len, var_len));
                const_len = 1;
                var_len = 0;
            }
        }
        if var_len > 0 {
            pairs.push((const_len, var_len));
        }

        let mut wordstack = tdo_words.to_vec();
        let mut keep_start = vec![0usize];
        let mut keep_stop: Vec<usize> = Vec::new();
        let mut extract: Vec<Range<usize>> = Vec::new();
        let mut source = 0;
        let mut kept = 0;
        let mut collected = 0;
        for (const_run, var_run) in pairs {
            source += const_run;
            if collected > 0 {
                keep_start.push(source);
            } else {
                kept += const_run;
            }
            source += var_run;
            collected += var_run;
            while collected > 0 && wordstack.last().is_some_and(|&w| collected >= w) {
                let width = wordstack.pop().unwrap_or(0);
                collected -= width;
                extract.push(kept..kept + width);
                kept += width;
            }
            if collected > 0 {
                keep_stop.push(source);
            }
        }
        keep_stop.push(tdo.len());
        assert!(
            wordstack.is_empty() && collected == 0,
            "TDO capture windows disagree with the capture string"
        );
        assert_eq!(keep_start.len(), keep_stop.len());
        let keep = keep_start
            .into_iter()
            .zip(keep_stop)
            .map(|(a, b)| a..b)
            .collect();
        extract.reverse();
        TdoExtractor {
            keep,
            extract,
            source_len: tdo.len(),
        }
    }

    /// Slice a raw wire-order TDO string into per-window words.
    ///
    /// Windows come back in time order, least-significant-bit first: bit 0
    /// of each word is the first bit that was captured.
    pub(crate) fn extract(&self, raw: &BitSlice<u8, Lsb0>) -> Vec<BitString> {
        assert_eq!(
            raw.len(),
            self.source_len,
            "raw TDO length disagrees with the compiled template"
        );
        let mut kept = BitString::with_capacity(self.source_len);
        for range in &self.keep {
            kept.extend_from_bitslice(&raw[range.clone()]);
        }
        self.extract
            .iter()
            .map(|range| {
                let mut word = BitString::with_capacity(range.len());
                for i in range.clone().rev() {
                    word.push(kept[i]);
                }
                word
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TdiEntry, TdoEntry};

    fn strings(tms: &[u8], tdi: Vec<TdiEntry>, tdo: Vec<TdoEntry>) -> TemplateStrings {
        let tms: Vec<bool> = tms.iter().map(|&b| b != 0).collect();
        TemplateStrings::new(&tms, &tdi, &tdo).unwrap()
    }

    fn entry(bits: usize, value: Tdi) -> TdiEntry {
        TdiEntry { bits, value }
    }

    #[test]
    fn wire_order_is_reverse_chronological() {
        // Three clocks of don't-care, then a 4-bit constant 0b1010, then a
        // 2-bit placeholder, reading right to left.
        let s = strings(
            &[1, 1, 0, 0, 0, 0, 0, 0, 0],
            vec![
                entry(3, Tdi::Pattern(vec![XBit::DontCare; 3])),
                entry(4, Tdi::Word(0b1010)),
                entry(2, Tdi::Var(0)),
            ],
            vec![TdoEntry { offset: 7, bits: 2 }],
        );
        assert_eq!(s.tdi().to_string(), "xx1010***");
        assert_eq!(s.tdo().to_string(), "xx*******");
        // TMS string is reversed outright.
        assert_eq!(s.tms().iter().by_vals().collect::<Vec<bool>>(), vec![
            false, false, false, false, false, false, false, true, true
        ]);
    }

    #[test]
    fn negative_one_means_all_ones() {
        let s = strings(
            &[0, 0, 0, 0, 0],
            vec![entry(5, Tdi::Word(-1))],
            vec![],
        );
        assert_eq!(s.tdi().to_string(), "11111");
        assert_eq!(s.tdo().to_string(), "*****");
    }

    #[test]
    fn oversized_word_is_rejected() {
        let tms = vec![false; 3];
        let err = TemplateStrings::new(&tms, &[entry(3, Tdi::Word(8))], &[]);
        assert!(matches!(err, Err(JtagError::TdiOverflow { bits: 3, value: 8 })));
    }

    #[test]
    fn combiner_splices_streams_into_the_skeleton() {
        let s = strings(
            &[0; 10],
            vec![
                entry(2, Tdi::Word(0b11)),
                entry(3, Tdi::Var(0)),
                entry(2, Tdi::Pattern(vec![XBit::DontCare; 2])),
                entry(3, Tdi::Var(0)),
            ],
            vec![],
        );
        assert_eq!(s.tdi().to_string(), "xxx**xxx11");
        let combiner = s.tdi_combiner();
        let out = combiner.combine(&[&[0b101, 0b010]]).unwrap();
        // Wire order: second word, zeroed don't-cares, first word, constant.
        let rendered: String = out
            .iter()
            .by_vals()
            .map(|b| if b { '1' } else { '0' })
            .collect();
        assert_eq!(rendered, "0100010111");
    }

    #[test]
    fn combiner_checks_stream_counts() {
        let s = strings(&[0; 4], vec![entry(4, Tdi::Var(0))], vec![]);
        let combiner = s.tdi_combiner();
        assert!(combiner.combine(&[&[1, 2]]).is_err());
        assert!(combiner.combine(&[]).is_err());
        assert!(combiner.combine(&[&[0xF]]).is_ok());
        assert!(matches!(
            combiner.combine(&[&[0x10]]),
            Err(JtagError::TdiOverflow { bits: 4, value: 0x10 })
        ));
    }

    #[test]
    fn empty_template_accepts_empty_streams() {
        let s = strings(&[0; 4], vec![entry(4, Tdi::Word(0))], vec![]);
        let combiner = s.tdi_combiner();
        assert!(combiner.combine(&[]).is_ok());
        assert!(combiner.combine(&[&[]]).is_ok());
    }

    #[test]
    fn extractor_reassembles_split_windows() {
        // One 6-bit capture window whose string got a 2-bit spacer wedged
        // into the middle by a framing pass, plus dead space either side.
        let raw_string = "**xxx**xxx*";
        let tdo: XString = raw_string
            .chars()
            .map(|c| if c == 'x' { XBit::Var } else { XBit::DontCare })
            .collect();
        let extractor = TdoExtractor::build(&tdo, &[6]);
        // Wire order: the *last* captured bits are leftmost.
        let raw: BitString = [0, 0, 1, 0, 1, 0, 0, 0, 1, 1, 0]
            .iter()
            .map(|&b| b != 0)
            .collect();
        let words = extractor.extract(&raw);
        assert_eq!(words.len(), 1);
        // Time order: 011 (early run, right) then 101 (late run, left);
        // LSB-first word = 0b101_011.
        assert_eq!(words[0].load_le::<u32>(), 0b101011);
    }

    #[test]
    fn extractor_returns_windows_in_time_order() {
        let s = strings(
            &[0; 8],
            vec![entry(8, Tdi::Word(0))],
            vec![
                TdoEntry { offset: 1, bits: 2 },
                TdoEntry { offset: 4, bits: 3 },
            ],
        );
        assert_eq!(s.tdo().to_string(), "xxx**xx*");
        let extractor = s.tdo_extractor().unwrap();
        let mut raw = BitString::repeat(false, 8);
        // Early window (clocks 1..3) lives at wire 5..7, later bit leftmost.
        raw.set(5, true);
        // Late window (clocks 5..8) lives at wire 0..3.
        raw.set(2, true);
        let words = extractor.extract(&raw);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].load_le::<u32>(), 0b10);
        assert_eq!(words[1].load_le::<u32>(), 0b001);
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let tms = vec![true, false, true, false];
        let tdi = vec![entry(1, Tdi::Var(0)), entry(3, Tdi::Word(5))];
        let tdo = vec![TdoEntry { offset: 0, bits: 2 }];
        let a = TemplateStrings::new(&tms, &tdi, &tdo).unwrap();
        let b = TemplateStrings::new(&tms, &tdi, &tdo).unwrap();
        assert_eq!(a, b);
    }
}
