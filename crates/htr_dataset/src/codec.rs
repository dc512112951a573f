//! String/label conversion for CTC training.
//!
//! Code `0` is the CTC blank. Alphabet symbol `i` (0-based) has code `i + 1`.
//! A separator symbol is appended after the alphabet; it is how the blank is
//! rendered by raw decoding.

use crate::types::CodecError;
use std::collections::HashMap;

/// Code reserved for the CTC blank class.
pub const CTC_BLANK: u32 = 0;
/// Symbol appended to the alphabet; raw decoding renders the blank with it.
pub const SEPARATOR: char = '-';

/// Flat label codes plus per-item lengths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedBatch {
    pub codes: Vec<u32>,
    pub lengths: Vec<usize>,
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// Fails with `LengthMismatch` unless `lengths` add up to `codes.len()`.
    pub fn check(&self) -> Result<(), CodecError> {
        check_lengths(&self.codes, &self.lengths)
    }

    /// Per-item code slices; only valid after [`EncodedBatch::check`].
    fn items(&self) -> impl Iterator<Item = &[u32]> + '_ {
        let mut offset = 0;
        self.lengths.iter().map(move |&len| {
            let item = &self.codes[offset..offset + len];
            offset += len;
            item
        })
    }

    /// Row-major `[len(), max_len()]` matrix, each row zero-padded past its length.
    pub fn padded(&self) -> Result<Vec<u32>, CodecError> {
        self.check()?;
        let width = self.max_len();
        let mut out = vec![CTC_BLANK; self.len() * width];
        for (row, item) in self.items().enumerate() {
            out[row * width..row * width + item.len()].copy_from_slice(item);
        }
        Ok(out)
    }

    /// Row-major `[len(), max_len(), num_classes]` one-hot targets; padding rows stay zero.
    pub fn one_hot(&self, num_classes: usize) -> Result<Vec<f32>, CodecError> {
        self.check()?;
        let width = self.max_len();
        let mut out = vec![0.0f32; self.len() * width * num_classes];
        for (row, item) in self.items().enumerate() {
            for (t, &code) in item.iter().enumerate() {
                let class = code as usize;
                if class >= num_classes {
                    return Err(CodecError::UnknownCode {
                        code,
                        max: num_classes.saturating_sub(1) as u32,
                    });
                }
                out[(row * width + t) * num_classes + class] = 1.0;
            }
        }
        Ok(out)
    }

    /// Flat int targets and lengths as burn tensors (the layout CTC losses consume).
    #[cfg(feature = "burn-runtime")]
    pub fn to_burn<B: burn::tensor::backend::Backend>(
        &self,
        device: &B::Device,
    ) -> (
        burn::tensor::Tensor<B, 1, burn::tensor::Int>,
        burn::tensor::Tensor<B, 1, burn::tensor::Int>,
    ) {
        let codes: Vec<i32> = self.codes.iter().map(|&c| c as i32).collect();
        let lengths: Vec<i32> = self.lengths.iter().map(|&l| l as i32).collect();
        let codes = burn::tensor::Tensor::<B, 1, burn::tensor::Int>::from_ints(
            codes.as_slice(),
            device,
        );
        let lengths = burn::tensor::Tensor::<B, 1, burn::tensor::Int>::from_ints(
            lengths.as_slice(),
            device,
        );
        (codes, lengths)
    }
}

/// Converts between text and CTC label codes.
#[derive(Debug, Clone)]
pub struct LabelCodec {
    ignore_case: bool,
    /// Alphabet symbols followed by [`SEPARATOR`].
    symbols: Vec<char>,
    dict: HashMap<char, u32>,
}

impl LabelCodec {
    /// Build from a character set. Repeated symbols keep their first position.
    pub fn new(alphabet: &str, ignore_case: bool) -> Self {
        let mut symbols: Vec<char> = Vec::with_capacity(alphabet.len() + 1);
        let mut dict = HashMap::new();
        for c in alphabet.chars() {
            let c = if ignore_case { fold_case(c) } else { c };
            if dict.contains_key(&c) {
                continue;
            }
            symbols.push(c);
            dict.insert(c, symbols.len() as u32);
        }
        symbols.push(SEPARATOR);
        Self {
            ignore_case,
            symbols,
            dict,
        }
    }

    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    /// Alphabet symbols without the separator.
    pub fn alphabet(&self) -> &[char] {
        &self.symbols[..self.symbols.len() - 1]
    }

    /// Blank plus one class per alphabet symbol.
    pub fn num_classes(&self) -> usize {
        self.symbols.len()
    }

    /// Code assigned to the appended separator symbol.
    pub fn separator_code(&self) -> u32 {
        self.symbols.len() as u32
    }

    pub fn code_of(&self, symbol: char) -> Option<u32> {
        let symbol = if self.ignore_case {
            fold_case(symbol)
        } else {
            symbol
        };
        self.dict.get(&symbol).copied()
    }

    pub fn can_encode(&self, text: &str) -> bool {
        text.chars().all(|c| self.code_of(c).is_some())
    }

    pub fn encode_one(&self, text: &str) -> Result<EncodedBatch, CodecError> {
        let codes = self.encode_codes(text)?;
        let lengths = vec![codes.len()];
        Ok(EncodedBatch { codes, lengths })
    }

    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<EncodedBatch, CodecError> {
        let mut out = EncodedBatch::default();
        for text in texts {
            let codes = self.encode_codes(text.as_ref())?;
            out.lengths.push(codes.len());
            out.codes.extend(codes);
        }
        Ok(out)
    }

    fn encode_codes(&self, text: &str) -> Result<Vec<u32>, CodecError> {
        text.chars()
            .enumerate()
            .map(|(position, symbol)| {
                self.code_of(symbol)
                    .ok_or(CodecError::UnknownSymbol { symbol, position })
            })
            .collect()
    }

    /// Decode one sequence. `raw` maps every code verbatim; otherwise blanks are
    /// dropped and consecutive repeats collapse (CTC best path).
    pub fn decode_one(&self, codes: &[u32], length: usize, raw: bool) -> Result<String, CodecError> {
        if codes.len() != length {
            return Err(CodecError::LengthMismatch {
                declared: length,
                actual: codes.len(),
            });
        }
        let mut out = String::with_capacity(length);
        for (i, &code) in codes.iter().enumerate() {
            if !raw && (code == CTC_BLANK || (i > 0 && codes[i - 1] == code)) {
                continue;
            }
            out.push(self.symbol_of(code)?);
        }
        Ok(out)
    }

    pub fn decode_batch(
        &self,
        codes: &[u32],
        lengths: &[usize],
        raw: bool,
    ) -> Result<Vec<String>, CodecError> {
        check_lengths(codes, lengths)?;
        let mut texts = Vec::with_capacity(lengths.len());
        let mut offset = 0;
        for &len in lengths {
            texts.push(self.decode_one(&codes[offset..offset + len], len, raw)?);
            offset += len;
        }
        Ok(texts)
    }

    pub fn decode_encoded(&self, encoded: &EncodedBatch, raw: bool) -> Result<Vec<String>, CodecError> {
        self.decode_batch(&encoded.codes, &encoded.lengths, raw)
    }

    fn symbol_of(&self, code: u32) -> Result<char, CodecError> {
        if code == CTC_BLANK {
            return Ok(SEPARATOR);
        }
        self.symbols
            .get(code as usize - 1)
            .copied()
            .ok_or(CodecError::UnknownCode {
                code,
                max: self.separator_code(),
            })
    }
}

fn check_lengths(codes: &[u32], lengths: &[usize]) -> Result<(), CodecError> {
    let declared = lengths
        .iter()
        .try_fold(0usize, |acc, &len| acc.checked_add(len))
        .unwrap_or(usize::MAX);
    if declared != codes.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: codes.len(),
        });
    }
    Ok(())
}

fn fold_case(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ab_alphabet_codes() {
        let codec = LabelCodec::new("ab", false);
        assert_eq!(codec.code_of('a'), Some(1));
        assert_eq!(codec.code_of('b'), Some(2));
        assert_eq!(codec.separator_code(), 3);
        assert_eq!(codec.num_classes(), 3);

        let enc = codec.encode_one("aab").unwrap();
        assert_eq!(enc.codes, vec![1, 1, 2]);
        assert_eq!(enc.lengths, vec![3]);
        assert_eq!(codec.decode_one(&enc.codes, 3, false).unwrap(), "ab");
        assert_eq!(codec.decode_one(&enc.codes, 3, true).unwrap(), "aab");
    }

    #[test]
    fn collapse_is_lossless_without_adjacent_repeats() {
        let codec = LabelCodec::new("abcdefghijklmnopqrstuvwxyz ", false);
        for text in ["hello world", "abcabc", "a", "", "the quick brown fox"] {
            let has_repeat = text.as_bytes().windows(2).any(|w| w[0] == w[1]);
            let enc = codec.encode_one(text).unwrap();
            let decoded = codec.decode_one(&enc.codes, enc.lengths[0], false).unwrap();
            if has_repeat {
                assert_ne!(decoded, text);
            } else {
                assert_eq!(decoded, text);
            }
        }
    }

    #[test]
    fn collapse_drops_repeats_in_general() {
        let codec = LabelCodec::new("lo", false);
        let enc = codec.encode_one("ooll").unwrap();
        assert_eq!(codec.decode_one(&enc.codes, 4, false).unwrap(), "ol");
    }

    #[test]
    fn blanks_separate_repeats_and_are_dropped() {
        let codec = LabelCodec::new("ab", false);
        let codes = [1, 1, 0, 1, 2, 2, 0, 0];
        assert_eq!(codec.decode_one(&codes, 8, false).unwrap(), "aab");
        assert_eq!(codec.decode_one(&codes, 8, true).unwrap(), "aa-abb--");
    }

    #[test]
    fn separator_code_decodes_to_separator() {
        let codec = LabelCodec::new("ab", false);
        assert_eq!(codec.decode_one(&[3], 1, true).unwrap(), "-");
        assert_eq!(
            codec.decode_one(&[4], 1, true).unwrap_err(),
            CodecError::UnknownCode { code: 4, max: 3 }
        );
    }

    #[test]
    fn unknown_symbol_reports_position() {
        let codec = LabelCodec::new("ab", false);
        assert_eq!(
            codec.encode_one("abz").unwrap_err(),
            CodecError::UnknownSymbol {
                symbol: 'z',
                position: 2
            }
        );
    }

    #[test]
    fn ignore_case_folds_alphabet_and_input() {
        let codec = LabelCodec::new("AbC", true);
        assert_eq!(codec.alphabet(), &['a', 'b', 'c']);
        let enc = codec.encode_one("ABc").unwrap();
        assert_eq!(enc.codes, vec![1, 2, 3]);
        assert_eq!(codec.decode_one(&enc.codes, 3, true).unwrap(), "abc");
    }

    #[test]
    fn duplicate_alphabet_symbols_keep_first_code() {
        let codec = LabelCodec::new("abca", false);
        assert_eq!(codec.alphabet(), &['a', 'b', 'c']);
        assert_eq!(codec.code_of('a'), Some(1));
        assert_eq!(codec.num_classes(), 4);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let codec = LabelCodec::new("ab", false);
        assert_eq!(
            codec.decode_one(&[1, 2], 3, false).unwrap_err(),
            CodecError::LengthMismatch {
                declared: 3,
                actual: 2
            }
        );
        assert!(codec.decode_batch(&[1, 2, 1], &[1, 1], false).is_err());
    }

    #[test]
    fn batch_round_trip() {
        let codec = LabelCodec::new("abcdefghijklmnopqrstuvwxyz ", false);
        let texts = vec!["the fox", "", "jumps", "over a dog"];
        let enc = codec.encode_batch(&texts).unwrap();
        assert_eq!(enc.lengths, vec![7, 0, 5, 10]);
        assert_eq!(enc.lengths.iter().sum::<usize>(), enc.codes.len());
        assert_eq!(codec.decode_encoded(&enc, false).unwrap(), texts);
        assert_eq!(codec.decode_encoded(&enc, true).unwrap(), texts);
    }

    #[test]
    fn raw_decode_inverts_encode_with_repeats() {
        let codec = LabelCodec::new("abcdefghijklmnopqrstuvwxyz ", false);
        let texts = ["bookkeeper", "aa  bb"];
        let enc = codec.encode_batch(&texts).unwrap();
        assert_eq!(codec.decode_encoded(&enc, true).unwrap(), texts);
    }

    #[test]
    fn padded_and_one_hot_layouts() {
        let codec = LabelCodec::new("ab", false);
        let enc = codec.encode_batch(&["ab", "b"]).unwrap();
        assert_eq!(enc.padded().unwrap(), vec![1, 2, 2, 0]);

        let hot = enc.one_hot(codec.num_classes()).unwrap();
        assert_eq!(hot.len(), 2 * 2 * 3);
        assert_eq!(&hot[0..3], &[0.0, 1.0, 0.0]);
        assert_eq!(&hot[3..6], &[0.0, 0.0, 1.0]);
        assert_eq!(&hot[6..9], &[0.0, 0.0, 1.0]);
        assert_eq!(&hot[9..12], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn inconsistent_lengths_are_rejected_not_sliced() {
        let bad = EncodedBatch {
            codes: vec![1],
            lengths: vec![2],
        };
        let mismatch = CodecError::LengthMismatch {
            declared: 2,
            actual: 1,
        };
        assert_eq!(bad.check().unwrap_err(), mismatch);
        assert_eq!(bad.padded().unwrap_err(), mismatch);
        assert_eq!(bad.one_hot(3).unwrap_err(), mismatch);

        let overflowing = EncodedBatch {
            codes: vec![1, 2],
            lengths: vec![usize::MAX, 2],
        };
        assert!(overflowing.padded().is_err());
        assert!(LabelCodec::new("ab", false)
            .decode_encoded(&overflowing, true)
            .is_err());
    }
}
