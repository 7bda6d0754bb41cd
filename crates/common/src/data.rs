//! Data pipeline: text loading, tokenisation, padding, loss masks.
//!
//! Every sample is one line of the corpus (plain text or JSONL with a
//! `"text"` field) encoded, truncated to `max_seq_len` and right-padded. The
//! model sees `ids[..L-1]`, is scored against `ids[1..]`, and padding is
//! excluded from the loss through the mask.
//!
//! * **[`PretrainDataset`]** — raw lines in memory, encoded lazily per sample.
//! * **[`MmapDataset`]** — zero-copy access to pre-tokenised padded rows via `memmap2`.
//! * **[`write_pretokenized`]** — parallel encode of a [`PretrainDataset`] into that format.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use rayon::prelude::*;
use tokenizers::Tokenizer;

// ── Encoder interface ───────────────────────────────────────────────────────

/// Text → token ids. The tokenizer is an external collaborator; this is
/// the whole surface the dataset needs from it.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Id used for right-padding; positions holding it are masked out of the loss.
    fn pad_id(&self) -> u32;
}

/// HuggingFace `tokenizer.json` encoder.
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file or a directory that contains one.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };
        let inner = Tokenizer::from_file(&file)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", file.display()))?;
        let pad_id = inner
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| inner.token_to_id("<pad>"))
            .or_else(|| inner.token_to_id("<unk>"))
            .unwrap_or(0);
        Ok(Self { inner, pad_id })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextEncoder for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

// ── Sample ──────────────────────────────────────────────────────────────────

/// One training example: `seq_len = max_seq_len - 1` positions each.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub targets: Vec<u32>,
    /// 1.0 where the target is a real token, 0.0 where it is padding.
    pub loss_mask: Vec<f32>,
}

impl Sample {
    /// Truncate / right-pad `ids` to `max_seq_len`, then shift by one.
    pub fn from_ids(mut ids: Vec<u32>, max_seq_len: usize, pad_id: u32) -> Self {
        ids.truncate(max_seq_len);
        ids.resize(max_seq_len, pad_id);
        Self::from_padded(&ids, pad_id)
    }

    /// Build from an already padded row of length `max_seq_len`.
    pub fn from_padded(row: &[u32], pad_id: u32) -> Self {
        let n = row.len();
        let input_ids = row[..n.saturating_sub(1)].to_vec();
        let targets = row.get(1..).unwrap_or_default().to_vec();
        let loss_mask = targets
            .iter()
            .map(|&t| if t == pad_id { 0.0 } else { 1.0 })
            .collect();
        Self {
            input_ids,
            targets,
            loss_mask,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Random-access source of [`Sample`]s, shared with the prefetch thread.
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;
    fn sample(&self, idx: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── PretrainDataset ─────────────────────────────────────────────────────────

/// Corpus lines held in memory; encoding happens on access.
pub struct PretrainDataset {
    texts: Vec<String>,
    encoder: Arc<dyn TextEncoder>,
    max_seq_len: usize,
}

impl PretrainDataset {
    /// Read every non-empty line of `path` (file or directory of
    /// `.jsonl`/`.json`/`.txt` files, in sorted order).
    pub fn load(path: &Path, encoder: Arc<dyn TextEncoder>, max_seq_len: usize) -> Result<Self> {
        let mut texts = Vec::new();
        for file in collect_files(path)? {
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("open {}", file.display()))?,
            );
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                texts.push(extract_text(line));
            }
        }
        tracing::debug!(lines = texts.len(), path = %path.display(), "loaded corpus");
        Ok(Self::from_texts(texts, encoder, max_seq_len))
    }

    pub fn from_texts(
        texts: Vec<String>,
        encoder: Arc<dyn TextEncoder>,
        max_seq_len: usize,
    ) -> Self {
        Self {
            texts,
            encoder,
            max_seq_len,
        }
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn pad_id(&self) -> u32 {
        self.encoder.pad_id()
    }

    /// Encoded, truncated and padded row of length `max_seq_len`.
    pub fn padded_ids(&self, idx: usize) -> Result<Vec<u32>> {
        let text = self
            .texts
            .get(idx)
            .with_context(|| format!("sample index {idx} out of range ({})", self.texts.len()))?;
        let mut ids = self.encoder.encode(text)?;
        ids.truncate(self.max_seq_len);
        ids.resize(self.max_seq_len, self.encoder.pad_id());
        Ok(ids)
    }
}

impl SampleSource for PretrainDataset {
    fn len(&self) -> usize {
        self.texts.len()
    }

    fn sample(&self, idx: usize) -> Result<Sample> {
        let row = self.padded_ids(idx)?;
        Ok(Sample::from_padded(&row, self.encoder.pad_id()))
    }
}

// ── Pre-tokenised binary format ─────────────────────────────────────────────

/// Magic bytes for the pre-tokenised padded-row format.
const PRETOKENIZED_MAGIC: &[u8; 4] = b"PTK1";
/// Header: magic (4) + seq_len u32 (4) + pad_id u32 (4) + num_rows u64 (8).
const PRETOKENIZED_HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Encode every sample of `dataset` in parallel and write the padded rows.
///
/// Returns the number of rows written.
pub fn write_pretokenized(dataset: &PretrainDataset, path: &Path) -> Result<usize> {
    let n = dataset.texts.len();
    let pb = ProgressBar::new(n as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| anyhow::anyhow!("progress template: {e}"))?,
    );
    pb.set_message("tokenizing");

    let rows: Vec<Vec<u32>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let row = dataset.padded_ids(i);
            pb.inc(1);
            row
        })
        .collect::<Result<_>>()?;
    pb.finish_with_message("done");

    let mut w = BufWriter::new(File::create(path).context("create pre-tokenised file")?);
    w.write_all(PRETOKENIZED_MAGIC)?;
    w.write_all(&(dataset.max_seq_len as u32).to_le_bytes())?;
    w.write_all(&dataset.pad_id().to_le_bytes())?;
    w.write_all(&(rows.len() as u64).to_le_bytes())?;
    for row in &rows {
        for &id in row {
            w.write_all(&id.to_le_bytes())?;
        }
    }
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all().context("sync pre-tokenised file")?;
    Ok(rows.len())
}

// ── MmapDataset (zero-copy) ─────────────────────────────────────────────────

/// Zero-copy dataset over a file produced by [`write_pretokenized`].
#[derive(Debug)]
pub struct MmapDataset {
    mmap: Mmap,
    seq_len: usize,
    pad_id: u32,
    num_rows: usize,
}

impl MmapDataset {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).context("open pre-tokenised file for mmap")?;
        // SAFETY: the file is opened read-only and not modified while mapped.
        let mmap = unsafe { Mmap::map(&file).context("mmap pre-tokenised file")? };
        if mmap.len() < PRETOKENIZED_HEADER_LEN {
            anyhow::bail!("pre-tokenised file too short");
        }
        if &mmap[0..4] != PRETOKENIZED_MAGIC {
            anyhow::bail!("invalid pre-tokenised file: bad magic");
        }
        let seq_len = read_u32(&mmap, 4) as usize;
        let pad_id = read_u32(&mmap, 8);
        let num_rows = u64::from_le_bytes(
            mmap[12..20]
                .try_into()
                .context("pre-tokenised header row count")?,
        ) as usize;
        let expected_len = num_rows
            .checked_mul(seq_len)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(PRETOKENIZED_HEADER_LEN))
            .with_context(|| {
                format!("pre-tokenised header overflows: {num_rows} rows of {seq_len} tokens")
            })?;
        if mmap.len() < expected_len {
            anyhow::bail!(
                "pre-tokenised file truncated: expected {} bytes, got {}",
                expected_len,
                mmap.len()
            );
        }
        Ok(Self {
            mmap,
            seq_len,
            pad_id,
            num_rows,
        })
    }

    /// Row length (the `max_seq_len` the file was written with).
    pub fn max_seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

impl SampleSource for MmapDataset {
    fn len(&self) -> usize {
        self.num_rows
    }

    fn sample(&self, idx: usize) -> Result<Sample> {
        if idx >= self.num_rows {
            anyhow::bail!("sample index {idx} out of range ({})", self.num_rows);
        }
        let base = PRETOKENIZED_HEADER_LEN + idx * self.seq_len * 4;
        let row: Vec<u32> = (0..self.seq_len)
            .map(|i| read_u32(&self.mmap, base + i * 4))
            .collect();
        Ok(Sample::from_padded(&row, self.pad_id))
    }
}

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Collect text/JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        anyhow::bail!("path is neither file nor directory: {}", path.display());
    }
    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e == "jsonl" || e == "json" || e == "txt")
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

/// JSONL lines contribute their `"text"` field; anything else is used verbatim.
fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text") {
                return match t.as_str() {
                    Some(s) => s.to_string(),
                    None => t.to_string(),
                };
            }
        }
    }
    line.to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Whitespace encoder: assigns ids on first sight; 0 is padding.
    pub(crate) struct ToyEncoder {
        vocab: Mutex<HashMap<String, u32>>,
    }

    impl ToyEncoder {
        pub(crate) fn new() -> Self {
            Self {
                vocab: Mutex::new(HashMap::new()),
            }
        }
    }

    impl TextEncoder for ToyEncoder {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            let mut vocab = self.vocab.lock().unwrap();
            Ok(text
                .split_whitespace()
                .map(|w| {
                    let next = vocab.len() as u32 + 1;
                    *vocab.entry(w.to_string()).or_insert(next)
                })
                .collect())
        }

        fn pad_id(&self) -> u32 {
            0
        }
    }

    #[test]
    fn sample_shift_and_mask() {
        let s = Sample::from_ids(vec![5, 6, 7], 6, 0);
        assert_eq!(s.input_ids, vec![5, 6, 7, 0, 0]);
        assert_eq!(s.targets, vec![6, 7, 0, 0, 0]);
        assert_eq!(s.loss_mask, vec![1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn sample_truncates_long_input() {
        let s = Sample::from_ids((1..=10).collect(), 4, 0);
        assert_eq!(s.input_ids, vec![1, 2, 3]);
        assert_eq!(s.targets, vec![2, 3, 4]);
        assert!(s.loss_mask.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn extract_text_reads_jsonl_field() {
        assert_eq!(extract_text(r#"{"text": "hello world"}"#), "hello world");
        assert_eq!(extract_text("plain line"), "plain line");
        assert_eq!(extract_text(r#"{"other": 1}"#), r#"{"other": 1}"#);
    }

    #[test]
    fn dataset_loads_jsonl_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, "{\"text\": \"a b c\"}\n\n{\"text\": \"d e\"}\n").unwrap();

        let ds = PretrainDataset::load(&path, Arc::new(ToyEncoder::new()), 5).unwrap();
        assert_eq!(ds.len(), 2);
        let s = ds.sample(0).unwrap();
        assert_eq!(s.input_ids, vec![1, 2, 3, 0]);
        assert_eq!(s.loss_mask, vec![1.0, 1.0, 0.0, 0.0]);
        assert!(ds.sample(2).is_err());
    }

    #[test]
    fn pretokenized_file_matches_lazy_samples() {
        let dir = tempfile::tempdir().unwrap();
        let texts = vec!["a b c".to_string(), "d".to_string(), "e f g h i j".to_string()];
        let ds = PretrainDataset::from_texts(texts, Arc::new(ToyEncoder::new()), 4);
        // Warm the toy vocabulary in order so parallel encoding is deterministic.
        for i in 0..ds.len() {
            ds.sample(i).unwrap();
        }

        let path = dir.path().join("train.ptk");
        assert_eq!(write_pretokenized(&ds, &path).unwrap(), 3);

        let mm = MmapDataset::open(&path).unwrap();
        assert_eq!(mm.len(), 3);
        assert_eq!(mm.max_seq_len(), 4);
        for i in 0..3 {
            assert_eq!(mm.sample(i).unwrap(), ds.sample(i).unwrap());
        }
        assert!(mm.sample(3).is_err());
    }

    #[test]
    fn mmap_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ptk");
        std::fs::write(&path, [0u8; 32]).unwrap();
        assert!(MmapDataset::open(&path).is_err());
    }

    #[test]
    fn mmap_rejects_oversized_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.ptk");
        let mut bytes = PRETOKENIZED_MAGIC.to_vec();
        bytes.extend(u32::MAX.to_le_bytes());
        bytes.extend(0u32.to_le_bytes());
        bytes.extend(u64::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        let err = MmapDataset::open(&path).unwrap_err();
        assert!(err.to_string().contains("overflows"), "{err}");
    }
}
