//! Artifact persistence: one dataset file and one model file per stimulus,
//! named by a content hash of `(stimulus identity, sensor name)`.
//!
//! File layout (both kinds):
//! - magic: [u8;8]
//! - version: u32
//! - chunks: tag [u8;4], len u32, uncompressed_len u32, LZ4 payload
//!
//! Floats are stored as little-endian bit patterns, so reloading a saved
//! artifact reproduces it bit for bit.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::dataset::{Sample, StimulusDataset};
use crate::error::StoreError;
use crate::model::{Decorrelation, Regressor, ResponseModel, UncertaintySnapshot};
use crate::state::validate_unit;

pub const DATASET_MAGIC: &[u8; 8] = b"NFDSET01";
pub const MODEL_MAGIC: &[u8; 8] = b"NFMODL01";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

const TAG_HEADER: [u8; 4] = *b"HEAD";
const TAG_SAMPLES: [u8; 4] = *b"SMPL";
const TAG_WEIGHTS: [u8; 4] = *b"WGHT";
const TAG_DECORRELATION: [u8; 4] = *b"DCOR";
const TAG_UNCERTAINTY: [u8; 4] = *b"UNCT";

/// LZ4 cannot expand a block by more than this factor.
const MAX_LZ4_RATIO: usize = 255;
/// Upper bound on up-front allocation for a length read from a file.
const MAX_PREALLOC: usize = 1 << 16;

pub const DATASET_EXT: &str = "nfd";
pub const MODEL_EXT: &str = "nfm";

// ─────────────────────────────────────────────────────────────────────────
// Primitive codec
// ─────────────────────────────────────────────────────────────────────────

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    if expected_size > input.len().saturating_mul(MAX_LZ4_RATIO) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "lz4 chunk claims an impossible uncompressed size",
        ));
    }
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32s<W: Write>(w: &mut W, vs: &[f32]) -> io::Result<()> {
    for v in vs {
        write_f32_le(w, *v)?;
    }
    Ok(())
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32_le(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_f32s<R: Read>(r: &mut R, n: usize) -> io::Result<Vec<f32>> {
    let mut out = Vec::with_capacity(n.min(MAX_PREALLOC));
    for _ in 0..n {
        out.push(read_f32_le(r)?);
    }
    Ok(out)
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let n = read_u32_le(r)? as usize;
    let mut buf = Vec::new();
    r.take(n as u64).read_to_end(&mut buf)?;
    if buf.len() != n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated string"));
    }
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 string"))
}

/// Write a chunk whose payload is LZ4-compressed and preceded by the
/// uncompressed length.
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );
    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, payload.len() as u32)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read all chunks until EOF, decompressing each payload.
fn read_chunks<R: Read>(r: &mut R) -> io::Result<Vec<([u8; 4], Vec<u8>)>> {
    let mut chunks = Vec::new();
    loop {
        let (tag, len) = match read_chunk_header(r) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let mut take = r.take(len as u64);
        let uncompressed_len = read_u32_le(&mut take)? as usize;
        let mut compressed = Vec::new();
        take.read_to_end(&mut compressed)?;
        chunks.push((tag, decompress_lz4(&compressed, uncompressed_len)?));
    }
    Ok(chunks)
}

fn check_preamble<R: Read>(r: &mut R, magic: &[u8; 8], what: &str) -> Result<(), StoreError> {
    let got = read_exact::<8, _>(r)?;
    if &got != magic {
        return Err(StoreError::BadMagic(what.to_string()));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(StoreError::UnsupportedVersion(version));
    }
    Ok(())
}

fn find_chunk<'a>(chunks: &'a [([u8; 4], Vec<u8>)], tag: [u8; 4]) -> Option<&'a [u8]> {
    chunks
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, p)| p.as_slice())
}

// ─────────────────────────────────────────────────────────────────────────
// Dataset / model encoding
// ─────────────────────────────────────────────────────────────────────────

pub fn write_dataset<W: Write>(w: &mut W, data: &StimulusDataset) -> io::Result<()> {
    w.write_all(DATASET_MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)?;

    let mut head = Vec::new();
    write_string(&mut head, &data.identity)?;
    write_string(&mut head, &data.sensor)?;
    write_u32_le(&mut head, data.input_dim as u32)?;
    write_u32_le(&mut head, data.output_dim as u32)?;
    write_u32_le(&mut head, data.samples.len() as u32)?;
    write_chunk_lz4(w, TAG_HEADER, &head)?;

    let mut body = Vec::with_capacity(data.samples.len() * (data.input_dim + data.output_dim) * 4);
    for s in &data.samples {
        write_f32s(&mut body, &s.input)?;
        write_f32s(&mut body, &s.delta)?;
    }
    write_chunk_lz4(w, TAG_SAMPLES, &body)
}

pub fn read_dataset<R: Read>(r: &mut R) -> Result<StimulusDataset, StoreError> {
    check_preamble(r, DATASET_MAGIC, "dataset")?;
    let chunks = read_chunks(r)?;

    let mut head = find_chunk(&chunks, TAG_HEADER)
        .ok_or_else(|| StoreError::Corrupt("missing dataset header".to_string()))?;
    let identity = read_string(&mut head)?;
    let sensor = read_string(&mut head)?;
    let input_dim = read_u32_le(&mut head)? as usize;
    let output_dim = read_u32_le(&mut head)? as usize;
    let count = read_u32_le(&mut head)? as usize;

    let mut samples = Vec::new();
    if count > 0 {
        let mut body = find_chunk(&chunks, TAG_SAMPLES)
            .ok_or_else(|| StoreError::Corrupt("missing sample chunk".to_string()))?;
        let expected = input_dim
            .checked_add(output_dim)
            .and_then(|w| w.checked_mul(count))
            .and_then(|n| n.checked_mul(4));
        if expected != Some(body.len()) {
            return Err(StoreError::Corrupt("sample chunk length mismatch".to_string()));
        }
        samples.reserve_exact(count);
        for i in 0..count {
            let input = read_f32s(&mut body, input_dim)?;
            let delta = read_f32s(&mut body, output_dim)?;
            validate_unit(&input, "input")
                .map_err(|e| StoreError::Corrupt(format!("{identity} sample {i}: {e}")))?;
            if delta.iter().any(|d| !d.is_finite()) {
                return Err(StoreError::Corrupt(format!("{identity} sample {i}: delta is not finite")));
            }
            samples.push(Sample { input, delta });
        }
    }

    Ok(StimulusDataset {
        identity,
        sensor,
        input_dim,
        output_dim,
        samples,
    })
}

pub fn write_model<W: Write>(w: &mut W, model: &ResponseModel) -> io::Result<()> {
    w.write_all(MODEL_MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)?;
    let reg = &model.regressor;

    let mut head = Vec::new();
    write_string(&mut head, &model.identity)?;
    write_string(&mut head, &model.sensor)?;
    write_u32_le(&mut head, reg.input_dim as u32)?;
    write_u32_le(&mut head, reg.output_dim as u32)?;
    write_u32_le(&mut head, model.trained_samples)?;
    write_f32_le(&mut head, model.loss)?;
    write_chunk_lz4(w, TAG_HEADER, &head)?;

    let mut weights = Vec::with_capacity(4 + reg.params.len() * 4);
    write_u32_le(&mut weights, reg.params.len() as u32)?;
    write_f32s(&mut weights, &reg.params)?;
    write_chunk_lz4(w, TAG_WEIGHTS, &weights)?;

    if let Some(d) = &reg.decorrelation {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, d.offset as u32)?;
        write_u32_le(&mut buf, d.mean.len() as u32)?;
        write_f32s(&mut buf, &d.mean)?;
        write_f32s(&mut buf, &d.whitening)?;
        write_chunk_lz4(w, TAG_DECORRELATION, &buf)?;
    }

    if let Some(u) = &model.uncertainty {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, u.samples.len() as u32)?;
        write_u32_le(&mut buf, reg.params.len() as u32)?;
        for s in &u.samples {
            write_f32s(&mut buf, s)?;
        }
        write_u32_le(&mut buf, u.noise_var.len() as u32)?;
        write_f32s(&mut buf, &u.noise_var)?;
        write_chunk_lz4(w, TAG_UNCERTAINTY, &buf)?;
    }
    Ok(())
}

pub fn read_model<R: Read>(r: &mut R) -> Result<ResponseModel, StoreError> {
    check_preamble(r, MODEL_MAGIC, "model")?;
    let chunks = read_chunks(r)?;

    let mut head = find_chunk(&chunks, TAG_HEADER)
        .ok_or_else(|| StoreError::Corrupt("missing model header".to_string()))?;
    let identity = read_string(&mut head)?;
    let sensor = read_string(&mut head)?;
    let input_dim = read_u32_le(&mut head)? as usize;
    let output_dim = read_u32_le(&mut head)? as usize;
    let trained_samples = read_u32_le(&mut head)?;
    let loss = read_f32_le(&mut head)?;

    let mut weights = find_chunk(&chunks, TAG_WEIGHTS)
        .ok_or_else(|| StoreError::Corrupt("missing weights".to_string()))?;
    let n = read_u32_le(&mut weights)? as usize;
    if n != Regressor::param_count(input_dim, output_dim) {
        return Err(StoreError::Corrupt("weight count mismatch".to_string()));
    }
    let params = read_f32s(&mut weights, n)?;

    let decorrelation = match find_chunk(&chunks, TAG_DECORRELATION) {
        Some(mut buf) => {
            let offset = read_u32_le(&mut buf)? as usize;
            let dim = read_u32_le(&mut buf)? as usize;
            let mean = read_f32s(&mut buf, dim)?;
            let whitening = read_f32s(&mut buf, dim.saturating_mul(dim))?;
            Some(Decorrelation {
                offset,
                mean,
                whitening,
            })
        }
        None => None,
    };

    let uncertainty = match find_chunk(&chunks, TAG_UNCERTAINTY) {
        Some(mut buf) => {
            let count = read_u32_le(&mut buf)? as usize;
            let len = read_u32_le(&mut buf)? as usize;
            let body = count.checked_mul(len).and_then(|n| n.checked_mul(4));
            if len != n || body.map_or(true, |b| b > buf.len()) {
                return Err(StoreError::Corrupt("uncertainty chunk length mismatch".to_string()));
            }
            let mut samples = Vec::with_capacity(count);
            for _ in 0..count {
                samples.push(read_f32s(&mut buf, len)?);
            }
            let nv = read_u32_le(&mut buf)? as usize;
            let noise_var = read_f32s(&mut buf, nv)?;
            Some(UncertaintySnapshot { samples, noise_var })
        }
        None => None,
    };

    Ok(ResponseModel {
        identity,
        sensor,
        regressor: Regressor {
            input_dim,
            output_dim,
            params,
            decorrelation,
        },
        uncertainty,
        trained_samples,
        loss,
    })
}

// ─────────────────────────────────────────────────────────────────────────
// Keys and stores
// ─────────────────────────────────────────────────────────────────────────

/// Stable address of an artifact: blake3 of `(identity, sensor)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub identity: String,
    pub sensor: String,
    hash: String,
}

impl ArtifactKey {
    pub fn new(identity: &str, sensor: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        // Length prefixes keep ("ab","c") and ("a","bc") apart.
        hasher.update(&(identity.len() as u32).to_le_bytes());
        hasher.update(identity.as_bytes());
        hasher.update(&(sensor.len() as u32).to_le_bytes());
        hasher.update(sensor.as_bytes());
        Self {
            identity: identity.to_string(),
            sensor: sensor.to_string(),
            hash: hasher.finalize().to_hex().to_string(),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Dataset/model persistence backend.
pub trait ArtifactStore: Send {
    fn load_dataset(&self, key: &ArtifactKey) -> Result<Option<StimulusDataset>, StoreError>;
    fn save_dataset(&mut self, key: &ArtifactKey, data: &StimulusDataset) -> Result<(), StoreError>;
    fn load_model(&self, key: &ArtifactKey) -> Result<Option<ResponseModel>, StoreError>;
    fn save_model(&mut self, key: &ArtifactKey, model: &ResponseModel) -> Result<(), StoreError>;

    /// Point model reads/writes at a command-supplied directory.
    fn set_model_dir(&mut self, _dir: Option<&Path>) {}
}

/// Files on disk: `<datasets>/<hash>.nfd` and `<models>/<hash>.nfm`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dataset_dir: PathBuf,
    default_model_dir: PathBuf,
    model_dir: PathBuf,
}

impl FileStore {
    pub fn new(dataset_dir: PathBuf, model_dir: PathBuf) -> Self {
        Self {
            dataset_dir,
            default_model_dir: model_dir.clone(),
            model_dir,
        }
    }

    pub fn dataset_path(&self, key: &ArtifactKey) -> PathBuf {
        self.dataset_dir.join(format!("{}.{DATASET_EXT}", key.hash()))
    }

    pub fn model_path(&self, key: &ArtifactKey) -> PathBuf {
        self.model_dir.join(format!("{}.{MODEL_EXT}", key.hash()))
    }

    /// Write next to the target and rename, so readers never see a partial file.
    fn write_atomic<F>(path: &Path, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            write(&mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ArtifactStore for FileStore {
    fn load_dataset(&self, key: &ArtifactKey) -> Result<Option<StimulusDataset>, StoreError> {
        let path = self.dataset_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = io::BufReader::new(File::open(&path)?);
        read_dataset(&mut file).map(Some)
    }

    fn save_dataset(&mut self, key: &ArtifactKey, data: &StimulusDataset) -> Result<(), StoreError> {
        Self::write_atomic(&self.dataset_path(key), |f| {
            let mut w = io::BufWriter::new(f);
            write_dataset(&mut w, data)?;
            w.flush()
        })
    }

    fn load_model(&self, key: &ArtifactKey) -> Result<Option<ResponseModel>, StoreError> {
        let path = self.model_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = io::BufReader::new(File::open(&path)?);
        read_model(&mut file).map(Some)
    }

    fn save_model(&mut self, key: &ArtifactKey, model: &ResponseModel) -> Result<(), StoreError> {
        Self::write_atomic(&self.model_path(key), |f| {
            let mut w = io::BufWriter::new(f);
            write_model(&mut w, model)?;
            w.flush()
        })
    }

    fn set_model_dir(&mut self, dir: Option<&Path>) {
        self.model_dir = match dir {
            Some(d) => d.to_path_buf(),
            None => self.default_model_dir.clone(),
        };
    }
}

/// In-RAM store holding encoded artifacts (headless runs and tests).
#[derive(Debug, Default)]
pub struct MemoryStore {
    datasets: HashMap<String, Vec<u8>>,
    models: HashMap<String, Vec<u8>>,
    /// Make every save fail, to exercise persistence-failure paths.
    pub fail_saves: bool,
    pub saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    fn refuse(&self) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "store configured to fail",
            )));
        }
        Ok(())
    }
}

impl ArtifactStore for MemoryStore {
    fn load_dataset(&self, key: &ArtifactKey) -> Result<Option<StimulusDataset>, StoreError> {
        match self.datasets.get(key.hash()) {
            Some(bytes) => read_dataset(&mut bytes.as_slice()).map(Some),
            None => Ok(None),
        }
    }

    fn save_dataset(&mut self, key: &ArtifactKey, data: &StimulusDataset) -> Result<(), StoreError> {
        self.refuse()?;
        let mut buf = Vec::new();
        write_dataset(&mut buf, data)?;
        self.datasets.insert(key.hash().to_string(), buf);
        self.saves += 1;
        Ok(())
    }

    fn load_model(&self, key: &ArtifactKey) -> Result<Option<ResponseModel>, StoreError> {
        match self.models.get(key.hash()) {
            Some(bytes) => read_model(&mut bytes.as_slice()).map(Some),
            None => Ok(None),
        }
    }

    fn save_model(&mut self, key: &ArtifactKey, model: &ResponseModel) -> Result<(), StoreError> {
        self.refuse()?;
        let mut buf = Vec::new();
        write_model(&mut buf, model)?;
        self.models.insert(key.hash().to_string(), buf);
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model(with_extras: bool) -> ResponseModel {
        let mut reg = Regressor::zeros(2, 2);
        reg.params = vec![0.1, -0.25, 1.0e-7, 3.5, f32::MIN_POSITIVE, -0.0];
        if with_extras {
            reg.decorrelation = Some(Decorrelation {
                offset: 0,
                mean: vec![0.4, 0.6],
                whitening: vec![2.0, 0.0, -0.5, 3.0],
            });
        }
        ResponseModel {
            identity: "keyword:calm".to_string(),
            sensor: "muse".to_string(),
            regressor: reg,
            uncertainty: with_extras.then(|| UncertaintySnapshot {
                samples: vec![vec![0.11, -0.2, 0.0, 3.4, 0.0, 0.01]; 3],
                noise_var: vec![0.01, 0.02],
            }),
            trained_samples: 42,
            loss: 0.003,
        }
    }

    fn bits(v: &[f32]) -> Vec<u32> {
        v.iter().map(|x| x.to_bits()).collect()
    }

    #[test]
    fn model_round_trip_is_bit_exact() {
        for extras in [false, true] {
            let model = sample_model(extras);
            let mut buf = Vec::new();
            write_model(&mut buf, &model).unwrap();
            let back = read_model(&mut buf.as_slice()).unwrap();
            assert_eq!(bits(&back.regressor.params), bits(&model.regressor.params));
            assert_eq!(back, model);
        }
    }

    #[test]
    fn dataset_round_trip() {
        let mut data = StimulusDataset::new("picture:a.png".to_string(), "muse".to_string(), 2, 2);
        data.samples.push(Sample {
            input: vec![0.1, 0.9],
            delta: vec![-0.05, 0.3],
        });
        let mut buf = Vec::new();
        write_dataset(&mut buf, &data).unwrap();
        assert_eq!(read_dataset(&mut buf.as_slice()).unwrap(), data);
    }

    fn dataset_bytes(head: &[u8], body: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(DATASET_MAGIC);
        write_u32_le(&mut buf, VERSION_CURRENT).unwrap();
        write_chunk_lz4(&mut buf, TAG_HEADER, head).unwrap();
        if let Some(body) = body {
            write_chunk_lz4(&mut buf, TAG_SAMPLES, body).unwrap();
        }
        buf
    }

    #[test]
    fn oversized_lengths_fail_without_allocating() {
        // Identity length of 4 GiB with nothing behind it.
        let mut head = Vec::new();
        write_u32_le(&mut head, u32::MAX).unwrap();
        let buf = dataset_bytes(&head, None);
        assert!(matches!(read_dataset(&mut buf.as_slice()), Err(StoreError::Io(_))));

        // Chunk whose declared uncompressed size no LZ4 block can reach.
        let compressed = compress_lz4(b"tiny");
        let mut buf = Vec::new();
        buf.extend_from_slice(DATASET_MAGIC);
        write_u32_le(&mut buf, VERSION_CURRENT).unwrap();
        buf.extend_from_slice(&TAG_HEADER);
        write_u32_le(&mut buf, 4 + compressed.len() as u32).unwrap();
        write_u32_le(&mut buf, u32::MAX).unwrap();
        buf.extend_from_slice(&compressed);
        assert!(matches!(read_dataset(&mut buf.as_slice()), Err(StoreError::Io(_))));

        // Sample count whose byte size overflows.
        let mut head = Vec::new();
        write_string(&mut head, "keyword:calm").unwrap();
        write_string(&mut head, "muse").unwrap();
        for v in [u32::MAX, u32::MAX, u32::MAX] {
            write_u32_le(&mut head, v).unwrap();
        }
        let buf = dataset_bytes(&head, Some(&[0u8; 8]));
        assert!(matches!(read_dataset(&mut buf.as_slice()), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn loaded_samples_are_range_checked() {
        let mut data = StimulusDataset::new("keyword:calm".to_string(), "muse".to_string(), 1, 1);
        data.samples.push(Sample {
            input: vec![0.4],
            delta: vec![0.1],
        });
        data.samples.push(Sample {
            input: vec![1.5],
            delta: vec![0.1],
        });
        let mut buf = Vec::new();
        write_dataset(&mut buf, &data).unwrap();
        match read_dataset(&mut buf.as_slice()) {
            Err(StoreError::Corrupt(msg)) => assert!(msg.contains("sample 1"), "{msg}"),
            other => panic!("expected corrupt dataset, got {other:?}"),
        }

        data.samples.pop();
        data.samples[0].delta[0] = f32::NAN;
        let mut buf = Vec::new();
        write_dataset(&mut buf, &data).unwrap();
        assert!(matches!(read_dataset(&mut buf.as_slice()), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn rejects_wrong_magic() {
        let model = sample_model(false);
        let mut buf = Vec::new();
        write_model(&mut buf, &model).unwrap();
        assert!(matches!(
            read_dataset(&mut buf.as_slice()),
            Err(StoreError::BadMagic(_))
        ));
    }

    #[test]
    fn key_hash_is_stable_and_distinct() {
        let a = ArtifactKey::new("keyword:calm", "muse");
        let b = ArtifactKey::new("keyword:calm", "muse");
        let c = ArtifactKey::new("keyword:calm", "polar");
        let d = ArtifactKey::new("keyword:cal", "mmuse");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_ne!(a.hash(), d.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn file_store_round_trip_and_model_dir_switch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("datasets"), dir.path().join("models"));
        let key = ArtifactKey::new("keyword:calm", "muse");
        let model = sample_model(true);

        assert!(store.load_model(&key).unwrap().is_none());
        store.save_model(&key, &model).unwrap();
        assert_eq!(store.load_model(&key).unwrap(), Some(model.clone()));

        let other = dir.path().join("other_models");
        store.set_model_dir(Some(&other));
        assert!(store.load_model(&key).unwrap().is_none());
        store.set_model_dir(None);
        assert!(store.load_model(&key).unwrap().is_some());
    }

    #[test]
    fn memory_store_can_fail_saves() {
        let mut store = MemoryStore::new();
        store.fail_saves = true;
        let key = ArtifactKey::new("keyword:calm", "muse");
        assert!(store.save_model(&key, &sample_model(false)).is_err());
        assert_eq!(store.model_count(), 0);
    }
}
