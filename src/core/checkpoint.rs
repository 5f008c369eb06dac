//! Checkpoint file format and the model loader.
//!
//! Layout:
//! - magic `HEBBCK01`, u32 version
//! - chunks: `tag[4] len:u32 payload`
//!   - `SPEC`: JSON-encoded [`ModelSpec`]
//!   - `LAYR`: `uncompressed_len:u32` + LZ4 block of one layer:
//!     `name, count:u32, {tensor name, ndim:u32, dims:u32*, data:f32*}`
//!
//! Unknown chunk tags are skipped so newer writers stay readable.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::error::{HebbError, Result};
use crate::layers::NamedTensor;
use crate::model::{Model, ModelSpec};

pub const MAGIC: &[u8; 8] = b"HEBBCK01";
pub const VERSION_V1: u32 = 1;

const TAG_SPEC: [u8; 4] = *b"SPEC";
const TAG_LAYER: [u8; 4] = *b"LAYR";

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn len_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| invalid("length exceeds u32"))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32_le(w, len_u32(s.len())?)?;
    w.write_all(s.as_bytes())
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives so a
/// corrupt length prefix cannot force a huge allocation.
fn read_bounded<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", buf.len()),
        ));
    }
    Ok(buf)
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let n = read_u32_le(r)? as usize;
    let buf = read_bounded(r, n)?;
    String::from_utf8(buf).map_err(|_| invalid("invalid utf-8 string"))
}

fn write_chunk<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    w.write_all(&tag)?;
    write_u32_le(w, len_u32(payload.len())?)?;
    w.write_all(payload)
}

/// Chunk whose payload is `uncompressed_len:u32` followed by an LZ4 block.
fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = lz4_flex::compress(payload);
    let mut body = Vec::with_capacity(compressed.len() + 4);
    write_u32_le(&mut body, len_u32(payload.len())?)?;
    body.extend_from_slice(&compressed);
    write_chunk(w, tag, &body)
}

/// An LZ4 block expands at most about 255x.
const LZ4_MAX_RATIO: usize = 255;

fn decode_lz4(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut cursor = Cursor::new(body);
    let expected = read_u32_le(&mut cursor)? as usize;
    let block = &body[4..];
    if expected > block.len().saturating_mul(LZ4_MAX_RATIO).saturating_add(16) {
        return Err(invalid("lz4 chunk declares an impossible uncompressed size"));
    }
    lz4_flex::decompress(block, expected).map_err(|_| invalid("lz4 decompression failed"))
}

/// Reads `(tag, payload)`; `Ok(None)` only when the stream ends exactly on a
/// chunk boundary.
fn read_chunk<R: Read>(r: &mut R) -> io::Result<Option<([u8; 4], Vec<u8>)>> {
    let mut tag = [0u8; 4];
    loop {
        match r.read(&mut tag[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    r.read_exact(&mut tag[1..])
        .map_err(|_| invalid("truncated chunk tag"))?;
    let len = read_u32_le(r).map_err(|_| invalid("truncated chunk length"))? as usize;
    let payload = read_bounded(r, len).map_err(|e| invalid(&format!("truncated chunk payload: {e}")))?;
    Ok(Some((tag, payload)))
}

fn encode_layer(name: &str, tensors: &[NamedTensor]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_string(&mut out, name)?;
    write_u32_le(&mut out, len_u32(tensors.len())?)?;
    for t in tensors {
        let expected: usize = t.shape.iter().product();
        if expected != t.data.len() {
            return Err(invalid("tensor data does not match its shape"));
        }
        write_string(&mut out, &t.name)?;
        write_u32_le(&mut out, len_u32(t.shape.len())?)?;
        for &d in &t.shape {
            write_u32_le(&mut out, len_u32(d)?)?;
        }
        for &v in &t.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

fn decode_layer(bytes: &[u8]) -> io::Result<(String, Vec<NamedTensor>)> {
    let mut r = Cursor::new(bytes);
    let name = read_string(&mut r)?;
    let count = read_u32_le(&mut r)? as usize;
    let mut tensors = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let tname = read_string(&mut r)?;
        let ndim = read_u32_le(&mut r)? as usize;
        let mut shape = Vec::with_capacity(ndim.min(8));
        for _ in 0..ndim {
            shape.push(read_u32_le(&mut r)? as usize);
        }
        let remaining = bytes.len().saturating_sub(r.position() as usize);
        let byte_len = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .and_then(|numel| numel.checked_mul(4))
            .filter(|&n| n <= remaining)
            .ok_or_else(|| invalid(&format!("tensor '{tname}' shape {shape:?} exceeds its chunk")))?;
        let mut raw = vec![0u8; byte_len];
        r.read_exact(&mut raw)?;
        let data = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        tensors.push(NamedTensor {
            name: tname,
            shape,
            data,
        });
    }
    Ok((name, tensors))
}

/// Persisted mapping from layer name to its tensors.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub spec: Option<ModelSpec>,
    pub layers: HashMap<String, Vec<NamedTensor>>,
    /// Layer names in file order.
    order: Vec<String>,
}

impl Checkpoint {
    /// Snapshot of every layer's parameters and buffers.
    pub fn from_model(model: &Model) -> Self {
        let mut ck = Checkpoint {
            spec: model.spec().cloned(),
            ..Default::default()
        };
        for l in model.layers() {
            let state = l.layer.state();
            if !state.is_empty() {
                ck.insert(&l.name, state);
            }
        }
        ck
    }

    pub fn insert(&mut self, layer: &str, tensors: Vec<NamedTensor>) {
        if self.layers.insert(layer.to_string(), tensors).is_none() {
            self.order.push(layer.to_string());
        }
    }

    pub fn layer(&self, name: &str) -> Option<&[NamedTensor]> {
        self.layers.get(name).map(|v| v.as_slice())
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// The spec to build before restoring. An explicit spec wins over the
    /// stored one, and a mismatch between the two is logged.
    pub fn resolve_spec(&self, explicit: Option<&ModelSpec>) -> Result<ModelSpec> {
        match (explicit, &self.spec) {
            (Some(given), Some(stored)) => {
                if given != stored {
                    warn!(?given, ?stored, "model spec differs from the one stored in the checkpoint, using the given spec");
                }
                Ok(given.clone())
            }
            (Some(given), None) => Ok(given.clone()),
            (None, Some(stored)) => Ok(stored.clone()),
            (None, None) => Err(HebbError::config(
                "checkpoint carries no model spec and none was given",
            )),
        }
    }

    pub fn save_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        write_u32_le(w, VERSION_V1)?;
        if let Some(spec) = &self.spec {
            write_chunk(w, TAG_SPEC, &serde_json::to_vec(spec)?)?;
        }
        for name in &self.order {
            let payload = encode_layer(name, &self.layers[name])?;
            write_chunk_lz4(w, TAG_LAYER, &payload)?;
        }
        Ok(())
    }

    pub fn load_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HebbError::Checkpoint("bad checkpoint magic".into()));
        }
        let version = read_u32_le(r)?;
        if version != VERSION_V1 {
            return Err(HebbError::Checkpoint(format!(
                "unsupported checkpoint version {version}"
            )));
        }

        let corrupt = |e: io::Error| HebbError::Checkpoint(format!("corrupt checkpoint: {e}"));
        let mut ck = Checkpoint::default();
        while let Some((tag, payload)) = read_chunk(r).map_err(corrupt)? {
            match &tag {
                b"SPEC" => ck.spec = Some(serde_json::from_slice(&payload)?),
                b"LAYR" => {
                    let body = decode_lz4(&payload).map_err(corrupt)?;
                    let (name, tensors) = decode_layer(&body).map_err(corrupt)?;
                    ck.insert(&name, tensors);
                }
                other => debug!(tag = ?String::from_utf8_lossy(other), "skipping unknown chunk"),
            }
        }
        Ok(ck)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut w = BufWriter::new(File::create(path)?);
        self.save_to(&mut w)?;
        w.flush()?;
        info!(path = %path.display(), layers = self.order.len(), "wrote checkpoint");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            HebbError::Checkpoint(format!("cannot open {}: {e}", path.display()))
        })?;
        Self::load_from(&mut BufReader::new(file))
    }
}

/// Which checkpoint layer goes into which model layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMapping {
    pub source: String,
    pub target: String,
}

impl LayerMapping {
    pub fn same(name: &str) -> Self {
        Self {
            source: name.to_string(),
            target: name.to_string(),
        }
    }
}

impl FromStr for LayerMapping {
    type Err = HebbError;

    /// `name` or `source=target`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (source, target) = match s.split_once('=') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s, s),
        };
        if source.is_empty() || target.is_empty() {
            return Err(HebbError::config(format!("bad layer mapping '{s}'")));
        }
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
        })
    }
}

/// Copies the mapped layers' tensors from `ck` into `model`.
///
/// Every mapping is validated before anything is written, so a failed load
/// leaves the model untouched.
pub fn load_weights(model: &mut Model, ck: &Checkpoint, mappings: &[LayerMapping]) -> Result<()> {
    for m in mappings {
        let tensors = ck.layer(&m.source).ok_or_else(|| {
            HebbError::config(format!("checkpoint has no layer named '{}'", m.source))
        })?;
        let current = model.layer_state(&m.target)?;
        for t in tensors {
            let slot = current.iter().find(|c| c.name == t.name).ok_or_else(|| {
                HebbError::config(format!("layer '{}' has no tensor named '{}'", m.target, t.name))
            })?;
            if slot.shape != t.shape {
                return Err(HebbError::shape(format!(
                    "{}.{}: checkpoint shape {:?} does not match model shape {:?}",
                    m.target, t.name, t.shape, slot.shape
                )));
            }
        }
    }

    for m in mappings {
        let tensors = ck.layer(&m.source).unwrap_or_default();
        for t in tensors {
            model.load_layer_tensor(&m.target, t)?;
        }
        debug!(source = %m.source, target = %m.target, tensors = tensors.len(), "loaded layer");
    }
    Ok(())
}

/// Builds the model (from `spec`, or the spec stored in the checkpoint) and
/// restores the mapped layers.
pub fn load_model(path: &Path, spec: Option<&ModelSpec>, mappings: &[LayerMapping]) -> Result<Model> {
    let ck = Checkpoint::load(path)?;
    let spec = ck.resolve_spec(spec)?;
    let mut model = Model::from_spec(&spec)?;
    load_weights(&mut model, &ck, mappings)?;
    info!(
        path = %path.display(),
        layers = ?mappings.iter().map(|m| m.target.as_str()).collect::<Vec<_>>(),
        "restored weights"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec::fc1(&[5, 4], 1.5, true).with_classes(3).with_seed(17)
    }

    fn roundtrip(ck: &Checkpoint) -> Checkpoint {
        let mut bytes = Vec::new();
        ck.save_to(&mut bytes).unwrap();
        Checkpoint::load_from(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn checkpoint_preserves_all_layers() {
        let model = Model::from_spec(&spec()).unwrap();
        let ck = Checkpoint::from_model(&model);
        let back = roundtrip(&ck);

        assert_eq!(back.spec, Some(spec()));
        assert_eq!(
            back.layer_names().collect::<Vec<_>>(),
            vec!["linear1", "batch_norm", "linear2"]
        );
        assert_eq!(back.layer("linear1"), ck.layer("linear1"));
        let bn = back.layer("batch_norm").unwrap();
        assert!(bn.iter().any(|t| t.name == "running_var"));
    }

    #[test]
    fn rejects_bad_magic() {
        let err = Checkpoint::load_from(&mut Cursor::new(b"NOTACKPT\x01\0\0\0".to_vec())).unwrap_err();
        assert!(matches!(err, HebbError::Checkpoint(_)));
    }

    #[test]
    fn skips_unknown_chunks() {
        let model = Model::from_spec(&spec()).unwrap();
        let mut bytes = Vec::new();
        Checkpoint::from_model(&model).save_to(&mut bytes).unwrap();
        write_chunk(&mut bytes, *b"XTRA", b"whatever").unwrap();
        let back = Checkpoint::load_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(back.layers.len(), 3);
    }

    fn valid_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        Checkpoint::from_model(&Model::from_spec(&spec()).unwrap())
            .save_to(&mut bytes)
            .unwrap();
        bytes
    }

    #[test]
    fn partial_trailing_tag_is_rejected() {
        for tail in [&b"L"[..], b"LA", b"LAY"] {
            let mut bytes = valid_bytes();
            bytes.extend_from_slice(tail);
            let err = Checkpoint::load_from(&mut Cursor::new(bytes)).unwrap_err();
            assert!(matches!(err, HebbError::Checkpoint(_)), "{tail:?}: {err}");
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = valid_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Checkpoint::load_from(&mut Cursor::new(bytes)),
            Err(HebbError::Checkpoint(_))
        ));

        // Declared length far beyond the data that follows.
        let mut bytes = valid_bytes();
        bytes.extend_from_slice(b"XTRA");
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        assert!(matches!(
            Checkpoint::load_from(&mut Cursor::new(bytes)),
            Err(HebbError::Checkpoint(_))
        ));
    }

    #[test]
    fn oversized_tensor_dims_are_rejected() {
        let mut layer = Vec::new();
        write_string(&mut layer, "linear1").unwrap();
        write_u32_le(&mut layer, 1).unwrap();
        write_string(&mut layer, "weight").unwrap();
        write_u32_le(&mut layer, 3).unwrap();
        for _ in 0..3 {
            write_u32_le(&mut layer, u32::MAX).unwrap();
        }
        layer.extend_from_slice(&[0u8; 16]);

        let mut bytes = valid_bytes();
        write_chunk_lz4(&mut bytes, TAG_LAYER, &layer).unwrap();
        let err = Checkpoint::load_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, HebbError::Checkpoint(_)), "{err}");
    }

    #[test]
    fn impossible_lz4_size_is_rejected() {
        let mut body = Vec::new();
        write_u32_le(&mut body, u32::MAX).unwrap();
        body.extend_from_slice(&[0u8; 4]);
        let mut bytes = valid_bytes();
        write_chunk(&mut bytes, TAG_LAYER, &body).unwrap();
        assert!(matches!(
            Checkpoint::load_from(&mut Cursor::new(bytes)),
            Err(HebbError::Checkpoint(_))
        ));
    }

    #[test]
    fn load_weights_copies_named_layers_only() {
        let trained = Model::from_spec(&spec().with_seed(1)).unwrap();
        let ck = Checkpoint::from_model(&trained);
        let mut fresh = Model::from_spec(&spec().with_seed(2)).unwrap();

        load_weights(&mut fresh, &ck, &[LayerMapping::same("linear1")]).unwrap();

        assert_eq!(
            fresh.linear("linear1").unwrap().weight_matrix().unwrap(),
            trained.linear("linear1").unwrap().weight_matrix().unwrap()
        );
        assert_ne!(
            fresh.linear("linear2").unwrap().weight_matrix().unwrap(),
            trained.linear("linear2").unwrap().weight_matrix().unwrap()
        );
    }

    #[test]
    fn load_weights_supports_renamed_source() {
        let trained = Model::from_spec(&spec().with_seed(3)).unwrap();
        let mut ck = Checkpoint::default();
        ck.insert("1", trained.layer_state("linear1").unwrap());

        let mut fresh = Model::from_spec(&spec().with_seed(4)).unwrap();
        let mapping: LayerMapping = "1=linear1".parse().unwrap();
        load_weights(&mut fresh, &ck, &[mapping]).unwrap();
        assert_eq!(
            fresh.layer_state("linear1").unwrap(),
            trained.layer_state("linear1").unwrap()
        );
    }

    #[test]
    fn missing_layer_is_a_config_error() {
        let model = Model::from_spec(&spec()).unwrap();
        let ck = Checkpoint::from_model(&model);
        let mut fresh = Model::from_spec(&spec()).unwrap();

        let absent_in_ck = load_weights(&mut fresh, &ck, &[LayerMapping::same("linear9")]);
        assert!(matches!(absent_in_ck, Err(HebbError::Config(_))));

        let absent_in_model = load_weights(&mut fresh, &ck, &["linear1=conv1".parse().unwrap()]);
        assert!(matches!(absent_in_model, Err(HebbError::Config(_))));
    }

    #[test]
    fn shape_mismatch_leaves_model_untouched() {
        let wide = Model::from_spec(&ModelSpec::fc1(&[5, 8], 1.5, true).with_classes(3)).unwrap();
        let ck = Checkpoint::from_model(&wide);
        let mut model = Model::from_spec(&spec()).unwrap();
        let before = model.layer_state("linear1").unwrap();

        let err = load_weights(
            &mut model,
            &ck,
            &[LayerMapping::same("batch_norm"), LayerMapping::same("linear1")],
        )
        .unwrap_err();
        assert!(matches!(err, HebbError::Shape(_)));
        assert_eq!(model.layer_state("linear1").unwrap(), before);
    }

    #[test]
    fn explicit_spec_wins_over_stored() {
        let stored = spec();
        let ck = Checkpoint::from_model(&Model::from_spec(&stored).unwrap());
        assert_eq!(ck.resolve_spec(None).unwrap(), stored);

        let given = spec().with_seed(99);
        assert_eq!(ck.resolve_spec(Some(&given)).unwrap(), given);

        let bare = Checkpoint::default();
        assert_eq!(bare.resolve_spec(Some(&given)).unwrap(), given);
        assert!(matches!(bare.resolve_spec(None), Err(HebbError::Config(_))));
    }

    #[test]
    fn mapping_parse() {
        assert_eq!("linear1".parse::<LayerMapping>().unwrap(), LayerMapping::same("linear1"));
        let m: LayerMapping = " 1 = linear1 ".parse().unwrap();
        assert_eq!((m.source.as_str(), m.target.as_str()), ("1", "linear1"));
        assert!("=linear1".parse::<LayerMapping>().is_err());
    }
}
