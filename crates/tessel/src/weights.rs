// Weights - save and load layer parameters
//
// Binary parameter format (.tswt):
//
//   Header:
//     magic:   [u8; 4]  = b"TSWT"
//     version: u32 LE   = 1
//     layers:  u32 LE   = number of layer records
//
//   For each layer:
//     name_len: u32 LE
//     name:     [u8; name_len]  (UTF-8 layer name)
//     blobs:    u32 LE          (parameter blobs, in the layer's order)
//
//   For each blob:
//     shape_kind: u8            (0 = N-D dims, 1 = legacy num/channels/height/width)
//     dims:       ndim u32 LE + [u64 LE; ndim]   (kind 0)
//                 [u64 LE; 4]                    (kind 1)
//     dtype:      u8            (0=F32, 1=F64, 2=F16, 3=BF16)
//     data_len:   u64 LE        (in bytes)
//     data:       [u8; data_len] (raw little-endian storage)
//
// Parameters are matched to layers by name and to blobs by position. A legacy
// record matches any blob of rank <= 4 with the same (num, channels, height,
// width) view; an N-D record must match the blob's dims exactly. Storage is
// converted when the file's dtype differs from the arena's.
//
// Usage:
//   weights::save_params("net.tswt", &layers, &arena)?;
//   weights::load_params("net.tswt", &layers, &mut arena)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tessel_core::{BlobArena, DType, Error, Result, Shape, Storage};
use tessel_nn::Layer;

const MAGIC: &[u8; 4] = b"TSWT";
const VERSION: u32 = 1;

const SHAPE_DIMS: u8 = 0;
const SHAPE_LEGACY: u8 = 1;

/// One parameter blob as stored in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub shape: Shape,
    /// Written as a (num, channels, height, width) tuple.
    pub legacy: bool,
    pub storage: Storage,
}

/// The parameters of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRecord {
    pub name: String,
    pub blobs: Vec<BlobRecord>,
}

impl BlobRecord {
    pub fn count(&self) -> usize {
        self.shape.elem_count()
    }

    /// The values as (num x channels) planes of height rows by width
    /// columns, one blank line after each plane. `None` unless the record is
    /// legacy or 4-D.
    pub fn render_planes(&self) -> Option<String> {
        if !self.legacy && self.shape.rank() != 4 {
            return None;
        }
        let [n, c, h, w] = self.shape.legacy_dims().ok()?;
        let values = self.storage.to_f64_vec();
        let mut out = String::new();
        // no elements means some dim is 0; chunking by h * w would be invalid
        if values.is_empty() {
            return Some(out);
        }
        for plane in values.chunks(h * w).take(n * c) {
            for row in plane.chunks(w) {
                let row: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                out.push_str(&row.join(" "));
                out.push('\n');
            }
            out.push('\n');
        }
        Some(out)
    }

    fn matches(&self, shape: &Shape) -> bool {
        if self.legacy {
            shape.is_legacy_compatible()
                && self.shape.legacy_dims().ok() == shape.legacy_dims().ok()
        } else {
            self.shape == *shape
        }
    }
}

// DType <-> u8 encoding

fn dtype_to_u8(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::F64 => 1,
        DType::F16 => 2,
        DType::BF16 => 3,
    }
}

fn u8_to_dtype(v: u8) -> Result<DType> {
    match v {
        0 => Ok(DType::F32),
        1 => Ok(DType::F64),
        2 => Ok(DType::F16),
        3 => Ok(DType::BF16),
        _ => Err(Error::Format(format!("unknown dtype tag {v}"))),
    }
}

// Low-level IO helpers

fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
    Ok(w.write_all(&[v])?)
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn write_len(w: &mut impl Write, n: usize, what: &str) -> Result<()> {
    let n = u32::try_from(n).map_err(|_| Error::Format(format!("too many {what}: {n}")))?;
    write_u32(w, n)
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_usize(r: &mut impl Read) -> Result<usize> {
    let v = read_u64(r)?;
    usize::try_from(v).map_err(|_| Error::Format(format!("value {v} does not fit in usize")))
}

fn read_bytes(r: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    // read through take() so a corrupt length cannot force a huge allocation
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(Error::Format(format!(
            "truncated payload: expected {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(buf)
}

// Write

/// Write layer records in the parameter format.
pub fn write_records(writer: &mut impl Write, layers: &[LayerRecord]) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_len(writer, layers.len(), "layers")?;

    for layer in layers {
        write_len(writer, layer.name.len(), "name bytes")?;
        writer.write_all(layer.name.as_bytes())?;
        write_len(writer, layer.blobs.len(), "blobs")?;

        for blob in &layer.blobs {
            if blob.legacy {
                write_u8(writer, SHAPE_LEGACY)?;
                for d in blob.shape.legacy_dims()? {
                    write_u64(writer, d as u64)?;
                }
            } else {
                write_u8(writer, SHAPE_DIMS)?;
                write_len(writer, blob.shape.rank(), "axes")?;
                for &d in blob.shape.dims() {
                    write_u64(writer, d as u64)?;
                }
            }
            write_u8(writer, dtype_to_u8(blob.storage.dtype()))?;
            let data = blob.storage.to_le_bytes();
            write_u64(writer, data.len() as u64)?;
            writer.write_all(&data)?;
        }
    }
    Ok(())
}

/// Collect the parameter records of `layers`.
pub fn records_of(layers: &[Layer], arena: &BlobArena) -> Result<Vec<LayerRecord>> {
    layers
        .iter()
        .filter(|l| !l.params().is_empty())
        .map(|l| {
            let blobs = l
                .params()
                .into_iter()
                .map(|id| {
                    Ok(BlobRecord {
                        shape: arena.shape(id)?.clone(),
                        legacy: false,
                        storage: arena.values_storage(id)?.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(LayerRecord {
                name: l.name().to_string(),
                blobs,
            })
        })
        .collect()
}

/// Save the parameters of `layers` to a file.
pub fn save_params(path: impl AsRef<Path>, layers: &[Layer], arena: &BlobArena) -> Result<()> {
    let records = records_of(layers, arena)?;
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_records(&mut writer, &records)?;
    writer.flush()?;
    tracing::info!(
        path = %path.as_ref().display(),
        layers = records.len(),
        "saved parameters"
    );
    Ok(())
}

// Read

/// Read layer records in the parameter format.
pub fn read_from(reader: &mut impl Read) -> Result<Vec<LayerRecord>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Format(format!(
            "invalid parameter file: expected magic {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::Format(format!(
            "unsupported parameter file version {version} (expected {VERSION})"
        )));
    }

    let count = read_u32(reader)? as usize;
    let mut layers = Vec::new();
    for _ in 0..count {
        let name_len = read_u32(reader)? as usize;
        let name = String::from_utf8(read_bytes(reader, name_len)?)
            .map_err(|e| Error::Format(format!("invalid UTF-8 layer name: {e}")))?;
        let blob_count = read_u32(reader)? as usize;
        let mut blobs = Vec::new();
        for _ in 0..blob_count {
            let (dims, legacy) = match read_u8(reader)? {
                SHAPE_DIMS => {
                    let ndim = read_u32(reader)? as usize;
                    let dims = (0..ndim).map(|_| read_usize(reader)).collect::<Result<Vec<_>>>()?;
                    (dims, false)
                }
                SHAPE_LEGACY => {
                    let dims = (0..4).map(|_| read_usize(reader)).collect::<Result<Vec<_>>>()?;
                    (dims, true)
                }
                other => return Err(Error::Format(format!("unknown shape kind {other}"))),
            };
            let shape = Shape::new(dims);
            let count = shape.checked_elem_count().ok_or_else(|| {
                Error::Format(format!(
                    "blob {} of layer '{name}': element count of shape {shape} overflows",
                    blobs.len()
                ))
            })?;
            let dtype = u8_to_dtype(read_u8(reader)?)?;
            let data_len = read_usize(reader)?;
            let storage = Storage::from_le_bytes(dtype, &read_bytes(reader, data_len)?)?;
            if storage.len() != count {
                return Err(Error::Format(format!(
                    "blob {} of layer '{name}': shape {shape} needs {count} elements, payload holds {}",
                    blobs.len(),
                    storage.len()
                )));
            }
            blobs.push(BlobRecord {
                shape,
                legacy,
                storage,
            });
        }
        layers.push(LayerRecord { name, blobs });
    }
    Ok(layers)
}

/// Read every record of a parameter file.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<LayerRecord>> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    read_from(&mut reader)
}

/// Copy records into the parameter blobs of matching layers.
///
/// Records for layers not in `layers` are skipped; a matching layer must have
/// the same number of parameter blobs with matching shapes. Returns the
/// number of layers loaded.
pub fn apply_records(records: &[LayerRecord], layers: &[Layer], arena: &mut BlobArena) -> Result<usize> {
    let mut loaded = 0;
    for record in records {
        let Some(layer) = layers.iter().find(|l| l.name() == record.name) else {
            tracing::debug!(layer = %record.name, "no layer for stored parameters; skipping");
            continue;
        };
        let params = layer.params();
        if params.len() != record.blobs.len() {
            return Err(Error::Format(format!(
                "layer '{}' has {} parameter blobs, file holds {}",
                record.name,
                params.len(),
                record.blobs.len()
            )));
        }
        // validate everything before writing anything
        for (i, (&id, blob)) in params.iter().zip(&record.blobs).enumerate() {
            let shape = arena.shape(id)?;
            if !blob.matches(shape) {
                return Err(Error::Format(format!(
                    "layer '{}' blob {i}: stored shape {} does not match {shape}",
                    record.name, blob.shape
                )));
            }
        }
        for (&id, blob) in params.iter().zip(&record.blobs) {
            arena.load_storage(id, &blob.storage)?;
        }
        loaded += 1;
    }
    Ok(loaded)
}

/// Load a parameter file into the parameter blobs of `layers`.
pub fn load_params(path: impl AsRef<Path>, layers: &[Layer], arena: &mut BlobArena) -> Result<usize> {
    let records = read_records(path.as_ref())?;
    let loaded = apply_records(&records, layers, arena)?;
    tracing::info!(path = %path.as_ref().display(), loaded, "loaded parameters");
    Ok(loaded)
}
