//! Reader for dlib's serialized `shape_predictor` (`.dat`, `.dat.bz2`).
//!
//! dlib writes integers as a control byte (bit 7 = sign, low nibble = byte
//! count) followed by little-endian magnitude bytes. Floats are a
//! `(mantissa, exponent)` integer pair. Matrices are prefixed with their
//! negated row and column counts.
//!
//! Layout of a shape predictor:
//!
//! ```text
//! version (= 1)
//! initial_shape            matrix<float, 2N, 1>
//! forests                  vector<vector<tree>>      one forest per stage
//! anchor_idx               vector<vector<ulong>>     probe anchors per stage
//! deltas                   vector<vector<(x, y)>>    probe offsets per stage
//! ```
//!
//! Pre-trained models: <https://github.com/davisking/dlib-models>.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;

use crate::error::{Error, Result};
use crate::shape_predictor::{CascadeStage, PixelProbe, RegressionTree, ShapePredictor, Split};
use crate::types::{Point, Shape};

struct Decoder<R: Read> {
    inner: R,
}

impl<R: Read> Decoder<R> {
    fn new(inner: R) -> Self {
        Self { inner }
    }

    fn byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn int(&mut self) -> Result<i64> {
        let control = self.byte()?;
        let len = (control & 0x0F) as usize;
        if len > 8 {
            return Err(Error::InvalidModel(format!(
                "integer with {len} bytes does not fit in 64 bits"
            )));
        }
        let mut magnitude = 0u64;
        for shift in 0..len {
            magnitude |= (self.byte()? as u64) << (8 * shift);
        }
        let value = magnitude as i64;
        Ok(if control & 0x80 != 0 { -value } else { value })
    }

    fn count(&mut self) -> Result<usize> {
        let value = self.int()?;
        usize::try_from(value)
            .map_err(|_| Error::InvalidModel(format!("negative length {value}")))
    }

    fn float(&mut self) -> Result<f32> {
        let mantissa = self.int()?;
        let exponent = self.int()?;
        if mantissa == 0 {
            return Ok(0.0);
        }
        Ok((mantissa as f64 * 2f64.powi(exponent as i32)) as f32)
    }

    /// A column vector of `2 * n` floats, returned as a shape of `n` points.
    fn shape_column(&mut self) -> Result<Shape> {
        let rows = -self.int()?;
        let cols = -self.int()?;
        if cols != 1 || rows < 0 || rows % 2 != 0 {
            return Err(Error::InvalidModel(format!(
                "expected a 2N x 1 shape matrix, got {rows} x {cols}"
            )));
        }
        let values = (0..rows)
            .map(|_| self.float())
            .collect::<Result<Vec<_>>>()?;
        Ok(Shape::from_interleaved(&values))
    }

    fn sequence<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.count()?;
        let mut out = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

fn narrow(value: usize, what: &str) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::InvalidModel(format!("{what} {value} out of range")))
}

fn decode_tree<R: Read>(d: &mut Decoder<R>) -> Result<RegressionTree> {
    let splits = d.sequence(|d| {
        Ok(Split {
            probe_a: narrow(d.count()?, "probe index")?,
            probe_b: narrow(d.count()?, "probe index")?,
            threshold: d.float()?,
        })
    })?;
    let leaves = d.sequence(|d| d.shape_column())?;
    RegressionTree::new(splits, leaves)
}

fn decode_predictor<R: Read>(d: &mut Decoder<R>) -> Result<ShapePredictor> {
    let version = d.int()?;
    if version != 1 {
        return Err(Error::InvalidModel(format!(
            "unsupported shape_predictor version {version}"
        )));
    }

    let mean_shape = d.shape_column()?;
    let forests = d.sequence(|d| d.sequence(decode_tree))?;
    let anchors = d.sequence(|d| d.sequence(|d| narrow(d.count()?, "anchor")))?;
    let offsets = d.sequence(|d| d.sequence(|d| Ok(Point::new(d.float()?, d.float()?))))?;

    if anchors.len() != forests.len() || offsets.len() != forests.len() {
        return Err(Error::InvalidModel(format!(
            "{} forests but {} anchor lists and {} offset lists",
            forests.len(),
            anchors.len(),
            offsets.len()
        )));
    }

    let stages = forests
        .into_iter()
        .zip(anchors.into_iter().zip(offsets))
        .map(|(forest, (anchors, offsets))| {
            if anchors.len() != offsets.len() {
                return Err(Error::InvalidModel(format!(
                    "stage has {} anchors but {} offsets",
                    anchors.len(),
                    offsets.len()
                )));
            }
            let probes = anchors
                .into_iter()
                .zip(offsets)
                .map(|(anchor, offset)| PixelProbe { anchor, offset })
                .collect();
            Ok(CascadeStage { probes, forest })
        })
        .collect::<Result<Vec<_>>>()?;

    ShapePredictor::new(mean_shape, stages)
}

/// Decode a dlib model from any reader (already decompressed).
pub fn load_dlib_model_from_reader<R: Read>(reader: R) -> Result<ShapePredictor> {
    decode_predictor(&mut Decoder::new(reader))
}

/// Load a dlib model, transparently decompressing `.bz2` files.
pub fn load_dlib_model<P: AsRef<Path>>(path: P) -> Result<ShapePredictor> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("bz2")) {
        load_dlib_model_from_reader(BzDecoder::new(reader))
    } else {
        load_dlib_model_from_reader(reader)
    }
}

/// Load either a dlib model or a bincode model cache, chosen by extension.
pub fn load_landmark_model<P: AsRef<Path>>(path: P) -> Result<ShapePredictor> {
    let path = path.as_ref();
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("bin")) {
        ShapePredictor::load(path)
    } else {
        load_dlib_model(path)
    }
}
