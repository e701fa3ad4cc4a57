use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BenchError, Result};

/// Tensor element types understood by the serving endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "TYPE_BOOL")]
    Bool,
    #[serde(rename = "TYPE_UINT8")]
    Uint8,
    #[serde(rename = "TYPE_UINT16")]
    Uint16,
    #[serde(rename = "TYPE_UINT32")]
    Uint32,
    #[serde(rename = "TYPE_UINT64")]
    Uint64,
    #[serde(rename = "TYPE_INT8")]
    Int8,
    #[serde(rename = "TYPE_INT16")]
    Int16,
    #[serde(rename = "TYPE_INT32")]
    Int32,
    #[serde(rename = "TYPE_INT64")]
    Int64,
    #[serde(rename = "TYPE_FP16")]
    Fp16,
    #[serde(rename = "TYPE_FP32")]
    Fp32,
    #[serde(rename = "TYPE_FP64")]
    Fp64,
    #[serde(rename = "TYPE_BYTES")]
    Bytes,
}

impl DataType {
    /// Name carried in the `datatype` field on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            DataType::Bool => "TYPE_BOOL",
            DataType::Uint8 => "TYPE_UINT8",
            DataType::Uint16 => "TYPE_UINT16",
            DataType::Uint32 => "TYPE_UINT32",
            DataType::Uint64 => "TYPE_UINT64",
            DataType::Int8 => "TYPE_INT8",
            DataType::Int16 => "TYPE_INT16",
            DataType::Int32 => "TYPE_INT32",
            DataType::Int64 => "TYPE_INT64",
            DataType::Fp16 => "TYPE_FP16",
            DataType::Fp32 => "TYPE_FP32",
            DataType::Fp64 => "TYPE_FP64",
            DataType::Bytes => "TYPE_BYTES",
        }
    }

    /// Width of one element in bytes; `None` for variable-length elements.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => Some(1),
            DataType::Uint16 | DataType::Int16 | DataType::Fp16 => Some(2),
            DataType::Uint32 | DataType::Int32 | DataType::Fp32 => Some(4),
            DataType::Uint64 | DataType::Int64 | DataType::Fp64 => Some(8),
            DataType::Bytes => None,
        }
    }

    /// Byte length of a tensor of `shape`; `None` for variable-length
    /// elements. Negative dimensions and sizes past `usize` are rejected.
    pub fn tensor_len(&self, shape: &[i64]) -> Result<Option<usize>> {
        let Some(width) = self.element_size() else {
            return Ok(None);
        };
        if shape.iter().any(|&d| d < 0) {
            return Err(BenchError::invalid(format!(
                "tensor shape must not contain negative dimensions: {shape:?}"
            )));
        }
        shape
            .iter()
            .try_fold(1i64, |acc, &d| acc.checked_mul(d))
            .and_then(|elements| usize::try_from(elements).ok())
            .and_then(|elements| elements.checked_mul(width))
            .map(Some)
            .ok_or_else(|| {
                BenchError::invalid(format!(
                    "tensor shape {shape:?} of {} overflows the addressable size",
                    self.wire_name()
                ))
            })
    }
}

/// Input tensor as sent to the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorPayload {
    shape: Vec<i64>,
    datatype: DataType,
    raw: Vec<u8>,
}

impl TensorPayload {
    /// Wrap already-serialized tensor bytes, checking them against the shape.
    pub fn from_raw(shape: Vec<i64>, datatype: DataType, raw: Vec<u8>) -> Result<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(BenchError::invalid(format!(
                "tensor shape must not contain negative dimensions: {shape:?}"
            )));
        }
        if let Some(expected) = datatype.tensor_len(&shape)? {
            if expected != raw.len() {
                return Err(BenchError::invalid(format!(
                    "shape {shape:?} of {} needs {expected} bytes, got {}",
                    datatype.wire_name(),
                    raw.len()
                )));
            }
        }
        Ok(Self {
            shape,
            datatype,
            raw,
        })
    }

    /// Build a `TYPE_BYTES` tensor of shape `[n]`; each element is written
    /// as a little-endian u32 length followed by its bytes.
    pub fn from_byte_elements<I, B>(elements: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut raw = Vec::new();
        let mut count = 0i64;
        for element in elements {
            let bytes = element.as_ref();
            raw.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            raw.extend_from_slice(bytes);
            count += 1;
        }
        Self {
            shape: vec![count],
            datatype: DataType::Bytes,
            raw,
        }
    }

    /// Load the tensor bytes from disk. Without an explicit shape the file is
    /// treated as a flat tensor of `datatype` elements.
    pub fn from_file(
        path: impl AsRef<Path>,
        shape: Option<Vec<i64>>,
        datatype: DataType,
    ) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            BenchError::invalid(format!("cannot read payload {}: {e}", path.display()))
        })?;
        if datatype == DataType::Bytes {
            return Ok(Self::from_byte_elements([raw]));
        }
        let shape = match shape {
            Some(shape) => shape,
            None => {
                let width = datatype.element_size().unwrap_or(1);
                vec![(raw.len() / width) as i64]
            }
        };
        Self::from_raw(shape, datatype, raw)
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[derive(Serialize)]
struct WireContent<'a> {
    shape: &'a [i64],
    datatype: &'static str,
    raw_input_contents: &'a serde_bytes::Bytes,
}

/// Pickled request body, ready to be posted as the `content` form field.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    body: Vec<u8>,
}

impl EncodedRequest {
    pub const FIELD_NAME: &'static str = "content";

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

pub fn encode(payload: &TensorPayload) -> Result<EncodedRequest> {
    let content = WireContent {
        shape: &payload.shape,
        datatype: payload.datatype.wire_name(),
        raw_input_contents: serde_bytes::Bytes::new(&payload.raw),
    };
    let body = serde_pickle::to_vec(&content, serde_pickle::SerOptions::new())
        .map_err(|e| BenchError::invalid(format!("failed to encode payload: {e}")))?;
    Ok(EncodedRequest { body })
}

/// Server-side timing breakdown in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerTimes {
    pub preprocessing_time: f64,
    pub batching_time: f64,
    pub inference_time: f64,
    pub postprocessing_time: f64,
    pub server_end2end_time: f64,
}

impl ServerTimes {
    pub fn stage_sum(&self) -> f64 {
        self.preprocessing_time + self.batching_time + self.inference_time + self.postprocessing_time
    }

    /// End-to-end covers every stage, up to `tolerance` seconds of rounding.
    pub fn is_additive(&self, tolerance: f64) -> bool {
        self.server_end2end_time + tolerance >= self.stage_sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferResponse {
    pub response: serde_json::Value,
    pub times: ServerTimes,
}

pub fn decode_response(body: &[u8]) -> Result<InferResponse> {
    serde_json::from_slice(body)
        .map_err(|e| BenchError::transport(format!("undecodable response: {e}")))
}
