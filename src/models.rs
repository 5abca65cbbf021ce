//! Core data models for the embedding gateway

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Edge length, in pixels, of every patch the inference service accepts
pub const PATCH_SIZE: i64 = 224;

/// Origin and size of a fixed-size patch within a slide level
///
/// Width and height are always [`PATCH_SIZE`]; any other value is rejected
/// at construction, including during deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPatchCoordinate")]
pub struct PatchCoordinate {
    x_origin: i64,
    y_origin: i64,
    width: i64,
    height: i64,
}

impl PatchCoordinate {
    /// Create a new PatchCoordinate
    ///
    /// # Returns
    /// * `Ok(PatchCoordinate)` if width and height are both 224
    /// * `Err(GatewayError::Validation)` otherwise
    pub fn new(x_origin: i64, y_origin: i64, width: i64, height: i64) -> Result<Self> {
        if width != PATCH_SIZE || height != PATCH_SIZE {
            return Err(GatewayError::Validation(format!(
                "patch coordinate width and height must be {}x{}, got {}x{}",
                PATCH_SIZE, PATCH_SIZE, width, height
            )));
        }
        Ok(PatchCoordinate {
            x_origin,
            y_origin,
            width,
            height,
        })
    }

    /// Create a patch of the default size at the given origin
    pub fn at(x_origin: i64, y_origin: i64) -> Self {
        PatchCoordinate {
            x_origin,
            y_origin,
            width: PATCH_SIZE,
            height: PATCH_SIZE,
        }
    }

    pub fn x_origin(&self) -> i64 {
        self.x_origin
    }

    pub fn y_origin(&self) -> i64 {
        self.y_origin
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn height(&self) -> i64 {
        self.height
    }
}

/// JSON integers may arrive as integral floats (`3.0`)
#[derive(Deserialize)]
#[serde(untagged)]
enum JsonInt {
    Int(i64),
    Float(f64),
}

impl JsonInt {
    fn into_i64(self, field: &str) -> Result<i64> {
        match self {
            JsonInt::Int(v) => Ok(v),
            JsonInt::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(v as i64),
            JsonInt::Float(v) => Err(GatewayError::Validation(format!(
                "patch coordinate {} is not an integer: {}",
                field, v
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatchCoordinate {
    x_origin: JsonInt,
    y_origin: JsonInt,
    width: Option<JsonInt>,
    height: Option<JsonInt>,
}

impl TryFrom<RawPatchCoordinate> for PatchCoordinate {
    type Error = GatewayError;

    fn try_from(raw: RawPatchCoordinate) -> Result<Self> {
        let width = match raw.width {
            Some(w) => w.into_i64("width")?,
            None => PATCH_SIZE,
        };
        let height = match raw.height {
            Some(h) => h.into_i64("height")?,
            None => PATCH_SIZE,
        };
        PatchCoordinate::new(
            raw.x_origin.into_i64("x_origin")?,
            raw.y_origin.into_i64("y_origin")?,
            width,
            height,
        )
    }
}

/// Location of an image series on the tile server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomPath {
    pub series_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_uids: Vec<String>,
}

/// One image series and the ordered patches to embed from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceInstance {
    pub dicom_path: DicomPath,
    pub patch_coordinates: Vec<PatchCoordinate>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

/// Client request body for `POST /predict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub instances: Vec<InferenceInstance>,
}

/// Embedding vector produced for a single patch
pub type EmbeddingVector = Vec<f64>;

/// A patch paired with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEmbedding {
    pub patch_coordinate: PatchCoordinate,
    pub embedding_vector: EmbeddingVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub patch_embeddings: Vec<PatchEmbedding>,
}

/// Result for one request instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub result: EmbeddingResult,
}

/// Response body for `POST /predict`, one prediction per request instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub predictions: Vec<Prediction>,
}

impl InferenceResponse {
    pub fn from_embeddings(per_instance: Vec<Vec<PatchEmbedding>>) -> Self {
        InferenceResponse {
            predictions: per_instance
                .into_iter()
                .map(|patch_embeddings| Prediction {
                    result: EmbeddingResult { patch_embeddings },
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_coordinate_new() {
        let patch = PatchCoordinate::new(10, 20, 224, 224).unwrap();
        assert_eq!(patch.x_origin(), 10);
        assert_eq!(patch.y_origin(), 20);
        assert_eq!(patch, PatchCoordinate::at(10, 20));
    }

    #[test]
    fn test_patch_coordinate_rejects_other_sizes() {
        assert!(PatchCoordinate::new(0, 0, 256, 224).is_err());
        assert!(PatchCoordinate::new(0, 0, 224, 100).is_err());
    }

    #[test]
    fn test_deserialize_defaults_size() {
        let patch: PatchCoordinate =
            serde_json::from_value(json!({"x_origin": 5, "y_origin": 7})).unwrap();
        assert_eq!(patch, PatchCoordinate::at(5, 7));
    }

    #[test]
    fn test_deserialize_accepts_integral_floats() {
        let patch: PatchCoordinate = serde_json::from_value(
            json!({"x_origin": 3.0, "y_origin": 4, "width": 224.0, "height": 224}),
        )
        .unwrap();
        assert_eq!(patch, PatchCoordinate::at(3, 4));
    }

    #[test]
    fn test_deserialize_rejects_bad_values() {
        let fractional = serde_json::from_value::<PatchCoordinate>(
            json!({"x_origin": 3.5, "y_origin": 4}),
        );
        assert!(fractional.is_err());

        let wrong_size = serde_json::from_value::<PatchCoordinate>(
            json!({"x_origin": 0, "y_origin": 0, "width": 512, "height": 512}),
        );
        assert!(wrong_size.is_err());

        let unknown_key = serde_json::from_value::<PatchCoordinate>(
            json!({"x_origin": 0, "y_origin": 0, "depth": 1}),
        );
        assert!(unknown_key.is_err());
    }

    #[test]
    fn test_response_wire_shape() {
        let response = InferenceResponse::from_embeddings(vec![vec![PatchEmbedding {
            patch_coordinate: PatchCoordinate::at(0, 224),
            embedding_vector: vec![0.5, 1.5],
        }]]);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"predictions": [{"result": {"patch_embeddings": [{
                "patch_coordinate": {"x_origin": 0, "y_origin": 224, "width": 224, "height": 224},
                "embedding_vector": [0.5, 1.5]
            }]}}]})
        );
    }
}
