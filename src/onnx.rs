//! tract-onnx backed implementations of the vision model traits.
//!
//! The detection artifact is a YOLO-style network over a 1x3x192x512 input
//! producing `[1, channels, candidates]`; the similarity artifact is a
//! siamese network over two 1x3x105x105 inputs producing a single logit.

use std::path::Path;

use tract_onnx::prelude::*;

use crate::error::QueryError;
use crate::vision::{
    DetectionModel, ImageTensor, SimilarityModel, DETECT_INPUT_HEIGHT, DETECT_INPUT_WIDTH,
    GLYPH_INPUT_SIZE,
};

type OnnxPlan = TypedRunnableModel<TypedModel>;

pub struct OnnxDetectionModel {
    plan: OnnxPlan,
}

impl OnnxDetectionModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let plan = tract_onnx::onnx()
            .model_for_path(path.as_ref())
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, 3, DETECT_INPUT_HEIGHT as usize, DETECT_INPUT_WIDTH as usize),
                    ),
                )
            })
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| QueryError::Inference(format!("detection model load: {}", e)))?;
        Ok(Self { plan })
    }
}

impl DetectionModel for OnnxDetectionModel {
    fn predict(&self, input: &ImageTensor) -> Result<Vec<Vec<f32>>, QueryError> {
        let tensor = to_tensor(input)?;
        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| QueryError::Inference(format!("detection run: {}", e)))?;
        let view = outputs[0]
            .to_array_view::<f32>()
            .map_err(|e| QueryError::Inference(format!("detection output: {}", e)))?;

        // [1, channels, candidates] transposed into per-candidate rows
        let shape = view.shape();
        if shape.len() != 3 {
            return Err(QueryError::Inference(format!(
                "unexpected detection output shape {:?}",
                shape
            )));
        }
        let (channels, candidates) = (shape[1], shape[2]);
        let mut rows = Vec::with_capacity(candidates);
        for i in 0..candidates {
            let mut row = Vec::with_capacity(channels);
            for c in 0..channels {
                row.push(view[[0, c, i]]);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

pub struct OnnxSimilarityModel {
    plan: OnnxPlan,
}

impl OnnxSimilarityModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let glyph = GLYPH_INPUT_SIZE as usize;
        let fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, glyph, glyph));
        let plan = tract_onnx::onnx()
            .model_for_path(path.as_ref())
            .and_then(|m| m.with_input_fact(0, fact.clone()))
            .and_then(|m| m.with_input_fact(1, fact))
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| QueryError::Inference(format!("similarity model load: {}", e)))?;
        Ok(Self { plan })
    }
}

impl SimilarityModel for OnnxSimilarityModel {
    fn compare(&self, candidate: &ImageTensor, query: &ImageTensor) -> Result<f32, QueryError> {
        let outputs = self
            .plan
            .run(tvec!(to_tensor(candidate)?.into(), to_tensor(query)?.into()))
            .map_err(|e| QueryError::Inference(format!("similarity run: {}", e)))?;
        let view = outputs[0]
            .to_array_view::<f32>()
            .map_err(|e| QueryError::Inference(format!("similarity output: {}", e)))?;
        view.iter()
            .next()
            .copied()
            .ok_or_else(|| QueryError::Inference("empty similarity output".into()))
    }
}

fn to_tensor(t: &ImageTensor) -> Result<Tensor, QueryError> {
    let arr = tract_ndarray::Array4::from_shape_vec((1, 3, t.height, t.width), t.data.clone())
        .map_err(|e| QueryError::Inference(format!("bad tensor shape: {}", e)))?;
    Ok(Tensor::from(arr))
}
