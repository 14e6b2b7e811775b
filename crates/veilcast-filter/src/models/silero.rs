// crates/veilcast-filter/src/models/silero.rs
//
// Silero VAD (V5/V6) over an ort session. The model takes the 512-sample
// chunk prefixed with 64 samples of context from the previous chunk, plus
// the recurrent [2, 1, 128] state tensor, and returns a single speech
// probability; state and context carry across calls.

use std::mem::take;
use std::path::Path;

use ndarray::{Array, Array1, Array2, ArrayBase, ArrayD, Dim, IxDynImpl, OwnedRepr};
use ort::session::Session;
use ort::value::Value;

use veilcast_core::error::{FilterError, Result};
use veilcast_core::vad::SpeechProbability;

const CONTEXT_SIZE: usize = 64;

pub struct SileroVad {
    session:     Session,
    state:       ArrayBase<OwnedRepr<f32>, Dim<IxDynImpl>>,
    context:     Array1<f32>,
    sample_rate: ArrayBase<OwnedRepr<i64>, Dim<[usize; 1]>>,
    /// Rate the sample_rate tensor was built for.
    rate:        u32,
}

impl SileroVad {
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| FilterError::Config(format!("vad session: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| FilterError::Config(format!("vad model: {e}")))?;

        Ok(Self {
            session,
            state: ArrayD::<f32>::zeros([2, 1, 128].as_slice()),
            context: Array1::<f32>::zeros(CONTEXT_SIZE),
            sample_rate: Array::from_shape_vec([1], vec![16_000i64])
                .expect("1-element shape"),
            rate: 16_000,
        })
    }
}

impl SpeechProbability for SileroVad {
    fn speech_prob(&mut self, chunk: &[f32], sampling_rate: u32) -> Result<f32> {
        if self.rate != sampling_rate {
            self.sample_rate = Array::from_shape_vec([1], vec![sampling_rate as i64])
                .expect("1-element shape");
            self.rate = sampling_rate;
        }

        // Chunk prefixed with the previous chunk's tail for continuity.
        let mut input = Vec::with_capacity(CONTEXT_SIZE + chunk.len());
        input.extend_from_slice(self.context.as_slice().expect("contiguous context"));
        input.extend_from_slice(chunk);

        let frame = Array2::<f32>::from_shape_vec([1, input.len()], input)
            .map_err(|e| FilterError::Transcribe(format!("vad input: {e}")))?;

        let frame_value =
            Value::from_array(frame).map_err(|e| FilterError::Transcribe(e.to_string()))?;
        let state_value = Value::from_array(take(&mut self.state))
            .map_err(|e| FilterError::Transcribe(e.to_string()))?;
        let sr_value = Value::from_array(self.sample_rate.clone())
            .map_err(|e| FilterError::Transcribe(e.to_string()))?;

        let outputs = self
            .session
            .run([
                (&frame_value).into(),
                (&state_value).into(),
                (&sr_value).into(),
            ])
            .map_err(|e| FilterError::Transcribe(format!("vad inference: {e}")))?;

        // Carry the recurrent state into the next call.
        let (shape, state_data) = outputs["stateN"]
            .try_extract_tensor::<f32>()
            .map_err(|e| FilterError::Transcribe(e.to_string()))?;
        let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
        self.state = ArrayD::from_shape_vec(dims.as_slice(), state_data.to_vec())
            .map_err(|e| FilterError::Transcribe(e.to_string()))?;

        if chunk.len() >= CONTEXT_SIZE {
            self.context = Array1::from_vec(chunk[chunk.len() - CONTEXT_SIZE..].to_vec());
        }

        let prob = *outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(|e| FilterError::Transcribe(e.to_string()))?
            .1
            .first()
            .ok_or_else(|| FilterError::Transcribe("empty vad output".into()))?;

        Ok(prob)
    }
}
