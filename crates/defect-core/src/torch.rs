use std::{convert::TryFrom, path::Path, time::Duration};

use anyhow::{Result, bail};
use line_ingest::{FrameFormat, FrameImage};
use tch::{self, Device, Kind, Tensor};

use crate::{
    detection::{BoundingRegion, RawDetection},
    detector::{Detector, InferenceError},
};

const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector for YOLO-style heads emitting
/// `[batch, 5 + classes, predictions]` rows of `cx, cy, w, h, conf, class`.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    class_names: Vec<String>,
    score_floor: f32,
}

impl TorchDetector {
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        class_names: Vec<String>,
    ) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            class_names,
            score_floor: 0.05,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn image_to_tensor(&self, image: &FrameImage) -> Result<Tensor> {
        let (in_w, in_h) = self.input_size;
        let (width, height) = (image.width() as i64, image.height() as i64);
        if (width, height) != (in_w, in_h) {
            bail!("frame size {width}x{height} does not match detector input {in_w}x{in_h}");
        }
        let channels = image.format().bytes_per_pixel() as i64;
        let tensor = Tensor::from_slice(image.data())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, channels]);
        let tensor = match image.format() {
            FrameFormat::Rgb8 => tensor,
            FrameFormat::Bgr8 => tensor.flip([3]),
            FrameFormat::Gray8 => tensor.expand([1, in_h, in_w, 3], false),
        };
        Ok(tensor.permute([0, 3, 1, 2]).contiguous() / 255.0)
    }

    fn class_name(&self, class_id: i64) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|index| self.class_names.get(index))
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    fn decode(&self, output: Tensor) -> Result<Vec<RawDetection>> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 || row[4] < self.score_floor {
                continue;
            }
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            detections.push(RawDetection::new(
                self.class_name(class_id),
                row[4],
                BoundingRegion::from_center_xywh([row[0], row[1], row[2], row[3]]),
            ));
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }
        Ok(detections)
    }
}

impl Detector for TorchDetector {
    fn name(&self) -> &str {
        "torchscript"
    }

    fn infer(
        &mut self,
        image: &FrameImage,
        _timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let _guard = tch::no_grad_guard();
        let input = self.image_to_tensor(image)?;
        let output = self
            .module
            .forward_ts(&[input])
            .map_err(anyhow::Error::from)?;
        Ok(self.decode(output)?)
    }
}
