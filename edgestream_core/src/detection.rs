//! YOLO output decoding and non-maximum suppression.

pub mod descriptor;

pub use descriptor::{ModelDescriptor, ModelDescriptorBuilder, ModelFamily};

use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Output tensor is too short: expected {expected} values, got {actual}")]
    TensorTooShort { expected: usize, actual: usize },
    #[error("Model has no labels")]
    NoLabels,
    #[error("Model declares {actual} anchor values, {expected} are required")]
    NotEnoughAnchors { expected: usize, actual: usize },
    #[error("Invalid model geometry: {0}")]
    InvalidGeometry(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse model sidecar {path}: {source}")]
    Sidecar {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Pixel-space box, `x` and `y` are the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BBox {
    pub fn area(&self) -> f32 {
        self.w as f32 * self.h as f32
    }

    pub fn intersection(&self, other: &BBox) -> f32 {
        let w = overlap(self.x, self.w, other.x, other.w);
        let h = overlap(self.y, self.h, other.y, other.h);
        if w < 0.0 || h < 0.0 {
            return 0.0;
        }
        w * h
    }
}

fn overlap(a: i32, a_len: i32, b: i32, b_len: i32) -> f32 {
    let left = a.max(b) as f32;
    let right = (a + a_len).min(b + b_len) as f32;
    right - left
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(skip)]
    pub class_id: usize,
    pub label: String,
    #[serde(rename = "box")]
    pub bbox: BBox,
    /// Percent, `0..=100`.
    pub probability: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    class_id: usize,
    bbox: BBox,
    probability: f32,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::MIN, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

impl ModelFamily {
    fn box_extent(self, raw: f32, anchor: f64, model_in: u32, grid: usize) -> f32 {
        let scale = match self {
            ModelFamily::YoloV3 => model_in as f64,
            ModelFamily::YoloV2 => grid as f64,
        };
        ((raw as f64).exp() * anchor / scale) as f32
    }

    fn score_classes(self, scores: &mut [f32]) {
        match self {
            ModelFamily::YoloV3 => {
                for s in scores.iter_mut() {
                    *s = sigmoid(*s as f64) as f32;
                }
            }
            ModelFamily::YoloV2 => softmax(scores),
        }
    }
}

/// Darknet letterbox geometry for a unit correction ratio.
fn letterbox(model_in_w: u32, model_in_h: u32) -> (f32, f32) {
    if model_in_w < model_in_h {
        (model_in_w as f32, model_in_w as f32)
    } else {
        (model_in_h as f32, model_in_h as f32)
    }
}

/// Decodes a raw output tensor into detections for an `image_w` x `image_h`
/// frame. Pure: identical inputs yield identical output.
pub fn decode(
    raw: &[f32],
    descriptor: &ModelDescriptor,
    image_w: u32,
    image_h: u32,
) -> Result<Vec<Detection>, DecodeError> {
    let expected = descriptor.tensor_len();
    if raw.len() < expected {
        return Err(DecodeError::TensorTooShort {
            expected,
            actual: raw.len(),
        });
    }

    let family = descriptor.family;
    let num_class = descriptor.labels.len();
    let num_bb = descriptor.num_bb;
    let layers = descriptor.num_grids.len();
    let (in_w, in_h) = (descriptor.model_in_w as f32, descriptor.model_in_h as f32);
    let (new_w, new_h) = letterbox(descriptor.model_in_w, descriptor.model_in_h);

    let mut scores = vec![0f32; num_class];
    let mut candidates = Vec::new();
    let mut layer_base = 0;

    for (n, &grid) in descriptor.num_grids.iter().enumerate() {
        let cells = grid * grid;
        let anchor_offset = 2 * num_bb * (layers - (n + 1));
        for b in 0..num_bb {
            let anchor_w = descriptor.anchors[anchor_offset + 2 * b];
            let anchor_h = descriptor.anchors[anchor_offset + 2 * b + 1];
            for y in 0..grid {
                for x in 0..grid {
                    let offs = layer_base + b * (num_class + 5) * cells + y * grid + x;
                    let channel = |c: usize| raw[offs + c * cells];

                    let objectness = sigmoid(channel(4) as f64) as f32;
                    let mut center_x = (x as f32 + sigmoid(channel(0) as f64) as f32) / grid as f32;
                    let mut center_y = (y as f32 + sigmoid(channel(1) as f64) as f32) / grid as f32;
                    let mut box_w =
                        family.box_extent(channel(2), anchor_w, descriptor.model_in_w, grid);
                    let mut box_h =
                        family.box_extent(channel(3), anchor_h, descriptor.model_in_h, grid);

                    center_x = (center_x - (in_w - new_w) / 2.0 / in_w) / (new_w / in_w);
                    center_y = (center_y - (in_h - new_h) / 2.0 / in_h) / (new_h / in_h);
                    box_w *= in_w / new_w;
                    box_h *= in_h / new_h;

                    let center_x = (center_x * image_w as f32).round();
                    let center_y = (center_y * image_h as f32).round();
                    let w = (box_w * image_w as f32).round() as i32;
                    let h = (box_h * image_h as f32).round() as i32;

                    for (i, s) in scores.iter_mut().enumerate() {
                        *s = channel(5 + i);
                    }
                    family.score_classes(&mut scores);

                    let mut best: Option<(usize, f32)> = None;
                    let mut max_pred = 0.0;
                    for (i, &s) in scores.iter().enumerate() {
                        if s > max_pred {
                            max_pred = s;
                            best = Some((i, s));
                        }
                    }
                    let Some((class_id, score)) = best else {
                        continue;
                    };

                    let probability = score * objectness;
                    if probability < descriptor.thresh_prob {
                        continue;
                    }

                    candidates.push(Candidate {
                        class_id,
                        bbox: BBox {
                            x: (center_x - (w / 2) as f32) as i32,
                            y: (center_y - (h / 2) as f32) as i32,
                            w,
                            h,
                        },
                        probability: probability * 100.0,
                    });
                }
            }
        }
        layer_base += num_bb * (num_class + 5) * cells;
    }

    suppress(
        &mut candidates,
        descriptor.thresh_nms,
        descriptor.containment_epsilon,
    );

    Ok(candidates
        .into_iter()
        .filter(|c| c.probability > 0.0)
        .map(|c| Detection {
            class_id: c.class_id,
            label: descriptor.labels[c.class_id].clone(),
            bbox: c.bbox,
            probability: c.probability,
        })
        .collect())
}

/// Greedy pairwise suppression. Losers get a zero probability; the order of
/// the slice is untouched.
fn suppress(candidates: &mut [Candidate], thresh_nms: f32, containment_epsilon: f32) {
    let size = candidates.len();
    for i in 0..size {
        for j in 0..size {
            if i == j || candidates[i].class_id != candidates[j].class_id {
                continue;
            }
            let a = candidates[i].bbox;
            let b = candidates[j].bbox;
            let area_a = a.area();
            let area_b = b.area();
            let intersection = a.intersection(&b);
            let iou = intersection / (area_a + area_b - intersection);
            if iou > thresh_nms
                || intersection >= area_a - containment_epsilon
                || intersection >= area_b - containment_epsilon
            {
                if candidates[i].probability > candidates[j].probability {
                    candidates[j].probability = 0.0;
                } else {
                    candidates[i].probability = 0.0;
                }
            }
        }
    }
}
