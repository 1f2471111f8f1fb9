use super::DecodeError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const COCO_LABELS_FILENAME: &str = "coco-labels-2014_2017.txt";
pub const LABELS_FILENAME: &str = "labels.txt";

const YOLOV3_GRIDS: [usize; 3] = [13, 26, 52];
const YOLOV3_ANCHORS: [f64; 18] = [
    10.0, 13.0, 16.0, 30.0, 33.0, 23.0, 30.0, 61.0, 62.0, 45.0, 59.0, 119.0, 116.0, 90.0, 156.0,
    198.0, 373.0, 326.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "yolov3")]
    YoloV3,
    #[serde(rename = "yolov2")]
    YoloV2,
}

/// Decode parameters of a loaded model. Never mutated after a load; a new
/// load builds a new descriptor.
#[derive(Debug, Clone, Serialize, Builder)]
#[builder(default)]
pub struct ModelDescriptor {
    pub(crate) family: ModelFamily,
    pub(crate) labels: Vec<String>,
    pub(crate) anchors: Vec<f64>,
    pub(crate) num_grids: Vec<usize>,
    pub(crate) num_bb: usize,
    pub(crate) thresh_prob: f32,
    pub(crate) thresh_nms: f32,
    pub(crate) model_in_w: u32,
    pub(crate) model_in_h: u32,
    /// Area tolerance of the NMS containment test.
    pub(crate) containment_epsilon: f32,
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self {
            family: ModelFamily::YoloV3,
            labels: Vec::new(),
            anchors: YOLOV3_ANCHORS.to_vec(),
            num_grids: YOLOV3_GRIDS.to_vec(),
            num_bb: 3,
            thresh_prob: 0.5,
            thresh_nms: 0.5,
            model_in_w: 416,
            model_in_h: 416,
            containment_epsilon: 1.0,
        }
    }
}

impl ModelDescriptorBuilder {
    pub fn build_and_validate(&mut self) -> Result<ModelDescriptor, DecodeError> {
        let d = self
            .build()
            .map_err(|e| DecodeError::InvalidGeometry(e.to_string()))?;
        if d.labels.is_empty() {
            return Err(DecodeError::NoLabels);
        }
        if d.num_bb == 0 || d.num_grids.is_empty() || d.num_grids.contains(&0) {
            return Err(DecodeError::InvalidGeometry(format!(
                "num_bb={} num_grids={:?}",
                d.num_bb, d.num_grids
            )));
        }
        if d.model_in_w == 0 || d.model_in_h == 0 {
            return Err(DecodeError::InvalidGeometry(format!(
                "model input {}x{}",
                d.model_in_w, d.model_in_h
            )));
        }
        let expected = 2 * d.num_bb * d.num_grids.len();
        if d.anchors.len() < expected {
            return Err(DecodeError::NotEnoughAnchors {
                expected,
                actual: d.anchors.len(),
            });
        }
        Ok(d)
    }
}

fn default_model_in() -> u32 {
    416
}

#[derive(Debug, Deserialize)]
struct Sidecar {
    model_type: ModelFamily,
    labels: Vec<String>,
    #[serde(default = "default_model_in")]
    model_in_w: u32,
    #[serde(default = "default_model_in")]
    model_in_h: u32,
    num_bb: usize,
    thresh_prob: f32,
    thresh_nms: f32,
    num_grids: Vec<usize>,
    anchors: Vec<f64>,
}

impl ModelDescriptor {
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn model_input(&self) -> (u32, u32) {
        (self.model_in_w, self.model_in_h)
    }

    /// Number of `f32` values the output tensor carries.
    pub fn tensor_len(&self) -> usize {
        let per_cell = self.num_bb * (self.labels.len() + 5);
        self.num_grids.iter().map(|g| per_cell * g * g).sum()
    }

    pub fn postprocess(
        &self,
        raw: &[f32],
        image_w: u32,
        image_h: u32,
    ) -> Result<Vec<super::Detection>, DecodeError> {
        super::decode(raw, self, image_w, image_h)
    }

    /// Resolves decode parameters for the package `models_root/name`.
    ///
    /// A JSON sidecar in the package wins; without one the YOLOv3 COCO
    /// convention applies and labels come from a text file.
    pub fn from_package(
        models_root: &Path,
        name: &str,
        containment_epsilon: f32,
    ) -> Result<Self, DecodeError> {
        let package = models_root.join(name);
        let mut builder = ModelDescriptorBuilder::default();
        builder.containment_epsilon(containment_epsilon);

        if let Some(path) = find_sidecar(&package, name)? {
            let text = fs::read_to_string(&path).map_err(|source| DecodeError::Io {
                path: path.clone(),
                source,
            })?;
            let sidecar: Sidecar = serde_json::from_str(&text)
                .map_err(|source| DecodeError::Sidecar { path, source })?;
            return builder
                .family(sidecar.model_type)
                .labels(sidecar.labels)
                .model_in_w(sidecar.model_in_w)
                .model_in_h(sidecar.model_in_h)
                .num_bb(sidecar.num_bb)
                .thresh_prob(sidecar.thresh_prob)
                .thresh_nms(sidecar.thresh_nms)
                .num_grids(sidecar.num_grids)
                .anchors(sidecar.anchors)
                .build_and_validate();
        }

        let candidates = [
            models_root.join(format!("{}.txt", name)),
            package.join(LABELS_FILENAME),
            package.join(COCO_LABELS_FILENAME),
        ];
        for path in candidates {
            if path.is_file() {
                log::debug!(
                    target: "edgestream::detection",
                    "Loading labels of model {} from {}",
                    name,
                    path.display()
                );
                return builder.labels(load_labels(&path)?).build_and_validate();
            }
        }
        Err(DecodeError::NoLabels)
    }
}

fn find_sidecar(package: &Path, name: &str) -> Result<Option<PathBuf>, DecodeError> {
    let named = package.join(format!("{}.json", name));
    if named.is_file() {
        return Ok(Some(named));
    }
    let entries = fs::read_dir(package).map_err(|source| DecodeError::Io {
        path: package.to_path_buf(),
        source,
    })?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

/// One label per line.
pub fn load_labels(path: &Path) -> Result<Vec<String>, DecodeError> {
    let text = fs::read_to_string(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.lines().map(|l| l.to_string()).collect())
}
