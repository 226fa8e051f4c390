//! Grid plan definitions for XYZ parameter sweeps.
//!
//! A plan has an X axis and optional Y and Z axes. Each cell of the grid is
//! one image: the combination of one value from every axis. Cells are
//! enumerated in scan order (X fastest, then Y, then Z).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of an axis value label before truncation.
const MAX_LABEL_LEN: usize = 40;

// ---------------------------------------------------------------------------
// Axes
// ---------------------------------------------------------------------------

/// What an axis varies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    Checkpoint,
    Prompt,
    Steps,
    Cfg,
    Sampler,
    Seed,
    Vae,
    Lora,
    Custom(String),
}

impl AxisKind {
    pub fn name(&self) -> &str {
        match self {
            AxisKind::Checkpoint => "checkpoint",
            AxisKind::Prompt => "prompt",
            AxisKind::Steps => "steps",
            AxisKind::Cfg => "cfg",
            AxisKind::Sampler => "sampler",
            AxisKind::Seed => "seed",
            AxisKind::Vae => "vae",
            AxisKind::Lora => "lora",
            AxisKind::Custom(name) => name,
        }
    }
}

/// A positive/negative prompt pair gathered by the input-collection node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive: String,
    pub negative: String,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

/// One value along an axis, with the label shown in the grid header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisValue {
    pub label: String,
    pub value: serde_json::Value,
}

impl AxisValue {
    pub fn new(label: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }

    /// A value whose label is the string itself.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            label: truncate_label(&value),
            value: serde_json::Value::String(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    /// Identifier used as the key in progress labels (e.g. `"x"`).
    pub id: String,
    pub kind: AxisKind,
    pub values: Vec<AxisValue>,
}

impl GridAxis {
    pub fn new(id: impl Into<String>, kind: AxisKind, values: Vec<AxisValue>) -> Self {
        Self {
            id: id.into(),
            kind,
            values,
        }
    }

    /// An axis of plain string values (checkpoint names, sampler names...).
    pub fn from_strings<I, S>(id: impl Into<String>, kind: AxisKind, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(id, kind, values.into_iter().map(AxisValue::text).collect())
    }

    /// A prompt axis built from the collected prompt pairs, in order.
    ///
    /// Each label is the positive prompt, truncated for display.
    pub fn prompts(id: impl Into<String>, pairs: Vec<PromptPair>) -> Self {
        let values = pairs
            .into_iter()
            .map(|pair| {
                let label = truncate_label(&pair.positive);
                AxisValue::new(
                    label,
                    serde_json::json!({
                        "positive": pair.positive,
                        "negative": pair.negative,
                    }),
                )
            })
            .collect();
        Self::new(id, AxisKind::Prompt, values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn truncate_label(text: &str) -> String {
    if text.chars().count() <= MAX_LABEL_LEN {
        return text.to_string();
    }
    let mut label: String = text.chars().take(MAX_LABEL_LEN - 3).collect();
    label.push_str("...");
    label
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPlan {
    pub x: GridAxis,
    pub y: Option<GridAxis>,
    pub z: Option<GridAxis>,
}

/// One image of the grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridCell {
    /// Position in scan order.
    pub index: usize,
    pub x: usize,
    pub y: usize,
    pub z: usize,
    /// Axis id -> value label, used as the progress tracker's current labels.
    pub labels: BTreeMap<String, String>,
    /// Axis kind -> raw value.
    #[serde(skip)]
    values: Vec<(AxisKind, serde_json::Value)>,
}

impl GridCell {
    /// The raw value for the axis of `kind`, if the plan has one.
    pub fn value(&self, kind: &AxisKind) -> Option<&serde_json::Value> {
        self.values
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| v)
    }

    /// The string value for the axis of `kind` (e.g. a checkpoint name).
    pub fn resource(&self, kind: &AxisKind) -> Option<&str> {
        self.value(kind).and_then(serde_json::Value::as_str)
    }
}

impl GridPlan {
    pub fn new(x: GridAxis) -> Self {
        Self { x, y: None, z: None }
    }

    pub fn with_y(mut self, y: GridAxis) -> Self {
        self.y = Some(y);
        self
    }

    pub fn with_z(mut self, z: GridAxis) -> Self {
        self.z = Some(z);
        self
    }

    pub fn axes(&self) -> impl Iterator<Item = &GridAxis> {
        std::iter::once(&self.x).chain(self.y.iter()).chain(self.z.iter())
    }

    /// Validate a plan.
    ///
    /// Rules:
    /// - Every present axis must have at least one value.
    /// - Axis ids must be non-empty and unique.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut ids = HashSet::new();
        for axis in self.axes() {
            if axis.id.is_empty() {
                return Err(CoreError::Validation("Axis id must not be empty".to_string()));
            }
            if axis.is_empty() {
                return Err(CoreError::Validation(format!(
                    "Axis '{}' must have at least one value",
                    axis.id
                )));
            }
            if !ids.insert(axis.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate axis id '{}'",
                    axis.id
                )));
            }
        }
        Ok(())
    }

    /// Number of images the plan produces.
    pub fn total_images(&self) -> usize {
        self.axes().map(GridAxis::len).product()
    }

    /// Enumerate every cell in scan order.
    pub fn cells(&self) -> Vec<GridCell> {
        let ny = self.y.as_ref().map_or(1, GridAxis::len);
        let nz = self.z.as_ref().map_or(1, GridAxis::len);
        let mut cells = Vec::with_capacity(self.total_images());

        for z in 0..nz {
            for y in 0..ny {
                for x in 0..self.x.len() {
                    let mut labels = BTreeMap::new();
                    let mut values = Vec::with_capacity(3);
                    let placed = [
                        (Some(&self.x), x),
                        (self.y.as_ref(), y),
                        (self.z.as_ref(), z),
                    ];
                    for (axis, pos) in placed {
                        if let Some(axis) = axis {
                            let v = &axis.values[pos];
                            labels.insert(axis.id.clone(), v.label.clone());
                            values.push((axis.kind.clone(), v.value.clone()));
                        }
                    }
                    cells.push(GridCell {
                        index: cells.len(),
                        x,
                        y,
                        z,
                        labels,
                        values,
                    });
                }
            }
        }
        cells
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
