//! Per-class decision thresholds.
//!
//! A detection only counts as a defect when its confidence reaches the
//! threshold configured for its class and its box covers at least the class
//! minimum area. Unconfigured classes fall back to [`DEFAULT_CLASS_CONFIDENCE`]
//! and no size filter. Detections below the model-level floor never leave the
//! worker that produced them.
//!
//! Two optional rules refine this per camera view. A [`LocatorGate`] only lets
//! a defect count when it sits on a confidently located roller in the same
//! view. A [`HeadRule`] measures how far the roller head box is inset within
//! the roller box and flags high or down heads against per-roller-type limits.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detection::{BoundingRegion, Detection, RawDetection};

pub const DEFAULT_CLASS_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_MODEL_CONFIDENCE: f32 = 0.25;
pub const HIGH_HEAD_CLASS: &str = "high_head";
pub const DOWN_HEAD_CLASS: &str = "down_head";

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("malformed threshold entry {0:?}, expected `class:value`")]
    Malformed(String),
    #[error("threshold for {class:?} is not a number: {value:?}")]
    NotANumber { class: String, value: String },
    #[error("confidence for {class:?} must be within 0..=1, got {value}")]
    ConfidenceRange { class: String, value: f32 },
    #[error("minimum area for {class:?} must not be negative, got {value}")]
    NegativeArea { class: String, value: f32 },
    #[error("head limits {name:?} need 0 <= high_head_px <= down_head_px, got {high} and {down}")]
    HeadLimits { name: String, high: f32, down: f32 },
    #[error("roller type {0:?} has no head limits")]
    UnknownRollerType(String),
    #[error("{0} class name must not be empty")]
    EmptyClass(&'static str),
}

/// Defects only count when they sit on a confidently located roller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorGate {
    pub class: String,
    /// Locator detections must be strictly above this confidence.
    pub min_confidence: f32,
}

impl Default for LocatorGate {
    fn default() -> Self {
        Self {
            class: "roller".to_string(),
            min_confidence: 0.8,
        }
    }
}

impl LocatorGate {
    pub fn locates(&self, detection: &Detection) -> bool {
        detection.defect_class == self.class && detection.confidence > self.min_confidence
    }
}

/// Acceptable head inset for one roller type, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadLimits {
    /// Insets below this are a high head.
    pub high_head_px: f32,
    /// Insets above this are a down head.
    pub down_head_px: f32,
}

impl Default for HeadLimits {
    fn default() -> Self {
        Self {
            high_head_px: 180.0,
            down_head_px: 240.0,
        }
    }
}

impl HeadLimits {
    fn validate(&self, name: &str) -> Result<(), ThresholdError> {
        if self.high_head_px >= 0.0 && self.high_head_px <= self.down_head_px {
            Ok(())
        } else {
            Err(ThresholdError::HeadLimits {
                name: name.to_string(),
                high: self.high_head_px,
                down: self.down_head_px,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadType {
    High,
    Normal,
    Down,
}

impl HeadType {
    /// Defect class reported for an out-of-limit head.
    pub fn defect_class(self) -> Option<&'static str> {
        match self {
            HeadType::High => Some(HIGH_HEAD_CLASS),
            HeadType::Normal => None,
            HeadType::Down => Some(DOWN_HEAD_CLASS),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadRule {
    pub head_class: String,
    pub roller_class: String,
    /// Limits used when no roller type is selected.
    pub limits: HeadLimits,
    pub roller_types: BTreeMap<String, HeadLimits>,
    pub roller_type: Option<String>,
}

impl Default for HeadRule {
    fn default() -> Self {
        Self {
            head_class: "head".to_string(),
            roller_class: "roller".to_string(),
            limits: HeadLimits::default(),
            roller_types: BTreeMap::new(),
            roller_type: None,
        }
    }
}

impl HeadRule {
    pub fn active_limits(&self) -> HeadLimits {
        self.roller_type
            .as_ref()
            .and_then(|name| self.roller_types.get(name))
            .copied()
            .unwrap_or(self.limits)
    }

    /// Mean of the horizontal and vertical margins between the roller box
    /// and the head box.
    pub fn inset_px(roller: &BoundingRegion, head: &BoundingRegion) -> f32 {
        let horizontal = (roller.width() - head.width()) / 2.0;
        let vertical = (roller.height() - head.height()) / 2.0;
        (horizontal + vertical) / 2.0
    }

    /// Classify one view. `None` unless both a head and a roller box are
    /// present; the most confident of each is used.
    pub fn classify(&self, view: &[&Detection]) -> Option<(HeadType, f32)> {
        let best = |class: &str| {
            view.iter()
                .copied()
                .filter(|detection| detection.defect_class == class)
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        };
        let head = best(self.head_class.as_str())?;
        let roller = best(self.roller_class.as_str())?;
        let inset = Self::inset_px(&roller.region, &head.region);
        let limits = self.active_limits();
        let head_type = if inset < limits.high_head_px {
            HeadType::High
        } else if inset > limits.down_head_px {
            HeadType::Down
        } else {
            HeadType::Normal
        };
        Some((head_type, inset))
    }

    fn validate(&self) -> Result<(), ThresholdError> {
        if self.head_class.is_empty() {
            return Err(ThresholdError::EmptyClass("head"));
        }
        if self.roller_class.is_empty() {
            return Err(ThresholdError::EmptyClass("roller"));
        }
        self.limits.validate("<default>")?;
        for (name, limits) in &self.roller_types {
            limits.validate(name)?;
        }
        match &self.roller_type {
            Some(name) if !self.roller_types.contains_key(name) => {
                Err(ThresholdError::UnknownRollerType(name.clone()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdProfile {
    /// Floor applied by the detector workers before aggregation.
    pub model_confidence: f32,
    /// Threshold for classes absent from `class_confidence`.
    pub default_confidence: f32,
    pub class_confidence: BTreeMap<String, f32>,
    /// Minimum box area in px², per class.
    pub class_min_area: BTreeMap<String, f32>,
    /// Classes the model reports that are not defects (locators, fixtures).
    pub ignored_classes: BTreeSet<String>,
    pub locator: Option<LocatorGate>,
    pub head: Option<HeadRule>,
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        Self {
            model_confidence: DEFAULT_MODEL_CONFIDENCE,
            default_confidence: DEFAULT_CLASS_CONFIDENCE,
            class_confidence: BTreeMap::new(),
            class_min_area: BTreeMap::new(),
            ignored_classes: BTreeSet::new(),
            locator: None,
            head: None,
        }
    }
}

impl ThresholdProfile {
    pub fn with_class(mut self, class: impl Into<String>, confidence: f32) -> Self {
        self.class_confidence.insert(class.into(), confidence);
        self
    }

    pub fn with_min_area(mut self, class: impl Into<String>, area: f32) -> Self {
        self.class_min_area.insert(class.into(), area);
        self
    }

    pub fn confidence_for(&self, class: &str) -> f32 {
        self.class_confidence
            .get(class)
            .copied()
            .unwrap_or(self.default_confidence)
    }

    pub fn min_area_for(&self, class: &str) -> f32 {
        self.class_min_area.get(class).copied().unwrap_or(0.0)
    }

    pub fn passes_model_floor(&self, detection: &RawDetection) -> bool {
        detection.confidence >= self.model_confidence
    }

    /// Classes that describe the roller itself rather than a defect.
    fn is_structural(&self, class: &str) -> bool {
        self.ignored_classes.contains(class)
            || self.locator.as_ref().is_some_and(|gate| gate.class == class)
            || self
                .head
                .as_ref()
                .is_some_and(|rule| rule.head_class == class || rule.roller_class == class)
    }

    /// Whether `detection` is a defect under this profile, ignoring the
    /// per-view rules.
    pub fn is_defect(&self, detection: &Detection) -> bool {
        let class = detection.defect_class.as_str();
        !self.is_structural(class)
            && detection.confidence >= self.confidence_for(class)
            && detection.region.area() >= self.min_area_for(class)
    }

    /// Defect classes found in the detections of one camera view.
    pub fn view_defects(&self, view: &[&Detection]) -> BTreeSet<String> {
        let locators: Option<Vec<&BoundingRegion>> = self.locator.as_ref().map(|gate| {
            view.iter()
                .filter(|detection| gate.locates(detection))
                .map(|detection| &detection.region)
                .collect()
        });
        let mut classes: BTreeSet<String> = view
            .iter()
            .filter(|detection| self.is_defect(detection))
            .filter(|detection| match &locators {
                Some(rollers) => rollers
                    .iter()
                    .any(|roller| roller.holds_corner_of(&detection.region)),
                None => true,
            })
            .map(|detection| detection.defect_class.clone())
            .collect();
        if let Some((head_type, _)) = self.head.as_ref().and_then(|rule| rule.classify(view)) {
            if let Some(class) = head_type.defect_class() {
                classes.insert(class.to_string());
            }
        }
        classes
    }

    pub fn validate(&self) -> Result<(), ThresholdError> {
        check_confidence("<model>", self.model_confidence)?;
        check_confidence("<default>", self.default_confidence)?;
        for (class, value) in &self.class_confidence {
            check_confidence(class, *value)?;
        }
        for (class, value) in &self.class_min_area {
            if *value < 0.0 {
                return Err(ThresholdError::NegativeArea {
                    class: class.clone(),
                    value: *value,
                });
            }
        }
        if let Some(gate) = &self.locator {
            if gate.class.is_empty() {
                return Err(ThresholdError::EmptyClass("locator"));
            }
            check_confidence(&gate.class, gate.min_confidence)?;
        }
        if let Some(rule) = &self.head {
            rule.validate()?;
        }
        Ok(())
    }

    /// Parse `"rust:80%, dent:0.9"`. Values above 1 are read as percentages.
    pub fn parse_confidence_list(text: &str) -> Result<BTreeMap<String, f32>, ThresholdError> {
        let mut parsed = BTreeMap::new();
        for (class, raw) in split_pairs(text)? {
            let value = parse_number(&class, raw.trim_end_matches('%'))?;
            let value = if raw.ends_with('%') || value > 1.0 {
                value / 100.0
            } else {
                value
            };
            check_confidence(&class, value)?;
            parsed.insert(class, value);
        }
        Ok(parsed)
    }

    /// Parse `"rust:1000, dent:5000"` as minimum areas in px².
    pub fn parse_area_list(text: &str) -> Result<BTreeMap<String, f32>, ThresholdError> {
        let mut parsed = BTreeMap::new();
        for (class, raw) in split_pairs(text)? {
            let value = parse_number(&class, raw)?;
            if value < 0.0 {
                return Err(ThresholdError::NegativeArea { class, value });
            }
            parsed.insert(class, value);
        }
        Ok(parsed)
    }
}

fn split_pairs(text: &str) -> Result<Vec<(String, &str)>, ThresholdError> {
    text.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((class, value)) if !class.trim().is_empty() => {
                Ok((class.trim().to_string(), value.trim()))
            }
            _ => Err(ThresholdError::Malformed(pair.to_string())),
        })
        .collect()
}

fn parse_number(class: &str, raw: &str) -> Result<f32, ThresholdError> {
    raw.trim()
        .parse::<f32>()
        .map_err(|_| ThresholdError::NotANumber {
            class: class.to_string(),
            value: raw.to_string(),
        })
}

fn check_confidence(class: &str, value: f32) -> Result<(), ThresholdError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ThresholdError::ConfidenceRange {
            class: class.to_string(),
            value,
        })
    }
}
