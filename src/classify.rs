//! Tiered frontal-face decision.
//!
//! Only yaw and pitch gate frontality. Roll bounds exist in every tier but
//! default far above any real head tilt and are carried for diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pose::PoseEstimate;

/// Strictness levels, strictest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    /// Evaluation order for [`classify_level`].
    pub const ORDER: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest absolute angles, in degrees, a tier admits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBounds {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl TierBounds {
    pub const fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Inclusive yaw/pitch test used to grade a tier.
    pub fn admits(&self, yaw: f64, pitch: f64) -> bool {
        yaw.abs() <= self.yaw && pitch.abs() <= self.pitch
    }

    fn contains(&self, inner: &TierBounds) -> bool {
        inner.yaw <= self.yaw && inner.pitch <= self.pitch && inner.roll <= self.roll
    }

    fn is_sane(&self) -> bool {
        [self.yaw, self.pitch, self.roll]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }
}

/// Three nested tiers. `low` is the acceptance gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdProfile {
    pub high: TierBounds,
    pub medium: TierBounds,
    pub low: TierBounds,
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        Self {
            high: TierBounds::new(1.0, 11.0, 1000.0),
            medium: TierBounds::new(7.0, 16.0, 1000.0),
            low: TierBounds::new(12.0, 19.0, 1000.0),
        }
    }
}

impl ThresholdProfile {
    pub fn tier(&self, tier: Tier) -> &TierBounds {
        match tier {
            Tier::High => &self.high,
            Tier::Medium => &self.medium,
            Tier::Low => &self.low,
        }
    }

    /// Bounds must be positive and nest: high inside medium inside low.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ORDER {
            if !self.tier(tier).is_sane() {
                return Err(Error::Config(format!(
                    "{tier} tier bounds must be finite and positive: {:?}",
                    self.tier(tier)
                )));
            }
        }
        if !self.medium.contains(&self.high) || !self.low.contains(&self.medium) {
            return Err(Error::Config(
                "threshold tiers must nest: high <= medium <= low".into(),
            ));
        }
        Ok(())
    }
}

/// Whether the pose passes the `low` tier. Roll is checked too but its
/// default bound never binds.
pub fn is_frontal(pose: &PoseEstimate, profile: &ThresholdProfile) -> bool {
    let Some(angles) = pose.angles() else {
        return false;
    };
    if angles.gimbal_locked {
        return false;
    }
    let low = &profile.low;
    angles.roll.abs() < low.roll && angles.pitch.abs() < low.pitch && angles.yaw.abs() < low.yaw
}

/// First tier, strictest first, whose yaw/pitch bounds hold.
pub fn classify_level(yaw: f64, pitch: f64, profile: &ThresholdProfile) -> Option<Tier> {
    Tier::ORDER
        .into_iter()
        .find(|tier| profile.tier(*tier).admits(yaw, pitch))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub is_frontal: bool,
    /// Set only for frontal faces.
    pub level: Option<Tier>,
    pub pose: PoseEstimate,
}

pub fn classify(pose: &PoseEstimate, profile: &ThresholdProfile) -> ClassificationResult {
    let frontal = is_frontal(pose, profile);
    let level = match pose.angles() {
        Some(angles) if frontal => classify_level(angles.yaw, angles.pitch, profile),
        _ => None,
    };
    ClassificationResult {
        is_frontal: frontal,
        level,
        pose: *pose,
    }
}
