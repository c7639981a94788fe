use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Clamp the box to a `width` × `height` frame. Returns `None` if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = self.right().min(width as f32);
        let y2 = self.bottom().min(height as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        Some(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: self.confidence,
        })
    }
}

/// Estimated gender. `Neutral` is only produced for degraded (occluded) results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Neutral,
}

/// Facial expression classes, in the output order of the expression net.
///
/// `Occluded` is a sentinel that never comes out of the net; it marks a
/// face whose features could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
    Occluded,
}

impl Expression {
    /// Classes produced by the expression net, index-aligned with its output.
    pub const NET_CLASSES: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];
}

/// Probability distribution over expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpressionScores(BTreeMap<Expression, f32>);

impl ExpressionScores {
    /// Build from net probabilities, index-aligned with [`Expression::NET_CLASSES`].
    pub fn from_probabilities(probs: &[f32]) -> Self {
        Self(
            Expression::NET_CLASSES
                .iter()
                .zip(probs.iter())
                .map(|(&e, &p)| (e, p))
                .collect(),
        )
    }

    /// The single-entry distribution used for occluded faces.
    pub fn occluded() -> Self {
        Self(BTreeMap::from([(Expression::Occluded, 1.0)]))
    }

    /// Probability of `expression`, 0.0 if absent.
    pub fn get(&self, expression: Expression) -> f32 {
        self.0.get(&expression).copied().unwrap_or(0.0)
    }

    pub fn is_occluded(&self) -> bool {
        self.0.contains_key(&Expression::Occluded)
    }

    /// The `n` most likely expressions, highest first.
    pub fn top(&self, n: usize) -> Vec<(Expression, f32)> {
        let mut entries: Vec<(Expression, f32)> = self.0.iter().map(|(&e, &p)| (e, p)).collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(n);
        entries
    }

    pub fn total(&self) -> f32 {
        self.0.values().sum()
    }
}

impl FromIterator<(Expression, f32)> for ExpressionScores {
    fn from_iter<I: IntoIterator<Item = (Expression, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How much of the face the detection cascade could read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Primary pass: landmarks and attributes available.
    High,
    /// Low-threshold pass: bounding box only.
    Low,
    /// No inference backed the result.
    None,
}

/// Output of the primary detection pass: the face plus all attribute nets.
#[derive(Debug, Clone)]
pub struct FaceAnalysis {
    pub face: BoundingBox,
    /// 68-point landmarks in frame coordinates.
    pub landmarks: Vec<(f32, f32)>,
    pub expressions: ExpressionScores,
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

/// Structured result of one scan attempt, consumed once by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub age: Option<f32>,
    pub gender: Gender,
    pub expressions: ExpressionScores,
    pub confidence: Confidence,
}

impl DetectionResult {
    /// Synthesized result for a face found only by the low-threshold pass.
    pub fn occluded() -> Self {
        Self {
            age: None,
            gender: Gender::Neutral,
            expressions: ExpressionScores::occluded(),
            confidence: Confidence::Low,
        }
    }

    /// Age rounded to whole years, for display.
    pub fn rounded_age(&self) -> Option<u32> {
        self.age.map(|a| a.round().max(0.0) as u32)
    }
}

impl From<&FaceAnalysis> for DetectionResult {
    fn from(analysis: &FaceAnalysis) -> Self {
        Self {
            age: Some(analysis.age),
            gender: analysis.gender,
            expressions: analysis.expressions.clone(),
            confidence: Confidence::High,
        }
    }
}

/// Customer-profile categories used to personalize downstream content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileType {
    #[serde(rename = "Work from Home Adult")]
    WorkFromHomeAdult,
    #[serde(rename = "Elderly People")]
    ElderlyPeople,
    #[serde(rename = "Families with Babies")]
    FamiliesWithBabies,
    #[serde(rename = "Asthma/Allergic People")]
    AsthmaAllergicPeople,
}

impl ProfileType {
    pub const ALL: [ProfileType; 4] = [
        ProfileType::WorkFromHomeAdult,
        ProfileType::ElderlyPeople,
        ProfileType::FamiliesWithBabies,
        ProfileType::AsthmaAllergicPeople,
    ];

    /// Display name, also the string handed to downstream consumers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::WorkFromHomeAdult => "Work from Home Adult",
            ProfileType::ElderlyPeople => "Elderly People",
            ProfileType::FamiliesWithBabies => "Families with Babies",
            ProfileType::AsthmaAllergicPeople => "Asthma/Allergic People",
        }
    }

    /// Short command-line identifier.
    pub fn slug(&self) -> &'static str {
        match self {
            ProfileType::WorkFromHomeAdult => "work-from-home",
            ProfileType::ElderlyPeople => "elderly",
            ProfileType::FamiliesWithBabies => "families",
            ProfileType::AsthmaAllergicPeople => "asthma-allergic",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProfileType::WorkFromHomeAdult => "Productivity-focused environment",
            ProfileType::ElderlyPeople => "Comfort and safety focused",
            ProfileType::FamiliesWithBabies => "Gentle and quiet environment",
            ProfileType::AsthmaAllergicPeople => "Health-conscious environment",
        }
    }

    /// Environment traits this profile cares about.
    pub fn characteristics(&self) -> &'static str {
        match self {
            ProfileType::WorkFromHomeAdult => "Needs good lighting and cool temp",
            ProfileType::ElderlyPeople => "Warmer temp, easy accessibility",
            ProfileType::FamiliesWithBabies => "Soft lighting, stable humidity",
            ProfileType::AsthmaAllergicPeople => "High air quality, low humidity",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown profile: {0}")]
pub struct UnknownProfile(pub String);

impl FromStr for ProfileType {
    type Err = UnknownProfile;

    /// Accepts the slug, the display name (case-insensitive), or a 1-based index.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        if let Ok(n) = needle.parse::<usize>() {
            return n
                .checked_sub(1)
                .and_then(|i| ProfileType::ALL.get(i).copied())
                .ok_or_else(|| UnknownProfile(s.to_string()));
        }
        ProfileType::ALL
            .iter()
            .copied()
            .find(|p| p.slug() == needle || p.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownProfile(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_scores_from_probabilities() {
        let scores = ExpressionScores::from_probabilities(&[0.1, 0.2, 0.3, 0.05, 0.15, 0.1, 0.1]);
        assert!((scores.get(Expression::Sad) - 0.3).abs() < 1e-6);
        assert!((scores.get(Expression::Fearful) - 0.15).abs() < 1e-6);
        assert!((scores.total() - 1.0).abs() < 1e-6);
        assert!(!scores.is_occluded());
    }

    #[test]
    fn test_expression_scores_missing_is_zero() {
        let scores: ExpressionScores = [(Expression::Happy, 1.0)].into_iter().collect();
        assert_eq!(scores.get(Expression::Sad), 0.0);
    }

    #[test]
    fn test_expression_top_sorted() {
        let scores = ExpressionScores::from_probabilities(&[0.1, 0.5, 0.05, 0.05, 0.2, 0.05, 0.05]);
        let top = scores.top(3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].0, Expression::Happy);
        assert_eq!(top[1].0, Expression::Fearful);
        assert_eq!(top[2].0, Expression::Neutral);
    }

    #[test]
    fn test_occluded_result() {
        let result = DetectionResult::occluded();
        assert_eq!(result.age, None);
        assert_eq!(result.gender, Gender::Neutral);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.expressions.is_occluded());
        assert!((result.expressions.total() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_profile_wire_strings() {
        let json = serde_json::to_string(&ProfileType::AsthmaAllergicPeople).unwrap();
        assert_eq!(json, "\"Asthma/Allergic People\"");
        let back: ProfileType = serde_json::from_str("\"Families with Babies\"").unwrap();
        assert_eq!(back, ProfileType::FamiliesWithBabies);
        for p in ProfileType::ALL {
            assert_eq!(serde_json::to_string(&p).unwrap(), format!("\"{}\"", p.as_str()));
        }
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("elderly".parse::<ProfileType>().unwrap(), ProfileType::ElderlyPeople);
        assert_eq!(
            "work from home adult".parse::<ProfileType>().unwrap(),
            ProfileType::WorkFromHomeAdult
        );
        assert_eq!("3".parse::<ProfileType>().unwrap(), ProfileType::FamiliesWithBabies);
        assert!("0".parse::<ProfileType>().is_err());
        assert!("5".parse::<ProfileType>().is_err());
        assert!("astronaut".parse::<ProfileType>().is_err());
    }

    #[test]
    fn test_bbox_clamp() {
        let b = BoundingBox { x: -10.0, y: 5.0, width: 50.0, height: 200.0, confidence: 0.9 };
        let c = b.clamp_to(100, 100).unwrap();
        assert_eq!(c.x, 0.0);
        assert_eq!(c.width, 40.0);
        assert_eq!(c.height, 95.0);

        let outside = BoundingBox { x: 200.0, y: 200.0, width: 10.0, height: 10.0, confidence: 0.9 };
        assert!(outside.clamp_to(100, 100).is_none());
    }
}
