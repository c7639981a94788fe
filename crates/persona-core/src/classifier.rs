//! Rule set mapping a detection result to a customer profile.
//!
//! Rules are evaluated in order; age rules win over expression rules,
//! which win over the default. The caregiver rule is the only
//! probabilistic branch and draws from the caller's RNG.

use crate::types::{DetectionResult, Expression, Gender, ProfileType};
use rand::Rng;

const ELDERLY_MIN_AGE: f32 = 60.0;
const CHILD_MAX_AGE: f32 = 12.0;
const CAREGIVER_AGE_RANGE: std::ops::RangeInclusive<f32> = 25.0..=40.0;
const CAREGIVER_PROBABILITY: f64 = 0.3;
const DISTRESS_THRESHOLD: f32 = 0.5;

/// Profile assigned to faces that only the low-threshold pass could find.
///
/// A weak box with unreadable features is taken as a worn face covering,
/// and a covering as a sign of a health-conscious visitor. This is a
/// product policy, not something the models infer.
pub const OCCLUSION_PROFILE: ProfileType = ProfileType::AsthmaAllergicPeople;

/// Map a full detection result to a profile.
///
/// Occluded results must not be passed here; they map to
/// [`OCCLUSION_PROFILE`] directly.
pub fn classify<R: Rng + ?Sized>(result: &DetectionResult, rng: &mut R) -> ProfileType {
    if let Some(age) = result.age {
        if age > ELDERLY_MIN_AGE {
            return ProfileType::ElderlyPeople;
        }
        if age < CHILD_MAX_AGE {
            return ProfileType::FamiliesWithBabies;
        }
        if CAREGIVER_AGE_RANGE.contains(&age)
            && result.gender == Gender::Female
            && rng.gen_bool(CAREGIVER_PROBABILITY)
        {
            return ProfileType::FamiliesWithBabies;
        }
    }

    let expr = &result.expressions;
    if expr.get(Expression::Sad) > DISTRESS_THRESHOLD
        || expr.get(Expression::Fearful) > DISTRESS_THRESHOLD
    {
        return ProfileType::AsthmaAllergicPeople;
    }

    ProfileType::WorkFromHomeAdult
}

/// Pick a profile uniformly at random.
pub fn random_profile<R: Rng + ?Sized>(rng: &mut R) -> ProfileType {
    ProfileType::ALL[rng.gen_range(0..ProfileType::ALL.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, ExpressionScores};
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn result(age: f32, gender: Gender, expr: &[(Expression, f32)]) -> DetectionResult {
        DetectionResult {
            age: Some(age),
            gender,
            expressions: expr.iter().copied().collect(),
            confidence: Confidence::High,
        }
    }

    /// Always takes the 30% branch.
    fn always() -> StepRng {
        StepRng::new(0, 0)
    }

    /// Never takes the 30% branch.
    fn never() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }

    #[test]
    fn test_elderly_wins_over_expressions() {
        for gender in [Gender::Male, Gender::Female, Gender::Neutral] {
            let r = result(70.0, gender, &[(Expression::Sad, 0.9), (Expression::Fearful, 0.9)]);
            assert_eq!(classify(&r, &mut always()), ProfileType::ElderlyPeople);
            assert_eq!(classify(&r, &mut never()), ProfileType::ElderlyPeople);
        }
    }

    #[test]
    fn test_child_is_family() {
        let r = result(8.0, Gender::Male, &[(Expression::Sad, 0.9)]);
        assert_eq!(classify(&r, &mut never()), ProfileType::FamiliesWithBabies);
        let r = result(8.0, Gender::Female, &[]);
        assert_eq!(classify(&r, &mut never()), ProfileType::FamiliesWithBabies);
    }

    #[test]
    fn test_sad_adult_is_health_conscious() {
        let r = result(30.0, Gender::Male, &[(Expression::Sad, 0.9)]);
        assert_eq!(classify(&r, &mut always()), ProfileType::AsthmaAllergicPeople);
    }

    #[test]
    fn test_fearful_adult_is_health_conscious() {
        let r = result(45.0, Gender::Female, &[(Expression::Fearful, 0.6)]);
        assert_eq!(classify(&r, &mut never()), ProfileType::AsthmaAllergicPeople);
    }

    #[test]
    fn test_default_profile() {
        let r = result(30.0, Gender::Male, &[(Expression::Sad, 0.1), (Expression::Fearful, 0.1)]);
        assert_eq!(classify(&r, &mut always()), ProfileType::WorkFromHomeAdult);
    }

    #[test]
    fn test_distress_threshold_is_exclusive() {
        let r = result(30.0, Gender::Male, &[(Expression::Sad, 0.5)]);
        assert_eq!(classify(&r, &mut never()), ProfileType::WorkFromHomeAdult);
    }

    #[test]
    fn test_age_boundaries() {
        let r = result(60.0, Gender::Male, &[]);
        assert_eq!(classify(&r, &mut never()), ProfileType::WorkFromHomeAdult);
        let r = result(12.0, Gender::Male, &[]);
        assert_eq!(classify(&r, &mut never()), ProfileType::WorkFromHomeAdult);
    }

    #[test]
    fn test_caregiver_branch_uses_rng() {
        for age in [25.0, 32.0, 40.0] {
            let r = result(age, Gender::Female, &[(Expression::Sad, 0.9)]);
            assert_eq!(classify(&r, &mut always()), ProfileType::FamiliesWithBabies);
            assert_eq!(classify(&r, &mut never()), ProfileType::AsthmaAllergicPeople);
        }
    }

    #[test]
    fn test_caregiver_branch_requires_female_in_range() {
        let male = result(30.0, Gender::Male, &[]);
        assert_eq!(classify(&male, &mut always()), ProfileType::WorkFromHomeAdult);
        let older = result(41.0, Gender::Female, &[]);
        assert_eq!(classify(&older, &mut always()), ProfileType::WorkFromHomeAdult);
        let younger = result(24.0, Gender::Female, &[]);
        assert_eq!(classify(&younger, &mut always()), ProfileType::WorkFromHomeAdult);
    }

    #[test]
    fn test_caregiver_branch_rate() {
        let mut rng = StdRng::seed_from_u64(7);
        let r = result(30.0, Gender::Female, &[]);
        let hits = (0..10_000)
            .filter(|_| classify(&r, &mut rng) == ProfileType::FamiliesWithBabies)
            .count();
        assert!((2_700..3_300).contains(&hits), "caregiver hits: {hits}");
    }

    #[test]
    fn test_unknown_age_skips_age_rules() {
        let r = DetectionResult {
            age: None,
            gender: Gender::Female,
            expressions: ExpressionScores::default(),
            confidence: Confidence::High,
        };
        assert_eq!(classify(&r, &mut always()), ProfileType::WorkFromHomeAdult);
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let r = result(33.0, Gender::Female, &[(Expression::Happy, 0.8)]);
        let a: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..50).map(|_| classify(&r, &mut rng)).collect()
        };
        let b: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..50).map(|_| classify(&r, &mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_profile_covers_all() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut counts = [0usize; 4];
        for _ in 0..4_000 {
            let p = random_profile(&mut rng);
            let idx = ProfileType::ALL.iter().position(|&q| q == p).unwrap();
            counts[idx] += 1;
        }
        assert!(counts.iter().all(|&c| c > 800), "counts: {counts:?}");
    }
}
