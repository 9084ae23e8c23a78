use std::collections::BTreeMap;

use image::GrayImage;
use log::debug;
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::classifier::{fill_probabilities, FillClassifier};
use crate::grid::QuestionGroup;
use crate::types::{Center, QuestionNumber};

/// Questions left for a human, with the raw probability of each choice.
pub type AmbiguityMap = BTreeMap<QuestionNumber, Vec<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    /// How far the top choice must lead every other choice.
    pub margin: f32,
    /// Probability above which a lone bubble (name block) counts as filled.
    pub fill_threshold: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            margin: 0.2,
            fill_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("question {question} has {found} bubbles, expected {expected}")]
    GroupSize {
        question: QuestionNumber,
        expected: usize,
        found: usize,
    },
    #[error("{centers} centers but {decisions} fill decisions")]
    Parity { centers: usize, decisions: usize },
}

/// Index of the choice that beats every other one by more than `margin`, or
/// `None` when the group is ambiguous.
pub fn decisive_choice(probabilities: &[f32], margin: f32) -> Option<usize> {
    let (winner, max) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, b)) if b >= p => best,
            _ => Some((i, p)),
        })?;
    probabilities
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != winner)
        .all(|(_, p)| max - p > margin)
        .then_some(winner)
}

/// Fill decisions for one group: exactly one `true` for a decisive group,
/// all `false` otherwise.
pub fn resolve_group(probabilities: &[f32], margin: f32) -> (Vec<bool>, bool) {
    match decisive_choice(probabilities, margin) {
        Some(winner) => ((0..probabilities.len()).map(|i| i == winner).collect(), false),
        None => (vec![false; probabilities.len()], true),
    }
}

/// Decisions for the whole questions block, ordered by question number.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedAnswers {
    pub centers: Vec<Center>,
    pub filled: Vec<bool>,
    pub ambiguous: AmbiguityMap,
}

#[time]
pub fn resolve_questions(
    block: &GrayImage,
    groups: &[QuestionGroup],
    choices: usize,
    classifier: &dyn FillClassifier,
    config: &ResolverConfig,
) -> Result<ResolvedAnswers, ResolveError> {
    let mut resolved = ResolvedAnswers::default();
    let mut ordered = groups.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|g| g.question);

    for group in ordered {
        if group.centers.len() != choices {
            return Err(ResolveError::GroupSize {
                question: group.question,
                expected: choices,
                found: group.centers.len(),
            });
        }
        let probabilities = fill_probabilities(block, &group.centers, classifier);
        let (decisions, ambiguous) = resolve_group(&probabilities, config.margin);
        if ambiguous {
            debug!("question {} is ambiguous: {:?}", group.question, probabilities);
            resolved.ambiguous.insert(group.question, probabilities);
        }
        resolved.filled.extend(decisions);
        resolved.centers.extend_from_slice(&group.centers);
    }

    if resolved.filled.len() != resolved.centers.len() {
        return Err(ResolveError::Parity {
            centers: resolved.centers.len(),
            decisions: resolved.filled.len(),
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DarknessClassifier;
    use crate::image_utils::{BLACK, WHITE};
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};
    use proptest::prelude::*;

    #[test]
    fn clear_winner_is_filled() {
        assert_eq!(
            resolve_group(&[0.9, 0.1, 0.05, 0.05], 0.2),
            (vec![true, false, false, false], false)
        );
    }

    #[test]
    fn close_call_abstains() {
        assert_eq!(
            resolve_group(&[0.55, 0.50, 0.1, 0.1], 0.2),
            (vec![false; 4], true)
        );
    }

    #[test]
    fn ties_and_flat_groups_are_ambiguous() {
        assert_eq!(decisive_choice(&[0.8, 0.8, 0.0, 0.0], 0.2), None);
        assert_eq!(decisive_choice(&[0.0; 4], 0.2), None);
        assert_eq!(decisive_choice(&[0.1, 0.1, 0.95, 0.1], 0.2), Some(2));
    }

    #[test]
    fn resolves_a_small_block_in_question_order() {
        let mut block = GrayImage::from_pixel(220, 100, WHITE);
        let row = |y: i32| (0..4).map(|i| Center::new(30 + i * 40, y)).collect::<Vec<_>>();
        let q1 = row(30);
        let q2 = row(70);
        for c in q1.iter().chain(&q2) {
            draw_hollow_circle_mut(&mut block, (c.x, c.y), 13, BLACK);
        }
        draw_filled_circle_mut(&mut block, (q1[2].x, q1[2].y), 12, BLACK);
        draw_filled_circle_mut(&mut block, (q2[0].x, q2[0].y), 12, BLACK);
        draw_filled_circle_mut(&mut block, (q2[3].x, q2[3].y), 12, BLACK);

        let groups = vec![
            QuestionGroup {
                question: 2,
                centers: q2.clone(),
            },
            QuestionGroup {
                question: 1,
                centers: q1.clone(),
            },
        ];
        let resolved = resolve_questions(
            &block,
            &groups,
            4,
            &DarknessClassifier::default(),
            &ResolverConfig::default(),
        )
        .unwrap();

        assert_eq!(resolved.centers[..4], q1[..]);
        assert_eq!(
            resolved.filled,
            vec![false, false, true, false, false, false, false, false]
        );
        assert_eq!(resolved.ambiguous.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(resolved.ambiguous[&2].len(), 4);
    }

    #[test]
    fn wrong_group_size_is_an_error() {
        let block = GrayImage::from_pixel(50, 50, WHITE);
        let groups = vec![QuestionGroup {
            question: 7,
            centers: vec![Center::new(25, 25); 3],
        }];
        assert_eq!(
            resolve_questions(
                &block,
                &groups,
                4,
                &DarknessClassifier::default(),
                &ResolverConfig::default()
            ),
            Err(ResolveError::GroupSize {
                question: 7,
                expected: 4,
                found: 3
            })
        );
    }

    proptest! {
        #[test]
        fn at_most_one_choice_and_ambiguity_matches_margin(
            probabilities in proptest::collection::vec(0.0f32..=1.0, 4),
            margin in 0.0f32..0.5,
        ) {
            let (filled, ambiguous) = resolve_group(&probabilities, margin);
            let marked = filled.iter().filter(|f| **f).count();
            prop_assert!(marked <= 1);
            prop_assert_eq!(ambiguous, marked == 0);

            let someone_dominates = (0..4).any(|i| {
                (0..4).filter(|&j| j != i).all(|j| probabilities[i] - probabilities[j] > margin)
            });
            prop_assert_eq!(ambiguous, !someone_dominates);
        }
    }
}
