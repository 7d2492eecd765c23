use regex::RegexBuilder;

/// Auto-grading key for a short-answer question. A question may carry an
/// exact-match reference, a full-string regex pattern, both, or neither.
#[derive(Debug, Clone, Default)]
pub struct ShortAnswerKey<'a> {
    pub reference: Option<&'a str>,
    pub pattern: Option<&'a str>,
    pub case_sensitive: bool,
}

/// Grade a short answer against its key.
///
/// Returns `Some(true)`/`Some(false)` when the question is auto-gradable and
/// `None` when it carries neither reference nor pattern (pending manual
/// review). Submitted text is compared exactly as entered; no trimming.
/// A malformed pattern never surfaces as an error, it simply does not match.
pub fn grade_short_answer(key: &ShortAnswerKey<'_>, submitted: &str) -> Option<bool> {
    let mut verdict: Option<bool> = None;

    if let Some(reference) = key.reference {
        verdict = Some(if key.case_sensitive {
            submitted == reference
        } else {
            submitted.to_lowercase() == reference.to_lowercase()
        });
    }

    if verdict != Some(true) {
        if let Some(pattern) = key.pattern {
            verdict = Some(full_match(pattern, submitted, key.case_sensitive));
        }
    }

    verdict
}

/// Full-string regex match. The pattern is anchored so partial matches do
/// not count; an invalid pattern yields false.
fn full_match(pattern: &str, text: &str, case_sensitive: bool) -> bool {
    let anchored = format!("^(?:{})$", pattern);
    match RegexBuilder::new(&anchored)
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Grade a multiple-choice selection. `selected_is_correct` is the stored
/// flag of the chosen option, or `None` when nothing (or an unknown choice)
/// was selected.
pub fn grade_choice(selected_is_correct: Option<bool>) -> bool {
    selected_is_correct.unwrap_or(false)
}

/// Points awarded for one question.
pub fn points_awarded(correct: Option<bool>, points: i64) -> i64 {
    if correct == Some(true) {
        points
    } else {
        0
    }
}

/// Final reported score: automatic points plus the instructor's manual
/// overlay, summed. Never averaged as percentages.
pub fn final_score(auto_score: i64, manual_score: Option<i64>) -> i64 {
    auto_score + manual_score.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(
        reference: Option<&'a str>,
        pattern: Option<&'a str>,
        case_sensitive: bool,
    ) -> ShortAnswerKey<'a> {
        ShortAnswerKey {
            reference,
            pattern,
            case_sensitive,
        }
    }

    #[test]
    fn exact_match_case_insensitive() {
        let k = key(Some("Paris"), None, false);
        assert_eq!(grade_short_answer(&k, "paris"), Some(true));
        assert_eq!(grade_short_answer(&k, "PARIS"), Some(true));
        assert_eq!(grade_short_answer(&k, "London"), Some(false));
    }

    #[test]
    fn exact_match_case_sensitive() {
        let k = key(Some("Paris"), None, true);
        assert_eq!(grade_short_answer(&k, "Paris"), Some(true));
        assert_eq!(grade_short_answer(&k, "paris"), Some(false));
    }

    #[test]
    fn no_trimming_policy() {
        let k = key(Some("Paris"), None, false);
        assert_eq!(grade_short_answer(&k, "PARIS "), Some(false));
        assert_eq!(grade_short_answer(&k, " paris"), Some(false));
    }

    #[test]
    fn regex_full_match_not_substring() {
        let k = key(None, Some(r"\d+"), false);
        assert_eq!(grade_short_answer(&k, "42"), Some(true));
        assert_eq!(grade_short_answer(&k, "42 apples"), Some(false));
        assert_eq!(grade_short_answer(&k, "x42"), Some(false));
    }

    #[test]
    fn regex_case_flag() {
        let k = key(None, Some("h2o|water"), false);
        assert_eq!(grade_short_answer(&k, "H2O"), Some(true));
        let strict = key(None, Some("h2o|water"), true);
        assert_eq!(grade_short_answer(&strict, "H2O"), Some(false));
        assert_eq!(grade_short_answer(&strict, "water"), Some(true));
    }

    #[test]
    fn malformed_pattern_is_incorrect_not_error() {
        let k = key(None, Some(r"([unclosed"), false);
        assert_eq!(grade_short_answer(&k, "anything"), Some(false));
    }

    #[test]
    fn reference_miss_falls_through_to_pattern() {
        let k = key(Some("four"), Some(r"4"), false);
        assert_eq!(grade_short_answer(&k, "four"), Some(true));
        assert_eq!(grade_short_answer(&k, "4"), Some(true));
        assert_eq!(grade_short_answer(&k, "five"), Some(false));
    }

    #[test]
    fn no_mechanism_is_pending() {
        let k = key(None, None, false);
        assert_eq!(grade_short_answer(&k, "essay text"), None);
    }

    #[test]
    fn choice_grading() {
        assert!(grade_choice(Some(true)));
        assert!(!grade_choice(Some(false)));
        assert!(!grade_choice(None));
    }

    #[test]
    fn points_and_final_score() {
        assert_eq!(points_awarded(Some(true), 10), 10);
        assert_eq!(points_awarded(Some(false), 10), 0);
        assert_eq!(points_awarded(None, 10), 0);
        assert_eq!(final_score(7, Some(3)), 10);
        assert_eq!(final_score(7, None), 7);
    }
}
