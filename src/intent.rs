//! Rule-based query intent tagging.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    General,
    Definition,
    Summary,
    Procedure,
    Example,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::General => "general",
            Intent::Definition => "definition",
            Intent::Summary => "summary",
            Intent::Procedure => "procedure",
            Intent::Example => "example",
        }
    }
}

const DEFINITION_CUES: &[&str] = &[
    "what is",
    "define",
    "definition of",
    "meaning of",
    "theorem",
    "lemma",
];
const PROCEDURE_CUES: &[&str] = &["how to", "steps to", "procedure for", "process of"];
const SUMMARY_CUES: &[&str] = &["summary", "overview", "explain chapter", "summarize"];
const EXAMPLE_CUES: &[&str] = &["example", "illustration", "case study", "walkthrough"];

/// Case-insensitive, word-boundary phrase matching; first group wins in
/// the declared order.
pub fn detect(query: &str) -> Intent {
    let q = query.to_lowercase();

    if contains_any_phrase(&q, DEFINITION_CUES) {
        return Intent::Definition;
    }
    if contains_any_phrase(&q, PROCEDURE_CUES) {
        return Intent::Procedure;
    }
    if contains_any_phrase(&q, SUMMARY_CUES) {
        return Intent::Summary;
    }
    if contains_any_phrase(&q, EXAMPLE_CUES) {
        return Intent::Example;
    }
    Intent::General
}

fn contains_any_phrase(haystack: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| contains_phrase(haystack, p))
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(phrase) {
        let at = start + pos;
        let end = at + phrase.len();
        let boundary_before = at == 0
            || !haystack[..at]
                .chars()
                .next_back()
                .map(char::is_alphanumeric)
                .unwrap_or(false);
        let boundary_after = end == haystack.len()
            || !haystack[end..]
                .chars()
                .next()
                .map(char::is_alphanumeric)
                .unwrap_or(false);
        if boundary_before && boundary_after {
            return true;
        }
        start = at
            + haystack[at..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_cues() {
        assert_eq!(detect("What is a cache?"), Intent::Definition);
        assert_eq!(detect("meaning of entropy"), Intent::Definition);
        assert_eq!(detect("prove the lemma"), Intent::Definition);
    }

    #[test]
    fn procedure_cues() {
        assert_eq!(detect("how to configure WAL"), Intent::Procedure);
        assert_eq!(detect("steps to install"), Intent::Procedure);
    }

    #[test]
    fn summary_and_example_cues() {
        assert_eq!(detect("give me an overview"), Intent::Summary);
        assert_eq!(detect("summarize chapter 3"), Intent::Summary);
        assert_eq!(detect("show a walkthrough"), Intent::Example);
    }

    #[test]
    fn first_match_wins_in_declared_order() {
        // "what is" (Definition) outranks "example" later in the query.
        assert_eq!(detect("what is an example of a monad"), Intent::Definition);
    }

    #[test]
    fn word_boundaries_are_respected() {
        // "counterexample" must not trigger the Example cue.
        assert_eq!(detect("counterexample hunting"), Intent::General);
        // "definitions" does not contain the bare phrase "definition of".
        assert_eq!(detect("definitions galore"), Intent::General);
    }

    #[test]
    fn fallback_is_general() {
        assert_eq!(detect("sqlite page cache tuning"), Intent::General);
        assert_eq!(detect(""), Intent::General);
    }
}
