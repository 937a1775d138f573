use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rules::{Rule, RuleSet};
use super::SafetyCategory;
use crate::error::{CareError, CareResult};
use crate::memory::Role;
use crate::metrics;

/// Substituted for any crisis input and for any discarded reply.
pub const SAFETY_RESPONSE: &str = "I'm really glad you told me, and I'm concerned about how you are feeling. \
You are not alone, and talking to someone can help right now. Please reach out to a person you trust, \
or contact a crisis line: in mainland China call 400-161-9995 (24 hours); elsewhere, your local emergency \
number or crisis hotline. If you are in immediate danger, please call emergency services now.\n\n\
我注意到您可能正在经历非常困难的时刻。您不是一个人，专业帮助是有效的。请联系您信任的亲友，\
或拨打心理危机干预热线：400-161-9995（24小时）。如果您处于紧急情况，请立即拨打紧急电话。";

const MAX_STORED_CHARS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub category: SafetyCategory,
    pub matched_signal: Option<String>,
    pub ruleset_version: String,
}

impl SafetyVerdict {
    pub fn is_crisis(&self) -> bool {
        self.category == SafetyCategory::Crisis
    }
}

/// Pure classifier over one rule-set version. Cheap to clone.
#[derive(Debug, Clone, Copy)]
pub struct SafetyFilter {
    rules: &'static RuleSet,
}

impl SafetyFilter {
    pub fn new(version: &str) -> CareResult<Self> {
        RuleSet::load(version)
            .map(|rules| Self { rules })
            .ok_or_else(|| {
                CareError::InvalidConfig(format!(
                    "unknown safety rule set '{}', known: {:?}",
                    version,
                    RuleSet::KNOWN_VERSIONS
                ))
            })
    }

    pub fn ruleset_version(&self) -> &'static str {
        self.rules.version
    }

    pub fn safety_response(&self) -> &'static str {
        SAFETY_RESPONSE
    }

    pub fn evaluate(&self, text: &str, role: Role) -> SafetyVerdict {
        let mut verdict = self.classify(text, role);
        if verdict.category != SafetyCategory::None {
            warn!(
                role = role.as_str(),
                category = verdict.category.as_str(),
                signal = verdict.matched_signal.as_deref().unwrap_or(""),
                ruleset = self.rules.version,
                "Safety signal detected"
            );
        } else {
            debug!("Safety check passed for {} text", role);
        }
        metrics::inc_safety_verdict(role.as_str(), verdict.category.as_str());
        verdict.ruleset_version = self.rules.version.to_string();
        verdict
    }

    fn classify(&self, text: &str, role: Role) -> SafetyVerdict {
        let verdict = |category, rule: Option<&Rule>| SafetyVerdict {
            category,
            matched_signal: rule.map(|r| r.signal.to_string()),
            ruleset_version: String::new(),
        };

        if let Some(rule) = first_match(&self.rules.crisis, text) {
            return verdict(SafetyCategory::Crisis, Some(rule));
        }
        if role == Role::Assistant {
            if let Some(rule) = first_match(&self.rules.assistant_crisis, text) {
                return verdict(SafetyCategory::Crisis, Some(rule));
            }
        }
        if let Some(rule) = first_match(&self.rules.concern, text) {
            return verdict(SafetyCategory::Concern, Some(rule));
        }
        verdict(SafetyCategory::None, None)
    }
}

fn first_match<'a>(rules: &'a [Rule], text: &str) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.pattern.is_match(text))
}

/// Strips control characters (keeping newlines and tabs) and caps length.
pub fn sanitize_for_storage(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    if cleaned.chars().count() > MAX_STORED_CHARS {
        let mut capped: String = cleaned.chars().take(MAX_STORED_CHARS).collect();
        capped.push_str("...");
        capped
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> SafetyFilter {
        SafetyFilter::new("v1").unwrap()
    }

    #[test]
    fn test_crisis_phrase_in_english() {
        let verdict = filter().evaluate("I want to end it all", Role::User);
        assert_eq!(verdict.category, SafetyCategory::Crisis);
        assert_eq!(verdict.matched_signal.as_deref(), Some("end_it_all"));
        assert_eq!(verdict.ruleset_version, "v1");
    }

    #[test]
    fn test_crisis_phrase_in_chinese() {
        let verdict = filter().evaluate("我真的不想活了", Role::User);
        assert!(verdict.is_crisis());
        let verdict = filter().evaluate("有时候想结束自己的生命", Role::User);
        assert!(verdict.is_crisis());
    }

    #[test]
    fn test_concern_is_soft() {
        let verdict = filter().evaluate("I feel so lonely these days", Role::User);
        assert_eq!(verdict.category, SafetyCategory::Concern);
        let verdict = filter().evaluate("最近感觉很绝望", Role::User);
        assert_eq!(verdict.category, SafetyCategory::Concern);
    }

    #[test]
    fn test_everyday_text_is_clean() {
        for text in ["Good morning! I slept well.", "今天天气很好，我去公园散步了", "I need to get back to work"] {
            assert_eq!(filter().evaluate(text, Role::User).category, SafetyCategory::None);
        }
    }

    #[test]
    fn test_advice_rules_only_apply_to_replies() {
        let text = "Maybe you should hurt them back";
        assert_eq!(filter().evaluate(text, Role::User).category, SafetyCategory::None);
        assert_eq!(filter().evaluate(text, Role::Assistant).category, SafetyCategory::Crisis);
    }

    #[test]
    fn test_deterministic() {
        let f = filter();
        let a = f.evaluate("我建议你去自杀", Role::Assistant);
        let b = f.evaluate("我建议你去自杀", Role::Assistant);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_ruleset_rejected() {
        let err = SafetyFilter::new("v42").unwrap_err();
        assert_eq!(err.category(), "invalid_config");
    }

    #[test]
    fn test_sanitize_strips_controls_and_caps() {
        assert_eq!(sanitize_for_storage("a\u{0007}b\nc\td"), "ab\nc\td");
        let long = "字".repeat(10_050);
        let stored = sanitize_for_storage(&long);
        assert_eq!(stored.chars().count(), 10_003);
        assert!(stored.ends_with("..."));
    }
}
