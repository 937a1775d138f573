//! Versioned pattern sets for the safety filter.
//!
//! A rule set never changes once published; new patterns go into a new
//! version so that stored verdicts stay reproducible.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::error;

#[derive(Debug, Clone)]
pub struct Rule {
    /// Short name recorded as the matched signal.
    pub signal: &'static str,
    pub pattern: Regex,
}

#[derive(Debug)]
pub struct RuleSet {
    pub version: &'static str,
    /// Self-harm and suicide signals, checked for every role.
    pub crisis: Vec<Rule>,
    /// Harmful advice that only matters in generated replies.
    pub assistant_crisis: Vec<Rule>,
    /// Distress that warrants a soft warning but normal delivery.
    pub concern: Vec<Rule>,
}

fn compile(rules: &[(&'static str, &str)]) -> Vec<Rule> {
    rules
        .iter()
        .filter_map(|&(signal, pattern)| match Regex::new(pattern) {
            Ok(pattern) => Some(Rule { signal, pattern }),
            Err(e) => {
                error!("Dropping invalid safety pattern {}: {}", signal, e);
                None
            }
        })
        .collect()
}

const V1_CRISIS: &[(&str, &str)] = &[
    ("kill_myself", r"(?i)\b(kill|hurt|harm)\s+myself\b"),
    ("end_it_all", r"(?i)\bend(ing)?\s+(it\s+all|my\s+life)\b"),
    ("suicide", r"(?i)\bsuicid(e|al)\b"),
    ("want_to_die", r"(?i)\b(want|wish)\s+(to\s+die|i\s+was\s+dead|i\s+were\s+dead)\b"),
    ("no_reason_to_live", r"(?i)\bno\s+reason\s+to\s+(live|go\s+on)\b"),
    ("self_harm", r"(?i)\bself[-\s]?harm"),
    ("cut_myself", r"(?i)\bcut(ting)?\s+myself\b"),
    ("自杀", r"自杀"),
    ("自伤", r"自伤"),
    ("自残", r"自残"),
    ("跳楼", r"跳楼"),
    ("割腕", r"割腕"),
    ("上吊", r"上吊"),
    ("不想活", r"不想(再)?活|不想.{0,6}活下去"),
    ("结束生命", r"结束.{0,6}生命"),
    ("离开世界", r"离开.{0,6}(这个)?世界"),
    ("伤害自己", r"伤害.{0,4}自己"),
];

const V1_ASSISTANT_CRISIS: &[(&str, &str)] = &[
    ("advice_to_harm", r"(?i)\byou\s+should\s+(hurt|harm|kill)\b"),
    ("method_instructions", r"(?i)\b(here('s|\s+is)\s+how|ways?)\s+to\s+(kill|hurt|harm)\s+(yourself|myself)\b"),
    ("encourage_suicide", r"(?i)\b(try|consider)\s+(suicide|self[-\s]?harm)\b"),
    ("你应该伤害", r"你应该.{0,10}伤害"),
    ("建议自杀", r"建议.{0,10}自杀"),
    ("可以自残", r"可以.{0,10}自残"),
];

const V1_CONCERN: &[(&str, &str)] = &[
    ("hopeless", r"(?i)\bhopeless(ness)?\b"),
    ("worthless", r"(?i)\bworthless\b"),
    ("lonely", r"(?i)\b(so|very|really|always)\s+(lonely|alone)\b"),
    ("nobody_cares", r"(?i)\b(nobody|no\s+one)\s+(cares|would\s+notice)\b"),
    ("cant_go_on", r"(?i)\bcan('|no)?t\s+go\s+on\b"),
    ("绝望", r"绝望"),
    ("没有希望", r"没有希望|没希望"),
    ("孤独", r"孤独|好寂寞"),
    ("没人关心", r"没(有)?人(关心|在乎)"),
    ("暴力", r"暴力"),
    ("仇恨", r"仇恨"),
    ("歧视", r"歧视"),
];

lazy_static! {
    static ref RULESET_V1: RuleSet = RuleSet {
        version: "v1",
        crisis: compile(V1_CRISIS),
        assistant_crisis: compile(V1_ASSISTANT_CRISIS),
        concern: compile(V1_CONCERN),
    };
}

impl RuleSet {
    pub const LATEST: &'static str = "v1";
    pub const KNOWN_VERSIONS: &'static [&'static str] = &["v1"];

    pub fn load(version: &str) -> Option<&'static RuleSet> {
        match version {
            "v1" => Some(&RULESET_V1),
            _ => None,
        }
    }
}
