//! Fixed prompt templates: persona preamble, summarizer instruction and
//! proactive check-in instructions.

use chrono::Timelike;

pub const DEFAULT_PERSONA: &str = "You are CareMate, a caring companion. Your role is to:
1. Listen to the user's feelings and thoughts the way a friend would
2. Offer warm, encouraging and supportive words
3. Help ease loneliness and emotional distress
4. Suggest positive, practical steps for daily life

Important constraints:
- Offer emotional support and general suggestions only
- Never give medical diagnoses, legal advice or professional treatment advice
- If the user mentions self-harm or suicide, gently encourage them to contact professional help
- Use warm, empathetic language and avoid cold or mechanical replies
- Stay positive while respecting how the user really feels

Reply in the same language the user writes in, naturally and warmly.";

pub const SUMMARY_INSTRUCTION: &str = "Summarize the conversation so far for your own memory. \
Keep what the user shared about their activities and goals, how their mood changed, \
and anything you promised to follow up on. Write plain prose in the user's language, \
no more than a short paragraph. Do not add advice.";

/// Label under which the rolling summary is shown to the model.
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

/// Label for the owner's long-term memory drawn from earlier sessions.
pub const MEMORY_PREFIX: &str = "What you remember about this person from earlier conversations:";

/// Shown in place of a message whose text was withheld by the safety filter.
pub const REDACTED_MARKER: &str = "[message withheld for safety]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDay {
    Morning,
    Noon,
    Evening,
}

impl TimeOfDay {
    /// Morning is 05:00-11:59, noon 12:00-17:59, evening the rest.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=17 => TimeOfDay::Noon,
            _ => TimeOfDay::Evening,
        }
    }

    pub fn of<T: Timelike>(time: &T) -> Self {
        Self::from_hour(time.hour())
    }

    pub fn greeting(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => "Good morning",
            TimeOfDay::Noon => "Good afternoon",
            TimeOfDay::Evening => "Good evening",
        }
    }

    /// Trailing instruction for a self-initiated check-in.
    pub fn check_in_instruction(&self) -> String {
        let focus = match self {
            TimeOfDay::Morning => "ask how they slept and encourage one small plan for today",
            TimeOfDay::Noon => "ask how the day is going and remind them to eat and rest",
            TimeOfDay::Evening => "ask how the day went and suggest winding down for a good night's sleep",
        };
        format!(
            "Start a short check-in with the user. Open with \"{}\", refer to what you know \
             about them from the conversation if anything, then {}. Keep it to two or three \
             warm sentences.",
            self.greeting(),
            focus
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_time_of_day_boundaries() {
        assert_eq!(TimeOfDay::from_hour(4), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Noon);
        assert_eq!(TimeOfDay::from_hour(18), TimeOfDay::Evening);
        let eight = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        assert_eq!(TimeOfDay::of(&eight), TimeOfDay::Morning);
    }

    #[test]
    fn test_check_in_opens_with_greeting() {
        let instruction = TimeOfDay::Morning.check_in_instruction();
        assert!(instruction.contains("Good morning"));
        assert!(instruction.contains("slept"));
    }
}
