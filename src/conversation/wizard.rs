//! Step-by-step creation of a note
//!
//! Text, confirmation, month, day, time, final confirmation. Times are local
//! to the user; converting them is up to the caller.

use chrono::Datelike;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::naive::NaiveDateTime;

const ASK_TEXT: &str = "Type the text of the note:";
const ASK_MONTH: &str = "When should I remind you? Enter the month (1-12):";
const ASK_TIME: &str = "Enter the time as HH or HH:MM (for example 14 or 15:37):";
const ASK_YES_NO: &str = "Please answer yes or no:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Text,
    ConfirmText,
    Month,
    Day,
    Time,
    ConfirmSave,
}

/// What the wizard wants next
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Reply with this and wait for more input
    Ask(String),

    /// The user confirmed, store the note
    Save {
        text: String,
        notify_at: NaiveDateTime,
    },
}

/// A note in the making, owned by one conversation
#[derive(Clone, Debug)]
pub struct Draft {
    step: Step,
    text: String,
    month: u32,
    day: u32,
    notify_at: Option<NaiveDateTime>,
}

impl Default for Draft {
    fn default() -> Self {
        Self::new()
    }
}

impl Draft {
    pub fn new() -> Self {
        Self {
            step: Step::Text,
            text: String::new(),
            month: 0,
            day: 0,
            notify_at: None,
        }
    }

    /// The first question of the wizard
    pub fn prompt() -> &'static str {
        ASK_TEXT
    }

    #[cfg(test)]
    pub fn step(&self) -> Step {
        self.step
    }

    /// Feed the next user input, `year` is the current local year
    pub fn advance(&mut self, input: &str, year: i32) -> Outcome {
        let input = input.trim();

        match self.step {
            Step::Text => {
                if input.is_empty() {
                    return ask("The note can not be empty. ".to_string() + ASK_TEXT);
                }

                self.text = input.to_string();
                self.step = Step::ConfirmText;

                ask(format!("Your note: \"{}\". Continue? (yes/no)", self.text))
            }
            Step::ConfirmText => match parse_answer(input) {
                Some(true) => {
                    self.step = Step::Month;

                    ask(ASK_MONTH)
                }
                Some(false) => {
                    *self = Self::new();

                    ask("Type the new note:")
                }
                None => ask(ASK_YES_NO),
            },
            Step::Month => match input.parse::<u32>() {
                Ok(month @ 1..=12) => {
                    self.month = month;
                    self.step = Step::Day;

                    ask(format!(
                        "Enter the day (1-{}):",
                        days_in_month(year, month)
                    ))
                }
                _ => ask("Enter the month number (1-12):"),
            },
            Step::Day => {
                let days = days_in_month(year, self.month);

                match input.parse::<u32>() {
                    Ok(day) if (1..=days).contains(&day) => {
                        self.day = day;
                        self.step = Step::Time;

                        ask(ASK_TIME)
                    }
                    _ => ask(format!("Enter a valid day of the month (1-{days}):")),
                }
            }
            Step::Time => {
                let notify_at = parse_time(input).and_then(|time| {
                    NaiveDate::from_ymd_opt(year, self.month, self.day).map(|date| date.and_time(time))
                });

                let Some(notify_at) = notify_at else {
                    return ask("Enter a valid time as HH or HH:MM:");
                };

                self.notify_at = Some(notify_at);
                self.step = Step::ConfirmSave;

                ask(format!(
                    "Save note \"{}\" with a reminder on {}? (yes/no)",
                    self.text,
                    notify_at.format("%Y-%m-%d %H:%M")
                ))
            }
            Step::ConfirmSave => match (parse_answer(input), self.notify_at) {
                (Some(true), Some(notify_at)) => Outcome::Save {
                    text: self.text.clone(),
                    notify_at,
                },
                (Some(true), None) | (Some(false), _) => {
                    *self = Self::new();

                    ask("Type the new note:")
                }
                (None, _) => ask(ASK_YES_NO),
            },
        }
    }
}

fn ask(text: impl Into<String>) -> Outcome {
    Outcome::Ask(text.into())
}

fn parse_answer(input: &str) -> Option<bool> {
    match input.to_lowercase().as_str() {
        "yes" | "y" => Some(true),
        "no" | "n" => Some(false),
        _ => None,
    }
}

/// `HH` or `HH:MM`
fn parse_time(input: &str) -> Option<NaiveTime> {
    if input.contains(':') {
        return NaiveTime::parse_from_str(input, "%H:%M").ok();
    }

    input
        .parse::<u32>()
        .ok()
        .and_then(|hour| NaiveTime::from_hms_opt(hour, 0, 0))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next_month = if month >= 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };

    next_month
        .and_then(|date| date.pred_opt())
        .map_or(31, |date| date.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn walks_through_all_steps() {
        let mut draft = Draft::new();

        assert!(matches!(draft.advance("Dentist", 2024), Outcome::Ask(_)));
        assert_eq!(Step::ConfirmText, draft.step());

        draft.advance("yes", 2024);
        assert_eq!(Step::Month, draft.step());

        draft.advance("2", 2024);
        assert_eq!(Step::Day, draft.step());

        draft.advance("29", 2024);
        assert_eq!(Step::Time, draft.step());

        let Outcome::Ask(question) = draft.advance("9:05", 2024) else {
            panic!("expected a question");
        };
        assert!(question.contains("2024-02-29 09:05"));

        assert_eq!(
            Outcome::Save {
                text: "Dentist".to_string(),
                notify_at: at("2024-02-29 09:05"),
            },
            draft.advance("YES", 2024)
        );
    }

    #[test]
    fn invalid_input_keeps_the_step() {
        let mut draft = Draft::new();

        draft.advance("Dentist", 2023);
        draft.advance("maybe", 2023);
        assert_eq!(Step::ConfirmText, draft.step());

        draft.advance("y", 2023);
        draft.advance("13", 2023);
        assert_eq!(Step::Month, draft.step());

        draft.advance("2", 2023);
        draft.advance("29", 2023);
        assert_eq!(Step::Day, draft.step());

        draft.advance("28", 2023);
        draft.advance("25:00", 2023);
        draft.advance("24", 2023);
        assert_eq!(Step::Time, draft.step());

        draft.advance("14", 2023);
        assert_eq!(Step::ConfirmSave, draft.step());
    }

    #[test]
    fn declining_starts_over() {
        let mut draft = Draft::new();

        draft.advance("Dentist", 2024);
        draft.advance("no", 2024);
        assert_eq!(Step::Text, draft.step());

        draft.advance("Doctor", 2024);
        draft.advance("yes", 2024);
        draft.advance("1", 2024);
        draft.advance("15", 2024);
        draft.advance("8", 2024);
        draft.advance("n", 2024);
        assert_eq!(Step::Text, draft.step());
    }

    #[test]
    fn empty_text_is_refused() {
        let mut draft = Draft::new();

        draft.advance("   ", 2024);

        assert_eq!(Step::Text, draft.step());
    }

    #[test]
    fn knows_month_lengths() {
        assert_eq!(31, days_in_month(2024, 1));
        assert_eq!(29, days_in_month(2024, 2));
        assert_eq!(28, days_in_month(2023, 2));
        assert_eq!(30, days_in_month(2024, 4));
        assert_eq!(31, days_in_month(2024, 12));
    }
}
