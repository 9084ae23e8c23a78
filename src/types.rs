use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// One-based question number on the answer sheet.
pub type QuestionNumber = u32;

/// Integer pixel center of a bubble, serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Center {
    pub x: i32,
    pub y: i32,
}

impl Center {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Serialize for Center {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (self.x, self.y).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Center {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (x, y) = <(i32, i32)>::deserialize(deserializer)?;
        Ok(Center::new(x, y))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Size<T> {
    pub width: T,
    pub height: T,
}

/// The two scored sections of the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    Listening,
    Reading,
}

impl Section {
    /// Listening covers parts 1 to 4 (questions 1..=100), reading parts 5 to 7.
    pub fn for_question(question: QuestionNumber) -> Option<Section> {
        Part::for_question(question).map(|part| part.section())
    }
}

/// Sub-parts of the two sections, keyed `part1`..`part7` in persisted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Part {
    Part1,
    Part2,
    Part3,
    Part4,
    Part5,
    Part6,
    Part7,
}

impl Part {
    pub const ALL: [Part; 7] = [
        Part::Part1,
        Part::Part2,
        Part::Part3,
        Part::Part4,
        Part::Part5,
        Part::Part6,
        Part::Part7,
    ];

    /// Inclusive question range covered by the part.
    pub fn questions(&self) -> (QuestionNumber, QuestionNumber) {
        match self {
            Part::Part1 => (1, 6),
            Part::Part2 => (7, 31),
            Part::Part3 => (32, 70),
            Part::Part4 => (71, 100),
            Part::Part5 => (101, 130),
            Part::Part6 => (131, 146),
            Part::Part7 => (147, 200),
        }
    }

    pub fn section(&self) -> Section {
        match self {
            Part::Part1 | Part::Part2 | Part::Part3 | Part::Part4 => Section::Listening,
            Part::Part5 | Part::Part6 | Part::Part7 => Section::Reading,
        }
    }

    pub fn for_question(question: QuestionNumber) -> Option<Part> {
        Part::ALL.into_iter().find(|part| {
            let (first, last) = part.questions();
            (first..=last).contains(&question)
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Part::Part1 => "Photographs",
            Part::Part2 => "Question-Response",
            Part::Part3 => "Conversations",
            Part::Part4 => "Short Talks",
            Part::Part5 => "Incomplete Sentences",
            Part::Part6 => "Text Completion",
            Part::Part7 => "Reading Comprehension",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            Part::Part1 => "part1",
            Part::Part2 => "part2",
            Part::Part3 => "part3",
            Part::Part4 => "part4",
            Part::Part5 => "part5",
            Part::Part6 => "part6",
            Part::Part7 => "part7",
        }
    }
}

impl TryFrom<&str> for Part {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Part::ALL
            .into_iter()
            .find(|part| part.key() == s)
            .ok_or_else(|| format!("invalid part: {}", s))
    }
}

impl Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl Serialize for Part {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Part::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

/// Maps an answer letter (`A`, `B`, ...) to its choice index, if it is one of
/// the first `choices` letters.
pub fn letter_index(letter: char, choices: usize) -> Option<usize> {
    let letter = letter.to_ascii_uppercase();
    if !letter.is_ascii_uppercase() {
        return None;
    }
    let index = (letter as u8 - b'A') as usize;
    (index < choices).then_some(index)
}
