use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two options every poll offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteOption {
    #[serde(rename = "optionA")]
    OptionA,
    #[serde(rename = "optionB")]
    OptionB,
}

impl VoteOption {
    pub const ALL: [VoteOption; 2] = [VoteOption::OptionA, VoteOption::OptionB];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOption::OptionA => "optionA",
            VoteOption::OptionB => "optionB",
        }
    }
}

impl fmt::Display for VoteOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optionA" => Ok(VoteOption::OptionA),
            "optionB" => Ok(VoteOption::OptionB),
            other => Err(format!("Unknown option: {}", other)),
        }
    }
}

/// One row of the voter roll: "this voter has voted in this poll".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterRecord {
    pub poll_id: String,
    pub voter_key: String,
    pub option: VoteOption,
    pub voted_at: DateTime<Utc>,
}

impl VoterRecord {
    pub fn new(poll_id: &str, voter_key: &str, option: VoteOption) -> Self {
        Self {
            poll_id: poll_id.to_string(),
            voter_key: voter_key.to_string(),
            option,
            voted_at: Utc::now(),
        }
    }
}

/// Per-option counter as stored. `option_id` stays a string so rows written
/// by other tools still show up in results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub poll_id: String,
    pub option_id: String,
    pub count: i64,
}

/// The `CURRENT` pointer row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentPoll {
    pub poll_id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionCount {
    pub option_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResults {
    pub poll_id: String,
    pub results: Vec<OptionCount>,
}

impl PollResults {
    pub fn count_for(&self, option: VoteOption) -> i64 {
        self.results
            .iter()
            .find(|c| c.option_id == option.as_str())
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

/// A page of voter keys plus the cursor to continue from, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoterPage {
    pub voter_keys: Vec<String>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_ids_round_trip_through_strings() {
        for option in VoteOption::ALL {
            assert_eq!(option.as_str().parse::<VoteOption>(), Ok(option));
        }
        assert!("optionC".parse::<VoteOption>().is_err());
        assert!("OptionA".parse::<VoteOption>().is_err());
    }

    #[test]
    fn results_serialize_in_camel_case() {
        let results = PollResults {
            poll_id: "p1".to_string(),
            results: vec![OptionCount { option_id: "optionA".to_string(), count: 3 }],
        };
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["pollId"], "p1");
        assert_eq!(json["results"][0]["optionId"], "optionA");
        assert_eq!(json["results"][0]["count"], 3);
        assert_eq!(results.count_for(VoteOption::OptionB), 0);
    }
}
