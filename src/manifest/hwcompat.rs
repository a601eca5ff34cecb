// Copyright 2023 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{anyhow, Context, Result};
use regex::Regex;

use crate::errors::UpdateError;

/// Prefix selecting regular-expression matching for a
/// hardware-compatibility entry.
pub const HW_REGEX_PREFIX: &str = "#RE:";

/// Identity of the running board, usually read from `/etc/hwrevision`
/// (`<boardname> <revision>` on one line).
#[derive(Debug, Clone, Default)]
pub struct BoardInfo {
    pub boardname: String,
    pub revision: String,
}

impl BoardInfo {
    pub fn from_hwrevision_text(text: &str) -> Result<Self> {
        let mut words = text.split_whitespace();
        match (words.next(), words.next()) {
            (Some(board), Some(rev)) => Ok(Self {
                boardname: board.to_string(),
                revision: rev.to_string(),
            }),
            _ => Err(anyhow!("malformed hwrevision contents")),
        }
    }
}

/// One accepted hardware revision: a literal string or a regular
/// expression introduced by `#RE:`.
#[derive(Debug, Clone)]
pub enum HwCompat {
    Literal(String),
    Pattern(Regex),
}

impl HwCompat {
    pub fn parse(entry: &str) -> Result<Self> {
        match entry.strip_prefix(HW_REGEX_PREFIX) {
            Some(pattern) => Ok(HwCompat::Pattern(
                Regex::new(pattern)
                    .with_context(|| format!("compiling hardware pattern '{pattern}'"))?,
            )),
            None => Ok(HwCompat::Literal(entry.to_string())),
        }
    }

    fn matches(&self, revision: &str) -> bool {
        match self {
            HwCompat::Literal(s) => s == revision,
            // unanchored match, like the original
            HwCompat::Pattern(re) => re.is_match(revision),
        }
    }
}

/// Check the running board's revision against the manifest's list.  An
/// empty list means the manifest carries no hardware constraint.
pub fn check_hw_compatibility(hw: &BoardInfo, accepted: &[HwCompat]) -> Result<()> {
    if accepted.is_empty() {
        return Ok(());
    }
    if accepted.iter().any(|c| c.matches(&hw.revision)) {
        log::info!(
            "hardware {} revision {} accepted",
            hw.boardname,
            hw.revision
        );
        return Ok(());
    }
    Err(anyhow!(UpdateError::ManifestSemantic(format!(
        "software is not compatible with hardware revision '{}'",
        hw.revision
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(rev: &str) -> BoardInfo {
        BoardInfo {
            boardname: "devboard".into(),
            revision: rev.into(),
        }
    }

    #[test]
    fn literal_and_regex_entries() {
        let accepted = vec![
            HwCompat::parse("1.0").unwrap(),
            HwCompat::parse("#RE:^2\\.[0-9]+$").unwrap(),
        ];
        check_hw_compatibility(&board("1.0"), &accepted).unwrap();
        check_hw_compatibility(&board("2.17"), &accepted).unwrap();
        let err = check_hw_compatibility(&board("3.0"), &accepted).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::ManifestSemantic(_))
        }));
    }

    #[test]
    fn unanchored_pattern_matches_inside() {
        let accepted = vec![HwCompat::parse("#RE:rev[AB]").unwrap()];
        check_hw_compatibility(&board("board-revB-2023"), &accepted).unwrap();
    }

    #[test]
    fn empty_list_accepts_everything() {
        check_hw_compatibility(&board("anything"), &[]).unwrap();
    }

    #[test]
    fn hwrevision_parsing() {
        let b = BoardInfo::from_hwrevision_text("myboard 1.1\n").unwrap();
        assert_eq!(b.boardname, "myboard");
        assert_eq!(b.revision, "1.1");
        BoardInfo::from_hwrevision_text("incomplete").unwrap_err();
    }
}
