// SPDX-License-Identifier: GPL-2.0
//! Pair file.
//!
//! One `a b` pair of annotation ids per line, whitespace separated decimal
//! integers. A companion tool reorders the pairs so that checks on
//! frequently paired instructions come last.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::error::{AnalysisError, Result};
use crate::core::log::{log_warn, AnalysisLog};

/// A pair of annotation ids
pub type IdPair = (usize, usize);

/// Parse pair file contents. Blank lines are skipped.
pub fn parse_pairs(text: &str) -> Result<Vec<IdPair>> {
    let mut pairs = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bad = || AnalysisError::PairFormat {
            line: n + 1,
            content: line.to_string(),
        };
        let mut fields = line.split_whitespace();
        let (Some(a), Some(b), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(bad());
        };
        let a = a.parse().map_err(|_| bad())?;
        let b = b.parse().map_err(|_| bad())?;
        pairs.push((a, b));
    }
    Ok(pairs)
}

/// Render pairs in pair file format
pub fn format_pairs(pairs: &[IdPair]) -> String {
    let mut out = String::new();
    for (a, b) in pairs {
        out.push_str(&format!("{} {}\n", a, b));
    }
    out
}

/// Read a pair file
pub fn read_pairs(path: impl AsRef<Path>) -> Result<Vec<IdPair>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| AnalysisError::PairFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pairs(&text)
}

/// Write a pair file, replacing any existing one
pub fn write_pairs(path: impl AsRef<Path>, pairs: &[IdPair]) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, format_pairs(pairs)).map_err(|source| AnalysisError::PairFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a pair file, reporting any failure to `log` and falling back to no
/// pairs
pub fn load_pairs_or_empty(path: impl AsRef<Path>, log: &mut AnalysisLog) -> Vec<IdPair> {
    match read_pairs(path) {
        Ok(pairs) => pairs,
        Err(err) => {
            log_warn(log, || format!("{}, using no pairs", err));
            Vec::new()
        }
    }
}

/// Sort pairs by the number of pairs each of their ids takes part in,
/// then by ids
pub fn order_pairs(pairs: &[IdPair]) -> Vec<IdPair> {
    let mut times: BTreeMap<usize, usize> = BTreeMap::new();
    for &(a, b) in pairs {
        *times.entry(a).or_default() += 1;
        *times.entry(b).or_default() += 1;
    }
    let weight = |(a, b): IdPair| times[&a] + times[&b];
    let mut ordered = pairs.to_vec();
    ordered.sort_by_key(|&(a, b)| (weight((a, b)), a, b));
    ordered
}

/// Reorder the pair file at `input` into `output`. Returns the number of
/// pairs written.
pub fn reorder_pairs(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<usize> {
    let ordered = order_pairs(&read_pairs(input)?);
    write_pairs(output, &ordered)?;
    Ok(ordered.len())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use test_log::test;

    use super::*;
    use crate::core::log::LogLevel;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("race-detector-{}-{}.pairs", std::process::id(), name))
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("0 1\n\n  2\t3  \n").unwrap();
        assert_eq!(pairs, vec![(0, 1), (2, 3)]);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(matches!(
            parse_pairs("0 1\n2\n"),
            Err(AnalysisError::PairFormat { line: 2, .. })
        ));
        assert!(matches!(
            parse_pairs("0 x\n"),
            Err(AnalysisError::PairFormat { line: 1, .. })
        ));
        assert!(parse_pairs("0 1 2\n").is_err());
    }

    #[test]
    fn test_order_by_weight() {
        // 0 takes part in three pairs, 4 and 5 only in one each.
        let pairs = vec![(0, 1), (0, 2), (4, 5), (0, 3)];
        assert_eq!(order_pairs(&pairs), vec![(4, 5), (0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn test_reorder_file() {
        let input = temp_path("reorder-in");
        let output = temp_path("reorder-out");
        write_pairs(&input, &[(0, 1), (1, 2), (3, 4)]).unwrap();
        assert_eq!(reorder_pairs(&input, &output).unwrap(), 3);
        assert_eq!(read_pairs(&output).unwrap(), vec![(3, 4), (0, 1), (1, 2)]);
        let _ = fs::remove_file(input);
        let _ = fs::remove_file(output);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let mut log = AnalysisLog::new(LogLevel::Warn);
        let pairs = load_pairs_or_empty(temp_path("does-not-exist"), &mut log);
        assert!(pairs.is_empty());
        assert!(log.contents().contains("using no pairs"));
        assert!(matches!(
            read_pairs(temp_path("does-not-exist")),
            Err(AnalysisError::PairFile { .. })
        ));
    }
}
