//! Glob matching over indexed files.
//!
//! Patterns are matched against paths relative to the working directory
//! with `/` as a literal separator, so `src/*.js` stays one level deep and
//! `**` is needed to cross directories.

use ::glob::{MatchOptions, Pattern};

use crate::error::FsResult;
use crate::index::PathIndex;
use crate::path::IndexPath;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobOptions {
    /// Files must match at least one. Empty matches everything.
    pub patterns: Vec<String>,
    /// Files matching any of these are dropped.
    pub ignore: Vec<String>,
}

impl GlobOptions {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            ignore: Vec::new(),
        }
    }

    pub fn ignore<I, S>(mut self, ignore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore = ignore.into_iter().map(Into::into).collect();
        self
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile(patterns: &[String]) -> FsResult<Vec<Pattern>> {
    let compiled = patterns
        .iter()
        .map(|pattern| Pattern::new(pattern))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(compiled)
}

/// Indexed files under `cwd` matching `options`, sorted.
pub fn glob(index: &PathIndex, cwd: &IndexPath, options: &GlobOptions) -> FsResult<Vec<IndexPath>> {
    let include = compile(&options.patterns)?;
    let exclude = compile(&options.ignore)?;

    let matches = index
        .get_all_files_in_directory(cwd)
        .into_iter()
        .filter(|file| {
            let Some(relative) = file.relative_to(cwd) else {
                return false;
            };
            let included = include.is_empty()
                || include
                    .iter()
                    .any(|pattern| pattern.matches_path_with(relative, MATCH_OPTIONS));
            included
                && !exclude
                    .iter()
                    .any(|pattern| pattern.matches_path_with(relative, MATCH_OPTIONS))
        })
        .collect();
    Ok(matches)
}
