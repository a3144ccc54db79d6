//! Target-profile file parser.
//!
//! Format: lines of `KEY = value` (quotes optional), one assignment per
//! line, `#`-prefixed lines and blank lines ignored. This is distinct from
//! the crate's own `settings.toml`-style layer — it is the third and final
//! config layer (code defaults -> env -> profile file), selected at
//! startup by the `TEST_TARGET` environment variable naming a file under
//! `config/targets/<TEST_TARGET>.profile`.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("failed to read target profile {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed line {line_no} in target profile: {line}")]
    Malformed { line_no: usize, line: String },
}

/// Parses a `KEY = value` profile file into a flat string map.
pub fn parse_profile(path: &Path) -> Result<HashMap<String, String>, ProfileError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_profile_str(&contents)
}

pub fn parse_profile_str(contents: &str) -> Result<HashMap<String, String>, ProfileError> {
    let mut out = HashMap::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ProfileError::Malformed {
                line_no: idx + 1,
                line: raw_line.to_string(),
            });
        };
        let key = key.trim().to_string();
        let mut value = value.trim().to_string();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }
        out.insert(key, value);
    }
    Ok(out)
}

/// Fixed key mapping from the profile file's flat namespace into the
/// config tree. Each entry is `(profile_key, dotted_path)`; typed
/// conversion happens in `settings::apply_profile`.
pub const PROFILE_KEY_MAP: &[(&str, &str)] = &[
    ("SEARCH_K", "retriever_config.k"),
    ("CITATION_LIMIT", "retriever_config.citation_limit"),
    ("SEARCH_SCORE_THRESHOLD", "retriever_config.score_threshold"),
    ("CHUNK_SIZE", "retriever_config.chunk_size"),
    ("CHUNK_OVERLAP", "retriever_config.chunk_overlap"),
    (
        "LARGE_RETRIEVAL_SIZE_PER_CORPUS",
        "retriever_config.large_retrieval_size_per_corpus",
    ),
    (
        "LARGE_RETRIEVAL_SIZE_ALL_CORPUS",
        "retriever_config.large_retrieval_size_all_corpus",
    ),
    ("LLM_PROVIDER", "llm_provider"),
    ("LLM_MODEL", "llm_model"),
    ("ALGORITHM", "retriever_config.search_type"),
    ("POOLING", "retriever_config.pooling"),
    ("INDEX_NAME", "retriever_config.index_name"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_assignments() {
        let text = "SEARCH_K = 8\nLLM_PROVIDER=openai\n# comment\n\nINDEX_NAME = \"1901_hansard\"\n";
        let map = parse_profile_str(text).unwrap();
        assert_eq!(map.get("SEARCH_K").unwrap(), "8");
        assert_eq!(map.get("LLM_PROVIDER").unwrap(), "openai");
        assert_eq!(map.get("INDEX_NAME").unwrap(), "1901_hansard");
    }

    #[test]
    fn rejects_malformed_line() {
        let text = "NOT_AN_ASSIGNMENT";
        assert!(parse_profile_str(text).is_err());
    }

    #[test]
    fn ignores_blank_and_comment_lines() {
        let text = "\n# header\n\nCHUNK_SIZE = 512\n";
        let map = parse_profile_str(text).unwrap();
        assert_eq!(map.len(), 1);
    }
}
