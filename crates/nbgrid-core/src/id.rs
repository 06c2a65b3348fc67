//! Opaque id generation.
//!
//! Ids are random strings over a lowercase alphanumeric alphabet so they are
//! safe in file names, KV keys, and machine host names.

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

pub const WORKFLOW_ID_LEN: usize = 16;
pub const EXECUTION_ID_LEN: usize = 16;
pub const PROJECT_ID_LEN: usize = 10;
pub const SUFFIX_LEN: usize = 6;

/// Random id of `len` characters.
pub fn generate(len: usize) -> String {
    nanoid::nanoid!(len, &ALPHABET)
}

pub fn workflow_id() -> String {
    generate(WORKFLOW_ID_LEN)
}

pub fn execution_id() -> String {
    generate(EXECUTION_ID_LEN)
}

pub fn project_id() -> String {
    generate(PROJECT_ID_LEN)
}

/// `<prefix>-<6char>`, used for machine and boot volume names.
pub fn suffixed(prefix: &str) -> String {
    format!("{prefix}-{}", generate(SUFFIX_LEN))
}

/// True if `s` looks like an id produced by [`generate`] with length `len`.
pub fn is_valid(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| ALPHABET.contains(&c))
}
