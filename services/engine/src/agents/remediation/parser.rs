//! Completion parsing
//!
//! Splits assembled completion text into the guide and its keyword list,
//! and drops keywords that cannot be traced back to the user's issue.

use std::collections::HashSet;

use super::types::DialogueResult;

#[derive(Debug, Clone, Copy)]
struct Marker {
    /// First byte of the marker including leading decoration
    start: usize,
    /// First byte after the colon and trailing decoration
    end: usize,
}

/// All `word:` markers in `lower`, tolerating `**Word:**`, `**Word**:`,
/// `## Word:` and similar decoration. `lower` must be ASCII-lowercased.
fn find_markers(lower: &str, word: &str) -> Vec<Marker> {
    let bytes = lower.as_bytes();
    let mut found = Vec::new();
    let mut search = 0;

    while let Some(pos) = lower[search..].find(word) {
        let at = search + pos;
        search = at + word.len();

        if at > 0 && bytes[at - 1].is_ascii_alphanumeric() {
            continue;
        }

        let mut i = at + word.len();
        // plural form (`Keywords:`)
        if bytes.get(i) == Some(&b's') {
            i += 1;
        }
        while i < bytes.len() && matches!(bytes[i], b'*' | b'_' | b' ') {
            i += 1;
        }
        if bytes.get(i) != Some(&b':') {
            continue;
        }
        i += 1;
        while i < bytes.len() && matches!(bytes[i], b'*' | b'_') {
            i += 1;
        }

        let mut start = at;
        while start > 0 && matches!(bytes[start - 1], b'*' | b'_' | b'#' | b' ' | b'\t') {
            start -= 1;
        }

        found.push(Marker { start, end: i });
    }

    found
}

/// Parse assembled completion text.
///
/// Guide is the text between the first `Guide:` marker and the last
/// `Keyword:` marker after it. Missing either marker, the whole text is the
/// guide and there are no keywords.
pub fn parse_completion(text: &str) -> DialogueResult {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DialogueResult::no_response();
    }

    let lower = trimmed.to_ascii_lowercase();
    let guide = find_markers(&lower, "guide").into_iter().next();
    let keyword = guide.and_then(|g| {
        find_markers(&lower, "keyword")
            .into_iter()
            .filter(|k| k.start >= g.end)
            .last()
    });

    match (guide, keyword) {
        (Some(g), Some(k)) => {
            let body = trimmed[g.end..k.start].trim();
            DialogueResult {
                guide: if body.is_empty() {
                    DialogueResult::no_response().guide
                } else {
                    body.to_string()
                },
                keywords: split_keywords(&trimmed[k.end..]),
            }
        }
        _ => DialogueResult {
            guide: trimmed.to_string(),
            keywords: Vec::new(),
        },
    }
}

fn clean_keyword(raw: &str) -> &str {
    let mut s = raw
        .trim()
        .trim_start_matches(|c: char| matches!(c, '-' | '*' | '+' | '•') || c.is_whitespace());

    // numbered bullets: `1.` / `2)`
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let rest = &s[digits..];
        if rest.starts_with('.') || rest.starts_with(')') {
            s = rest[1..].trim_start();
        }
    }

    s.trim_matches(|c: char| matches!(c, '*' | '_' | '`' | '"' | '.') || c.is_whitespace())
}

/// Split a keyword section on commas and newlines; first spelling wins
/// among case-insensitive duplicates.
pub fn split_keywords(section: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    section
        .split(|c| c == ',' || c == '\n')
        .map(clean_keyword)
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_lowercase()))
        .map(str::to_string)
        .collect()
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Edits tolerated for a word of `len` characters
fn allowed_edits(len: usize) -> usize {
    match len {
        0..=3 => 0,
        4..=7 => 1,
        _ => 2,
    }
}

/// Optimal string alignment distance (Levenshtein plus adjacent swaps)
pub fn osa_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut d = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in d.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        d[0][j] = j;
    }

    for i in 1..=n {
        for j in 1..=m {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (d[i - 1][j] + 1)
                .min(d[i][j - 1] + 1)
                .min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(d[i - 2][j - 2] + 1);
            }
            d[i][j] = best;
        }
    }

    d[n][m]
}

/// Keep keywords whose every word is a (possibly spelling-corrected) word
/// of the issue.
pub fn retain_traceable(keywords: Vec<String>, issue: &str) -> Vec<String> {
    let issue_words = words(issue);

    keywords
        .into_iter()
        .filter(|keyword| {
            let kw_words = words(keyword);
            !kw_words.is_empty()
                && kw_words.iter().all(|w| {
                    let len = w.chars().count();
                    let limit = allowed_edits(len);
                    issue_words.iter().any(|iw| {
                        iw.chars().count().abs_diff(len) <= limit && osa_distance(w, iw) <= limit
                    })
                })
        })
        .collect()
}
