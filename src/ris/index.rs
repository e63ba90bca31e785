use std::collections::BTreeSet;

use crate::cache::is_valid_name;

const ARCHIVE_SUFFIX: &str = ".gz";

/// Extracts snapshot file names from an HTML directory index.
///
/// Keeps `href` targets that are plain file names starting with `prefix`
/// and ending in `.gz`. The result is sorted and free of duplicates.
pub fn parse_index(html: &str, prefix: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    let mut rest = html;

    while let Some(pos) = find_href(rest) {
        rest = &rest[pos..];
        let Some(quote) = rest.chars().next() else {
            break;
        };
        rest = &rest[quote.len_utf8()..];

        let Some(end) = rest.find(quote) else {
            break;
        };
        let target = &rest[..end];
        rest = &rest[end + quote.len_utf8()..];

        if target.starts_with(prefix) && target.ends_with(ARCHIVE_SUFFIX) && is_valid_name(target)
        {
            names.insert(target.to_string());
        }
    }

    names.into_iter().collect()
}

/// Byte offset of the quote character following the next `href=`.
fn find_href(s: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(found) = s[from..].find("href=") {
        let after = from + found + "href=".len();
        match s[after..].chars().next() {
            Some('"') | Some('\'') => return Some(after),
            Some(_) => from = after,
            None => return None,
        }
    }
    None
}
