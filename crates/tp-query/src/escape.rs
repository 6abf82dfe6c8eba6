//! # Query Escaping
//!
//! The SQL grammar cannot lex everything our dialect allows: hyphenated source
//! names (`my-app`), field paths (`line.request.0.path`, `line.*.id`), the
//! reserved `date` field and `FROM *`. Those are rewritten into plain
//! identifiers before parsing and restored afterwards by locating the
//! identifier in the original text, which also recovers its original casing.
//! Quoted literals are copied through untouched.

const DASH: &str = "__dash__";
const DOT: &str = "__dot__";
const STAR: &str = "__star__";
const DATE: &str = "__date__";
const ALL: &str = "__all__";

/// Words that end a FROM list.
const CLAUSE_KEYWORDS: &[&str] = &["WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "OFFSET"];

/// A query rewritten for the grammar, paired with its original text.
#[derive(Debug, Clone)]
pub struct EscapedQuery {
    original: String,
    lowered: String,
    escaped: String,
    /// Byte ranges of quoted literals in `original`, quotes included.
    quoted: Vec<(usize, usize)>,
}

impl EscapedQuery {
    pub fn new(original: &str) -> Self {
        Self {
            original: original.to_string(),
            lowered: original.to_ascii_lowercase(),
            escaped: escape(original),
            quoted: quoted_spans(original),
        }
    }

    /// The text handed to the grammar.
    pub fn as_str(&self) -> &str {
        &self.escaped
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// Turns an identifier returned by the grammar back into the exact text
    /// the user wrote.
    pub fn restore(&self, fragment: &str) -> String {
        let restored = fragment
            .replace(DASH, "-")
            .replace(DOT, ".")
            .replace(STAR, "*")
            .replace(DATE, "date")
            .replace(ALL, "*");

        match self.locate(&restored) {
            Some(start) => self.original[start..start + restored.len()].to_string(),
            None => restored,
        }
    }

    /// Byte offset of `needle` in the original text outside quoted literals,
    /// preferring an occurrence that stands alone as an identifier.
    fn locate(&self, needle: &str) -> Option<usize> {
        if needle.is_empty() {
            return None;
        }
        let lowered_needle = needle.to_ascii_lowercase();
        let bytes = self.lowered.as_bytes();
        let mut first = None;
        for (idx, _) in self.lowered.match_indices(&lowered_needle) {
            if !self.original.is_char_boundary(idx)
                || !self.original.is_char_boundary(idx + needle.len())
            {
                continue;
            }
            if self.is_quoted(idx) {
                continue;
            }
            first.get_or_insert(idx);
            let before = idx.checked_sub(1).map(|i| bytes[i]);
            let after = bytes.get(idx + needle.len()).copied();
            if !before.is_some_and(is_path_byte) && !after.is_some_and(is_path_byte) {
                return Some(idx);
            }
        }
        first
    }

    fn is_quoted(&self, idx: usize) -> bool {
        self.quoted.iter().any(|&(start, end)| idx >= start && idx < end)
    }
}

fn quoted_spans(input: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if !matches!(c, '\'' | '"' | '`') {
            continue;
        }
        let mut end = input.len();
        while let Some((idx, ch)) = chars.next() {
            if ch != c {
                continue;
            }
            if chars.peek().is_some_and(|&(_, next)| next == c) {
                chars.next();
                continue;
            }
            end = idx + ch.len_utf8();
            break;
        }
        spans.push((start, end));
    }
    spans
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'*')
}

fn escape(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let n = chars.len();
    let mut out = String::with_capacity(input.len() + 16);
    let mut quote: Option<char> = None;
    let mut in_from = false;
    let mut last_word_numeric = false;
    let mut i = 0;

    let at = |idx: Option<usize>| idx.and_then(|j| chars.get(j).copied());

    while i < n {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if c == q {
                if at(Some(i + 1)) == Some(q) {
                    out.push(q);
                    i += 2;
                    continue;
                }
                quote = None;
            }
            i += 1;
            continue;
        }

        let prev = at(i.checked_sub(1));
        let next = at(Some(i + 1));
        let ident = |o: Option<char>| o.is_some_and(is_ident_char);
        let ident_or_star = |o: Option<char>| o.is_some_and(|ch| is_ident_char(ch) || ch == '*');

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < n && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let upper = word.to_ascii_uppercase();
                // A word next to a dot is a path segment, never a keyword.
                let segment = prev == Some('.') || chars.get(i) == Some(&'.');
                if !segment && upper == "FROM" {
                    in_from = true;
                } else if !segment && CLAUSE_KEYWORDS.contains(&upper.as_str()) {
                    in_from = false;
                }
                last_word_numeric = word.chars().all(|ch| ch.is_ascii_digit());
                if !segment && upper == "DATE" {
                    out.push_str(DATE);
                } else {
                    out.push_str(&word);
                }
                continue;
            }
            '-' if ident(prev) && ident(next) && !last_word_numeric => out.push_str(DASH),
            '.' if ident_or_star(prev)
                && ident_or_star(next)
                && !(last_word_numeric && next.is_some_and(|ch| ch.is_ascii_digit())) =>
            {
                out.push_str(DOT)
            }
            '*' if prev == Some('.') || next == Some('.') => out.push_str(STAR),
            '*' if in_from => out.push_str(ALL),
            _ => out.push(c),
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_paths_dashes_and_date() {
        let q = EscapedQuery::new(
            "SELECT * FROM my-app WHERE line.req.path = 'a-b.c' AND date > '2020-01-01'",
        );
        assert_eq!(
            q.as_str(),
            "SELECT * FROM my__dash__app WHERE line__dot__req__dot__path = 'a-b.c' AND __date__ > '2020-01-01'"
        );
    }

    #[test]
    fn test_restore_recovers_original_text() {
        let q = EscapedQuery::new("SELECT Line.CMD FROM My-App WHERE DATE = '2020-01-01'");
        assert_eq!(q.restore("Line__dot__CMD"), "Line.CMD");
        assert_eq!(q.restore("my__dash__app"), "My-App");
        assert_eq!(q.restore("__date__"), "DATE");
    }

    #[test]
    fn test_numbers_are_not_paths() {
        let q = EscapedQuery::new("SELECT * FROM app WHERE line.ratio > 1.5");
        assert!(q.as_str().ends_with("line__dot__ratio > 1.5"));
    }

    #[test]
    fn test_wildcards() {
        let q = EscapedQuery::new("SELECT COUNT(*) FROM * WHERE line.*.id = 3");
        assert_eq!(
            q.as_str(),
            "SELECT COUNT(*) FROM __all__ WHERE line__dot____star____dot__id = 3"
        );
        assert_eq!(q.restore("line__dot____star____dot__id"), "line.*.id");
        assert_eq!(q.restore("__all__"), "*");
    }

    #[test]
    fn test_quoted_literals_untouched() {
        let q = EscapedQuery::new("SELECT * FROM app WHERE line.msg = 'it''s date-time. *'");
        assert!(q.as_str().ends_with("= 'it''s date-time. *'"));
    }

    #[test]
    fn test_restore_ignores_text_inside_literals() {
        let q = EscapedQuery::new("SELECT * FROM app WHERE line.kind = 'line.level' AND line.LEVEL = 'x'");
        assert_eq!(q.restore("line__dot__LEVEL"), "line.LEVEL");
        assert_eq!(q.restore("line__dot__kind"), "line.kind");
    }

    #[test]
    fn test_keywords_as_path_segments() {
        let q = EscapedQuery::new("SELECT line.from, COUNT(*) FROM app WHERE line.date = 1");
        assert_eq!(
            q.as_str(),
            "SELECT line__dot__from, COUNT(*) FROM app WHERE line__dot__date = 1"
        );
    }

    #[test]
    fn test_date_inside_identifier_is_kept() {
        let q = EscapedQuery::new("SELECT * FROM app WHERE line.update_date = 'x'");
        assert!(q.as_str().contains("line__dot__update_date"));
    }
}
