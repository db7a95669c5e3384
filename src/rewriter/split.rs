//! Lexical helpers that run before the SQL parser: multi-statement
//! splitting, hint stripping, and leading-keyword classification. All of
//! them understand MySQL quoting (single/double quotes with backslash
//! escapes, backticks) and the three comment styles.

/// Scanner state while walking a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Code,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    state: LexState,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Scanner<'a> {
        Scanner {
            bytes: input.as_bytes(),
            pos: 0,
            state: LexState::Code,
        }
    }

    /// Advance one byte, updating quote/comment state. Returns the byte and
    /// whether it sits in plain code.
    fn next(&mut self) -> Option<(usize, u8, bool)> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let i = self.pos;
        let b = self.bytes[i];
        let peek = self.bytes.get(i + 1).copied();
        let mut in_code = self.state == LexState::Code;
        let mut advance = 1;

        match self.state {
            LexState::Code => match b {
                b'\'' => self.state = LexState::SingleQuote,
                b'"' => self.state = LexState::DoubleQuote,
                b'`' => self.state = LexState::Backtick,
                b'#' => {
                    self.state = LexState::LineComment;
                    in_code = false;
                }
                b'-' if peek == Some(b'-') => {
                    // MySQL requires whitespace (or EOL) after `--`.
                    let after = self.bytes.get(i + 2).copied();
                    if after.is_none() || after == Some(b' ') || after == Some(b'\t') || after == Some(b'\n') {
                        self.state = LexState::LineComment;
                        in_code = false;
                    }
                }
                b'/' if peek == Some(b'*') => {
                    self.state = LexState::BlockComment;
                    in_code = false;
                    advance = 2;
                }
                _ => {}
            },
            LexState::SingleQuote => match b {
                b'\\' if peek.is_some() => advance = 2,
                b'\'' if peek == Some(b'\'') => advance = 2,
                b'\'' => self.state = LexState::Code,
                _ => {}
            },
            LexState::DoubleQuote => match b {
                b'\\' if peek.is_some() => advance = 2,
                b'"' if peek == Some(b'"') => advance = 2,
                b'"' => self.state = LexState::Code,
                _ => {}
            },
            LexState::Backtick => {
                if b == b'`' {
                    if peek == Some(b'`') {
                        advance = 2;
                    } else {
                        self.state = LexState::Code;
                    }
                }
            }
            LexState::LineComment => {
                in_code = false;
                if b == b'\n' {
                    self.state = LexState::Code;
                }
            }
            LexState::BlockComment => {
                in_code = false;
                if b == b'*' && peek == Some(b'/') {
                    self.state = LexState::Code;
                    advance = 2;
                }
            }
        }

        self.pos = i + advance;
        Some((i, b, in_code))
    }
}

/// Split a COM_QUERY payload on top-level semicolons. Empty fragments
/// (trailing `;`, comment-only tails) are dropped.
pub fn split_statements(payload: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut scanner = Scanner::new(payload);

    while let Some((i, b, in_code)) = scanner.next() {
        if in_code && b == b';' {
            let fragment = &payload[start..i];
            if !is_blank(fragment) {
                out.push(fragment.trim());
            }
            start = i + 1;
        }
    }
    let tail = &payload[start.min(payload.len())..];
    if !is_blank(tail) {
        out.push(tail.trim());
    }
    out
}

/// True when the fragment holds no executable code (whitespace/comments).
fn is_blank(fragment: &str) -> bool {
    let mut scanner = Scanner::new(fragment);
    while let Some((_, b, in_code)) = scanner.next() {
        if in_code && !b.is_ascii_whitespace() && b != b'/' && b != b'-' {
            return false;
        }
    }
    true
}

/// The first keyword of a statement, uppercased, skipping comments.
pub fn leading_keyword(sql: &str) -> Option<(String, &str)> {
    let mut scanner = Scanner::new(sql);
    let mut start = None;
    let mut end = sql.len();
    while let Some((i, b, in_code)) = scanner.next() {
        if !in_code {
            continue;
        }
        let is_word = b.is_ascii_alphanumeric() || b == b'_' || b == b'@';
        match start {
            None if is_word => start = Some(i),
            None => continue,
            Some(_) if is_word => continue,
            Some(_) => {
                end = i;
                break;
            }
        }
    }
    let start = start?;
    let word = sql[start..end].to_ascii_uppercase();
    Some((word, sql[end..].trim_start()))
}

/// A word with its byte span, taken from code regions only.
#[derive(Debug, Clone)]
struct Word {
    start: usize,
    end: usize,
    upper: String,
}

fn code_words(sql: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut scanner = Scanner::new(sql);
    let mut current: Option<usize> = None;
    let mut last_end = 0usize;

    while let Some((i, b, in_code)) = scanner.next() {
        let is_word = in_code && (b.is_ascii_alphanumeric() || b == b'_');
        match current {
            None if is_word => current = Some(i),
            Some(start) if !is_word => {
                words.push(Word {
                    start,
                    end: i,
                    upper: sql[start..i].to_ascii_uppercase(),
                });
                current = None;
            }
            _ => {}
        }
        last_end = i + 1;
    }
    if let Some(start) = current {
        words.push(Word {
            start,
            end: last_end.max(sql.len()),
            upper: sql[start..].to_ascii_uppercase(),
        });
    }
    words
}

/// Remove MySQL planner hints the backend cannot parse and normalize the
/// legacy shared-lock clause. Optimizer comments (`/*+ ... */`) are left to
/// the parser, which treats comments as whitespace.
///
/// Handled here: `STRAIGHT_JOIN` (join form becomes a plain `JOIN`, the
/// SELECT-modifier form is dropped), `USE/FORCE/IGNORE INDEX|KEY (...)`
/// groups, and `LOCK IN SHARE MODE` → `FOR SHARE`.
pub fn strip_mysql_hints(sql: &str) -> (String, Vec<&'static str>) {
    let words = code_words(sql);
    let mut notes = Vec::new();
    // (span start, span end, replacement)
    let mut edits: Vec<(usize, usize, &str)> = Vec::new();

    let mut i = 0;
    while i < words.len() {
        let w = &words[i];
        match w.upper.as_str() {
            "STRAIGHT_JOIN" => {
                let after_select = i > 0 && words[i - 1].upper == "SELECT";
                let replacement = if after_select { "" } else { "JOIN" };
                edits.push((w.start, w.end, replacement));
                notes.push("straight_join");
            }
            "USE" | "FORCE" | "IGNORE"
                if words
                    .get(i + 1)
                    .is_some_and(|n| n.upper == "INDEX" || n.upper == "KEY") =>
            {
                // Optional `FOR JOIN|ORDER BY|GROUP BY` between the keyword
                // and the index list.
                let mut j = i + 2;
                if words.get(j).is_some_and(|n| n.upper == "FOR") {
                    j += 1;
                    if words.get(j).is_some_and(|n| n.upper == "ORDER" || n.upper == "GROUP") {
                        j += 1;
                    }
                    j += 1; // BY or JOIN
                }
                let list_start = words.get(j - 1).map(|w| w.end).unwrap_or(w.end);
                let end = match sql[list_start..].find('(') {
                    Some(open) => match sql[list_start + open..].find(')') {
                        Some(close) => list_start + open + close + 1,
                        None => words[j - 1].end,
                    },
                    None => words[j - 1].end,
                };
                edits.push((w.start, end, ""));
                notes.push("index_hint");
                while i + 1 < words.len() && words[i + 1].start < end {
                    i += 1;
                }
            }
            "LOCK"
                if words.get(i + 1).is_some_and(|n| n.upper == "IN")
                    && words.get(i + 2).is_some_and(|n| n.upper == "SHARE")
                    && words.get(i + 3).is_some_and(|n| n.upper == "MODE") =>
            {
                edits.push((w.start, words[i + 3].end, "FOR SHARE"));
                notes.push("lock_in_share_mode");
                i += 3;
            }
            _ => {}
        }
        i += 1;
    }

    if edits.is_empty() {
        return (sql.to_string(), notes);
    }

    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0usize;
    for (start, end, replacement) in edits {
        out.push_str(&sql[cursor..start]);
        out.push_str(replacement);
        cursor = end;
    }
    out.push_str(&sql[cursor..]);
    (out, notes)
}

/// True when `word` appears as a standalone word outside strings/comments.
pub fn contains_code_word(sql: &str, word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    code_words(sql).iter().any(|w| w.upper == upper)
}

/// Translate `?` placeholders to `$1..$n` without parsing; used when SQL
/// rewriting is disabled.
pub fn relabel_placeholders_lexical(sql: &str) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut scanner = Scanner::new(sql);
    let mut count = 0usize;
    let mut cursor = 0usize;

    while let Some((i, b, in_code)) = scanner.next() {
        if in_code && b == b'?' {
            out.push_str(&sql[cursor..i]);
            count += 1;
            out.push_str(&format!("${count}"));
            cursor = i + 1;
        }
    }
    out.push_str(&sql[cursor..]);
    (out, count)
}
