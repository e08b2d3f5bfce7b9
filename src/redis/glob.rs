//! Glob-style pattern matching for KEYS.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes.

pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match_from(pattern, text, 0, 0)
}

fn match_from(pattern: &[u8], text: &[u8], p: usize, t: usize) -> bool {
    if p >= pattern.len() {
        return t >= text.len();
    }
    match pattern[p] {
        b'*' => {
            // Collapse runs of stars.
            let mut next = p;
            while next < pattern.len() && pattern[next] == b'*' {
                next += 1;
            }
            if next == pattern.len() {
                return true;
            }
            (t..=text.len()).any(|i| match_from(pattern, text, next, i))
        }
        b'?' => t < text.len() && match_from(pattern, text, p + 1, t + 1),
        b'[' => {
            let mut end = p + 1;
            while end < pattern.len() && pattern[end] != b']' {
                if pattern[end] == b'\\' {
                    end += 1;
                }
                end += 1;
            }
            if end >= pattern.len() || t >= text.len() {
                return false;
            }
            let class = &pattern[p + 1..end];
            let (negate, class) = match class.first() {
                Some(b'^') => (true, &class[1..]),
                _ => (false, class),
            };
            let c = text[t];
            let mut matched = false;
            let mut i = 0;
            while i < class.len() {
                if class[i] == b'\\' && i + 1 < class.len() {
                    matched |= class[i + 1] == c;
                    i += 2;
                } else if i + 2 < class.len() && class[i + 1] == b'-' {
                    let (lo, hi) = if class[i] <= class[i + 2] {
                        (class[i], class[i + 2])
                    } else {
                        (class[i + 2], class[i])
                    };
                    matched |= (lo..=hi).contains(&c);
                    i += 3;
                } else {
                    matched |= class[i] == c;
                    i += 1;
                }
            }
            matched != negate && match_from(pattern, text, end + 1, t + 1)
        }
        b'\\' if p + 1 < pattern.len() => {
            t < text.len() && text[t] == pattern[p + 1] && match_from(pattern, text, p + 2, t + 1)
        }
        ch => t < text.len() && text[t] == ch && match_from(pattern, text, p + 1, t + 1),
    }
}
