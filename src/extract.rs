use regex::Regex;
use std::sync::LazyLock;

// ============================================================================
// Remote Reference Extraction
// ============================================================================
//
// Heuristic, line-scoped scan for "download then execute" idioms. A reference
// is only emitted when the fetch verb (curl/wget) and an execution verb share
// one logical command. This is not a shell parser: heavily obfuscated
// invocations are missed and some harmless lines match. The validator narrows.

/// `curl ... | bash`, including intermediate pipeline stages and `sudo`.
/// Fetch arguments may hold quoted spans and fd redirections such as `2>&1`,
/// so a `&` there does not end the command.
static PIPE_TO_SHELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s;&|(])(?:\S*/)?(?:curl|wget)\s+((?:"[^"]*"|'[^']*'|\d*>&\d*-?|&>|[^|;&"'])*)\|\s*(?:[^|;&\s][^|;&]*\|\s*)*(?:sudo\s+(?:(?:-[ugCDhprt]|--(?:user|group|chdir|host|prompt))\s+\S+\s+|-\S+\s+)*)?(?:\S*/)?(?:bash|sh|zsh)\b"#,
    )
    .expect("pipe-to-shell regex")
});

/// `bash -c "$(curl ...)"`, `eval "$(wget ...)"`, or a substitution standing in
/// command position. Backtick form included.
static SUBSTITUTION_EXEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:(?:^|[\s;&|(])(?:\S*/)?(?:bash|sh|zsh)\s+-c\s+|(?:^|[\s;&|(])eval\s+|(?:^|[;&|])\s*)["']?(?:\$\(|`)\s*(?:\S*/)?(?:curl|wget)\s+([^)`]*)"#,
    )
    .expect("substitution regex")
});

/// `source <(curl ...)`, `. <(curl ...)`, `bash <(curl ...)`.
static PROCESS_SUBSTITUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s;&|(])(?:source|\.|(?:\S*/)?(?:bash|sh|zsh))\s+<\(\s*(?:\S*/)?(?:curl|wget)\s+([^)]*)",
    )
    .expect("process substitution regex")
});

/// Which execution idiom produced a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Idiom {
    PipeToShell,
    CommandSubstitution,
    ProcessSubstitution,
}

/// A candidate remote address found next to an execution idiom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExtractedReference {
    pub(crate) raw: String,
    /// 1-based line where the logical command starts.
    pub(crate) line: usize,
    pub(crate) idiom: Idiom,
}

/// Scan script text for candidate references. Order follows the text;
/// duplicates are kept.
pub(crate) fn extract_references(script: &str) -> Vec<ExtractedReference> {
    let mut found = Vec::new();

    for (line, command) in logical_lines(script) {
        let mut hits: Vec<(usize, &str, Idiom)> = Vec::new();
        for (regex, idiom) in [
            (&*PIPE_TO_SHELL, Idiom::PipeToShell),
            (&*SUBSTITUTION_EXEC, Idiom::CommandSubstitution),
            (&*PROCESS_SUBSTITUTION, Idiom::ProcessSubstitution),
        ] {
            for caps in regex.captures_iter(&command) {
                if let Some(args) = caps.get(1) {
                    hits.push((args.start(), args.as_str(), idiom));
                }
            }
        }
        // Several idioms can describe the same fetch; keep the first per span.
        hits.sort_by_key(|(start, _, _)| *start);
        hits.dedup_by_key(|(start, _, _)| *start);

        for (_, args, idiom) in hits {
            for raw in candidate_tokens(args) {
                found.push(ExtractedReference {
                    raw: raw.to_string(),
                    line,
                    idiom,
                });
            }
        }
    }

    found
}

/// Tokens of a fetch command's argument list that look like an address.
/// Options are skipped; anything holding `://` or shell expansion syntax is a
/// candidate so that the validator sees (and rejects) half-expanded URLs.
fn candidate_tokens(args: &str) -> impl Iterator<Item = &str> {
    shell_words(args).into_iter().filter(|word| {
        let bare = word.trim_matches(['"', '\'']);
        !bare.starts_with('-') && (bare.contains("://") || bare.contains('$') || bare.contains('`'))
    })
}

/// Whitespace split that keeps quoted spans inside one word, quotes included.
fn shell_words(args: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = None;
    let mut quote: Option<char> = None;

    for (i, c) in args.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => {
                if let Some(s) = start.take() {
                    words.push(&args[s..i]);
                }
            }
            None => {
                start.get_or_insert(i);
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
            }
        }
    }
    if let Some(s) = start {
        words.push(&args[s..]);
    }

    words
}

/// Join backslash continuations and drop comment-only lines.
fn logical_lines(script: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in script.lines().enumerate() {
        let (start, mut buf) = pending.take().unwrap_or((idx + 1, String::new()));
        let trimmed = raw.trim();

        if buf.is_empty() && trimmed.starts_with('#') {
            continue;
        }

        if let Some(stripped) = trimmed.strip_suffix('\\') {
            buf.push_str(stripped);
            buf.push(' ');
            pending = Some((start, buf));
        } else {
            buf.push_str(trimmed);
            out.push((start, buf));
        }
    }

    if let Some(rest) = pending {
        out.push(rest);
    }
    out
}
