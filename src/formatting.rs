//! Canonical text form for stored HTML, CSS and JavaScript bodies.
//!
//! Stored content is UTF-8 without in-document charset declarations and is
//! reflowed one construct per line so recordings diff cleanly. The reflow only
//! adds or removes whitespace where the language ignores it: original line
//! breaks in scripts are kept (automatic semicolon insertion depends on them),
//! and `<pre>`/`<textarea>` bodies, string literals, template literals and
//! comments are copied verbatim.

use std::sync::OnceLock;

use regex::Regex;

const PRINT_WIDTH: usize = 120;
const INDENT: &str = "  ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormattingError {
    #[error("`{0}` is not a supported text content type")]
    UnsupportedMime(String),
    #[error("cannot transcode from unknown charset `{0}`")]
    UnknownCharset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Html,
    Css,
    Js,
}

fn text_kind(mime: &str) -> Option<TextKind> {
    let mime = mime.trim();
    if mime.eq_ignore_ascii_case("text/html") {
        Some(TextKind::Html)
    } else if mime.eq_ignore_ascii_case("text/css") {
        Some(TextKind::Css)
    } else if ["text/javascript", "application/javascript", "application/x-javascript"]
        .iter()
        .any(|js| mime.eq_ignore_ascii_case(js))
    {
        Some(TextKind::Js)
    } else {
        None
    }
}

pub fn is_text_like(mime: &str) -> bool {
    text_kind(mime).is_some()
}

/// Decodes `bytes` declared as `charset` into a Rust string.
pub fn ensure_canonical_text(bytes: &[u8], charset: &str) -> Result<String, FormattingError> {
    let label = charset.trim().to_ascii_lowercase();
    let text = if label.contains("utf8") || label.contains("utf-8") || label.contains("ascii") {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
            .ok_or_else(|| FormattingError::UnknownCharset(charset.to_owned()))?;
        let (decoded, _, _) = encoding.decode(bytes);
        decoded.into_owned()
    };
    Ok(text
        .strip_prefix('\u{feff}')
        .map(str::to_owned)
        .unwrap_or(text))
}

/// Strips charset declarations and reflows `text` according to `mime`.
pub fn normalize_markup_like(text: &str, mime: &str) -> Result<String, FormattingError> {
    match text_kind(mime) {
        Some(TextKind::Html) => {
            let text = meta_charset_pattern().replace_all(text, "");
            let text = script_tag_pattern().replace_all(&text, |caps: &regex::Captures<'_>| {
                charset_attr_pattern().replace(&caps[0], "").into_owned()
            });
            Ok(format_html(&text))
        }
        Some(TextKind::Css) => {
            let text = charset_rule_pattern().replace_all(text, "");
            Ok(format_css(&text))
        }
        Some(TextKind::Js) => Ok(format_js(text)),
        None => Err(FormattingError::UnsupportedMime(mime.to_owned())),
    }
}

/// Decode then normalize; the whole canonicalization step for one body.
pub fn convert_editable_text(
    content: &[u8],
    mime: &str,
    charset: Option<&str>,
) -> Result<String, FormattingError> {
    if !is_text_like(mime) {
        return Err(FormattingError::UnsupportedMime(mime.to_owned()));
    }
    let text = ensure_canonical_text(content, charset.unwrap_or("utf-8"))?;
    normalize_markup_like(&text, mime)
}

fn meta_charset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)<meta\s+charset\s*=\s*["']?[^"'\s>]*["']?\s*/?>"#)
            .expect("meta charset pattern is valid")
    })
}

fn script_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)<script\b[^>]*>").expect("script pattern is valid"))
}

fn charset_attr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)\s*charset\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
            .expect("charset attribute pattern is valid")
    })
}

fn charset_rule_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)@charset\s+["'][^"']*["']\s*;"#).expect("@charset pattern is valid")
    })
}

fn push_indented(out: &mut String, depth: usize, line: &str) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push_str(line);
    out.push('\n');
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_ascii_whitespace() {
            in_space = true;
            continue;
        }
        if in_space && !out.is_empty() {
            out.push(' ');
        }
        in_space = false;
        out.push(ch);
    }
    if in_space && !out.is_empty() {
        out.push(' ');
    }
    out
}

/// Re-indents a block of lines relative to its least indented line. Only
/// ASCII spaces and tabs count as indentation.
fn dedent_lines(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.trim_matches('\n').lines().collect();
    let common = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                line[common..].trim_end().to_owned()
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HTML

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];
const INLINE_ELEMENTS: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "br", "button", "cite", "code", "data", "dfn", "em", "i",
    "img", "input", "kbd", "label", "mark", "q", "s", "samp", "small", "span", "strong", "sub",
    "sup", "time", "u", "var", "wbr",
];
const VERBATIM_ELEMENTS: &[&str] = &["pre", "textarea"];
const ALWAYS_BROKEN_ELEMENTS: &[&str] = &["html", "head", "body"];

#[derive(Debug, PartialEq, Eq)]
enum HtmlToken<'a> {
    Text(&'a str),
    Comment(&'a str),
    Declaration(&'a str),
    StartTag {
        name: String,
        raw: &'a str,
        self_closing: bool,
    },
    EndTag {
        name: String,
        raw: &'a str,
    },
    RawText {
        open: &'a str,
        name: String,
        body: &'a str,
        close: &'a str,
    },
}

fn tokenize_html(src: &str) -> Vec<HtmlToken<'_>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut text_start = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let next = bytes.get(i + 1).copied();
        let is_markup = match next {
            Some(b'!') => true,
            Some(b'/') => bytes.get(i + 2).is_some_and(u8::is_ascii_alphabetic),
            Some(ch) => ch.is_ascii_alphabetic(),
            None => false,
        };
        if !is_markup {
            i += 1;
            continue;
        }
        if text_start < i {
            tokens.push(HtmlToken::Text(&src[text_start..i]));
        }

        if src[i..].starts_with("<!--") {
            let end = src[i + 4..]
                .find("-->")
                .map(|pos| i + 4 + pos + 3)
                .unwrap_or(bytes.len());
            tokens.push(HtmlToken::Comment(&src[i..end]));
            i = end;
        } else if next == Some(b'!') {
            let end = src[i..].find('>').map(|pos| i + pos + 1).unwrap_or(bytes.len());
            tokens.push(HtmlToken::Declaration(&src[i..end]));
            i = end;
        } else {
            let end = scan_tag_end(bytes, i);
            let raw = &src[i..end];
            let is_end = next == Some(b'/');
            let name_start = if is_end { i + 2 } else { i + 1 };
            let name_len = bytes[name_start..end]
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric() || **b == b'-' || **b == b':')
                .count();
            let name = src[name_start..name_start + name_len].to_ascii_lowercase();

            if is_end {
                tokens.push(HtmlToken::EndTag { name, raw });
                i = end;
            } else if is_raw_text_element(&name) {
                let close_at = find_closing_tag(src, end, &name);
                let close_end = src[close_at..]
                    .find('>')
                    .map(|pos| close_at + pos + 1)
                    .unwrap_or(bytes.len());
                tokens.push(HtmlToken::RawText {
                    open: raw,
                    body: &src[end..close_at],
                    close: &src[close_at..close_end],
                    name,
                });
                i = close_end;
            } else {
                let self_closing = raw.trim_end_matches('>').trim_end().ends_with('/');
                tokens.push(HtmlToken::StartTag {
                    name,
                    raw,
                    self_closing,
                });
                i = end;
            }
        }
        text_start = i;
    }
    if text_start < bytes.len() {
        tokens.push(HtmlToken::Text(&src[text_start..]));
    }
    tokens
}

fn is_raw_text_element(name: &str) -> bool {
    matches!(name, "script" | "style") || VERBATIM_ELEMENTS.contains(&name)
}

fn scan_tag_end(bytes: &[u8], start: usize) -> usize {
    let mut quote: Option<u8> = None;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return start + offset + 1,
            None => {}
        }
    }
    bytes.len()
}

fn find_closing_tag(src: &str, from: usize, name: &str) -> usize {
    let needle = format!("</{name}");
    let lower = src[from..].to_ascii_lowercase();
    lower
        .find(&needle)
        .map(|pos| from + pos)
        .unwrap_or(src.len())
}

fn normalize_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for ch in raw.chars() {
        match quote {
            Some(q) => {
                out.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch.is_ascii_whitespace() => pending_space = true,
            None => {
                if pending_space && ch != '>' {
                    out.push(' ');
                }
                pending_space = false;
                if ch == '"' || ch == '\'' {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HtmlLineKind {
    Tag,
    Inline,
    Verbatim,
}

#[derive(Debug)]
struct HtmlLine {
    depth: usize,
    kind: HtmlLineKind,
    text: String,
}

#[derive(Debug)]
struct OpenElement {
    name: String,
    line: usize,
}

#[derive(Debug, Default)]
struct HtmlPrinter {
    lines: Vec<HtmlLine>,
    run: String,
    stack: Vec<OpenElement>,
}

impl HtmlPrinter {
    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn push_line(&mut self, kind: HtmlLineKind, text: String) {
        let depth = self.depth();
        self.lines.push(HtmlLine { depth, kind, text });
    }

    fn push_inline(&mut self, fragment: &str) {
        let collapsed = collapse_whitespace(fragment);
        if fragment.starts_with(|ch: char| ch.is_ascii_whitespace())
            && !self.run.is_empty()
            && !self.run.ends_with(' ')
        {
            self.run.push(' ');
        }
        self.run.push_str(&collapsed);
    }

    fn flush_run(&mut self) {
        let run = std::mem::take(&mut self.run);
        let run = run.trim();
        if !run.is_empty() {
            self.push_line(HtmlLineKind::Inline, run.to_owned());
        }
    }

    fn open(&mut self, name: String, raw: &str) {
        self.flush_run();
        self.push_line(HtmlLineKind::Tag, normalize_tag(raw));
        let line = self.lines.len() - 1;
        self.stack.push(OpenElement { name, line });
    }

    fn close(&mut self, name: &str, raw: &str) {
        self.flush_run();
        let closing = normalize_tag(raw);
        let Some(pos) = self.stack.iter().rposition(|open| open.name == name) else {
            self.push_line(HtmlLineKind::Tag, closing);
            return;
        };
        self.stack.truncate(pos + 1);
        let Some(open) = self.stack.pop() else {
            return;
        };

        let children = self.lines.len() - open.line - 1;
        if children == 0 {
            self.lines[open.line].text.push_str(&closing);
            return;
        }
        if children == 1 && !ALWAYS_BROKEN_ELEMENTS.contains(&name) {
            let child = &self.lines[open.line + 1];
            let width = open_width(&self.lines[open.line]) + child.text.len() + closing.len();
            if child.kind == HtmlLineKind::Inline && width <= PRINT_WIDTH {
                let child = self.lines.pop().map(|line| line.text).unwrap_or_default();
                let parent = &mut self.lines[open.line];
                parent.text.push_str(&child);
                parent.text.push_str(&closing);
                parent.kind = HtmlLineKind::Inline;
                return;
            }
        }
        self.push_line(HtmlLineKind::Tag, closing);
    }

    fn raw_text(&mut self, name: &str, open: &str, body: &str, close: &str) {
        self.flush_run();
        let open = normalize_tag(open);
        let close = normalize_tag(close);
        if VERBATIM_ELEMENTS.contains(&name) {
            self.push_line(HtmlLineKind::Verbatim, format!("{open}{body}{close}"));
            return;
        }
        if body.trim().is_empty() {
            self.push_line(HtmlLineKind::Tag, format!("{open}{close}"));
            return;
        }

        let formatted = match name {
            "style" => format_css(body),
            _ if is_javascript_script(&open) => format_js(body),
            _ => dedent_lines(body).join("\n"),
        };
        self.push_line(HtmlLineKind::Tag, open);
        let depth = self.depth() + 1;
        for line in formatted.lines() {
            self.lines.push(HtmlLine {
                depth: if line.is_empty() { 0 } else { depth },
                kind: HtmlLineKind::Verbatim,
                text: line.to_owned(),
            });
        }
        self.push_line(HtmlLineKind::Tag, close);
    }

    fn finish(mut self) -> String {
        self.flush_run();
        let mut out = String::new();
        for line in &self.lines {
            if line.text.is_empty() {
                out.push('\n');
            } else {
                push_indented(&mut out, line.depth, &line.text);
            }
        }
        out
    }
}

fn open_width(line: &HtmlLine) -> usize {
    line.depth * INDENT.len() + line.text.len()
}

fn is_javascript_script(open_tag: &str) -> bool {
    static TYPE_ATTR: OnceLock<Regex> = OnceLock::new();
    let pattern = TYPE_ATTR.get_or_init(|| {
        Regex::new(r#"(?i)\stype\s*=\s*["']?([^"'\s>]+)"#).expect("type attribute pattern is valid")
    });
    match pattern.captures(open_tag) {
        Some(caps) => {
            let ty = caps[1].to_ascii_lowercase();
            ty.contains("javascript") || ty == "module" || ty.contains("ecmascript")
        }
        None => true,
    }
}

pub fn format_html(src: &str) -> String {
    let mut printer = HtmlPrinter::default();
    for token in tokenize_html(src) {
        match token {
            HtmlToken::Text(text) => printer.push_inline(text),
            HtmlToken::Comment(text) | HtmlToken::Declaration(text) => {
                printer.flush_run();
                printer.push_line(HtmlLineKind::Verbatim, text.trim().to_owned());
            }
            HtmlToken::StartTag {
                name,
                raw,
                self_closing,
            } => {
                if INLINE_ELEMENTS.contains(&name.as_str()) {
                    printer.run.push_str(&normalize_tag(raw));
                } else if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                    printer.flush_run();
                    printer.push_line(HtmlLineKind::Tag, normalize_tag(raw));
                } else {
                    printer.open(name, raw);
                }
            }
            HtmlToken::EndTag { name, raw } => {
                if INLINE_ELEMENTS.contains(&name.as_str()) {
                    printer.run.push_str(&normalize_tag(raw));
                } else {
                    printer.close(&name, raw);
                }
            }
            HtmlToken::RawText {
                open,
                name,
                body,
                close,
            } => printer.raw_text(&name, open, body, close),
        }
    }
    printer.finish()
}

// ---------------------------------------------------------------------------
// CSS

#[derive(Debug, Default)]
struct CssPrinter {
    out: String,
    depth: usize,
    statement: String,
}

impl CssPrinter {
    fn push_char(&mut self, ch: char) {
        if ch.is_ascii_whitespace() {
            if !self.statement.is_empty() && !self.statement.ends_with(' ') {
                self.statement.push(' ');
            }
        } else {
            self.statement.push(ch);
        }
    }

    fn take_statement(&mut self) -> String {
        let statement = std::mem::take(&mut self.statement);
        statement.trim().to_owned()
    }

    fn open_block(&mut self) {
        let selector = self.take_statement();
        push_indented(&mut self.out, self.depth, &format!("{selector} {{"));
        self.depth += 1;
    }

    fn end_statement(&mut self, terminated: bool) {
        let statement = self.take_statement();
        if statement.is_empty() {
            return;
        }
        let line = match statement.split_once(':') {
            Some((property, value)) if self.depth > 0 && !statement.starts_with('@') => {
                format!("{}: {};", property.trim(), value.trim())
            }
            _ if terminated || self.depth > 0 => format!("{statement};"),
            _ => statement,
        };
        push_indented(&mut self.out, self.depth, &line);
    }

    fn close_block(&mut self) {
        self.end_statement(false);
        self.depth = self.depth.saturating_sub(1);
        push_indented(&mut self.out, self.depth, "}");
    }
}

pub fn format_css(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut printer = CssPrinter::default();
    let mut parens = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '"' | '\'' => {
                let end = scan_chars_string(&chars, i, ch);
                printer.statement.extend(&chars[i..end]);
                i = end;
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find_chars(&chars, i + 2, &['*', '/'])
                    .map(|pos| pos + 2)
                    .unwrap_or(chars.len());
                let comment: String = chars[i..end].iter().collect();
                if printer.statement.trim().is_empty() {
                    printer.statement.clear();
                    push_indented(&mut printer.out, printer.depth, comment.trim());
                } else {
                    printer.statement.push_str(&comment);
                }
                i = end;
                continue;
            }
            '(' => {
                parens += 1;
                printer.push_char(ch);
            }
            ')' => {
                parens = parens.saturating_sub(1);
                printer.push_char(ch);
            }
            '{' if parens == 0 => printer.open_block(),
            '}' if parens == 0 => printer.close_block(),
            ';' if parens == 0 => printer.end_statement(true),
            _ => printer.push_char(ch),
        }
        i += 1;
    }
    printer.end_statement(false);
    printer.out
}

fn scan_chars_string(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ch if ch == quote => return i + 1,
            '\n' => return i,
            _ => i += 1,
        }
    }
    chars.len()
}

fn find_chars(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if from >= chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos)
}

// ---------------------------------------------------------------------------
// JavaScript

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsKind {
    Word,
    Punct,
    Literal,
    LineComment,
    BlockComment,
}

#[derive(Debug, Clone, Copy)]
struct JsToken<'a> {
    kind: JsKind,
    text: &'a str,
    space_before: bool,
    newlines_before: usize,
}

const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];
const NO_BREAK_AFTER_BRACE: &[&str] = &[
    "else", "catch", "finally", "while", "instanceof", "in", "of", "as",
];

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn regex_allowed(prev: Option<&JsToken<'_>>) -> bool {
    match prev {
        None => true,
        Some(token) => match token.kind {
            JsKind::Word => REGEX_PRECEDING_KEYWORDS.contains(&token.text),
            JsKind::Literal => false,
            JsKind::Punct => !matches!(token.text, ")" | "]" | "}"),
            JsKind::LineComment | JsKind::BlockComment => true,
        },
    }
}

fn scan_js_string(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut j = start + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' => return j,
            b if b == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

fn scan_template(bytes: &[u8], start: usize) -> usize {
    let mut j = start + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'`' => return j + 1,
            b'$' if bytes.get(j + 1) == Some(&b'{') => j = scan_template_expr(bytes, j + 2),
            _ => j += 1,
        }
    }
    bytes.len()
}

fn scan_template_expr(bytes: &[u8], start: usize) -> usize {
    let mut depth = 1usize;
    let mut j = start;
    while j < bytes.len() {
        match bytes[j] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return j + 1;
                }
            }
            quote @ (b'"' | b'\'') => {
                j = scan_js_string(bytes, j, quote);
                continue;
            }
            b'`' => {
                j = scan_template(bytes, j);
                continue;
            }
            _ => {}
        }
        j += 1;
    }
    bytes.len()
}

fn scan_regex(bytes: &[u8], start: usize) -> Option<usize> {
    let mut j = start + 1;
    let mut in_class = false;
    while j < bytes.len() {
        match bytes[j] {
            b'\n' => return None,
            b'\\' => j += 1,
            b'[' => in_class = true,
            b']' => in_class = false,
            b'/' if !in_class => {
                j += 1;
                while j < bytes.len() && is_word_byte(bytes[j]) {
                    j += 1;
                }
                return Some(j);
            }
            _ => {}
        }
        j += 1;
    }
    None
}

fn tokenize_js(src: &str) -> Vec<JsToken<'_>> {
    let bytes = src.as_bytes();
    let mut tokens: Vec<JsToken<'_>> = Vec::new();
    let mut space_before = false;
    let mut newlines_before = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\n' {
            newlines_before += 1;
            i += 1;
            continue;
        }
        if b.is_ascii_whitespace() {
            space_before = true;
            i += 1;
            continue;
        }

        let prev = tokens
            .iter()
            .rev()
            .find(|token| !matches!(token.kind, JsKind::LineComment | JsKind::BlockComment));
        let next = bytes.get(i + 1).copied();
        let (kind, end) = match b {
            b'/' if next == Some(b'/') => {
                let end = src[i..].find('\n').map(|pos| i + pos).unwrap_or(bytes.len());
                (JsKind::LineComment, end)
            }
            b'/' if next == Some(b'*') => {
                let end = src[i + 2..]
                    .find("*/")
                    .map(|pos| i + 2 + pos + 2)
                    .unwrap_or(bytes.len());
                (JsKind::BlockComment, end)
            }
            b'/' if regex_allowed(prev) => match scan_regex(bytes, i) {
                Some(end) => (JsKind::Literal, end),
                None => (JsKind::Punct, i + 1),
            },
            b'"' | b'\'' => (JsKind::Literal, scan_js_string(bytes, i, b)),
            b'`' => (JsKind::Literal, scan_template(bytes, i)),
            _ if is_word_byte(b) => {
                let len = bytes[i..].iter().take_while(|b| is_word_byte(**b)).count();
                (JsKind::Word, i + len)
            }
            _ => (JsKind::Punct, i + 1),
        };
        let end = end.min(bytes.len());
        tokens.push(JsToken {
            kind,
            text: &src[i..end],
            space_before,
            newlines_before,
        });
        space_before = false;
        newlines_before = 0;
        i = end;
    }
    tokens
}

#[derive(Debug, Clone, Copy)]
struct JsOpener {
    ch: u8,
    depth: usize,
}

fn break_after(token: &JsToken<'_>, next: Option<&JsToken<'_>>, stack: &[JsOpener]) -> bool {
    let Some(next) = next else {
        return false;
    };
    match (token.kind, token.text) {
        (JsKind::LineComment, _) => true,
        (JsKind::Punct, "{") => next.text != "}",
        (JsKind::Punct, ";") => stack.last().is_none_or(|opener| opener.ch != b'('),
        (JsKind::Punct, "}") => match next.kind {
            JsKind::Word => !NO_BREAK_AFTER_BRACE.contains(&next.text),
            JsKind::Literal => true,
            _ => false,
        },
        _ => false,
    }
}

pub fn format_js(src: &str) -> String {
    let tokens = tokenize_js(src);
    let mut out = String::new();
    let mut line = String::new();
    let mut line_depth = 0usize;
    let mut stack: Vec<JsOpener> = Vec::new();
    let mut force_break = false;

    for (idx, token) in tokens.iter().enumerate() {
        let closes = token.kind == JsKind::Punct && matches!(token.text, ")" | "]" | "}");
        let prev_is_open_brace = idx > 0 && tokens[idx - 1].text == "{";
        let mut brk = token.newlines_before > 0 || force_break;
        if token.kind == JsKind::Punct && token.text == "}" && !prev_is_open_brace {
            brk = true;
        }

        if idx == 0 {
            line_depth = 0;
        } else if brk {
            flush_js_line(&mut out, &line, line_depth);
            line.clear();
            if token.newlines_before >= 2 {
                out.push('\n');
            }
            line_depth = if closes {
                stack.last().map(|opener| opener.depth).unwrap_or(0)
            } else {
                stack.last().map(|opener| opener.depth + 1).unwrap_or(0)
            };
        } else if token.space_before && !line.is_empty() {
            line.push(' ');
        }
        line.push_str(token.text);

        if closes {
            stack.pop();
        } else if token.kind == JsKind::Punct && matches!(token.text, "(" | "[" | "{") {
            stack.push(JsOpener {
                ch: token.text.as_bytes()[0],
                depth: line_depth,
            });
        }
        force_break = break_after(token, tokens.get(idx + 1), &stack);
    }
    flush_js_line(&mut out, &line, line_depth);
    out
}

fn flush_js_line(out: &mut String, line: &str, depth: usize) {
    let line = line.trim_end();
    if !line.is_empty() {
        push_indented(out, depth, line);
    }
}
