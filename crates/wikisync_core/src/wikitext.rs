//! Wikitext to markdown-ish plain prose.
//!
//! This is a lossy reduction: templates, references, categories, file
//! embeds and layout markup are dropped, while headings, lists, link labels,
//! table cell text and emphasis survive. The output is deterministic for a
//! given input, which the export digest relies on.

const DROPPED_ELEMENTS: &[&str] = &["ref", "includeonly", "gallery", "references"];
const DROPPED_LINK_PREFIXES: &[&str] = &["category:", "file:", "image:", "media:"];

pub fn to_markdown(wikitext: &str) -> String {
    if let (true, target) = parse_redirect(wikitext) {
        return match target {
            Some(target) => format!("Redirects to {target}."),
            None => String::new(),
        };
    }

    let text = strip_comments(wikitext);
    let text = strip_elements(&text, DROPPED_ELEMENTS);
    let text = strip_templates(&text);
    let text = flatten_tables(&text);
    let text = text.lines().map(convert_line).collect::<Vec<_>>().join("\n");
    let text = replace_internal_links(&text);
    let text = replace_external_links(&text);
    let text = convert_emphasis(&text);
    let text = strip_behavior_switches(&text);
    let text = strip_html_tags(&text);
    let text = decode_entities(&text);
    collapse_blank_lines(&text)
}

pub fn parse_redirect(content: &str) -> (bool, Option<String>) {
    let trimmed = content.trim();
    if !trimmed.to_ascii_uppercase().starts_with("#REDIRECT") {
        return (false, None);
    }
    if let Some(start) = trimmed.find("[[")
        && let Some(end) = trimmed[start + 2..].find("]]")
    {
        let target = trimmed[start + 2..start + 2 + end].trim().to_string();
        if !target.is_empty() {
            return (true, Some(target));
        }
    }
    (true, None)
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        rest = match rest[start + 4..].find("-->") {
            Some(end) => &rest[start + 4 + end + 3..],
            None => "",
        };
    }
    out.push_str(rest);
    out
}

fn strip_elements(input: &str, names: &[&str]) -> String {
    let mut text = input.to_string();
    for name in names {
        text = strip_element(&text, name);
    }
    text
}

/// Removes `<name ...>...</name>` and `<name ... />`. Matching is ASCII
/// case-insensitive; the lowered copy shares byte offsets with `input`.
fn strip_element(input: &str, name: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0usize;

    while let Some(found) = lower[cursor..].find(&open) {
        let start = cursor + found;
        let after = start + open.len();
        let boundary = lower[after..].chars().next();
        if !matches!(boundary, Some(' ' | '\t' | '\n' | '>' | '/')) {
            out.push_str(&input[cursor..after]);
            cursor = after;
            continue;
        }

        out.push_str(&input[cursor..start]);
        let Some(tag_end) = lower[after..].find('>') else {
            cursor = input.len();
            break;
        };
        let tag_end = after + tag_end;
        if lower[..tag_end].ends_with('/') {
            cursor = tag_end + 1;
            continue;
        }
        cursor = match lower[tag_end + 1..].find(&close) {
            Some(close_at) => tag_end + 1 + close_at + close.len(),
            None => tag_end + 1,
        };
    }

    if cursor < input.len() {
        out.push_str(&input[cursor..]);
    }
    out
}

/// Drops `{{...}}` transclusions including nested ones. An unbalanced
/// opener keeps the remainder verbatim so prose is never lost.
fn strip_templates(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;
    let mut cursor = 0usize;
    let mut segment_start = 0usize;
    let mut outer_start = 0usize;

    while cursor < bytes.len() {
        if cursor + 1 < bytes.len() && bytes[cursor] == b'{' && bytes[cursor + 1] == b'{' {
            if depth == 0 {
                out.push_str(&input[segment_start..cursor]);
                outer_start = cursor;
            }
            depth += 1;
            cursor += 2;
            continue;
        }
        if depth > 0 && cursor + 1 < bytes.len() && bytes[cursor] == b'}' && bytes[cursor + 1] == b'}'
        {
            depth -= 1;
            cursor += 2;
            if depth == 0 {
                segment_start = cursor;
            }
            continue;
        }
        cursor += 1;
    }

    if depth == 0 {
        out.push_str(&input[segment_start..]);
    } else {
        out.push_str(&input[outer_start..]);
    }
    out
}

fn flatten_tables(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut depth = 0usize;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("{|") {
            flush_row(&mut row, &mut out);
            depth += 1;
            continue;
        }
        if depth == 0 {
            out.push(line.to_string());
            continue;
        }
        if trimmed.starts_with("|}") {
            flush_row(&mut row, &mut out);
            depth -= 1;
            continue;
        }
        if trimmed.starts_with("|-") {
            flush_row(&mut row, &mut out);
            continue;
        }
        if let Some(caption) = trimmed.strip_prefix("|+") {
            flush_row(&mut row, &mut out);
            out.push(cell_text(caption));
            continue;
        }
        if let Some(cells) = trimmed.strip_prefix('!') {
            row.extend(
                cells
                    .split("!!")
                    .flat_map(|cell| cell.split("||"))
                    .map(cell_text),
            );
        } else if let Some(cells) = trimmed.strip_prefix('|') {
            row.extend(cells.split("||").map(cell_text));
        } else if !trimmed.is_empty() {
            row.push(cell_text(trimmed));
        }
    }
    flush_row(&mut row, &mut out);
    out.join("\n")
}

fn flush_row(row: &mut Vec<String>, out: &mut Vec<String>) {
    let cells = row
        .drain(..)
        .filter(|cell| !cell.is_empty())
        .collect::<Vec<_>>();
    if !cells.is_empty() {
        out.push(cells.join(" | "));
    }
}

/// `style="x" | Text` keeps only `Text`.
fn cell_text(cell: &str) -> String {
    if let Some((attributes, content)) = cell.split_once('|')
        && !attributes.contains("[[")
        && attributes.contains('=')
    {
        return content.trim().to_string();
    }
    cell.trim().to_string()
}

fn convert_line(line: &str) -> String {
    let trimmed = line.trim_end();
    if let Some(heading) = convert_heading(trimmed) {
        return heading;
    }

    let marker_len = trimmed
        .bytes()
        .take_while(|byte| matches!(byte, b'*' | b'#' | b':' | b';'))
        .count();
    if marker_len > 0 {
        let body = trimmed[marker_len..].trim();
        let indent = "  ".repeat(marker_len - 1);
        return match trimmed.as_bytes()[marker_len - 1] {
            b'*' => format!("{indent}- {body}"),
            b'#' => format!("{indent}1. {body}"),
            b';' => format!("{indent}**{body}**"),
            _ => format!("{indent}{body}"),
        };
    }

    if trimmed.len() >= 4 && trimmed.bytes().all(|byte| byte == b'-') {
        return String::new();
    }
    trimmed.to_string()
}

fn convert_heading(line: &str) -> Option<String> {
    let leading = line.bytes().take_while(|byte| *byte == b'=').count();
    let trailing = line.bytes().rev().take_while(|byte| *byte == b'=').count();
    let level = leading.min(trailing);
    if level == 0 || line.len() <= level * 2 {
        return None;
    }
    let inner = line[level..line.len() - level].trim();
    if inner.is_empty() {
        return None;
    }
    Some(format!("{} {inner}", "#".repeat(level.min(6))))
}

fn replace_internal_links(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("[[") {
        out.push_str(&rest[..start]);
        let body_start = start + 2;
        match find_link_end(&rest[body_start..]) {
            Some(end) => {
                out.push_str(&render_link(&rest[body_start..body_start + end]));
                rest = &rest[body_start + end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn find_link_end(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut cursor = 0usize;
    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'[' && bytes[cursor + 1] == b'[' {
            depth += 1;
            cursor += 2;
            continue;
        }
        if bytes[cursor] == b']' && bytes[cursor + 1] == b']' {
            if depth == 0 {
                return Some(cursor);
            }
            depth -= 1;
            cursor += 2;
            continue;
        }
        cursor += 1;
    }
    None
}

fn render_link(inner: &str) -> String {
    let target = inner.split('|').next().unwrap_or("").trim();
    let visible_colon = target.starts_with(':');
    let bare_target = target.trim_start_matches(':').trim();
    let lowered = bare_target.to_ascii_lowercase();
    if !visible_colon
        && DROPPED_LINK_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
    {
        return String::new();
    }

    match inner.split_once('|') {
        Some((_, label)) if !label.trim().is_empty() => replace_internal_links(label.trim()),
        _ => bare_target.to_string(),
    }
}

fn replace_external_links(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('[') {
        let after = &rest[start + 1..];
        let is_url = ["http://", "https://", "//"]
            .iter()
            .any(|scheme| after.starts_with(scheme));
        match (is_url, after.find(']')) {
            (true, Some(end)) => {
                out.push_str(&rest[..start]);
                let inner = &after[..end];
                match inner.split_once(char::is_whitespace) {
                    Some((_, label)) if !label.trim().is_empty() => out.push_str(label.trim()),
                    _ => out.push_str(inner),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str(&rest[..=start]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn convert_emphasis(input: &str) -> String {
    input
        .replace("'''''", "***")
        .replace("'''", "**")
        .replace("''", "*")
}

/// Drops magic words such as `__NOTOC__`.
fn strip_behavior_switches(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("__") {
        let after = &rest[start + 2..];
        let word_len = after
            .bytes()
            .take_while(|byte| byte.is_ascii_uppercase())
            .count();
        if word_len > 0 && after[word_len..].starts_with("__") {
            out.push_str(&rest[..start]);
            rest = &after[word_len + 2..];
        } else {
            out.push_str(&rest[..start + 2]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn strip_html_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let name_part = after.strip_prefix('/').unwrap_or(after);
        let is_tag = name_part
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic());
        let tag_end = after
            .find('>')
            .filter(|end| !after[..*end].contains('\n'));
        match (is_tag, tag_end) {
            (true, Some(end)) => {
                let name = name_part
                    .chars()
                    .take_while(char::is_ascii_alphanumeric)
                    .collect::<String>()
                    .to_ascii_lowercase();
                if name == "br" {
                    out.push('\n');
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_blank_lines(input: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut previous_blank = true;
    for line in input.lines() {
        let line = line.trim_end();
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        lines.push(if blank { "" } else { line });
        previous_blank = blank;
    }
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
