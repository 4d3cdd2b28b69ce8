//! `LIST` output parsing (Unix `ls -l` style and DOS/IIS style).

use chrono::NaiveDate;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    File,
    Dir,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: RemoteKind,
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: RemoteKind::File,
            size,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RemoteKind::Dir,
            size: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == RemoteKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == RemoteKind::File
    }
}

/// Parses one listing line; `None` for totals, `.`/`..` and unrecognized lines.
pub fn parse_line(line: &str) -> Option<RemoteEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with("total ") {
        return None;
    }
    let entry = parse_unix(line).or_else(|| parse_dos(line))?;
    if entry.name == "." || entry.name == ".." {
        None
    } else {
        Some(entry)
    }
}

pub fn parse_listing<S: AsRef<str>>(lines: &[S]) -> Vec<RemoteEntry> {
    lines.iter().filter_map(|l| parse_line(l.as_ref())).collect()
}

/// Splits off `n` whitespace-separated fields, returning them and the rest verbatim.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

// drwxr-xr-x 1 owner group 4096 Jan 01 12:00 name
fn parse_unix(line: &str) -> Option<RemoteEntry> {
    let kind = match line.chars().next()? {
        'd' => RemoteKind::Dir,
        'l' => RemoteKind::Link,
        '-' => RemoteKind::File,
        _ => return None,
    };
    let perms = line.get(1..10)?;
    if !perms.chars().all(|c| "rwxsStTl-".contains(c)) {
        return None;
    }
    let (fields, name) = split_fields(line, 8)?;
    let size = fields[4].parse().ok()?;
    let name = match kind {
        RemoteKind::Link => name.split(" -> ").next().unwrap_or(name),
        _ => name,
    };
    if name.is_empty() {
        return None;
    }
    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size,
    })
}

// 01-31-24  12:00PM       <DIR>          name
// 01-31-24  12:00PM            12345 name
fn parse_dos(line: &str) -> Option<RemoteEntry> {
    let (fields, name) = split_fields(line, 3)?;
    NaiveDate::parse_from_str(fields[0], "%m-%d-%y")
        .or_else(|_| NaiveDate::parse_from_str(fields[0], "%m-%d-%Y"))
        .ok()?;
    if name.is_empty() {
        return None;
    }
    if fields[2].eq_ignore_ascii_case("<DIR>") {
        Some(RemoteEntry::dir(name))
    } else {
        Some(RemoteEntry::file(name, fields[2].parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_lines() {
        let lines = [
            "total 8",
            "drwxr-xr-x   2 root root     4096 Jan 01 12:00 .",
            "drwxr-xr-x   2 root root     4096 Jan 01 12:00 ..",
            "drwxr-xr-x   2 root root     4096 Jan 01 12:00 sce_sys",
            "-rw-r--r--   1 root root  1048576 Mar 15  2023 eboot.bin",
            "-rw-r--r--   1 root root       12 Mar 15  2023 name with  spaces.txt",
            "lrwxrwxrwx   1 root root        7 Mar 15  2023 link -> target",
        ];
        let entries = parse_listing(&lines);
        assert_eq!(
            entries,
            vec![
                RemoteEntry::dir("sce_sys"),
                RemoteEntry::file("eboot.bin", 1_048_576),
                RemoteEntry::file("name with  spaces.txt", 12),
                RemoteEntry {
                    name: "link".into(),
                    kind: RemoteKind::Link,
                    size: 7
                },
            ]
        );
    }

    #[test]
    fn test_dos_lines() {
        let lines = [
            "01-31-24  12:00PM       <DIR>          PPSA01234",
            "01-31-2024  09:15AM            2048 param.json",
        ];
        let entries = parse_listing(&lines);
        assert_eq!(
            entries,
            vec![RemoteEntry::dir("PPSA01234"), RemoteEntry::file("param.json", 2048)]
        );
    }

    #[test]
    fn test_garbage_is_ignored() {
        assert_eq!(parse_line("hello"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("-rw-r--r-- 1 root root notanumber Jan 01 12:00 x"), None);
    }
}
