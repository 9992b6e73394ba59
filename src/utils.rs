/// Path processing utility functions / 路径处理工具函数

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;

/// Clean and normalize a bucket-relative path / 清理和规范化路径
/// 1. Replace backslashes with forward slashes / 将反斜杠替换为正斜杠
/// 2. Drop leading and trailing / / 去掉首尾的 /
/// 3. Clean . and .. in path / 清理路径中的 . 和 ..
pub fn fix_and_clean_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    clean_path(&path)
}

/// Clean path, handle ., .. and duplicate / / 清理路径，处理 . 和 .. 和重复的 /
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    parts.join("/")
}

/// Check if sub_path is path itself or lies below it / 判断 sub_path 是否是 path 的子路径
pub fn is_sub_path(path: &str, sub_path: &str) -> bool {
    let path = fix_and_clean_path(path);
    let sub_path = fix_and_clean_path(sub_path);

    if path == sub_path || path.is_empty() {
        return true;
    }

    sub_path.starts_with(&format!("{}/", path))
}

/// Path of `path` relative to `base`, or None when it is outside / 计算相对路径
/// base: "bucket/dir", path: "bucket/dir/a/b.txt" -> "a/b.txt"
pub fn relative_path(base: &str, path: &str) -> Option<String> {
    let base = fix_and_clean_path(base);
    let path = fix_and_clean_path(path);

    if base == path {
        return Some(String::new());
    }
    if base.is_empty() {
        return Some(path);
    }
    path.strip_prefix(&format!("{}/", base)).map(str::to_string)
}

/// Number of path segments below `base` / 相对 base 的层级深度
pub fn path_depth(base: &str, path: &str) -> Option<usize> {
    relative_path(base, path).map(|rel| {
        if rel.is_empty() {
            0
        } else {
            rel.split('/').count()
        }
    })
}

/// Join a directory and a child name / 拼接路径
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{}/{}", dir, name),
    }
}

/// Random path below `prefix` for scratch objects / 生成随机路径
pub fn random_path(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    join_path(prefix, &suffix)
}

/// Whether a path contains glob metacharacters / 是否包含通配符
pub fn has_magic(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Translate a glob pattern into an anchored regex / 将通配符转换为正则
/// `**` crosses directories, `*` and `?` stay within one segment.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    i += 1;
                    if chars.get(i + 1) == Some(&'/') {
                        // "**/" also matches zero directories
                        i += 1;
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => match chars[i + 1..].iter().position(|&ch| ch == ']') {
                Some(offset) => {
                    let class: String = chars[i + 1..i + 1 + offset].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(rest) => format!("^{}", rest),
                        None => class,
                    };
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i += offset + 1;
                }
                None => out.push_str("\\["),
            },
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out)
}
